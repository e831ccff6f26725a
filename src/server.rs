//! Request dispatcher
//!
//! Routes each request by bare host and longest path prefix to a site
//! handler, derives the client address through the trusted-proxy chain,
//! enforces the per-request timeout, and records the per-status metrics and
//! the end-of-request log line.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::header::{HeaderMap, HOST, UPGRADE};
use axum::http::{Request, StatusCode};
use axum::response::Response;
use axum::routing::any;
use axum::Router;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::context::RequestContext;
use crate::error::status_response;
use crate::handlers::SiteHandler;
use crate::helper::RequestHelperFactory;
use crate::ip_pool::IpPool;
use crate::metrics::MetricsRegistry;

/// The configured proxy server: site handlers plus shared dispatch state.
pub struct PavonisServer {
    cfg: Arc<Config>,
    /// `None` means every peer is trusted (`*`)
    trusted_proxies: Option<IpPool>,
    host_handlers: HashMap<String, Vec<Arc<SiteHandler>>>,
    wildcard_handlers: Vec<Arc<SiteHandler>>,
    all_handlers: Vec<Arc<SiteHandler>>,
    helper_factory: RequestHelperFactory,
    metrics: Arc<MetricsRegistry>,
    request_timeout: Duration,
}

/// Host with any port part removed.
fn bare_host(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        // bracketed IPv6 literal, with or without a port
        if let Some(end) = rest.find(']') {
            return &rest[..end];
        }
    }
    match host.rsplit_once(':') {
        Some((name, port))
            if !name.contains(':') && !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) =>
        {
            name
        }
        _ => host,
    }
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

impl PavonisServer {
    pub fn new(cfg: Arc<Config>, metrics: Arc<MetricsRegistry>) -> Result<Self> {
        let trusted_proxies = if cfg.server.trusted_proxy_ips.iter().any(|s| s == "*") {
            None
        } else {
            Some(
                IpPool::new(&cfg.server.trusted_proxy_ips)
                    .context("trusted proxies pool init failed")?,
            )
        };

        let helper_factory = RequestHelperFactory::new(cfg.clone())?;

        let mut host_handlers: HashMap<String, Vec<Arc<SiteHandler>>> = HashMap::new();
        let mut wildcard_handlers: Vec<Arc<SiteHandler>> = Vec::new();
        let mut all_handlers: Vec<Arc<SiteHandler>> = Vec::new();

        for (site_idx, site) in cfg.sites.iter().enumerate() {
            let helper = helper_factory.new_request_helper(site.ip_pool_strategy);
            let handler = Arc::new(
                SiteHandler::new(site, helper, metrics.clone())
                    .with_context(|| format!("init site handler {site_idx} failed"))?,
            );
            info!(
                "{}: mode={} host={:?} path_prefix={:?}",
                site.id,
                site.mode,
                site.host.iter().collect::<Vec<_>>(),
                site.path_prefix
            );
            all_handlers.push(handler.clone());

            for host in site.host.iter() {
                if host == "*" {
                    wildcard_handlers.push(handler.clone());
                } else {
                    host_handlers
                        .entry(host.to_string())
                        .or_default()
                        .push(handler.clone());
                }
            }
        }

        // within each bucket the most specific prefix wins; ties keep config
        // order (the sort is stable)
        for handlers in host_handlers.values_mut() {
            handlers.sort_by(|a, b| {
                b.info()
                    .path_prefix
                    .len()
                    .cmp(&a.info().path_prefix.len())
            });
        }
        wildcard_handlers.sort_by(|a, b| {
            b.info()
                .path_prefix
                .len()
                .cmp(&a.info().path_prefix.len())
        });

        if cfg.sites.is_empty() {
            warn!("No site defined in config");
        }

        Ok(Self {
            request_timeout: cfg.resource_limit.request_timeout.duration(),
            cfg,
            trusted_proxies,
            host_handlers,
            wildcard_handlers,
            all_handlers,
            helper_factory,
            metrics,
        })
    }

    /// Derive the client address: the TCP peer's IP, or the first parseable
    /// IP from the trusted forwarded headers when the peer is a trusted
    /// proxy.
    fn resolve_client_addr(&self, peer: SocketAddr, headers: &HeaderMap) -> String {
        let peer_ip = peer.ip();
        let peer_trusted = match &self.trusted_proxies {
            None => true,
            Some(pool) => pool.contains(peer_ip),
        };
        if peer_trusted {
            for header in &self.cfg.server.trusted_proxy_headers {
                let Some(value) = headers.get(header.as_str()).and_then(|v| v.to_str().ok())
                else {
                    continue;
                };
                for part in value.split(',') {
                    let part = part.trim();
                    if part.parse::<IpAddr>().is_ok() {
                        return part.to_string();
                    }
                }
            }
        }
        peer_ip.to_string()
    }

    fn select_handler(&self, host: &str, path: &str) -> Option<&Arc<SiteHandler>> {
        if let Some(handlers) = self.host_handlers.get(host) {
            if let Some(handler) = handlers
                .iter()
                .find(|h| path.starts_with(h.info().path_prefix.as_str()))
            {
                return Some(handler);
            }
        }
        self.wildcard_handlers
            .iter()
            .find(|h| path.starts_with(h.info().path_prefix.as_str()))
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new().fallback(any(dispatch)).with_state(self)
    }

    pub fn shutdown(&self) {
        for handler in &self.all_handlers {
            handler.shutdown();
        }
        self.helper_factory.shutdown();
    }
}

async fn dispatch(
    State(server): State<Arc<PavonisServer>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: Request<Body>,
) -> Response {
    let start_time = std::time::Instant::now();

    let host = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.to_string()))
        .unwrap_or_default();
    let host = bare_host(&host).to_string();

    let client_addr = server.resolve_client_addr(peer, req.headers());
    let method = req.method().clone();
    let request_uri = req.uri().to_string();

    let response = handle_request(&server, &host, &client_addr, req).await;

    let code = response.status().as_u16();
    server.metrics.record_request(code);
    info!(
        "[{}] {} - {} {} - {} {} {:.3}s",
        host,
        client_addr,
        method,
        request_uri,
        code,
        response.status().canonical_reason().unwrap_or(""),
        start_time.elapsed().as_secs_f64()
    );
    response
}

async fn handle_request(
    server: &PavonisServer,
    host: &str,
    client_addr: &str,
    req: Request<Body>,
) -> Response {
    let Some(handler) = server.select_handler(host, req.uri().path()) else {
        return status_response(StatusCode::NOT_FOUND);
    };

    // connection hijacking is not supported
    if is_websocket_upgrade(req.headers()) {
        return status_response(StatusCode::FORBIDDEN);
    }

    let ctx = RequestContext::new(&handler.info().id, host, client_addr);
    debug!(
        "{}Request start: {} {} from {}",
        ctx.log_prefix,
        req.method(),
        req.uri(),
        client_addr
    );

    match tokio::time::timeout(server.request_timeout, handler.serve(&ctx, req)).await {
        Ok(response) => response,
        Err(_) => {
            debug!("{}Request timed out", ctx.log_prefix);
            status_response(StatusCode::GATEWAY_TIMEOUT)
        }
    }
}
