//! Reverse-proxy execution helper
//!
//! Composes the egress building blocks into one configured round trip:
//! request-rate admission, source-IP selection, pooled transport acquisition,
//! traffic shaping, redirect handling, header rewrite rules, and the per-site
//! response modifier. Site handlers call [`RequestHelper::run_reverse_proxy`]
//! with a destination URL and per-call options.

use std::net::IpAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_ENCODING, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use axum::http::{Request, Response, StatusCode, Uri};
use axum::response::IntoResponse;
use futures_util::StreamExt;
use http_body_util::BodyExt;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, error, warn};

use crate::client_data::ClientDataCache;
use crate::codec::{wrap_body, BoxedTransform, Compressor, Decompressor, Encoding};
use crate::config::{Config, HeaderModificationConfig, IpPoolStrategy, RedirectAction};
use crate::context::RequestContext;
use crate::error::{status_response, HttpError};
use crate::ip_pool::IpPool;
use crate::rate_limit::{create_traffic_rate_limiter, MultiRateLimiter};
use crate::redirect::{
    RecordedRequest, RedirectDecision, RedirectFollowingTransport, RedirectHandler, RedirectInfo,
};
use crate::replace::{ReplacingTransform, SearchFn};
use crate::transport::{ProxySpec, TransportCache, TransportGuard};

const TRANSPORT_IDLE_TTL: std::time::Duration = std::time::Duration::from_secs(60);

/// Headers whose values never reach the logs.
const MASKED_HEADERS: &[&str] = &[
    "authorization",
    "cookie",
    "set-cookie",
    "x-api-key",
    "token",
    "x-access-token",
];

// ============================================================================
// Factory
// ============================================================================

/// Owns the shared egress state; hands out per-site [`RequestHelper`]s.
pub struct RequestHelperFactory {
    cfg: Arc<Config>,
    ip_pool: Option<Arc<IpPool>>,
    transport_cache: Arc<TransportCache>,
    client_data_cache: Arc<ClientDataCache>,
    global_traffic_limiter: Option<Arc<MultiRateLimiter>>,
}

impl RequestHelperFactory {
    pub fn new(cfg: Arc<Config>) -> Result<Self> {
        let ip_pool_cfg = &cfg.request.ip_pool;
        let ip_pool = if ip_pool_cfg.enabled {
            Some(Arc::new(
                IpPool::new(&ip_pool_cfg.subnets).context("failed to create ip pool")?,
            ))
        } else {
            None
        };

        let proxy = if cfg.request.proxy.is_empty() {
            None
        } else {
            Some(ProxySpec::parse(&cfg.request.proxy)?)
        };

        let transport_cache = Arc::new(TransportCache::new(TRANSPORT_IDLE_TTL, proxy)?);
        let client_data_cache = Arc::new(ClientDataCache::new(cfg.resource_limit.clone()));

        let global_traffic_limiter = cfg.resource_limit.traffic_global_mibps.map(|global| {
            Arc::new(create_traffic_rate_limiter(Some(global), Some(global), None))
        });

        Ok(Self {
            cfg,
            ip_pool,
            transport_cache,
            client_data_cache,
            global_traffic_limiter,
        })
    }

    pub fn new_request_helper(&self, site_strategy: Option<IpPoolStrategy>) -> RequestHelper {
        let ip_pool_cfg = &self.cfg.request.ip_pool;
        let strategy = if ip_pool_cfg.enabled {
            site_strategy.unwrap_or(ip_pool_cfg.default_strategy)
        } else {
            IpPoolStrategy::None
        };

        RequestHelper {
            cfg: self.cfg.clone(),
            ip_pool: self.ip_pool.clone(),
            transport_cache: self.transport_cache.clone(),
            client_data_cache: self.client_data_cache.clone(),
            global_traffic_limiter: self.global_traffic_limiter.clone(),
            ip_pool_strategy: strategy,
        }
    }

    pub fn shutdown(&self) {
        self.transport_cache.shutdown();
        self.client_data_cache.clear();
    }
}

// ============================================================================
// Per-call options
// ============================================================================

pub type ResponseModifier =
    Box<dyn Fn(&RecordedRequest, &mut Response<Body>) -> Result<(), HttpError> + Send + Sync>;

pub type LocationRewriter = Box<dyn Fn(&RedirectInfo<'_>) -> Option<String> + Send + Sync>;

fn follow_all_handler() -> RedirectHandler {
    Arc::new(|_info| RedirectDecision::Follow)
}

fn follow_none_handler() -> RedirectHandler {
    Arc::new(|_info| RedirectDecision::Return)
}

/// Swap a location's scheme and host for the destination's, keeping path and
/// query.
fn swap_scheme_host(location: &Uri, dest: &Uri) -> Option<String> {
    let mut parts = location.clone().into_parts();
    parts.scheme = dest.scheme().cloned();
    parts.authority = dest.authority().cloned();
    Uri::from_parts(parts).ok().map(|uri| uri.to_string())
}

/// Per-call configuration for [`RequestHelper::run_reverse_proxy`].
#[derive(Default)]
pub struct ProxyOptions {
    response_modifier: Option<ResponseModifier>,
    redirect_handler: Option<RedirectHandler>,
}

impl ProxyOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Business response modifier, invoked with the final recorded request
    /// and the response about to stream back to the client.
    pub fn with_response_modifier(
        mut self,
        modifier: impl Fn(&RecordedRequest, &mut Response<Body>) -> Result<(), HttpError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.response_modifier = Some(Box::new(modifier));
        self
    }

    pub fn with_redirect_handler(mut self, handler: RedirectHandler) -> Self {
        self.redirect_handler = Some(handler);
        self
    }

    pub fn with_redirect_follow_all(self) -> Self {
        self.with_redirect_handler(follow_all_handler())
    }

    pub fn with_redirect_follow_none(self) -> Self {
        self.with_redirect_handler(follow_none_handler())
    }

    fn with_redirect_rewrite(
        self,
        dest: Uri,
        checker: Option<Arc<dyn Fn(&Uri) -> bool + Send + Sync>>,
        fallback: RedirectDecision,
    ) -> Self {
        self.with_redirect_handler(Arc::new(move |info| {
            if let Some(location) = &info.location {
                if checker.as_ref().map_or(true, |check| check(location)) {
                    if let Some(rewritten) = swap_scheme_host(location, &dest) {
                        return RedirectDecision::Rewrite(rewritten);
                    }
                }
            }
            fallback.clone()
        }))
    }

    /// Rewrite matching locations onto `dest`'s scheme and host, follow the
    /// rest.
    pub fn with_redirect_rewrite_or_follow(
        self,
        dest: Uri,
        checker: Option<Arc<dyn Fn(&Uri) -> bool + Send + Sync>>,
    ) -> Self {
        self.with_redirect_rewrite(dest, checker, RedirectDecision::Follow)
    }

    /// Rewrite matching locations onto `dest`'s scheme and host, surface the
    /// rest unchanged.
    pub fn with_redirect_rewrite_only(
        self,
        dest: Uri,
        checker: Option<Arc<dyn Fn(&Uri) -> bool + Send + Sync>>,
    ) -> Self {
        self.with_redirect_rewrite(dest, checker, RedirectDecision::Return)
    }

    /// Map a configured redirect action onto a handler. The rewriter is
    /// consulted first for the rewrite-capable actions.
    pub fn with_redirect_action(
        self,
        action: RedirectAction,
        location_rewriter: Option<LocationRewriter>,
    ) -> Self {
        match action {
            RedirectAction::FollowAll => self.with_redirect_follow_all(),
            RedirectAction::None => self.with_redirect_follow_none(),
            RedirectAction::RewriteOrFollow | RedirectAction::RewriteOnly => {
                self.with_redirect_handler(Arc::new(move |info| {
                    if let Some(rewriter) = &location_rewriter {
                        if let Some(rewritten) = rewriter(info) {
                            return RedirectDecision::Rewrite(rewritten);
                        }
                    }
                    match action {
                        RedirectAction::RewriteOrFollow => RedirectDecision::Follow,
                        _ => RedirectDecision::Return,
                    }
                }))
            }
        }
    }
}

// ============================================================================
// Helper
// ============================================================================

/// Site-bound view over the shared egress state.
pub struct RequestHelper {
    cfg: Arc<Config>,
    ip_pool: Option<Arc<IpPool>>,
    transport_cache: Arc<TransportCache>,
    client_data_cache: Arc<ClientDataCache>,
    global_traffic_limiter: Option<Arc<MultiRateLimiter>>,
    ip_pool_strategy: IpPoolStrategy,
}

impl RequestHelper {
    fn select_local_ip(&self, ctx: &RequestContext) -> Option<IpAddr> {
        let pool = match self.ip_pool_strategy {
            IpPoolStrategy::None => return None,
            _ => self.ip_pool.as_ref()?,
        };
        let local = match self.ip_pool_strategy {
            IpPoolStrategy::None => unreachable!(),
            IpPoolStrategy::Random => pool.get_randomly(),
            IpPoolStrategy::IpHash => pool.get_by_key(&ctx.client_addr),
        };
        debug!(
            "{}Transport IP for client {} is {}",
            ctx.log_prefix, ctx.client_addr, local
        );
        Some(local)
    }

    /// Execute the reverse proxy for one request.
    ///
    /// `destination` is the full downstream URL (scheme, host, path, query);
    /// the incoming request's method, headers and body are carried over.
    pub async fn run_reverse_proxy(
        &self,
        ctx: &RequestContext,
        req: Request<Body>,
        destination: Uri,
        opts: ProxyOptions,
    ) -> axum::response::Response {
        // Admission
        let client_data = self.client_data_cache.get_data(&ctx.client_addr);
        if !client_data.request_rate_limiter.allow() {
            debug!("{}Request rate limit exceeded", ctx.log_prefix);
            return status_response(StatusCode::TOO_MANY_REQUESTS);
        }

        // Source selection and transport acquisition
        let local_ip = self.select_local_ip(ctx);
        let (client, guard) = match self.transport_cache.get_transport(local_ip) {
            Ok(acquired) => acquired,
            Err(e) => {
                error!("{}Failed to acquire transport: {}", ctx.log_prefix, e);
                return status_response(StatusCode::BAD_GATEWAY);
            }
        };

        // Traffic limiter: the client's buckets plus the global ceiling
        let mut traffic = MultiRateLimiter::new();
        traffic.merge(&client_data.traffic_rate_limiter);
        if let Some(global) = &self.global_traffic_limiter {
            traffic.merge(global);
        }
        let traffic = Arc::new(traffic);

        // Downstream request: replace the URL, apply header rules
        let (mut parts, body) = req.into_parts();
        parts.uri = destination.clone();
        parts.headers.remove(HOST);
        apply_header_rules(&mut parts.headers, &self.cfg.request.header);
        debug!(
            "{}Downstream request: {} {} [{}]",
            ctx.log_prefix,
            parts.method,
            parts.uri,
            format_headers_for_logging(&parts.headers)
        );

        let redirect_handler = opts
            .redirect_handler
            .clone()
            .unwrap_or_else(follow_all_handler);
        let transport = RedirectFollowingTransport::new(
            ctx,
            &client,
            self.cfg.response.max_redirects,
            redirect_handler,
            traffic.clone(),
        );

        let mut history: Vec<RecordedRequest> = Vec::new();
        let upstream_resp = match transport
            .round_trip(Request::from_parts(parts, body), &mut history)
            .await
        {
            Ok(resp) => resp,
            Err(http_err) => return http_err.into_response(),
        };

        // Response: header rules, traffic-limited body, business modifier
        let (mut resp_parts, incoming) = upstream_resp.into_parts();
        apply_header_rules(&mut resp_parts.headers, &self.cfg.response.header);

        let data_stream = guarded_stream(incoming.into_data_stream(), guard);
        let body = wrap_body(data_stream, Vec::new(), Some(traffic));
        let mut response = Response::from_parts(resp_parts, body);

        if let Some(modifier) = &opts.response_modifier {
            let last_request = history.last().expect("at least one request was recorded");
            if let Err(http_err) = modifier(last_request, &mut response) {
                return http_err.into_response();
            }
        }

        response.into_response()
    }
}

/// Keep the transport-cache acquisition alive until the body finishes
/// streaming.
fn guarded_stream<S>(stream: S, guard: TransportGuard) -> impl futures_util::Stream<Item = S::Item>
where
    S: futures_util::Stream,
{
    stream.map(move |item| {
        let _keep = &guard;
        item
    })
}

/// Apply configured delete-then-modify header rules in place.
pub fn apply_header_rules(headers: &mut HeaderMap, rules: &HeaderModificationConfig) {
    for name in &rules.delete {
        if let Ok(name) = HeaderName::from_bytes(name.as_bytes()) {
            headers.remove(&name);
        }
    }
    for (name, value) in &rules.modify {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.insert(name, value);
        } else {
            warn!("Skipping invalid header rule {:?}: {:?}", name, value);
        }
    }
}

/// Render headers for a log line, masking credential-bearing values.
pub fn format_headers_for_logging(headers: &HeaderMap) -> String {
    let mut parts: Vec<String> = Vec::with_capacity(headers.len());
    for (name, value) in headers.iter() {
        if MASKED_HEADERS.contains(&name.as_str()) {
            parts.push(format!("{name}: ***"));
        } else {
            parts.push(format!("{name}: {}", String::from_utf8_lossy(value.as_bytes())));
        }
    }
    parts.join(", ")
}

// ============================================================================
// Response body rewriting
// ============================================================================

fn modify_response_body_with(
    resp: &mut Response<Body>,
    replacer: ReplacingTransform,
) -> Result<(), HttpError> {
    let encoding_label = resp
        .headers()
        .get(CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase();
    let encoding = Encoding::parse(&encoding_label).map_err(|_| {
        HttpError::new(
            StatusCode::NOT_IMPLEMENTED,
            format!("Unsupported Content-Encoding {encoding_label}"),
        )
    })?;

    let transforms: Vec<BoxedTransform> = vec![
        Box::new(
            Decompressor::new(encoding)
                .map_err(|e| HttpError::bad_gateway(format!("decoder init failed: {e}")))?,
        ),
        Box::new(replacer),
        Box::new(
            Compressor::new(encoding)
                .map_err(|e| HttpError::bad_gateway(format!("encoder init failed: {e}")))?,
        ),
    ];

    let body = std::mem::replace(resp.body_mut(), Body::empty());
    *resp.body_mut() = wrap_body(body.into_data_stream(), transforms, None);

    // the rewritten size is unknown
    resp.headers_mut().remove(CONTENT_LENGTH);
    resp.headers_mut()
        .insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
    Ok(())
}

/// Streaming literal search/replace over the response body, transparent to
/// the body's `Content-Encoding`.
pub fn modify_response_body(
    ctx: &RequestContext,
    resp: &mut Response<Body>,
    search: &str,
    replace: &str,
) -> Result<(), HttpError> {
    let skipped = search.is_empty() || search == replace;
    debug!(
        "{}Modifying response body string: {:?} -> {:?}{}",
        ctx.log_prefix,
        search,
        replace,
        if skipped { " (skipped)" } else { "" }
    );
    if skipped {
        return Ok(());
    }
    modify_response_body_with(
        resp,
        ReplacingTransform::new_literal(search.as_bytes(), replace.as_bytes()),
    )
}

/// Streaming search/replace with a custom search callback.
pub fn modify_response_body_advanced(
    ctx: &RequestContext,
    resp: &mut Response<Body>,
    search_fn: SearchFn,
    max_search_len: usize,
    look_behind_size: usize,
) -> Result<(), HttpError> {
    debug!(
        "{}Modifying response body with custom search fn, max_search_len {}, look_behind_size {}",
        ctx.log_prefix, max_search_len, look_behind_size
    );
    modify_response_body_with(
        resp,
        ReplacingTransform::new(search_fn, max_search_len, look_behind_size),
    )
}

// https://developer.mozilla.org/en-US/docs/Web/HTTP/Reference/Headers/Link
static LINK_URL_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"<([^>]+)>").unwrap());

/// Rewrite every `<url>` entry of a `Link` header through `rewriter`;
/// `on_unknown` observes entries the rewriter declined.
pub fn rewrite_link_header_urls(
    headers: &mut HeaderMap,
    rewriter: impl Fn(&Uri) -> Option<Uri>,
    mut on_unknown: impl FnMut(&str),
) {
    let Some(link) = headers.get("link").and_then(|v| v.to_str().ok()) else {
        return;
    };

    let mut modified = false;
    let new_link = LINK_URL_PATTERN.replace_all(link, |captures: &regex::Captures<'_>| {
        let url_str = &captures[1];
        let new_url = url_str
            .parse::<Uri>()
            .ok()
            .and_then(|old_url| rewriter(&old_url));
        match new_url {
            Some(new_url) => {
                modified = true;
                format!("<{new_url}>")
            }
            None => {
                on_unknown(url_str);
                captures[0].to_string()
            }
        }
    });

    if modified {
        if let Ok(value) = HeaderValue::from_str(&new_link) {
            headers.insert("link", value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_ctx() -> RequestContext {
        RequestContext::new("site0", "example.com", "203.0.113.9")
    }

    #[test]
    fn test_swap_scheme_host() {
        let location: Uri = "https://upstream.example/path/file?sig=abc".parse().unwrap();
        let dest: Uri = "https://proxy.example".parse().unwrap();
        assert_eq!(
            swap_scheme_host(&location, &dest).unwrap(),
            "https://proxy.example/path/file?sig=abc"
        );
    }

    #[test]
    fn test_apply_header_rules() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("1.2.3.4"));
        headers.insert("accept", HeaderValue::from_static("*/*"));

        let mut rules = HeaderModificationConfig::default();
        rules.delete.push("X-Forwarded-For".to_string());
        rules
            .modify
            .insert("X-Custom".to_string(), "injected".to_string());

        apply_header_rules(&mut headers, &rules);
        assert!(headers.get("x-forwarded-for").is_none());
        assert_eq!(headers.get("accept").unwrap(), "*/*");
        assert_eq!(headers.get("x-custom").unwrap(), "injected");
    }

    #[test]
    fn test_format_headers_masks_credentials() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer secret"));
        headers.insert("accept", HeaderValue::from_static("*/*"));

        let rendered = format_headers_for_logging(&headers);
        assert!(rendered.contains("authorization: ***"));
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("accept: */*"));
    }

    #[test]
    fn test_rewrite_link_header_urls() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "link",
            HeaderValue::from_static(
                "<https://upstream.example/a>; rel=\"next\", <https://other.example/b>; rel=\"auth\"",
            ),
        );

        let mut unknown = Vec::new();
        rewrite_link_header_urls(
            &mut headers,
            |old| {
                if old.host() == Some("upstream.example") {
                    Some(format!("https://proxy.example{}", old.path()).parse().unwrap())
                } else {
                    None
                }
            },
            |url| unknown.push(url.to_string()),
        );

        let link = headers.get("link").unwrap().to_str().unwrap();
        assert!(link.contains("<https://proxy.example/a>"));
        assert!(link.contains("<https://other.example/b>"));
        assert_eq!(unknown, vec!["https://other.example/b"]);
    }

    #[tokio::test]
    async fn test_modify_response_body_gzip() {
        use std::io::Write;

        // gzip "AAABBBAAA"
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(b"AAABBBAAA").unwrap();
        let compressed = encoder.finish().unwrap();

        let mut resp = Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_ENCODING, "gzip")
            .header(CONTENT_LENGTH, compressed.len())
            .body(Body::from(compressed))
            .unwrap();

        modify_response_body(&test_ctx(), &mut resp, "BBB", "ZZZ").unwrap();

        assert_eq!(resp.headers().get(CONTENT_ENCODING).unwrap(), "gzip");
        assert!(resp.headers().get(CONTENT_LENGTH).is_none());
        assert_eq!(resp.headers().get(TRANSFER_ENCODING).unwrap(), "chunked");

        let body = std::mem::replace(resp.body_mut(), Body::empty());
        let collected = body.collect().await.unwrap().to_bytes();

        let mut decoder = flate2::read::GzDecoder::new(&collected[..]);
        let mut decoded = String::new();
        std::io::Read::read_to_string(&mut decoder, &mut decoded).unwrap();
        assert_eq!(decoded, "AAAZZZAAA");
    }

    #[test]
    fn test_modify_response_body_unknown_encoding() {
        let mut resp = Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_ENCODING, "compress")
            .body(Body::from("payload"))
            .unwrap();

        let err = modify_response_body(&test_ctx(), &mut resp, "a", "b").unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_IMPLEMENTED);
    }

    #[tokio::test]
    async fn test_factory_strategy_resolution() {
        let cfg = Config::from_yaml(
            r#"
request:
  ip_pool:
    enabled: true
    default_strategy: random
    subnets: ["192.0.2.0/24"]
"#,
        )
        .unwrap();
        let factory = RequestHelperFactory::new(Arc::new(cfg)).unwrap();

        let default_helper = factory.new_request_helper(None);
        assert_eq!(default_helper.ip_pool_strategy, IpPoolStrategy::Random);

        let override_helper = factory.new_request_helper(Some(IpPoolStrategy::IpHash));
        assert_eq!(override_helper.ip_pool_strategy, IpPoolStrategy::IpHash);
        factory.shutdown();
    }

    #[tokio::test]
    async fn test_factory_disabled_pool_forces_none() {
        let cfg = Config::from_yaml("{}").unwrap();
        let factory = RequestHelperFactory::new(Arc::new(cfg)).unwrap();
        let helper = factory.new_request_helper(None);
        assert_eq!(helper.ip_pool_strategy, IpPoolStrategy::None);
        assert!(helper.select_local_ip(&test_ctx()).is_none());
        factory.shutdown();
    }

    #[tokio::test]
    async fn test_ip_hash_is_deterministic_per_client() {
        let cfg = Config::from_yaml(
            r#"
request:
  ip_pool:
    enabled: true
    subnets: ["192.0.2.0/24"]
"#,
        )
        .unwrap();
        let factory = RequestHelperFactory::new(Arc::new(cfg)).unwrap();
        let helper = factory.new_request_helper(Some(IpPoolStrategy::IpHash));

        let ctx = test_ctx();
        let first = helper.select_local_ip(&ctx).unwrap();
        let second = helper.select_local_ip(&ctx).unwrap();
        assert_eq!(first, second);
        factory.shutdown();
    }
}
