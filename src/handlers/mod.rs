//! Site handlers
//!
//! Each configured site binds hosts and a path prefix to one mode-specific
//! handler. All handlers expose the same surface: `info()` for routing,
//! `serve()` for request handling, `shutdown()` for teardown. The mode is a
//! tagged variant selected at startup and never changes.

use std::sync::Arc;

use anyhow::Result;
use axum::body::Body;
use axum::http::Request;
use axum::response::Response;

use crate::config::{SiteConfig, SiteSettings};
use crate::context::RequestContext;
use crate::helper::RequestHelper;
use crate::metrics::MetricsRegistry;

pub mod container_registry;
pub mod github;
pub mod hugging_face;
pub mod http_general;
pub mod pavonis_site;
pub mod pypi;
pub mod speed_test;

/// Static routing facts about one site.
#[derive(Debug, Clone)]
pub struct SiteInfo {
    pub id: String,
    pub path_prefix: String,
    pub self_url: String,
}

impl SiteInfo {
    pub fn new(site: &SiteConfig) -> Self {
        Self {
            id: site.id.clone(),
            path_prefix: site.path_prefix.clone(),
            self_url: site.self_url.clone(),
        }
    }

    /// Path with this site's prefix removed. The dispatcher only routes
    /// matching paths here, so a mismatch is a routing bug upstream of us.
    pub fn strip_prefix<'a>(&self, path: &'a str) -> &'a str {
        path.strip_prefix(self.path_prefix.as_str()).unwrap_or(path)
    }
}

pub enum SiteHandler {
    ContainerRegistry(container_registry::ContainerRegistryHandler),
    Github(github::GithubProxyHandler),
    HuggingFace(hugging_face::HuggingFaceHandler),
    Http(http_general::HttpProxyHandler),
    Pavonis(pavonis_site::PavonisSiteHandler),
    Pypi(pypi::PypiHandler),
    SpeedTest(speed_test::SpeedTestHandler),
}

impl SiteHandler {
    pub fn new(
        site: &SiteConfig,
        helper: RequestHelper,
        metrics: Arc<MetricsRegistry>,
    ) -> Result<Self> {
        let info = SiteInfo::new(site);
        let handler = match site.settings() {
            SiteSettings::ContainerRegistry(settings) => SiteHandler::ContainerRegistry(
                container_registry::ContainerRegistryHandler::new(info, helper, settings.clone())?,
            ),
            SiteSettings::GithubProxy(settings) => SiteHandler::Github(
                github::GithubProxyHandler::new(info, helper, settings.clone())?,
            ),
            SiteSettings::HuggingFace(_) => SiteHandler::HuggingFace(
                hugging_face::HuggingFaceHandler::new(info, helper)?,
            ),
            SiteSettings::Http(settings) => SiteHandler::Http(
                http_general::HttpProxyHandler::new(info, helper, settings.clone())?,
            ),
            SiteSettings::Pavonis(_) => {
                SiteHandler::Pavonis(pavonis_site::PavonisSiteHandler::new(info, metrics))
            }
            SiteSettings::Pypi(settings) => {
                SiteHandler::Pypi(pypi::PypiHandler::new(info, helper, settings.clone())?)
            }
            SiteSettings::SpeedTest(settings) => {
                SiteHandler::SpeedTest(speed_test::SpeedTestHandler::new(info, settings.clone()))
            }
        };
        Ok(handler)
    }

    pub fn info(&self) -> &SiteInfo {
        match self {
            SiteHandler::ContainerRegistry(h) => h.info(),
            SiteHandler::Github(h) => h.info(),
            SiteHandler::HuggingFace(h) => h.info(),
            SiteHandler::Http(h) => h.info(),
            SiteHandler::Pavonis(h) => h.info(),
            SiteHandler::Pypi(h) => h.info(),
            SiteHandler::SpeedTest(h) => h.info(),
        }
    }

    pub async fn serve(&self, ctx: &RequestContext, req: Request<Body>) -> Response {
        match self {
            SiteHandler::ContainerRegistry(h) => h.serve(ctx, req).await,
            SiteHandler::Github(h) => h.serve(ctx, req).await,
            SiteHandler::HuggingFace(h) => h.serve(ctx, req).await,
            SiteHandler::Http(h) => h.serve(ctx, req).await,
            SiteHandler::Pavonis(h) => h.serve(ctx, req).await,
            SiteHandler::Pypi(h) => h.serve(ctx, req).await,
            SiteHandler::SpeedTest(h) => h.serve(ctx, req).await,
        }
    }

    pub fn shutdown(&self) {
        if let SiteHandler::ContainerRegistry(h) = self {
            h.shutdown();
        }
    }
}
