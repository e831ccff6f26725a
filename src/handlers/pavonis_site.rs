//! Built-in info site: version banner and Prometheus metrics

use std::sync::Arc;

use axum::body::Body;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderValue, Request, StatusCode};
use axum::response::Response;

use crate::context::RequestContext;
use crate::error::status_response;
use crate::handlers::SiteInfo;
use crate::metrics::MetricsRegistry;

pub struct PavonisSiteHandler {
    info: SiteInfo,
    metrics: Arc<MetricsRegistry>,
}

impl PavonisSiteHandler {
    pub fn new(info: SiteInfo, metrics: Arc<MetricsRegistry>) -> Self {
        Self { info, metrics }
    }

    pub fn info(&self) -> &SiteInfo {
        &self.info
    }

    pub async fn serve(&self, _ctx: &RequestContext, req: Request<Body>) -> Response {
        let req_path = self.info.strip_prefix(req.uri().path());
        let req_path = req_path.trim_end_matches('/');

        match req_path {
            "" => Response::new(Body::from(format!("Pavonis v{}", crate::VERSION))),
            "/metrics" => {
                let mut resp = Response::new(Body::from(self.metrics.export_prometheus()));
                resp.headers_mut().insert(
                    CONTENT_TYPE,
                    HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
                );
                resp
            }
            _ => status_response(StatusCode::NOT_FOUND),
        }
    }
}
