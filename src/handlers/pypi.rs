//! PyPI package index proxy
//!
//! Routes `/simple` (project index) and `/files` (package downloads) to the
//! configured upstreams and rewrites index responses so file URLs point back
//! at the proxy. Both the PEP 503 HTML and PEP 691 JSON shapes are handled,
//! streaming, under whatever `Content-Encoding` the upstream chose.

use anyhow::{Context, Result};
use axum::body::Body;
use axum::http::header::CONTENT_TYPE;
use axum::http::{Request, StatusCode, Uri};
use axum::response::Response;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::PypiSettings;
use crate::context::RequestContext;
use crate::error::status_response;
use crate::handlers::SiteInfo;
use crate::helper::{modify_response_body, ProxyOptions, RequestHelper};

// https://peps.python.org/pep-0691/#project-list
// https://peps.python.org/pep-0691/#project-detail
static PROJECT_LIST_PATH: Lazy<Regex> = Lazy::new(|| Regex::new("^/simple/?$").unwrap());
static PROJECT_DETAIL_PATH: Lazy<Regex> = Lazy::new(|| Regex::new("^/simple/[^/]+/?$").unwrap());

const PYPI_JSON_CONTENT_TYPE: &str = "application/vnd.pypi.simple.v1+json";

pub struct PypiHandler {
    info: SiteInfo,
    helper: RequestHelper,
    upstream_simple: Uri,
    upstream_files: Uri,
}

impl PypiHandler {
    pub fn new(info: SiteInfo, helper: RequestHelper, settings: PypiSettings) -> Result<Self> {
        let upstream_simple: Uri = settings
            .upstream_simple_url
            .as_deref()
            .unwrap_or_default()
            .parse()
            .context("invalid upstream_simple_url")?;
        let upstream_files: Uri = settings
            .upstream_files_url
            .as_deref()
            .unwrap_or_default()
            .parse()
            .context("invalid upstream_files_url")?;

        Ok(Self {
            info,
            helper,
            upstream_simple,
            upstream_files,
        })
    }

    pub fn info(&self) -> &SiteInfo {
        &self.info
    }

    pub async fn serve(&self, ctx: &RequestContext, req: Request<Body>) -> Response {
        let req_path = self.info.strip_prefix(req.uri().path()).to_string();

        let (upstream, route_prefix) = if req_path.starts_with("/simple") {
            (&self.upstream_simple, "/simple")
        } else if req_path.starts_with("/files") {
            (&self.upstream_files, "/files")
        } else {
            return status_response(StatusCode::NOT_FOUND);
        };

        let upstream_path = match upstream.path() {
            "/" => "",
            path => path,
        };
        let mut path_and_query =
            format!("{}{}", upstream_path, &req_path[route_prefix.len()..]);
        if let Some(query) = req.uri().query() {
            path_and_query.push('?');
            path_and_query.push_str(query);
        }
        let downstream = match Uri::builder()
            .scheme(upstream.scheme_str().unwrap_or("https"))
            .authority(upstream.authority().expect("validated at init").clone())
            .path_and_query(path_and_query)
            .build()
        {
            Ok(uri) => uri,
            Err(_) => return status_response(StatusCode::NOT_FOUND),
        };

        let opts = if route_prefix == "/simple" {
            let ctx = ctx.clone();
            let site_prefix = self.info.path_prefix.clone();
            let files_host = self
                .upstream_files
                .authority()
                .expect("validated at init")
                .to_string();
            let files_scheme = self.upstream_files.scheme_str().unwrap_or("https").to_string();
            let req_path = req_path.clone();

            ProxyOptions::new().with_response_modifier(move |_last_req, resp| {
                if resp.status() != StatusCode::OK {
                    return Ok(());
                }

                let is_pypi_json = resp
                    .headers()
                    .get(CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .map(|v| v == PYPI_JSON_CONTENT_TYPE)
                    .unwrap_or(false);
                let files_url = format!("{files_scheme}://{files_host}");

                if PROJECT_LIST_PATH.is_match(&req_path) {
                    if !is_pypi_json {
                        return modify_response_body(
                            &ctx,
                            resp,
                            "href=\"/simple/",
                            &format!("href=\"{site_prefix}/simple/"),
                        );
                    }
                } else if PROJECT_DETAIL_PATH.is_match(&req_path) {
                    if is_pypi_json {
                        return modify_response_body(
                            &ctx,
                            resp,
                            &format!("\"url\":\"{files_url}/"),
                            &format!("\"url\":\"{site_prefix}/files/"),
                        );
                    }
                    return modify_response_body(
                        &ctx,
                        resp,
                        &format!("href=\"{files_url}/"),
                        &format!("href=\"{site_prefix}/files/"),
                    );
                }

                Ok(())
            })
        } else {
            ProxyOptions::new()
        };

        self.helper.run_reverse_proxy(ctx, req, downstream, opts).await
    }
}
