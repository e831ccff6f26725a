//! Hugging Face download proxy
//!
//! A download-only proxy (GET/HEAD) for huggingface.co and its xet storage
//! backends. Model/dataset downloads bounce through several hosts; each one
//! is mapped under a reserved path prefix so redirect locations, `Link`
//! headers and CAS reconstruction payloads can all be rewritten to stay on
//! the proxy.
//!
//! A download needs to access these paths:
//!
//!   "/api/models/HuggingFaceH4/zephyr-7b-beta/revision/main" (model)
//!   "/api/datasets/HuggingFaceH4/ultrachat_200k/revision/main" (dataset)
//!   "/HuggingFaceH4/zephyr-7b-beta/resolve/<rev>/foo" (model)
//!   "/datasets/HuggingFaceH4/ultrachat_200k/resolve/<rev>/bar" (dataset)

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::http::header::LOCATION;
use axum::http::{HeaderValue, Method, Request, StatusCode, Uri};
use axum::response::Response;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

use crate::context::RequestContext;
use crate::error::status_response;
use crate::handlers::SiteInfo;
use crate::helper::{
    modify_response_body, rewrite_link_header_urls, ProxyOptions, RequestHelper,
};
use crate::redirect::{is_redirect_status, RedirectDecision};

const HF_URL: &str = "https://huggingface.co";

/// Reserved prefixes for the xet storage hosts a download may bounce to.
struct PathMapping {
    path_prefix: &'static str,
    destination: &'static str,
}

static PM_CAS_BRIDGE: PathMapping = PathMapping {
    path_prefix: "/.cbxhc",
    destination: "https://cas-bridge.xethub.hf.co",
};
static PM_CAS_SERVER: PathMapping = PathMapping {
    path_prefix: "/.csxhc",
    destination: "https://cas-server.xethub.hf.co",
};
static PM_TRANSFER: PathMapping = PathMapping {
    path_prefix: "/.txhc",
    destination: "https://transfer.xethub.hf.co",
};
static PM_HF: PathMapping = PathMapping {
    path_prefix: "",
    destination: HF_URL,
};

static PATH_MAPPINGS: [&PathMapping; 4] = [&PM_CAS_BRIDGE, &PM_CAS_SERVER, &PM_TRANSFER, &PM_HF];

// See huggingface_hub's HUGGINGFACE_CO_URL_TEMPLATE:
// ENDPOINT + "/{repo_id}/resolve/{revision}/{filename}"
static HF_PATH_WHITELIST: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"^/api/(models|datasets)/[a-zA-Z0-9._-]+/[a-zA-Z0-9._-]+/.*$").unwrap(),
        Regex::new(r"^(/datasets)?/[a-zA-Z0-9._-]+/[a-zA-Z0-9._-]+/resolve/[0-9a-f]+(/.*)?$")
            .unwrap(),
    ]
});

static RECONSTRUCTION_PATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^/reconstruction/[0-9a-f]+$").unwrap());

fn is_valid_hf_path(path: &str) -> bool {
    HF_PATH_WHITELIST.iter().any(|pattern| pattern.is_match(path))
}

pub struct HuggingFaceHandler {
    info: SiteInfo,
    helper: RequestHelper,
    self_url: Uri,
}

impl HuggingFaceHandler {
    pub fn new(info: SiteInfo, helper: RequestHelper) -> Result<Self> {
        let self_url: Uri = info
            .self_url
            .parse()
            .with_context(|| format!("invalid self_url {:?}", info.self_url))?;
        Ok(Self {
            info,
            helper,
            self_url,
        })
    }

    pub fn info(&self) -> &SiteInfo {
        &self.info
    }

    pub async fn serve(&self, ctx: &RequestContext, req: Request<Body>) -> Response {
        // it's currently just a download proxy
        if req.method() != Method::GET && req.method() != Method::HEAD {
            return status_response(StatusCode::METHOD_NOT_ALLOWED);
        }

        let req_path = self.info.strip_prefix(req.uri().path()).to_string();

        let xet_mapping = PATH_MAPPINGS
            .iter()
            .find(|pm| !pm.path_prefix.is_empty() && req_path.starts_with(pm.path_prefix));

        let mut opts = ProxyOptions::new();
        let (target, remaining_path) = match xet_mapping {
            Some(mapping) => {
                let remaining = req_path[mapping.path_prefix.len()..].to_string();
                if mapping.path_prefix == PM_CAS_SERVER.path_prefix {
                    opts = self.add_reconstruction_modifier(opts, ctx, &remaining);
                }
                (mapping.destination, remaining)
            }
            None => {
                if !is_valid_hf_path(&req_path) {
                    return status_response(StatusCode::NOT_FOUND);
                }

                // rewrite upstream-internal redirects (e.g. repos renames)
                // back onto the proxy; everything else surfaces untouched
                let rewriter = self.clone_for_modifier();
                opts = opts.with_redirect_handler(Arc::new(move |info| {
                    if let Some(location) = &info.location {
                        if location.host() == Some(HF_URL.trim_start_matches("https://"))
                            && is_valid_hf_path(location.path())
                        {
                            if let Some(new_url) = rewriter.try_rewrite_url_to_self(location) {
                                return RedirectDecision::Rewrite(new_url.to_string());
                            }
                        }
                    }
                    RedirectDecision::Return
                }));

                opts = self.add_hf_response_modifier(opts, ctx);
                (HF_URL, req_path.clone())
            }
        };

        let target: Uri = target.parse().expect("static destination urls are valid");
        let mut path_and_query = remaining_path.clone();
        if let Some(query) = req.uri().query() {
            path_and_query.push('?');
            path_and_query.push_str(query);
        }
        let downstream = match Uri::builder()
            .scheme(target.scheme_str().unwrap_or("https"))
            .authority(target.authority().expect("static destination urls").clone())
            .path_and_query(path_and_query)
            .build()
        {
            Ok(uri) => uri,
            Err(_) => return status_response(StatusCode::NOT_FOUND),
        };

        self.helper.run_reverse_proxy(ctx, req, downstream, opts).await
    }

    /// Response modifier for the main huggingface.co routes: 302 location
    /// rewrite, `Link` header rewrite, and the xet CAS endpoint header.
    fn add_hf_response_modifier(&self, opts: ProxyOptions, ctx: &RequestContext) -> ProxyOptions {
        let ctx = ctx.clone();
        let this = self.clone_for_modifier();

        opts.with_response_modifier(move |_last_req, resp| {
            let mut redirected = false;
            if resp.status() == StatusCode::FOUND {
                let location = resp
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<Uri>().ok());
                if let Some(location) = location {
                    if let Some(new_location) = this.try_rewrite_url_to_self(&location) {
                        debug!(
                            "{}Rewriting 302 Location {:?} to {:?}",
                            ctx.log_prefix,
                            location.to_string(),
                            new_location.to_string()
                        );
                        if let Ok(value) = HeaderValue::from_str(&new_location.to_string()) {
                            resp.headers_mut().insert(LOCATION, value);
                            redirected = true;
                        }
                    }
                }
            }
            if is_redirect_status(resp.status()) && !redirected {
                warn!(
                    "{}Got {} with unknown Location {:?}, return as-is",
                    ctx.log_prefix,
                    resp.status(),
                    resp.headers()
                        .get(LOCATION)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                );
            }

            // the hugging face client utilizes urls in the Link header,
            // e.g. the "xet-auth" link
            {
                let ctx = &ctx;
                let this = &this;
                let mut headers = std::mem::take(resp.headers_mut());
                rewrite_link_header_urls(
                    &mut headers,
                    |old_url| this.try_rewrite_url_to_self(old_url),
                    |url| {
                        warn!(
                            "{}Skipping unknown url {:?} in Link header",
                            ctx.log_prefix, url
                        );
                    },
                );
                *resp.headers_mut() = headers;
            }

            // advertised in xet-read-token responses
            if let Some(cas_url) = resp
                .headers()
                .get("x-xet-cas-url")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<Uri>().ok())
            {
                if let Some(new_url) = this.try_rewrite_url_to_self(&cas_url) {
                    if let Ok(value) = HeaderValue::from_str(&new_url.to_string()) {
                        resp.headers_mut().insert("x-xet-cas-url", value);
                    }
                }
            }

            Ok(())
        })
    }

    /// The CAS reconstruction payload carries transfer URLs in its JSON body;
    /// rewrite them onto the transfer path mapping.
    fn add_reconstruction_modifier(
        &self,
        opts: ProxyOptions,
        ctx: &RequestContext,
        remaining_path: &str,
    ) -> ProxyOptions {
        if !RECONSTRUCTION_PATH.is_match(remaining_path) {
            return opts;
        }
        let ctx = ctx.clone();
        let search = format!("\"url\":\"{}/", PM_TRANSFER.destination);
        let replace = format!(
            "\"url\":\"{}{}{}/",
            self.info.self_url, self.info.path_prefix, PM_TRANSFER.path_prefix
        );
        opts.with_response_modifier(move |_last_req, resp| {
            modify_response_body(&ctx, resp, &search, &replace)
        })
    }

    fn clone_for_modifier(&self) -> HfRewriter {
        HfRewriter {
            info: self.info.clone(),
            self_url: self.self_url.clone(),
        }
    }
}

/// The rewriting subset of the handler, cloneable into response modifiers.
struct HfRewriter {
    info: SiteInfo,
    self_url: Uri,
}

impl HfRewriter {
    fn try_rewrite_url_to_self(&self, old_url: &Uri) -> Option<Uri> {
        for pm in PATH_MAPPINGS {
            let dest: Uri = pm.destination.parse().ok()?;
            if old_url.scheme_str() == dest.scheme_str() && old_url.host() == dest.host() {
                let mut path_and_query =
                    format!("{}{}{}", self.info.path_prefix, pm.path_prefix, old_url.path());
                if let Some(query) = old_url.query() {
                    path_and_query.push('?');
                    path_and_query.push_str(query);
                }
                return Uri::builder()
                    .scheme(self.self_url.scheme_str()?)
                    .authority(self.self_url.authority()?.clone())
                    .path_and_query(path_and_query)
                    .build()
                    .ok();
            }
        }
        None
    }
}
