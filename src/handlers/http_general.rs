//! Generic HTTP reverse proxy site
//!
//! Maps path prefixes under the site to absolute destination URLs; the most
//! specific prefix wins. A bare `destination` is shorthand for an empty
//! prefix.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use axum::body::Body;
use axum::http::{Request, StatusCode, Uri};
use axum::response::Response;

use crate::config::HttpProxySettings;
use crate::context::RequestContext;
use crate::error::plain_text_error;
use crate::handlers::SiteInfo;
use crate::helper::{ProxyOptions, RequestHelper};

struct Mapping {
    path_prefix: String,
    destination: Uri,
}

pub struct HttpProxyHandler {
    info: SiteInfo,
    helper: RequestHelper,
    mappings: Vec<Mapping>,
    settings: HttpProxySettings,
    self_url: Option<Uri>,
}

impl HttpProxyHandler {
    pub fn new(info: SiteInfo, helper: RequestHelper, settings: HttpProxySettings) -> Result<Self> {
        let mut mappings = Vec::new();

        let mut add_mapping = |path_prefix: &str, destination: &str| -> Result<()> {
            let dest: Uri = destination
                .parse()
                .with_context(|| format!("invalid destination URL {destination:?}"))?;
            if dest.scheme().is_none() || dest.host().is_none() {
                bail!("invalid destination URL {destination:?}");
            }
            mappings.push(Mapping {
                path_prefix: path_prefix.to_string(),
                destination: dest,
            });
            Ok(())
        };

        if !settings.destination.is_empty() {
            add_mapping("", &settings.destination)?;
        }
        for mapping in &settings.mappings {
            add_mapping(&mapping.path, &mapping.destination)?;
        }

        // most specific prefix first
        mappings.sort_by(|a, b| b.path_prefix.len().cmp(&a.path_prefix.len()));

        let self_url = if info.self_url.is_empty() {
            None
        } else {
            Some(info.self_url.parse::<Uri>().context("invalid self_url")?)
        };

        Ok(Self {
            info,
            helper,
            mappings,
            settings,
            self_url,
        })
    }

    pub fn info(&self) -> &SiteInfo {
        &self.info
    }

    pub async fn serve(&self, ctx: &RequestContext, req: Request<Body>) -> Response {
        let req_path = self.info.strip_prefix(req.uri().path()).to_string();

        let Some(mapping) = self
            .mappings
            .iter()
            .find(|m| req_path.starts_with(&m.path_prefix))
        else {
            return plain_text_error(
                StatusCode::NOT_FOUND,
                &format!("Invalid path {req_path}"),
            );
        };

        let dest = &mapping.destination;
        let dest_path = match dest.path() {
            "/" => "",
            path => path,
        };
        let remaining = &req_path[mapping.path_prefix.len()..];
        let mut path_and_query = format!("{dest_path}{remaining}");
        if let Some(query) = req.uri().query() {
            path_and_query.push('?');
            path_and_query.push_str(query);
        }

        let downstream = match Uri::builder()
            .scheme(dest.scheme_str().unwrap_or("https"))
            .authority(dest.authority().expect("validated at init").clone())
            .path_and_query(path_and_query)
            .build()
        {
            Ok(uri) => uri,
            Err(_) => {
                return plain_text_error(StatusCode::NOT_FOUND, &format!("Invalid path {req_path}"))
            }
        };

        let opts = ProxyOptions::new()
            .with_redirect_action(self.settings.redirect_action, self.location_rewriter());
        self.helper.run_reverse_proxy(ctx, req, downstream, opts).await
    }

    /// Rewrites redirect locations that point at a mapping's destination back
    /// onto this site, when a self URL is configured.
    fn location_rewriter(&self) -> Option<crate::helper::LocationRewriter> {
        let self_url = self.self_url.clone()?;
        let mappings: Arc<Vec<(String, Uri)>> = Arc::new(
            self.mappings
                .iter()
                .map(|m| (m.path_prefix.clone(), m.destination.clone()))
                .collect(),
        );
        let site_prefix = self.info.path_prefix.clone();

        Some(Box::new(move |info| {
            let location = info.location.as_ref()?;
            for (prefix, dest) in mappings.iter() {
                if location.scheme_str() == dest.scheme_str() && location.host() == dest.host() {
                    let mut path_and_query =
                        format!("{}{}{}", site_prefix, prefix, location.path());
                    if let Some(query) = location.query() {
                        path_and_query.push('?');
                        path_and_query.push_str(query);
                    }
                    let rewritten = Uri::builder()
                        .scheme(self_url.scheme_str()?)
                        .authority(self_url.authority()?.clone())
                        .path_and_query(path_and_query)
                        .build()
                        .ok()?;
                    return Some(rewritten.to_string());
                }
            }
            None
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, HttpProxyMapping};
    use crate::helper::RequestHelperFactory;

    fn test_helper() -> RequestHelper {
        let cfg = Config::from_yaml("{}").unwrap();
        RequestHelperFactory::new(Arc::new(cfg))
            .unwrap()
            .new_request_helper(None)
    }

    fn handler_with(settings: HttpProxySettings) -> HttpProxyHandler {
        let info = SiteInfo {
            id: "site0".to_string(),
            path_prefix: String::new(),
            self_url: String::new(),
        };
        HttpProxyHandler::new(info, test_helper(), settings).unwrap()
    }

    #[tokio::test]
    async fn test_mappings_sorted_most_specific_first() {
        let handler = handler_with(HttpProxySettings {
            destination: "https://fallback.example".to_string(),
            mappings: vec![
                HttpProxyMapping {
                    path: "/api".to_string(),
                    destination: "https://api.example".to_string(),
                },
                HttpProxyMapping {
                    path: "/api/v2".to_string(),
                    destination: "https://api-v2.example".to_string(),
                },
            ],
            ..HttpProxySettings::default()
        });

        let prefixes: Vec<&str> = handler
            .mappings
            .iter()
            .map(|m| m.path_prefix.as_str())
            .collect();
        assert_eq!(prefixes, vec!["/api/v2", "/api", ""]);
    }

    #[tokio::test]
    async fn test_invalid_destination_rejected() {
        let info = SiteInfo {
            id: "site0".to_string(),
            path_prefix: String::new(),
            self_url: String::new(),
        };
        let settings = HttpProxySettings {
            destination: "no-scheme".to_string(),
            ..HttpProxySettings::default()
        };
        assert!(HttpProxyHandler::new(info, test_helper(), settings).is_err());
    }

    #[tokio::test]
    async fn test_unmapped_path_is_404() {
        let handler = handler_with(HttpProxySettings {
            mappings: vec![HttpProxyMapping {
                path: "/only".to_string(),
                destination: "https://dest.example".to_string(),
            }],
            ..HttpProxySettings::default()
        });

        let ctx = RequestContext::new("site0", "h", "203.0.113.9");
        let req = Request::builder()
            .uri("http://h/other/path")
            .body(Body::empty())
            .unwrap();
        let resp = handler.serve(&ctx, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
