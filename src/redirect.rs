//! Redirect-following egress transport
//!
//! Replays a request across 3xx responses, consulting a per-call redirect
//! handler at every hop: `Follow` keeps going, `Rewrite` overwrites the
//! `Location` header and surfaces the response, `Return` surfaces it as-is.
//! Request bodies are captured in a bounded replay window so the first
//! redirect can resend them; sensitive headers are stripped whenever a hop
//! changes hosts.

use std::sync::Arc;

use axum::body::Body;
use axum::http::header::{
    HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, COOKIE, HOST, LOCATION, WWW_AUTHENTICATE,
};
use axum::http::{Method, Request, StatusCode, Uri};
use hyper::body::Incoming;
use hyper::Response;
use tracing::{debug, error, warn};

use crate::context::RequestContext;
use crate::error::HttpError;
use crate::rate_limit::MultiRateLimiter;
use crate::replay::ReplayBuffer;
use crate::transport::EgressClient;

/// Capture window for request-body replay across the first redirect.
pub const REPLAY_BUFFER_SIZE: usize = 8192;

#[derive(Debug, Clone)]
pub enum RedirectDecision {
    Follow,
    Rewrite(String),
    Return,
}

/// What a redirect handler gets to look at: the 3xx response's status and
/// headers, plus its `Location` resolved against the request that triggered
/// it.
pub struct RedirectInfo<'a> {
    pub status: StatusCode,
    pub headers: &'a HeaderMap,
    pub location: Option<Uri>,
}

pub type RedirectHandler = Arc<dyn Fn(&RedirectInfo<'_>) -> RedirectDecision + Send + Sync>;

/// The request as it went out on one hop; the final entry is handed to
/// response modifiers.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
}

pub fn is_redirect_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}

fn is_sensitive_header(name: &HeaderName) -> bool {
    name == AUTHORIZATION || name == WWW_AUTHENTICATE || name == COOKIE || name.as_str() == "cookie2"
}

/// Resolve a `Location` header value against the URI that produced it.
pub fn resolve_location(base: &Uri, headers: &HeaderMap) -> Option<Uri> {
    let location = headers.get(LOCATION)?.to_str().ok()?;

    if let Ok(uri) = location.parse::<Uri>() {
        if uri.scheme().is_some() && uri.authority().is_some() {
            return Some(uri);
        }
    }

    let scheme = base.scheme_str()?;
    let authority = base.authority()?;
    let path_and_query = if location.starts_with('/') {
        location.to_string()
    } else {
        let base_path = base.path();
        let dir_end = base_path.rfind('/')?;
        format!("{}{}", &base_path[..=dir_end], location)
    };

    Uri::builder()
        .scheme(scheme)
        .authority(authority.clone())
        .path_and_query(path_and_query)
        .build()
        .ok()
}

/// Headers for the next hop. Sensitive credentials do not cross a host
/// boundary, and `Host` is re-derived from the new URI.
fn rebuild_hop_headers(headers: &HeaderMap, host_changed: bool) -> HeaderMap {
    let mut next = HeaderMap::new();
    for (name, value) in headers.iter() {
        if host_changed && is_sensitive_header(name) {
            continue;
        }
        next.append(name.clone(), value.clone());
    }
    next.remove(HOST);
    next
}

pub struct RedirectFollowingTransport<'a> {
    ctx: &'a RequestContext,
    client: &'a EgressClient,
    max_redirects: usize,
    handler: RedirectHandler,
    limiter: Arc<MultiRateLimiter>,
}

impl<'a> RedirectFollowingTransport<'a> {
    pub fn new(
        ctx: &'a RequestContext,
        client: &'a EgressClient,
        max_redirects: usize,
        handler: RedirectHandler,
        limiter: Arc<MultiRateLimiter>,
    ) -> Self {
        Self {
            ctx,
            client,
            max_redirects,
            handler,
            limiter,
        }
    }

    /// Run the request, following redirects per the handler's decisions.
    /// Every outgoing hop is appended to `history`.
    pub async fn round_trip(
        &self,
        req: Request<Body>,
        history: &mut Vec<RecordedRequest>,
    ) -> Result<Response<Incoming>, HttpError> {
        let (parts, body) = req.into_parts();

        let limited = crate::codec::wrap_body(
            body.into_data_stream(),
            Vec::new(),
            Some(self.limiter.clone()),
        );
        let (captured, replay) = ReplayBuffer::capture(limited, REPLAY_BUFFER_SIZE);

        let method = parts.method;
        let mut uri = parts.uri;
        let mut headers = parts.headers;
        let mut body = Some(captured);
        let mut redirect_count = 0usize;

        loop {
            let mut out_req = Request::builder()
                .method(method.clone())
                .uri(uri.clone())
                .body(body.take().unwrap_or_else(Body::empty))
                .map_err(|e| {
                    HttpError::bad_gateway(format!("failed to build upstream request: {e}"))
                })?;
            *out_req.headers_mut() = headers.clone();

            history.push(RecordedRequest {
                method: method.clone(),
                uri: uri.clone(),
                headers: headers.clone(),
            });

            let mut resp = self.client.request(out_req).await.map_err(|e| {
                error!("{}Upstream request to {} failed: {}", self.ctx.log_prefix, uri, e);
                HttpError::bad_gateway("upstream request failed")
            })?;

            if !is_redirect_status(resp.status()) {
                return Ok(resp);
            }
            if redirect_count >= self.max_redirects {
                return Ok(resp);
            }

            let location = resolve_location(&uri, resp.headers());
            let info = RedirectInfo {
                status: resp.status(),
                headers: resp.headers(),
                location: location.clone(),
            };
            match (self.handler)(&info) {
                RedirectDecision::Follow => {}
                RedirectDecision::Rewrite(new_location) => {
                    match HeaderValue::from_str(&new_location) {
                        Ok(value) => {
                            resp.headers_mut().insert(LOCATION, value);
                        }
                        Err(_) => {
                            warn!(
                                "{}Rewritten Location {:?} is not a valid header value",
                                self.ctx.log_prefix, new_location
                            );
                        }
                    }
                    return Ok(resp);
                }
                RedirectDecision::Return => return Ok(resp),
            }

            let Some(location) = location else {
                debug!(
                    "{}Missing or unparsable Location in a {} response, do not follow",
                    self.ctx.log_prefix,
                    resp.status()
                );
                return Ok(resp);
            };

            debug!(
                "{}Following redirect ({}) from {:?} to {:?}",
                self.ctx.log_prefix,
                resp.status(),
                uri.to_string(),
                location.to_string()
            );
            // close the previous response body
            drop(resp);

            let host_changed = uri.host() != location.host();
            headers = rebuild_hop_headers(&headers, host_changed);

            // the method survives every hop unchanged, 303 included
            redirect_count += 1;
            uri = location;
            body = if redirect_count == 1 {
                let (replayed, ok) = replay.next_body();
                if !ok {
                    return Err(HttpError::bad_gateway(
                        "request body too large to replay across redirect",
                    ));
                }
                Some(replayed)
            } else {
                Some(Body::empty())
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_redirect_status() {
        for code in [301u16, 302, 303, 307, 308] {
            assert!(is_redirect_status(StatusCode::from_u16(code).unwrap()));
        }
        for code in [200u16, 204, 304, 400, 502] {
            assert!(!is_redirect_status(StatusCode::from_u16(code).unwrap()));
        }
    }

    fn headers_with_location(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(LOCATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_resolve_location_absolute() {
        let base: Uri = "https://github.com/owner/repo/releases".parse().unwrap();
        let resolved =
            resolve_location(&base, &headers_with_location("https://other.example/asset"))
                .unwrap();
        assert_eq!(resolved.to_string(), "https://other.example/asset");
    }

    #[test]
    fn test_resolve_location_path_absolute() {
        let base: Uri = "https://github.com/owner/repo".parse().unwrap();
        let resolved =
            resolve_location(&base, &headers_with_location("/login?next=%2Frepo")).unwrap();
        assert_eq!(resolved.scheme_str(), Some("https"));
        assert_eq!(resolved.host(), Some("github.com"));
        assert_eq!(resolved.path_and_query().unwrap().as_str(), "/login?next=%2Frepo");
    }

    #[test]
    fn test_resolve_location_relative() {
        let base: Uri = "https://example.com/a/b/c".parse().unwrap();
        let resolved = resolve_location(&base, &headers_with_location("d/e")).unwrap();
        assert_eq!(resolved.path(), "/a/b/d/e");
    }

    #[test]
    fn test_resolve_location_missing() {
        let base: Uri = "https://example.com/".parse().unwrap();
        assert!(resolve_location(&base, &HeaderMap::new()).is_none());
    }

    #[test]
    fn test_sensitive_header_set() {
        for name in ["authorization", "www-authenticate", "cookie", "cookie2"] {
            assert!(is_sensitive_header(&HeaderName::from_static(name)), "{name}");
        }
        assert!(!is_sensitive_header(&HeaderName::from_static("accept")));
    }

    fn hop_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer X"));
        headers.insert(COOKIE, HeaderValue::from_static("session=1"));
        headers.insert("cookie2", HeaderValue::from_static("extra=1"));
        headers.insert(WWW_AUTHENTICATE, HeaderValue::from_static("Basic"));
        headers.insert("accept", HeaderValue::from_static("*/*"));
        headers.insert(HOST, HeaderValue::from_static("old.example"));
        headers
    }

    #[test]
    fn test_rebuild_hop_headers_cross_host_strips_credentials() {
        let rebuilt = rebuild_hop_headers(&hop_headers(), true);
        assert!(rebuilt.get(AUTHORIZATION).is_none());
        assert!(rebuilt.get(COOKIE).is_none());
        assert!(rebuilt.get("cookie2").is_none());
        assert!(rebuilt.get(WWW_AUTHENTICATE).is_none());
        assert_eq!(rebuilt.get("accept").unwrap(), "*/*");
        assert!(rebuilt.get(HOST).is_none());
    }

    #[test]
    fn test_rebuild_hop_headers_same_host_keeps_credentials() {
        let rebuilt = rebuild_hop_headers(&hop_headers(), false);
        assert_eq!(rebuilt.get(AUTHORIZATION).unwrap(), "Bearer X");
        assert_eq!(rebuilt.get(COOKIE).unwrap(), "session=1");
        // the Host header is always re-derived
        assert!(rebuilt.get(HOST).is_none());
    }
}
