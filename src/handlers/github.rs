//! GitHub / gist download proxy
//!
//! The target URL rides in the request path (`/https://github.com/...`).
//! Only a fixed set of download hosts is reachable, and only URL shapes that
//! identify an author/repository, so the repos filter lists can apply.
//! Responses can be size-capped, and raw text files can have their
//! `raw.githubusercontent.com` URLs rewritten to point back at the proxy.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use anyhow::Result;
use axum::body::Body;
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use axum::http::{Request, StatusCode, Uri};
use axum::response::Response;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::codec::{wrap_body, BodyTransform, BoxedTransform};
use crate::config::GithubProxySettings;
use crate::context::RequestContext;
use crate::error::{plain_text_error, status_response, HttpError};
use crate::handlers::SiteInfo;
use crate::helper::{modify_response_body_advanced, ProxyOptions, RequestHelper};
use crate::replace::{find_subslice, SearchFn};

const RAW_GITHUB_URL: &str = "https://raw.githubusercontent.com";

static GITHUB_MAIN_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new("^/([^/]+)/([^/]+)/((releases|archive|blob|raw|info)/|git-upload-pack$)").unwrap()
});
static GITHUB_RAW_PATH: Lazy<Regex> =
    Lazy::new(|| Regex::new("^/([^/]+)/([^/]+)/[^/]+/").unwrap()); // author, repos, branch
static GIST_PATH: Lazy<Regex> = Lazy::new(|| Regex::new("^/([^/]+)/[^/]+/").unwrap()); // author, hash

enum HostKind {
    /// author + repos in the path
    Main(&'static Lazy<Regex>),
    /// author only
    Gist(&'static Lazy<Regex>),
}

static ALLOWED_HOSTS: Lazy<HashMap<&'static str, HostKind>> = Lazy::new(|| {
    HashMap::from([
        ("github.com", HostKind::Main(&GITHUB_MAIN_PATH)),
        ("raw.githubusercontent.com", HostKind::Main(&GITHUB_RAW_PATH)),
        ("gist.github.com", HostKind::Gist(&GIST_PATH)),
        ("gist.githubusercontent.com", HostKind::Gist(&GIST_PATH)),
    ])
});

// notes: check the final request host after redirects before rewriting
const RAW_TEXT_REWRITE_HOSTS: &[&str] = &["raw.githubusercontent.com", "gist.githubusercontent.com"];

fn parse_author_repos(host: &str, path: &str) -> Option<(String, String)> {
    match ALLOWED_HOSTS.get(host)? {
        HostKind::Main(pattern) => {
            let captures = pattern.captures(path)?;
            Some((captures[1].to_string(), captures[2].to_string()))
        }
        HostKind::Gist(pattern) => {
            let captures = pattern.captures(path)?;
            Some((captures[1].to_string(), String::new()))
        }
    }
}

// ============================================================================
// Repos filter lists
// ============================================================================

struct ReposListEntry {
    author: String,
    repos: String,
}

struct ReposList(Vec<ReposListEntry>);

impl ReposList {
    fn new(list: &[String]) -> Self {
        let entries = list
            .iter()
            .map(|entry| {
                let (author, repos) = entry
                    .split_once('/')
                    .unwrap_or((entry.as_str(), ""));
                ReposListEntry {
                    author: author.to_string(),
                    repos: repos.to_string(),
                }
            })
            .collect();
        ReposList(entries)
    }

    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn check(&self, author: &str, repos: &str) -> bool {
        self.0.iter().any(|entry| {
            (entry.author == "*" || entry.author == author)
                && (entry.repos == "*" || entry.repos == repos)
        })
    }
}

// ============================================================================
// Raw-text URL rewrite
// ============================================================================

// https://developer.mozilla.org/en-US/docs/Web/HTTP/Reference/Headers/Content-Type
fn is_utf8_text_type(content_type: &str) -> bool {
    if content_type.is_empty() {
        return false;
    }
    let mut parts = content_type.split(';');
    let media_type = parts.next().unwrap_or("").trim();
    if !media_type.eq_ignore_ascii_case("text/plain") {
        return false;
    }
    for param in parts {
        if let Some((key, value)) = param.split_once('=') {
            if key.trim().eq_ignore_ascii_case("charset") {
                let charset = value.trim().trim_matches('"');
                return matches!(
                    charset.to_ascii_lowercase().as_str(),
                    "utf-8" | "utf8" | "utf_8"
                );
            }
        }
    }
    false
}

fn is_bad_prev_char_for_rewrite(b: u8) -> bool {
    // [0-9a-zA-Z]: bad scheme       : "nothttps://raw.githubusercontent.com/xxx/yyy"
    // '/': part of existing url     : "https://other.ghproxy.com/https://raw.githubusercontent.com/xxx/yyy"
    // '}': has a url prefix variable: "${CDN_PREFIX}https://raw.githubusercontent.com/xxx/yyy"
    // '+', '-': scheme concat       : "magic+https://raw.githubusercontent.com/xxx/yyy"
    b.is_ascii_alphanumeric() || b == b'/' || b == b'+' || b == b'-' || b == b'}'
}

/// Search fn rewriting `src` to `dst` unless the preceding byte shows the
/// URL is already prefixed, templated or part of a concatenated scheme.
pub(crate) fn https_url_prefix_search_fn(src: &str, dst: &str) -> SearchFn {
    let src = src.as_bytes().to_vec();
    let dst = dst.as_bytes().to_vec();
    Box::new(move |buf, look_behind, _eof| {
        let mut start = 0;
        loop {
            let idx = find_subslice(&buf[start..], &src)? + start;

            if idx == 0 {
                match look_behind.last() {
                    // start of the stream
                    None => return Some((0, src.len(), dst.clone())),
                    Some(&prev) if !is_bad_prev_char_for_rewrite(prev) => {
                        return Some((0, src.len(), dst.clone()))
                    }
                    Some(_) => {
                        start = idx + src.len();
                        continue;
                    }
                }
            }

            let prev = buf[idx - 1];
            if !is_bad_prev_char_for_rewrite(prev) {
                // consume the previous char too so the look-behind window
                // tracks the emitted bytes
                let mut replacement = vec![prev];
                replacement.extend_from_slice(&dst);
                return Some((idx - 1, src.len() + 1, replacement));
            }
            start = idx + src.len();
        }
    })
}

// ============================================================================
// Streaming size cap
// ============================================================================

struct SizeLimitTransform {
    max_size: i64,
    read_size: i64,
}

impl BodyTransform for SizeLimitTransform {
    fn update(&mut self, chunk: &[u8]) -> io::Result<Vec<u8>> {
        self.read_size += chunk.len() as i64;
        if self.read_size > self.max_size {
            return Err(io::Error::other("response body too large"));
        }
        Ok(chunk.to_vec())
    }

    fn finish(&mut self) -> io::Result<Vec<u8>> {
        Ok(Vec::new())
    }
}

// ============================================================================
// Handler
// ============================================================================

pub struct GithubProxyHandler {
    info: SiteInfo,
    helper: RequestHelper,
    settings: GithubProxySettings,
    whitelist: ReposList,
    blacklist: ReposList,
    bypass_list: ReposList,
}

impl GithubProxyHandler {
    pub fn new(info: SiteInfo, helper: RequestHelper, settings: GithubProxySettings) -> Result<Self> {
        let whitelist = ReposList::new(&settings.repos_whitelist);
        let blacklist = ReposList::new(&settings.repos_blacklist);
        let bypass_list = ReposList::new(&settings.repos_bypass);
        Ok(Self {
            info,
            helper,
            settings,
            whitelist,
            blacklist,
            bypass_list,
        })
    }

    pub fn info(&self) -> &SiteInfo {
        &self.info
    }

    fn parse_target_url(&self, req: &Request<Body>) -> Result<Uri, Response> {
        let path = self.info.strip_prefix(req.uri().path());
        let Some(target) = path.strip_prefix('/') else {
            return Err(plain_text_error(StatusCode::BAD_REQUEST, "Invalid path"));
        };

        let mut target = target.to_string();
        if !target.contains("://") {
            target = format!("https://{target}");
        }
        if let Some(query) = req.uri().query() {
            target.push('?');
            target.push_str(query);
        }

        let target: Uri = target
            .parse()
            .map_err(|_| plain_text_error(StatusCode::BAD_REQUEST, "Invalid target URL"))?;
        if target.scheme_str() != Some("https") || target.host().is_none() {
            return Err(plain_text_error(StatusCode::BAD_REQUEST, "Invalid target URL"));
        }
        Ok(target)
    }

    pub async fn serve(&self, ctx: &RequestContext, req: Request<Body>) -> Response {
        let target = match self.parse_target_url(&req) {
            Ok(target) => target,
            Err(resp) => return resp,
        };

        let host = target.host().expect("checked in parse_target_url");
        if !ALLOWED_HOSTS.contains_key(host) {
            return plain_text_error(StatusCode::NOT_FOUND, "Forbidden host");
        }
        let Some((author, repos)) = parse_author_repos(host, target.path()) else {
            return plain_text_error(StatusCode::NOT_FOUND, "Forbidden url");
        };

        if !self.whitelist.is_empty() && !self.whitelist.check(&author, &repos) {
            return plain_text_error(
                StatusCode::FORBIDDEN,
                &format!("Repository {author}/{repos} not in whitelist"),
            );
        }
        if !self.blacklist.is_empty() && self.blacklist.check(&author, &repos) {
            return plain_text_error(
                StatusCode::FORBIDDEN,
                &format!("Repository {author}/{repos} is in blacklist"),
            );
        }
        if !self.bypass_list.is_empty() && self.bypass_list.check(&author, &repos) {
            let mut resp = status_response(StatusCode::TEMPORARY_REDIRECT);
            if let Ok(value) = axum::http::HeaderValue::from_str(&target.to_string()) {
                resp.headers_mut().insert(LOCATION, value);
            }
            return resp;
        }

        let opts = ProxyOptions::new().with_response_modifier(self.response_modifier(ctx));
        self.helper.run_reverse_proxy(ctx, req, target, opts).await
    }

    fn response_modifier(
        &self,
        ctx: &RequestContext,
    ) -> impl Fn(
        &crate::redirect::RecordedRequest,
        &mut Response<Body>,
    ) -> Result<(), HttpError>
           + Send
           + Sync
           + 'static {
        let ctx = ctx.clone();
        let size_limit = self.settings.size_limit;
        let raw_text_url_rewrite = self.settings.raw_text_url_rewrite;
        let rewrite_dst = Arc::new(format!(
            "{}{}/{}",
            self.info.self_url,
            self.info.path_prefix,
            RAW_GITHUB_URL
        ));

        move |last_req, resp| {
            if size_limit > 0 {
                let content_length = resp
                    .headers()
                    .get(CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<i64>().ok());
                if let Some(length) = content_length {
                    if length > size_limit {
                        return Err(HttpError::bad_gateway("Response body too large"));
                    }
                } else {
                    // chunked response, enforce the cap while streaming
                    let transforms: Vec<BoxedTransform> = vec![Box::new(SizeLimitTransform {
                        max_size: size_limit,
                        read_size: 0,
                    })];
                    let body = std::mem::replace(resp.body_mut(), Body::empty());
                    *resp.body_mut() = wrap_body(body.into_data_stream(), transforms, None);
                }
            }

            if raw_text_url_rewrite {
                let final_host = last_req.uri.host().unwrap_or("");
                let is_text = resp
                    .headers()
                    .get(CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .map(is_utf8_text_type)
                    .unwrap_or(false);
                if RAW_TEXT_REWRITE_HOSTS.contains(&final_host) && is_text {
                    let search_fn = https_url_prefix_search_fn(RAW_GITHUB_URL, &rewrite_dst);
                    modify_response_body_advanced(
                        &ctx,
                        resp,
                        search_fn,
                        RAW_GITHUB_URL.len() + 1,
                        1,
                    )?;
                }
            }

            Ok(())
        }
    }
}
