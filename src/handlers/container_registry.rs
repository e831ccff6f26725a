//! Container registry proxy
//!
//! Fronts an OCI/Docker registry: `/v2` API traffic, the token auth realm
//! under `/auth`, and optionally a read-only slice of the legacy `/v1` API
//! (the docker CLI still uses it for `docker search`). Supports a basic-auth
//! gate with hot-reloaded credentials, repos filter lists extracted from the
//! API paths, and the `Www-Authenticate` realm rewrite that keeps clients
//! talking to the proxy instead of the upstream auth server.

use std::sync::Arc;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use axum::body::Body;
use axum::http::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use axum::http::{HeaderValue, Method, Request, StatusCode, Uri};
use axum::response::Response;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use tracing::{debug, error};

use crate::config::{validate_user, ContainerRegistrySettings, UsersFile};
use crate::context::RequestContext;
use crate::error::{plain_text_error, status_response};
use crate::handlers::SiteInfo;
use crate::helper::{ProxyOptions, RequestHelper};

const ROUTE_PREFIX_V1: &str = "/v1";
const ROUTE_PREFIX_V2: &str = "/v2";
const ROUTE_PREFIX_AUTH: &str = "/auth";

const DUMMY_AUTH_TOKEN: &str = "pavonis-dummy-token";

static REALM_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r#"realm="[^"]+""#).unwrap());
static V1_LIST_TAGS_PATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^/v1/repositories/.+/tags$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RoutePrefix {
    V1,
    V2,
    AuthRealm,
}

// ============================================================================
// Repos filter lists (path-segment entries, `*` wildcards per segment)
// ============================================================================

struct ReposList(Vec<Vec<String>>);

impl ReposList {
    fn new(list: &[String]) -> Self {
        ReposList(
            list.iter()
                .map(|entry| entry.split('/').map(str::to_string).collect())
                .collect(),
        )
    }

    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn check(&self, repos: &[String]) -> bool {
        self.0.iter().any(|entry| {
            if entry.len() < repos.len() {
                // actual repos is longer than the entry
                return false;
            }
            // entries shorter than the repos treat the missing parts as "*"
            entry
                .iter()
                .zip(repos.iter())
                .all(|(pattern, segment)| pattern == "*" || pattern == segment)
        })
    }
}

// https://docs.docker.com/reference/api/hub/deprecated/
// Possible paths:
//
//     "/v1/repositories/{name}/images"
//     "/v1/repositories/{name}/tags"
//     "/v1/repositories/{name}/tags/{tag_name}"
//     "/v1/repositories/{namespace}/{name}/images"
//     "/v1/repositories/{namespace}/{name}/tags"
//     "/v1/repositories/{namespace}/{name}/tags/{tag_name}"
fn extract_repos_name_from_v1_path(path: &str) -> Option<Vec<String>> {
    let path = path.strip_prefix("/v1/repositories/")?;

    for suffix in ["/images", "/tags"] {
        if let Some(name) = path.strip_suffix(suffix) {
            return Some(name.split('/').map(str::to_string).collect());
        }
    }

    if let Some(idx) = path.rfind("/tags/") {
        let (pre, post) = (&path[..idx], &path[idx + "/tags/".len()..]);
        if !pre.is_empty() && !post.is_empty() && !post.contains('/') {
            return Some(pre.split('/').map(str::to_string).collect());
        }
    }

    None
}

// https://distribution.github.io/distribution/spec/api/#detail
// Possible paths:
//
//     "/v2/_catalog"
//     "/v2/<name>/blobs/<digest>"
//     "/v2/<name>/blobs/uploads/"
//     "/v2/<name>/blobs/uploads/<uuid>"
//     "/v2/<name>/manifests/<reference>"
//     "/v2/<name>/tags/list"
fn extract_repos_name_from_v2_path(path: &str) -> Option<Vec<String>> {
    let path = path.strip_prefix("/v2/")?;

    for keyword in ["/blobs/uploads/", "/blobs/", "/tags/list", "/manifests/"] {
        if let Some(idx) = path.find(keyword) {
            let name = &path[..idx];
            return Some(name.split('/').map(str::to_string).collect());
        }
    }

    None
}

// ============================================================================
// Auth users
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
struct AuthUser {
    name: String,
    password: String,
}

fn build_auth_user_list(
    site_id: &str,
    settings: &ContainerRegistrySettings,
) -> Result<Vec<AuthUser>> {
    let mut users = Vec::new();
    if !settings.auth.enabled {
        return Ok(users);
    }

    for user in &settings.auth.users {
        users.push(AuthUser {
            name: user.name.clone(),
            password: user.password.clone(),
        });
    }

    if !settings.auth.users_file.is_empty() {
        let content = std::fs::read_to_string(&settings.auth.users_file)
            .with_context(|| format!("failed to read users file {:?}", settings.auth.users_file))?;
        let users_file: UsersFile =
            serde_yaml::from_str(&content).context("failed to parse users file")?;
        for (user_idx, user) in users_file.users.iter().enumerate() {
            validate_user(user)
                .with_context(|| format!("failed to validate user[{user_idx}]"))?;
            users.push(AuthUser {
                name: user.name.clone(),
                password: user.password.clone(),
            });
        }
        debug!(
            "({}) loaded {} users from file {:?}",
            site_id,
            users_file.users.len(),
            settings.auth.users_file
        );
    }

    Ok(users)
}

/// `user$upstream_user` / `pass$upstream_pass` credential splitting: the part
/// before `$` authenticates against the proxy, the remainder is forwarded.
fn split_credential(s: &str) -> (String, Option<String>) {
    match s.split_once('$') {
        Some((own, upstream)) => (own.to_string(), Some(upstream.to_string())),
        None => (s.to_string(), None),
    }
}

fn parse_basic_auth(req: &Request<Body>) -> Option<(String, String)> {
    let header = req.headers().get(AUTHORIZATION)?.to_str().ok()?;
    let encoded = header.strip_prefix("Basic ")?;
    let decoded = BASE64.decode(encoded).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

// ============================================================================
// Handler
// ============================================================================

pub struct ContainerRegistryHandler {
    info: SiteInfo,
    helper: RequestHelper,
    settings: ContainerRegistrySettings,

    upstream_v1_url: Option<Uri>,
    upstream_v2_url: Uri,
    upstream_auth_realm_url: Uri,

    whitelist: ReposList,
    blacklist: ReposList,
    auth_users: Arc<ArcSwap<Vec<AuthUser>>>,
    reload_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ContainerRegistryHandler {
    pub fn new(
        info: SiteInfo,
        helper: RequestHelper,
        settings: ContainerRegistrySettings,
    ) -> Result<Self> {
        let upstream_v1_url = settings
            .upstream_v1_url
            .as_deref()
            .map(|url| url.parse::<Uri>().context("invalid upstream_v1_url"))
            .transpose()?;
        let upstream_v2_url: Uri = settings
            .upstream_v2_url
            .as_deref()
            .unwrap_or_default()
            .parse()
            .context("invalid upstream_v2_url")?;
        let upstream_auth_realm_url: Uri = settings
            .upstream_auth_realm_url
            .as_deref()
            .unwrap_or_default()
            .parse()
            .context("invalid upstream_auth_realm_url")?;

        let auth_users = Arc::new(ArcSwap::from_pointee(build_auth_user_list(
            &info.id, &settings,
        )?));

        let handler = Self {
            whitelist: ReposList::new(&settings.repos_whitelist),
            blacklist: ReposList::new(&settings.repos_blacklist),
            info,
            helper,
            upstream_v1_url,
            upstream_v2_url,
            upstream_auth_realm_url,
            auth_users: auth_users.clone(),
            reload_task: Mutex::new(None),
            settings,
        };
        handler.spawn_background_reload();
        Ok(handler)
    }

    pub fn info(&self) -> &SiteInfo {
        &self.info
    }

    pub fn shutdown(&self) {
        if let Some(task) = self.reload_task.lock().take() {
            task.abort();
        }
    }

    /// Periodically rebuild the user list from config plus the users file.
    /// A failed reload keeps the previous list.
    fn spawn_background_reload(&self) {
        let Some(interval) = self.settings.auth.users_file_reload_interval else {
            return;
        };
        if !self.settings.auth.enabled {
            return;
        }

        let settings = self.settings.clone();
        let site_id = self.info.id.clone();
        let auth_users = self.auth_users.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.duration());
            ticker.tick().await; // the first tick fires immediately
            loop {
                ticker.tick().await;
                match build_auth_user_list(&site_id, &settings) {
                    Ok(users) => auth_users.store(Arc::new(users)),
                    Err(e) => error!("({site_id}) Failed to build auth user list: {e:#}"),
                }
            }
        });
        *self.reload_task.lock() = Some(task);
    }

    fn check_for_authorization(&self, username: &str, password: &str) -> bool {
        self.auth_users
            .load()
            .iter()
            .any(|user| user.name == username && user.password == password)
    }

    fn get_route(&self, req_path: &str) -> Option<(Uri, RoutePrefix)> {
        if self.upstream_v1_url.is_some() && req_path.starts_with(ROUTE_PREFIX_V1) {
            return Some((
                self.upstream_v1_url.clone().expect("checked above"),
                RoutePrefix::V1,
            ));
        }
        if req_path.starts_with(ROUTE_PREFIX_V2) {
            return Some((self.upstream_v2_url.clone(), RoutePrefix::V2));
        }
        if req_path.starts_with(ROUTE_PREFIX_AUTH) {
            return Some((self.upstream_auth_realm_url.clone(), RoutePrefix::AuthRealm));
        }
        None
    }

    fn check_repos_filter(
        &self,
        ctx: &RequestContext,
        req_path: &str,
        route: RoutePrefix,
    ) -> Option<Response> {
        if self.whitelist.is_empty() && self.blacklist.is_empty() {
            return None;
        }

        let repos_name = match route {
            RoutePrefix::V1 => extract_repos_name_from_v1_path(req_path),
            RoutePrefix::V2 => extract_repos_name_from_v2_path(req_path),
            RoutePrefix::AuthRealm => None,
        };
        debug!(
            "{}Extracted repos name from path {:?}: {:?}",
            ctx.log_prefix, req_path, repos_name
        );

        let repos_name = repos_name?;
        if !self.whitelist.is_empty() && !self.whitelist.check(&repos_name) {
            return Some(plain_text_error(
                StatusCode::FORBIDDEN,
                &format!("Repository '{}' is not whitelisted", repos_name.join("/")),
            ));
        }
        if !self.blacklist.is_empty() && self.blacklist.check(&repos_name) {
            return Some(plain_text_error(
                StatusCode::FORBIDDEN,
                &format!("Repository '{}' is blacklisted", repos_name.join("/")),
            ));
        }
        None
    }

    /// Basic-auth gate for the token realm plus the mocked `docker login`
    /// flows. `Some` short-circuits the reverse proxy.
    fn handle_auth(
        &self,
        ctx: &RequestContext,
        req: &mut Request<Body>,
        req_path: &str,
        route: RoutePrefix,
    ) -> Option<Response> {
        if !self.settings.auth.enabled {
            return None;
        }

        if route == RoutePrefix::AuthRealm && req_path == ROUTE_PREFIX_AUTH {
            let Some((username, password)) = parse_basic_auth(req) else {
                return Some(status_response(StatusCode::UNAUTHORIZED));
            };
            let (self_user, upstream_user) = split_credential(&username);
            let (self_password, upstream_password) = split_credential(&password);

            if !self.check_for_authorization(&self_user, &self_password) {
                return Some(plain_text_error(
                    StatusCode::UNAUTHORIZED,
                    "Invalid credentials",
                ));
            }

            match (&upstream_user, &upstream_password) {
                (Some(user), Some(password)) => {
                    let encoded = BASE64.encode(format!("{user}:{password}"));
                    if let Ok(value) = HeaderValue::from_str(&format!("Basic {encoded}")) {
                        req.headers_mut().insert(AUTHORIZATION, value);
                    }
                }
                _ => {
                    req.headers_mut().remove(AUTHORIZATION);
                }
            }

            let has_scope = req
                .uri()
                .query()
                .map(|q| q.split('&').any(|p| p.starts_with("scope=")))
                .unwrap_or(false);
            if !has_scope && upstream_user.is_none() {
                // A token request without a scope query is likely a bare
                // `docker login`; some upstream realms (e.g. ghcr.io) reject
                // those, so answer it ourselves with a dummy token.
                debug!(
                    "{}Mocking a successful {} result for a proxy-only login request",
                    ctx.log_prefix, req_path
                );
                let body = serde_json::json!({ "token": DUMMY_AUTH_TOKEN }).to_string();
                let resp = Response::builder()
                    .status(StatusCode::OK)
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .expect("static response");
                return Some(resp);
            }
        }

        if route == RoutePrefix::V2 && req_path == "/v2/" {
            // the post-login probe comes back with our dummy token
            let authorization = req
                .headers()
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok());
            if authorization == Some(&format!("Bearer {DUMMY_AUTH_TOKEN}")) {
                // https://distribution.github.io/distribution/spec/api/#api-version-check
                debug!(
                    "{}Mocking a successful {} result for a proxy-only login request",
                    ctx.log_prefix, req_path
                );
                let resp = Response::builder()
                    .status(StatusCode::OK)
                    .header("Docker-Distribution-API-Version", "registry/2.0")
                    .body(Body::empty())
                    .expect("static response");
                return Some(resp);
            }
        }

        None
    }

    pub async fn serve(&self, ctx: &RequestContext, mut req: Request<Body>) -> Response {
        let req_path = self.info.strip_prefix(req.uri().path()).to_string();

        let Some((upstream, route)) = self.get_route(&req_path) else {
            return status_response(StatusCode::NOT_FOUND);
        };

        // reason for supporting v1: the docker client still uses the /v1
        // endpoint for its search command, so only list operations pass
        //
        // V1 APIs (incomplete, but enough for listing)
        // GET      /v1/_ping
        // GET      /v1/search
        // GET      /v1/repositories/<name>/tags
        if route == RoutePrefix::V1
            && req_path != "/v1/_ping"
            && req_path != "/v1/search"
            && !V1_LIST_TAGS_PATH.is_match(&req_path)
        {
            return status_response(StatusCode::NOT_FOUND);
        }

        if route == RoutePrefix::V2 {
            let is_read = req.method() == Method::GET || req.method() == Method::HEAD;
            // auth-gated sites never accept pushes
            if !is_read && (!self.settings.allow_push || self.settings.auth.enabled) {
                return status_response(StatusCode::METHOD_NOT_ALLOWED);
            }
            if req_path.starts_with("/v2/_catalog") && !self.settings.allow_list {
                return status_response(StatusCode::FORBIDDEN);
            }
        }

        if let Some(resp) = self.check_repos_filter(ctx, &req_path, route) {
            return resp;
        }
        if let Some(resp) = self.handle_auth(ctx, &mut req, &req_path, route) {
            return resp;
        }

        let route_prefix = match route {
            RoutePrefix::V1 => ROUTE_PREFIX_V1,
            RoutePrefix::V2 => ROUTE_PREFIX_V2,
            RoutePrefix::AuthRealm => ROUTE_PREFIX_AUTH,
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

        let opts = if route == RoutePrefix::V2 {
            // Point the auth realm back at us so the client fetches tokens
            // through the proxy.
            let new_realm = format!(
                "realm=\"{}{}{}\"",
                self.info.self_url, self.info.path_prefix, ROUTE_PREFIX_AUTH
            );
            ProxyOptions::new().with_response_modifier(move |_last_req, resp| {
                if resp.status() == StatusCode::UNAUTHORIZED {
                    let rewritten = resp
                        .headers()
                        .get(WWW_AUTHENTICATE)
                        .and_then(|v| v.to_str().ok())
                        .map(|auth| REALM_PATTERN.replace(auth, new_realm.as_str()).into_owned());
                    if let Some(rewritten) = rewritten {
                        if let Ok(value) = HeaderValue::from_str(&rewritten) {
                            resp.headers_mut().insert(WWW_AUTHENTICATE, value);
                        }
                    }
                }
                Ok(())
            })
        } else {
            ProxyOptions::new()
        };

        self.helper.run_reverse_proxy(ctx, req, downstream, opts).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_repos_name_from_v1_path() {
        assert_eq!(
            extract_repos_name_from_v1_path("/v1/repositories/library/nginx/tags"),
            Some(vec!["library".to_string(), "nginx".to_string()])
        );
        assert_eq!(
            extract_repos_name_from_v1_path("/v1/repositories/nginx/images"),
            Some(vec!["nginx".to_string()])
        );
        assert_eq!(
            extract_repos_name_from_v1_path("/v1/repositories/library/nginx/tags/latest"),
            Some(vec!["library".to_string(), "nginx".to_string()])
        );
        assert_eq!(extract_repos_name_from_v1_path("/v1/search"), None);
        assert_eq!(
            extract_repos_name_from_v1_path("/v1/repositories/x/tags/a/b"),
            None
        );
    }

    #[test]
    fn test_extract_repos_name_from_v2_path() {
        assert_eq!(
            extract_repos_name_from_v2_path("/v2/library/nginx/manifests/latest"),
            Some(vec!["library".to_string(), "nginx".to_string()])
        );
        assert_eq!(
            extract_repos_name_from_v2_path("/v2/library/nginx/blobs/sha256:abc"),
            Some(vec!["library".to_string(), "nginx".to_string()])
        );
        assert_eq!(
            extract_repos_name_from_v2_path("/v2/library/nginx/blobs/uploads/"),
            Some(vec!["library".to_string(), "nginx".to_string()])
        );
        assert_eq!(
            extract_repos_name_from_v2_path("/v2/library/nginx/tags/list"),
            Some(vec!["library".to_string(), "nginx".to_string()])
        );
        assert_eq!(extract_repos_name_from_v2_path("/v2/_catalog"), None);
    }

    #[test]
    fn test_repos_list_check() {
        let list = ReposList::new(&[
            "library/nginx".to_string(),
            "trusted/*".to_string(),
            "solo".to_string(),
        ]);
        assert!(list.check(&["library".to_string(), "nginx".to_string()]));
        assert!(!list.check(&["library".to_string(), "redis".to_string()]));
        assert!(list.check(&["trusted".to_string(), "anything".to_string()]));
        // entries shorter than the repos path do not match
        assert!(!list.check(&["solo".to_string(), "extra".to_string()]));
        assert!(list.check(&["solo".to_string()]));
        // repos shorter than the entry: missing segments are wildcards
        assert!(list.check(&["library".to_string()]));
    }

    #[test]
    fn test_split_credential() {
        assert_eq!(split_credential("alice"), ("alice".to_string(), None));
        assert_eq!(
            split_credential("alice$bob"),
            ("alice".to_string(), Some("bob".to_string()))
        );
        assert_eq!(
            split_credential("alice$bob$c"),
            ("alice".to_string(), Some("bob$c".to_string()))
        );
    }

    #[test]
    fn test_realm_pattern_rewrite() {
        let auth = r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io""#;
        let rewritten =
            REALM_PATTERN.replace(auth, r#"realm="https://cr.example.com/auth""#);
        assert_eq!(
            rewritten,
            r#"Bearer realm="https://cr.example.com/auth",service="registry.docker.io""#
        );
    }

    #[test]
    fn test_v1_list_tags_pattern() {
        assert!(V1_LIST_TAGS_PATH.is_match("/v1/repositories/library/nginx/tags"));
        assert!(!V1_LIST_TAGS_PATH.is_match("/v1/repositories/tags"));
        assert!(!V1_LIST_TAGS_PATH.is_match("/v1/repositories/library/nginx/tags/latest"));
    }
}
