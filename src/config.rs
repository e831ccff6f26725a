//! YAML configuration model, defaults and validation
//!
//! Configuration is loaded from a file (or the `PAVONIS_CONFIG` environment
//! variable, whose content replaces the file when set), filled with defaults,
//! and validated before the server starts. Validation failures are fatal.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use axum::http::Uri;
use serde::{Deserialize, Deserializer};

use crate::ip_pool::IpPool;
use crate::transport::ProxySpec;

/// Environment variable whose content replaces the config file when set.
pub const CONFIG_ENV_VAR: &str = "PAVONIS_CONFIG";

const GIB: i64 = 1024 * 1024 * 1024;

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SiteMode {
    ContainerRegistry,
    GithubProxy,
    Http,
    HuggingFace,
    Pavonis,
    Pypi,
    SpeedTest,
}

impl fmt::Display for SiteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SiteMode::ContainerRegistry => "container_registry",
            SiteMode::GithubProxy => "github_proxy",
            SiteMode::Http => "http",
            SiteMode::HuggingFace => "hugging_face",
            SiteMode::Pavonis => "pavonis",
            SiteMode::Pypi => "pypi",
            SiteMode::SpeedTest => "speed_test",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IpPoolStrategy {
    #[default]
    None,
    Random,
    IpHash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedirectAction {
    FollowAll,
    #[default]
    RewriteOrFollow,
    RewriteOnly,
    None,
}

// ============================================================================
// Duration values ("90", "300ms", "10s", "5m", "1h30m")
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigDuration(pub Duration);

impl ConfigDuration {
    pub fn duration(&self) -> Duration {
        self.0
    }
}

pub(crate) fn parse_duration_str(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut number = String::new();
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_ascii_digit() || c == '.' {
            number.push(c);
            continue;
        }
        let mut unit = c.to_string();
        if c == 'm' && chars.peek() == Some(&'s') {
            chars.next();
            unit.push('s');
        }
        let value: f64 = number
            .parse()
            .map_err(|_| format!("bad duration number in {s:?}"))?;
        number.clear();
        let seconds = match unit.as_str() {
            "ms" => value / 1000.0,
            "s" => value,
            "m" => value * 60.0,
            "h" => value * 3600.0,
            other => return Err(format!("unknown duration unit {other:?} in {s:?}")),
        };
        total += Duration::from_secs_f64(seconds);
    }
    if !number.is_empty() {
        return Err(format!("trailing number without unit in {s:?}"));
    }
    Ok(total)
}

impl<'de> Deserialize<'de> for ConfigDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct DurationVisitor;

        impl serde::de::Visitor<'_> for DurationVisitor {
            type Value = ConfigDuration;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a duration string like \"30s\" or a number of seconds")
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Self::Value, E> {
                parse_duration_str(v)
                    .map(ConfigDuration)
                    .map_err(serde::de::Error::custom)
            }

            fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<Self::Value, E> {
                Ok(ConfigDuration(Duration::from_secs(v)))
            }

            fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<Self::Value, E> {
                u64::try_from(v)
                    .map(|secs| ConfigDuration(Duration::from_secs(secs)))
                    .map_err(|_| serde::de::Error::custom("negative duration"))
            }

            fn visit_f64<E: serde::de::Error>(self, v: f64) -> Result<Self::Value, E> {
                if v < 0.0 {
                    return Err(serde::de::Error::custom("negative duration"));
                }
                Ok(ConfigDuration(Duration::from_secs_f64(v)))
            }
        }

        deserializer.deserialize_any(DurationVisitor)
    }
}

// ============================================================================
// Server / request / response sections
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    pub trusted_proxy_ips: Vec<String>,
    pub trusted_proxy_headers: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: ":8009".to_string(),
            trusted_proxy_ips: vec!["127.0.0.1/24".to_string()],
            trusted_proxy_headers: vec![
                "CF-Connecting-IP".to_string(), // Cloudflare (including cloudflared)
                "X-Forwarded-For".to_string(),  // Standard proxy header
                "X-Real-IP".to_string(),        // Common alternative
            ],
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IpPoolConfig {
    pub enabled: bool,
    pub default_strategy: IpPoolStrategy,
    pub subnets: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HeaderModificationConfig {
    pub modify: BTreeMap<String, String>,
    pub delete: Vec<String>,
}

fn default_request_header() -> HeaderModificationConfig {
    HeaderModificationConfig {
        modify: BTreeMap::new(),
        delete: vec![
            // reverse proxy artifacts (common)
            "Via".to_string(),
            "X-Forwarded-For".to_string(),
            "X-Forwarded-Proto".to_string(),
            "X-Forwarded-Host".to_string(),
            // reverse proxy artifacts (cloudflare)
            // https://developers.cloudflare.com/fundamentals/reference/http-headers/
            "CDN-Loop".to_string(),
            "CF-Connecting-IP".to_string(),
            "CF-Connecting-IPv6".to_string(),
            "CF-EW-Via".to_string(),
            "CF-IPCountry".to_string(),
            "CF-Pseudo-IPv4".to_string(),
            "Cf-Ray".to_string(),
            "CF-Visitor".to_string(),
            "Cf-Warp-Tag-Id".to_string(),
        ],
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    pub proxy: String,
    pub ip_pool: IpPoolConfig,
    pub header: HeaderModificationConfig,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            proxy: String::new(),
            ip_pool: IpPoolConfig::default(),
            header: default_request_header(),
        }
    }
}

fn default_max_redirects() -> usize {
    10
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResponseConfig {
    pub header: HeaderModificationConfig,
    pub max_redirects: usize,
}

impl Default for ResponseConfig {
    fn default() -> Self {
        Self {
            header: HeaderModificationConfig::default(),
            max_redirects: default_max_redirects(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResourceLimitConfig {
    pub traffic_avg_mibps: Option<f64>,
    pub traffic_burst_mib: Option<f64>,
    pub traffic_max_mibps: Option<f64>,
    /// Process-wide ceiling shared by all clients
    pub traffic_global_mibps: Option<f64>,
    pub request_per_second: Option<f64>,
    pub request_per_minute: Option<f64>,
    pub request_per_hour: Option<f64>,
    pub request_timeout: ConfigDuration,
}

impl Default for ResourceLimitConfig {
    fn default() -> Self {
        Self {
            traffic_avg_mibps: None,
            traffic_burst_mib: None,
            traffic_max_mibps: None,
            traffic_global_mibps: None,
            request_per_second: None,
            request_per_minute: None,
            request_per_hour: None,
            request_timeout: ConfigDuration(Duration::from_secs(3600)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    pub enabled: bool,
    pub listen: String,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: "127.0.0.1:6009".to_string(),
        }
    }
}

// ============================================================================
// Sites
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SiteHosts {
    One(String),
    Many(Vec<String>),
}

impl Default for SiteHosts {
    fn default() -> Self {
        SiteHosts::One("*".to_string())
    }
}

impl SiteHosts {
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        match self {
            SiteHosts::One(host) => std::slice::from_ref(host).iter().map(String::as_str),
            SiteHosts::Many(hosts) => hosts[..].iter().map(String::as_str),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct User {
    pub name: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UsersFile {
    pub users: Vec<User>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ContainerRegistryAuthConfig {
    pub enabled: bool,
    pub users: Vec<User>,
    pub users_file: String,
    pub users_file_reload_interval: Option<ConfigDuration>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ContainerRegistrySettings {
    /// No trailing '/', may be unset (disables the v1 read-only endpoints)
    pub upstream_v1_url: Option<String>,
    /// No trailing '/'
    pub upstream_v2_url: Option<String>,
    /// No trailing '/'
    pub upstream_auth_realm_url: Option<String>,
    /// When enabled, push stays rejected regardless of allow_push
    pub auth: ContainerRegistryAuthConfig,
    pub allow_push: bool,
    pub allow_list: bool,
    pub repos_whitelist: Vec<String>,
    pub repos_blacklist: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GithubProxySettings {
    /// Response size cap in bytes; 0 disables the check
    pub size_limit: i64,
    pub raw_text_url_rewrite: bool,
    pub repos_whitelist: Vec<String>,
    pub repos_blacklist: Vec<String>,
    pub repos_bypass: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HuggingFaceSettings {}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HttpProxyMapping {
    pub path: String,
    pub destination: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HttpProxySettings {
    pub destination: String,
    pub mappings: Vec<HttpProxyMapping>,
    pub redirect_action: RedirectAction,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PavonisSiteSettings {}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PypiSettings {
    /// No trailing '/'
    pub upstream_simple_url: Option<String>,
    /// No trailing '/'
    pub upstream_files_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SpeedTestSettings {
    /// Negative disables upload tests
    pub max_upload_bytes: Option<i64>,
    /// Negative disables download tests
    pub max_download_bytes: Option<i64>,
}

impl Default for SpeedTestSettings {
    fn default() -> Self {
        Self {
            max_upload_bytes: None,
            max_download_bytes: None,
        }
    }
}

/// Mode-specific settings, parsed from the site's raw `settings` block.
#[derive(Debug, Clone)]
pub enum SiteSettings {
    ContainerRegistry(ContainerRegistrySettings),
    GithubProxy(GithubProxySettings),
    Http(HttpProxySettings),
    HuggingFace(HuggingFaceSettings),
    Pavonis(PavonisSiteSettings),
    Pypi(PypiSettings),
    SpeedTest(SpeedTestSettings),
}

#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    #[serde(default)]
    pub id: String,
    pub mode: SiteMode,
    #[serde(default)]
    pub host: SiteHosts,
    /// Only scheme + host, no path, no trailing '/'
    #[serde(default)]
    pub self_url: String,
    #[serde(default)]
    pub path_prefix: String,
    #[serde(default)]
    pub ip_pool_strategy: Option<IpPoolStrategy>,
    #[serde(default)]
    settings: serde_yaml::Value,
    #[serde(skip)]
    parsed_settings: Option<SiteSettings>,
}

impl SiteConfig {
    /// Parsed mode-specific settings; available after `Config::init`.
    pub fn settings(&self) -> &SiteSettings {
        self.parsed_settings
            .as_ref()
            .expect("site settings parsed during config init")
    }
}

// ============================================================================
// Top level
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub debug: bool,
    pub server: ServerConfig,
    pub request: RequestConfig,
    pub response: ResponseConfig,
    pub resource_limit: ResourceLimitConfig,
    pub diagnostics: DiagnosticsConfig,
    pub sites: Vec<SiteConfig>,
}

impl Config {
    /// Load from the given file, or from `PAVONIS_CONFIG` when set.
    pub fn load(path: &Path) -> Result<Config> {
        let content = match std::env::var(CONFIG_ENV_VAR) {
            Ok(content) if !content.is_empty() => content,
            _ => std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?,
        };
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Config> {
        let mut cfg: Config =
            serde_yaml::from_str(content).context("failed to parse config yaml")?;
        cfg.init()?;
        Ok(cfg)
    }

    pub fn init(&mut self) -> Result<()> {
        self.finalize().context("config finalization failed")?;
        self.validate().context("config validation failed")?;
        Ok(())
    }

    /// Assign missing site ids and parse per-mode settings with their
    /// defaults.
    fn finalize(&mut self) -> Result<()> {
        let mut existing_ids: Vec<String> = self
            .sites
            .iter()
            .filter(|s| !s.id.is_empty())
            .map(|s| s.id.clone())
            .collect();

        for (site_idx, site) in self.sites.iter_mut().enumerate() {
            if site.id.is_empty() {
                let base = format!("site{site_idx}");
                let mut attempt = 1;
                loop {
                    let candidate = if attempt == 1 {
                        base.clone()
                    } else {
                        format!("{base}_{attempt}")
                    };
                    if !existing_ids.contains(&candidate) {
                        existing_ids.push(candidate.clone());
                        site.id = candidate;
                        break;
                    }
                    attempt += 1;
                }
            }

            let raw = site.settings.clone();
            let parsed = match site.mode {
                SiteMode::ContainerRegistry => {
                    let mut settings: ContainerRegistrySettings = from_value(raw, site_idx)?;
                    // All valid url inputs
                    // V1   V2   AuthRealm
                    // -    -    -
                    // -    x    x
                    // x    x    x
                    if settings.upstream_v2_url.is_some() != settings.upstream_auth_realm_url.is_some() {
                        bail!("[site{site_idx}] upstream_v2_url and upstream_auth_realm_url must be all-set or all-unset");
                    }
                    if settings.upstream_v1_url.is_some() && settings.upstream_v2_url.is_none() {
                        bail!("[site{site_idx}] upstream_v2_url is unset while upstream_v1_url is set");
                    }
                    // default to Docker Hub
                    if settings.upstream_v2_url.is_none() {
                        settings.upstream_v1_url =
                            Some("https://registry.hub.docker.com/v1".to_string());
                        settings.upstream_v2_url =
                            Some("https://registry.hub.docker.com/v2".to_string());
                        settings.upstream_auth_realm_url =
                            Some("https://auth.docker.io/token".to_string());
                    }
                    SiteSettings::ContainerRegistry(settings)
                }
                SiteMode::GithubProxy => SiteSettings::GithubProxy(from_value(raw, site_idx)?),
                SiteMode::Http => SiteSettings::Http(from_value(raw, site_idx)?),
                SiteMode::HuggingFace => SiteSettings::HuggingFace(from_value(raw, site_idx)?),
                SiteMode::Pavonis => SiteSettings::Pavonis(from_value(raw, site_idx)?),
                SiteMode::Pypi => {
                    let mut settings: PypiSettings = from_value(raw, site_idx)?;
                    if settings.upstream_simple_url.is_some() != settings.upstream_files_url.is_some() {
                        bail!("[site{site_idx}] upstream_simple_url and upstream_files_url must be all-set or all-unset");
                    }
                    if settings.upstream_simple_url.is_none() {
                        settings.upstream_simple_url = Some("https://pypi.org/simple".to_string());
                        settings.upstream_files_url =
                            Some("https://files.pythonhosted.org".to_string());
                    }
                    SiteSettings::Pypi(settings)
                }
                SiteMode::SpeedTest => {
                    let mut settings: SpeedTestSettings = from_value(raw, site_idx)?;
                    if settings.max_upload_bytes.is_none() {
                        settings.max_upload_bytes = Some(GIB);
                    }
                    if settings.max_download_bytes.is_none() {
                        settings.max_download_bytes = Some(GIB);
                    }
                    SiteSettings::SpeedTest(settings)
                }
            };
            site.parsed_settings = Some(parsed);
        }

        Ok(())
    }

    fn validate(&self) -> Result<()> {
        // Server
        if !self.server.trusted_proxy_ips.iter().any(|s| s == "*") {
            IpPool::new(&self.server.trusted_proxy_ips).with_context(|| {
                format!(
                    "bad trusted_proxy_ips value {:?}",
                    self.server.trusted_proxy_ips
                )
            })?;
        }

        // ResourceLimit
        let rlc = &self.resource_limit;
        check_greater_than_zero(rlc.traffic_avg_mibps, "resource_limit.traffic_avg_mibps")?;
        check_greater_than_zero(rlc.traffic_burst_mib, "resource_limit.traffic_burst_mib")?;
        check_greater_than_zero(rlc.traffic_max_mibps, "resource_limit.traffic_max_mibps")?;
        check_greater_than_zero(rlc.traffic_global_mibps, "resource_limit.traffic_global_mibps")?;
        check_greater_than_zero(rlc.request_per_second, "resource_limit.request_per_second")?;
        check_greater_than_zero(rlc.request_per_minute, "resource_limit.request_per_minute")?;
        check_greater_than_zero(rlc.request_per_hour, "resource_limit.request_per_hour")?;

        // Request
        if !self.request.proxy.is_empty() {
            ProxySpec::parse(&self.request.proxy)
                .with_context(|| format!("failed to parse request.proxy {:?}", self.request.proxy))?;
        }
        if self.request.ip_pool.enabled && self.request.ip_pool.subnets.is_empty() {
            bail!("ip_pool enabled but no subnets specified");
        }
        if self.request.ip_pool.enabled {
            IpPool::new(&self.request.ip_pool.subnets).context("bad ip_pool.subnets")?;
        }

        // Sites
        for (site_idx, site) in self.sites.iter().enumerate() {
            if !self.request.ip_pool.enabled {
                if let Some(strategy) = site.ip_pool_strategy {
                    if strategy != IpPoolStrategy::None {
                        bail!(
                            "[site{site_idx}] IP pool is not enabled, but site IP pool strategy is set to {strategy:?}"
                        );
                    }
                }
            }
            if !site.path_prefix.is_empty() && !site.path_prefix.starts_with('/') {
                bail!(
                    "[site{site_idx}] path_prefix {:?} does not start with /",
                    site.path_prefix
                );
            }

            let mut check_self_url_reason: Option<String> = None;

            match site.settings() {
                SiteSettings::ContainerRegistry(settings) => {
                    check_self_url_reason = Some(format!("site mode is {}", site.mode));
                    if let Some(url) = &settings.upstream_v1_url {
                        check_url(url, site_idx, "upstream_v1_url", true, false)?;
                    }
                    check_url(
                        settings.upstream_v2_url.as_deref().unwrap_or(""),
                        site_idx,
                        "upstream_v2_url",
                        true,
                        false,
                    )?;
                    check_url(
                        settings.upstream_auth_realm_url.as_deref().unwrap_or(""),
                        site_idx,
                        "upstream_auth_realm_url",
                        true,
                        false,
                    )?;
                    if settings.auth.enabled {
                        for (user_idx, user) in settings.auth.users.iter().enumerate() {
                            validate_user(user).with_context(|| {
                                format!("[site{site_idx}] auth.users[{user_idx}] validation failed")
                            })?;
                        }
                        if !settings.auth.users_file.is_empty()
                            && !Path::new(&settings.auth.users_file).is_file()
                        {
                            bail!(
                                "[site{site_idx}] auth.users_file {:?} is not a valid file",
                                settings.auth.users_file
                            );
                        }
                        if let Some(interval) = settings.auth.users_file_reload_interval {
                            if interval.duration() <= Duration::from_secs(1) {
                                bail!(
                                    "[site{site_idx}] auth.users_file_reload_interval {:?} is too small",
                                    interval.duration()
                                );
                            }
                        }
                    }
                }
                SiteSettings::GithubProxy(settings) => {
                    if settings.raw_text_url_rewrite {
                        check_self_url_reason =
                            Some(format!("raw_text_url_rewrite is {}", settings.raw_text_url_rewrite));
                    }
                }
                SiteSettings::HuggingFace(_) => {
                    check_self_url_reason = Some(format!("site mode is {}", site.mode));
                }
                SiteSettings::Http(settings) => {
                    if settings.destination.is_empty() && settings.mappings.is_empty() {
                        bail!("[site{site_idx}] http site has neither destination nor mappings");
                    }
                    for (mapping_idx, mapping) in settings.mappings.iter().enumerate() {
                        if mapping.destination.is_empty() {
                            bail!("[site{site_idx}] mappings[{mapping_idx}] has no destination");
                        }
                    }
                }
                SiteSettings::Pavonis(_) | SiteSettings::SpeedTest(_) => {}
                SiteSettings::Pypi(settings) => {
                    check_url(
                        settings.upstream_simple_url.as_deref().unwrap_or(""),
                        site_idx,
                        "upstream_simple_url",
                        true,
                        false,
                    )?;
                    check_url(
                        settings.upstream_files_url.as_deref().unwrap_or(""),
                        site_idx,
                        "upstream_files_url",
                        true,
                        false,
                    )?;
                }
            }

            if check_self_url_reason.is_none() && !site.self_url.is_empty() {
                check_self_url_reason = Some("self_url is not empty".to_string());
            }
            if let Some(reason) = check_self_url_reason {
                check_url(&site.self_url, site_idx, "self_url", false, false)
                    .with_context(|| format!("check reason: {reason}"))?;
            }
        }

        Ok(())
    }
}

fn from_value<T: serde::de::DeserializeOwned + Default>(
    value: serde_yaml::Value,
    site_idx: usize,
) -> Result<T> {
    if value.is_null() {
        return Ok(T::default());
    }
    serde_yaml::from_value(value)
        .with_context(|| format!("[site{site_idx}] failed to parse settings"))
}

fn check_greater_than_zero(value: Option<f64>, what: &str) -> Result<()> {
    if let Some(v) = value {
        if v <= 0.0 {
            bail!("{what} cannot be <= 0, value: {v}");
        }
    }
    Ok(())
}

fn check_url(
    url: &str,
    site_idx: usize,
    what: &str,
    allow_path: bool,
    allow_trailing_slash: bool,
) -> Result<()> {
    let parsed: Uri = url
        .parse()
        .map_err(|e| anyhow!("[site{site_idx}] failed to parse {what} {url:?}: {e}"))?;
    if parsed.scheme().is_none() {
        bail!("[site{site_idx}] bad {what} {url:?}: scheme missing");
    }
    let path = parsed.path();
    if allow_path && !allow_trailing_slash && path.len() > 1 && path.ends_with('/') {
        bail!("[site{site_idx}] bad {what} {url:?}: trailing '/' is not allowed");
    }
    if !allow_path && path != "/" && !path.is_empty() {
        bail!("[site{site_idx}] bad {what} {url:?}: path is not allowed");
    }
    Ok(())
}

/// `$` splits proxy-side from upstream credentials, `:` delimits basic auth.
pub fn validate_user(user: &User) -> Result<()> {
    if user.name.is_empty() {
        bail!("name is empty");
    }
    if user.password.is_empty() {
        bail!("password is empty");
    }
    if user.name.contains('$') || user.name.contains(':') {
        bail!("name contains illegal char '$' or ':'");
    }
    if user.password.contains('$') || user.password.contains(':') {
        bail!("password contains illegal char '$' or ':'");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::from_yaml("{}").unwrap();
        assert!(!cfg.debug);
        assert_eq!(cfg.server.listen, ":8009");
        assert_eq!(cfg.server.trusted_proxy_ips, vec!["127.0.0.1/24"]);
        assert_eq!(
            cfg.server.trusted_proxy_headers,
            vec!["CF-Connecting-IP", "X-Forwarded-For", "X-Real-IP"]
        );
        assert_eq!(cfg.response.max_redirects, 10);
        assert_eq!(
            cfg.resource_limit.request_timeout.duration(),
            Duration::from_secs(3600)
        );
        assert_eq!(cfg.diagnostics.listen, "127.0.0.1:6009");
        assert!(cfg
            .request
            .header
            .delete
            .iter()
            .any(|h| h == "CF-Connecting-IP"));
        assert!(cfg.sites.is_empty());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration_str("90").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration_str("300ms").unwrap(), Duration::from_millis(300));
        assert_eq!(parse_duration_str("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration_str("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration_str("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration_str("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration_str("1m30s").unwrap(), Duration::from_secs(90));
        assert!(parse_duration_str("").is_err());
        assert!(parse_duration_str("10x").is_err());
    }

    #[test]
    fn test_site_modes_parse() {
        let cfg = Config::from_yaml(
            r#"
sites:
  - mode: pypi
    host: pypi.example.com
  - mode: github_proxy
    host: [gh.example.com, gh2.example.com]
  - mode: speed_test
"#,
        )
        .unwrap();
        assert_eq!(cfg.sites.len(), 3);
        assert_eq!(cfg.sites[0].mode, SiteMode::Pypi);
        assert_eq!(cfg.sites[0].id, "site0");
        assert_eq!(
            cfg.sites[1].host.iter().collect::<Vec<_>>(),
            vec!["gh.example.com", "gh2.example.com"]
        );
        match cfg.sites[2].settings() {
            SiteSettings::SpeedTest(s) => {
                assert_eq!(s.max_upload_bytes, Some(GIB));
                assert_eq!(s.max_download_bytes, Some(GIB));
            }
            other => panic!("unexpected settings {other:?}"),
        }
    }

    #[test]
    fn test_pypi_defaults() {
        let cfg = Config::from_yaml("sites:\n  - mode: pypi\n").unwrap();
        match cfg.sites[0].settings() {
            SiteSettings::Pypi(s) => {
                assert_eq!(s.upstream_simple_url.as_deref(), Some("https://pypi.org/simple"));
                assert_eq!(
                    s.upstream_files_url.as_deref(),
                    Some("https://files.pythonhosted.org")
                );
            }
            other => panic!("unexpected settings {other:?}"),
        }
    }

    #[test]
    fn test_container_registry_defaults_to_docker_hub() {
        let cfg = Config::from_yaml(
            "sites:\n  - mode: container_registry\n    self_url: https://cr.example.com\n",
        )
        .unwrap();
        match cfg.sites[0].settings() {
            SiteSettings::ContainerRegistry(s) => {
                assert_eq!(
                    s.upstream_v2_url.as_deref(),
                    Some("https://registry.hub.docker.com/v2")
                );
                assert_eq!(
                    s.upstream_auth_realm_url.as_deref(),
                    Some("https://auth.docker.io/token")
                );
                assert!(!s.allow_push);
            }
            other => panic!("unexpected settings {other:?}"),
        }
    }

    #[test]
    fn test_invalid_configs_rejected() {
        // bad trusted proxy CIDR
        assert!(Config::from_yaml("server:\n  trusted_proxy_ips: [nonsense]\n").is_err());
        // non-positive rate limit
        assert!(Config::from_yaml("resource_limit:\n  request_per_second: 0\n").is_err());
        // path prefix without slash
        assert!(
            Config::from_yaml("sites:\n  - mode: pypi\n    path_prefix: nope\n").is_err()
        );
        // ip pool strategy without pool
        assert!(Config::from_yaml(
            "sites:\n  - mode: pypi\n    ip_pool_strategy: random\n"
        )
        .is_err());
        // ip pool enabled without subnets
        assert!(Config::from_yaml("request:\n  ip_pool:\n    enabled: true\n").is_err());
        // self_url with a path
        assert!(Config::from_yaml(
            "sites:\n  - mode: hugging_face\n    self_url: https://hf.example.com/sub\n"
        )
        .is_err());
        // bad proxy url
        assert!(Config::from_yaml("request:\n  proxy: socks5://x\n").is_err());
        // bad egress site registry url
        assert!(Config::from_yaml(
            "sites:\n  - mode: container_registry\n    self_url: https://cr.example.com\n    settings:\n      upstream_v2_url: https://reg.example/v2\n"
        )
        .is_err());
    }

    #[test]
    fn test_user_validation() {
        assert!(validate_user(&User {
            name: "alice".into(),
            password: "secret".into()
        })
        .is_ok());
        assert!(validate_user(&User {
            name: "".into(),
            password: "secret".into()
        })
        .is_err());
        assert!(validate_user(&User {
            name: "ali$ce".into(),
            password: "secret".into()
        })
        .is_err());
        assert!(validate_user(&User {
            name: "alice".into(),
            password: "se:cret".into()
        })
        .is_err());
    }

    #[test]
    fn test_site_id_dedup() {
        let cfg = Config::from_yaml(
            r#"
sites:
  - mode: pypi
    id: site1
  - mode: pypi
"#,
        )
        .unwrap();
        assert_eq!(cfg.sites[0].id, "site1");
        // auto id avoids the explicit site1
        assert_eq!(cfg.sites[1].id, "site1_2");
    }

    #[test]
    fn test_trusted_proxies_wildcard_allowed() {
        let cfg = Config::from_yaml("server:\n  trusted_proxy_ips: [\"*\"]\n").unwrap();
        assert_eq!(cfg.server.trusted_proxy_ips, vec!["*"]);
    }
}
