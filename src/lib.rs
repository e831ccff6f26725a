//! Pavonis - multi-tenant reverse proxy
//!
//! A reverse proxy that fronts several classes of upstream services behind a
//! single listener:
//! - Container registries (Docker Hub, ghcr.io, ...) with an optional basic-auth gate
//! - PyPI package indexes with index/file URL rewriting
//! - GitHub / gist download endpoints with repos filtering
//! - Hugging Face model/dataset downloads including the xet storage backends
//! - Generic HTTP destinations with path-prefix mappings
//! - A built-in info endpoint and a speed-test endpoint
//!
//! Requests are routed by virtual host and longest path prefix. Egress traffic
//! is shaped by per-client token buckets, pooled per-source-IP transports, and
//! a redirect-following transport that can rewrite or surface 3xx responses.

pub mod client_data;
pub mod codec;
pub mod config;
pub mod context;
pub mod diagnostics;
pub mod error;
pub mod handlers;
pub mod helper;
pub mod ip_pool;
pub mod metrics;
pub mod rate_limit;
pub mod redirect;
pub mod replace;
pub mod replay;
pub mod server;
pub mod transport;

pub use config::Config;
pub use error::HttpError;
pub use metrics::MetricsRegistry;
pub use server::PavonisServer;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
