//! Per-client rate-limiter cache
//!
//! Clients are bucketed by a coarsened identifier: IPv4 addresses
//! individually, IPv6 addresses by their /64, anything unparseable by its
//! literal. Each bucket owns two composite limiters (traffic bytes and
//! request rate) that age out after a fixed idle period.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::debug;

use crate::config::ResourceLimitConfig;
use crate::rate_limit::{
    create_request_rate_limiter, create_traffic_rate_limiter, MultiRateLimiter,
};

const MAX_TRACKED_CLIENTS: usize = 10240;
const CLIENT_IDLE_TTL: Duration = Duration::from_secs(2 * 60 * 60);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

pub struct ClientData {
    pub traffic_rate_limiter: Arc<MultiRateLimiter>,
    pub request_rate_limiter: Arc<MultiRateLimiter>,
}

struct ClientEntry {
    data: Arc<ClientData>,
    last_access: RwLock<Instant>,
}

pub struct ClientDataCache {
    limits: ResourceLimitConfig,
    entries: Arc<DashMap<String, Arc<ClientEntry>>>,
    janitor: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Bucket key for a client identifier: `ipv4$<addr>`, `ipv6$<hex /64>`, or
/// `raw$<literal>` when the identifier is not an IP.
pub fn bucket_key(client: &str) -> String {
    match client.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => format!("ipv4${v4}"),
        Ok(IpAddr::V6(v6)) => {
            let prefix = &v6.octets()[..8];
            let hex: Vec<String> = prefix.iter().map(|b| format!("{b:02x}")).collect();
            format!("ipv6${}", hex.join(":"))
        }
        Err(_) => format!("raw${client}"),
    }
}

impl ClientDataCache {
    pub fn new(limits: ResourceLimitConfig) -> Self {
        let cache = Self {
            limits,
            entries: Arc::new(DashMap::new()),
            janitor: parking_lot::Mutex::new(None),
        };
        cache.spawn_cleanup_task();
        cache
    }

    /// Look up (or create) the limiters for a client. Concurrent lookups for
    /// the same bucket observe the same instance while the entry lives.
    pub fn get_data(&self, client: &str) -> Arc<ClientData> {
        let key = bucket_key(client);
        let entry = self
            .entries
            .entry(key)
            .or_insert_with(|| {
                Arc::new(ClientEntry {
                    data: Arc::new(self.new_client_data()),
                    last_access: RwLock::new(Instant::now()),
                })
            })
            .clone();
        *entry.last_access.write() = Instant::now();
        entry.data.clone()
    }

    fn new_client_data(&self) -> ClientData {
        let rlc = &self.limits;
        ClientData {
            traffic_rate_limiter: Arc::new(create_traffic_rate_limiter(
                rlc.traffic_avg_mibps,
                rlc.traffic_burst_mib,
                rlc.traffic_max_mibps,
            )),
            request_rate_limiter: Arc::new(create_request_rate_limiter(
                rlc.request_per_second,
                rlc.request_per_minute,
                rlc.request_per_hour,
            )),
        }
    }

    fn spawn_cleanup_task(&self) {
        let entries = self.entries.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
            loop {
                interval.tick().await;

                let before = entries.len();
                entries.retain(|_, entry| entry.last_access.read().elapsed() < CLIENT_IDLE_TTL);
                let removed = before - entries.len();
                if removed > 0 {
                    debug!("Cleaned up {} idle client rate limit entries", removed);
                }

                // Enforce the size bound by evicting the oldest entries
                let current = entries.len();
                if current > MAX_TRACKED_CLIENTS {
                    let mut by_age: Vec<_> = entries
                        .iter()
                        .map(|e| (e.key().clone(), *e.value().last_access.read()))
                        .collect();
                    by_age.sort_by_key(|(_, t)| *t);
                    for (key, _) in by_age.into_iter().take(current - MAX_TRACKED_CLIENTS) {
                        entries.remove(&key);
                    }
                }
            }
        });
        *self.janitor.lock() = Some(handle);
    }

    pub fn clear(&self) {
        if let Some(handle) = self.janitor.lock().take() {
            handle.abort();
        }
        self.entries.clear();
    }
}
