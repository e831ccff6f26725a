//! Per-request context threaded through handlers and the proxy pipeline

use std::time::Instant;

use rand::Rng;

const REQUEST_ID_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const REQUEST_ID_LEN: usize = 8;

fn generate_request_id(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| REQUEST_ID_CHARSET[rng.gen_range(0..REQUEST_ID_CHARSET.len())] as char)
        .collect()
}

/// Immutable record created by the dispatcher for every request.
///
/// The `log_prefix` is prepended to every log line emitted on behalf of this
/// request so concurrent requests stay distinguishable.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub start_time: Instant,
    pub host: String,
    pub client_addr: String,
    pub log_prefix: String,
}

impl RequestContext {
    pub fn new(site_id: &str, host: &str, client_addr: &str) -> Self {
        let request_id = generate_request_id(REQUEST_ID_LEN);
        let log_prefix = format!("({site_id}:{request_id}) ");
        Self {
            request_id,
            start_time: Instant::now(),
            host: host.to_string(),
            client_addr: client_addr.to_string(),
            log_prefix,
        }
    }
}
