//! Process-wide metrics, exported in Prometheus text format

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use dashmap::DashMap;

/// Global metrics registry shared by the dispatcher, the diagnostics listener
/// and the built-in info site.
pub struct MetricsRegistry {
    /// Served requests, labelled by response status code
    requests_by_code: DashMap<u16, AtomicU64>,
    start_time: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            requests_by_code: DashMap::new(),
            start_time: Instant::now(),
        }
    }

    pub fn record_request(&self, status_code: u16) {
        self.requests_by_code
            .entry(status_code)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Export all metrics in Prometheus text format.
    pub fn export_prometheus(&self) -> String {
        let mut output = String::with_capacity(1024);

        output.push_str("# HELP pavonis_uptime_seconds Server uptime in seconds\n");
        output.push_str("# TYPE pavonis_uptime_seconds gauge\n");
        let _ = writeln!(output, "pavonis_uptime_seconds {}", self.uptime_secs());

        output.push_str(
            "# HELP pavonis_server_http_request_total Total number of HTTP requests served\n",
        );
        output.push_str("# TYPE pavonis_server_http_request_total counter\n");
        let mut codes: Vec<u16> = self.requests_by_code.iter().map(|e| *e.key()).collect();
        codes.sort_unstable();
        for code in codes {
            if let Some(counter) = self.requests_by_code.get(&code) {
                let _ = writeln!(
                    output,
                    "pavonis_server_http_request_total{{code=\"{}\"}} {}",
                    code,
                    counter.load(Ordering::Relaxed)
                );
            }
        }

        output
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_export() {
        let registry = MetricsRegistry::new();
        registry.record_request(200);
        registry.record_request(200);
        registry.record_request(404);

        let text = registry.export_prometheus();
        assert!(text.contains("pavonis_server_http_request_total{code=\"200\"} 2"));
        assert!(text.contains("pavonis_server_http_request_total{code=\"404\"} 1"));
        assert!(text.contains("pavonis_uptime_seconds"));
    }

    #[test]
    fn test_codes_sorted() {
        let registry = MetricsRegistry::new();
        registry.record_request(502);
        registry.record_request(200);
        let text = registry.export_prometheus();
        let p200 = text.find("code=\"200\"").unwrap();
        let p502 = text.find("code=\"502\"").unwrap();
        assert!(p200 < p502);
    }
}
