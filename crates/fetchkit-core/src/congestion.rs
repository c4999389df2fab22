//! Per-host AIMD worker-count controller.
//!
//! Each part outcome feeds a per-host window (smoothed RTT plus
//! success/error counters). Every scheduler tick `ideal()` applies the AIMD
//! step: halve the recommended concurrency after any error, add one worker
//! once successes outpace the current level. Executors only ever spawn
//! toward the recommendation; excess workers drain by not being replaced.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};

/// Lower bound on recommended workers per host.
pub const MIN_WORKERS: usize = 1;
/// Upper bound on recommended workers per host.
pub const MAX_WORKERS: usize = 32;

/// RTT smoothing factor (RFC 6298 style).
const SRTT_ALPHA: f64 = 0.125;

/// Normalized host key for controller and scheduler maps.
pub fn host_of(url: &str) -> Result<String> {
    let parsed = url::Url::parse(url).with_context(|| format!("invalid URL: {url}"))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| anyhow::anyhow!("URL has no host: {url}"))?;
    Ok(host.to_ascii_lowercase())
}

#[derive(Debug, Clone)]
struct HostWindow {
    srtt: Duration,
    last_rtt: Duration,
    concurrency: usize,
    success_count: u32,
    error_count: u32,
}

impl Default for HostWindow {
    fn default() -> Self {
        Self {
            srtt: Duration::ZERO,
            last_rtt: Duration::ZERO,
            concurrency: MIN_WORKERS,
            success_count: 0,
            error_count: 0,
        }
    }
}

/// Read-only view of one host's window, for diagnostics and tests.
#[derive(Debug, Clone, PartialEq)]
pub struct HostSnapshot {
    pub srtt: Duration,
    pub last_rtt: Duration,
    pub concurrency: usize,
    pub success_count: u32,
    pub error_count: u32,
}

/// Shared AIMD state across all tasks. One short-lived mutex; never held
/// across I/O.
#[derive(Debug, Default)]
pub struct CongestionController {
    hosts: Mutex<HashMap<String, HostWindow>>,
}

impl CongestionController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one part outcome for `host`.
    pub fn record(&self, host: &str, latency: Duration, ok: bool) {
        let mut hosts = self.hosts.lock().unwrap();
        let w = hosts.entry(host.to_string()).or_default();
        w.last_rtt = latency;
        w.srtt = if w.srtt.is_zero() {
            latency
        } else {
            w.srtt.mul_f64(1.0 - SRTT_ALPHA) + latency.mul_f64(SRTT_ALPHA)
        };
        if ok {
            w.success_count = w.success_count.saturating_add(1);
        } else {
            w.error_count = w.error_count.saturating_add(1);
        }
    }

    /// Recommended worker count for `host`, applying one AIMD step.
    ///
    /// Call once per 2 s tick: any error since the last call halves the
    /// recommendation (multiplicative decrease); otherwise, successes
    /// exceeding the current level add one (additive increase).
    pub fn ideal(&self, host: &str) -> usize {
        let mut hosts = self.hosts.lock().unwrap();
        let w = hosts.entry(host.to_string()).or_default();
        if w.error_count > 0 {
            w.concurrency = (w.concurrency / 2).max(MIN_WORKERS);
            w.error_count = 0;
        } else if w.success_count as usize > w.concurrency {
            w.concurrency = (w.concurrency + 1).min(MAX_WORKERS);
            w.success_count = 0;
        }
        w.concurrency
    }

    /// Current window for `host`, if any outcome has been recorded.
    pub fn snapshot(&self, host: &str) -> Option<HostSnapshot> {
        let hosts = self.hosts.lock().unwrap();
        hosts.get(host).map(|w| HostSnapshot {
            srtt: w.srtt,
            last_rtt: w.last_rtt,
            concurrency: w.concurrency,
            success_count: w.success_count,
            error_count: w.error_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_of_normalizes() {
        assert_eq!(host_of("https://CDN.Example.COM/a/b").unwrap(), "cdn.example.com");
        assert_eq!(host_of("http://example.com:8080/x").unwrap(), "example.com");
        assert!(host_of("not a url").is_err());
    }

    #[test]
    fn new_host_starts_at_min() {
        let c = CongestionController::new();
        assert_eq!(c.ideal("h"), MIN_WORKERS);
    }

    #[test]
    fn additive_increase_needs_more_successes_than_level() {
        let c = CongestionController::new();
        c.record("h", Duration::from_millis(50), true);
        // 1 success at level 1: not strictly greater, no step yet.
        assert_eq!(c.ideal("h"), 1);
        c.record("h", Duration::from_millis(50), true);
        c.record("h", Duration::from_millis(50), true);
        assert_eq!(c.ideal("h"), 2);
        // counter was reset; no new successes -> level holds.
        assert_eq!(c.ideal("h"), 2);
    }

    #[test]
    fn multiplicative_decrease_halves_and_floors() {
        let c = CongestionController::new();
        for _ in 0..200 {
            c.record("h", Duration::from_millis(10), true);
            c.ideal("h");
        }
        let level = c.snapshot("h").unwrap().concurrency;
        assert!(level > 4);

        c.record("h", Duration::from_millis(10), false);
        assert_eq!(c.ideal("h"), (level / 2).max(MIN_WORKERS));

        for _ in 0..10 {
            c.record("h", Duration::from_millis(10), false);
            c.ideal("h");
        }
        assert_eq!(c.snapshot("h").unwrap().concurrency, MIN_WORKERS);
    }

    #[test]
    fn increase_is_capped_at_max_workers() {
        let c = CongestionController::new();
        for _ in 0..5000 {
            c.record("h", Duration::from_millis(1), true);
            c.ideal("h");
        }
        assert_eq!(c.snapshot("h").unwrap().concurrency, MAX_WORKERS);
    }

    #[test]
    fn srtt_smooths_toward_latency() {
        let c = CongestionController::new();
        c.record("h", Duration::from_millis(100), true);
        assert_eq!(c.snapshot("h").unwrap().srtt, Duration::from_millis(100));
        c.record("h", Duration::from_millis(200), true);
        let srtt = c.snapshot("h").unwrap().srtt;
        assert!(srtt > Duration::from_millis(100));
        assert!(srtt < Duration::from_millis(200));
        // alpha = 0.125: 100 * 0.875 + 200 * 0.125 = 112.5ms
        assert_eq!(srtt, Duration::from_micros(112_500));
    }

    #[test]
    fn hosts_are_independent() {
        let c = CongestionController::new();
        for _ in 0..10 {
            c.record("a", Duration::from_millis(1), true);
            c.ideal("a");
        }
        c.record("b", Duration::from_millis(1), false);
        assert!(c.snapshot("a").unwrap().concurrency > 1);
        assert_eq!(c.ideal("b"), MIN_WORKERS);
    }
}
