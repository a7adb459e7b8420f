//! In-process gateway metrics
//!
//! The `metrics` facade macros are emitted at event sites throughout the
//! crate for whatever recorder the deployment installs. [`GatewayMetrics`]
//! is the gateway's own collector behind `/_rendergate/metrics` and
//! `/_rendergate/status`:
//! - atomic counters for requests, cache outcomes, renders and fallbacks
//! - ring-buffer histograms for request and render duration percentiles
//! - Prometheus text and JSON export
//!
//! It is constructed once in `main` and shared through `Arc`, never as a
//! global.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Maximum number of duration samples kept per histogram
const MAX_HISTOGRAM_SAMPLES: usize = 1000;

/// Buckets for latency histograms (milliseconds)
const DEFAULT_BUCKETS_MS: &[u64] = &[5, 10, 25, 50, 100, 250, 500, 1000, 2500, 5000, 10000];

/// Fixed-capacity sample window
#[derive(Debug)]
struct RingBuffer<T> {
    data: Vec<T>,
    capacity: usize,
    write_pos: usize,
    total_samples: u64,
}

impl<T: Clone + Ord> RingBuffer<T> {
    fn new(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            capacity,
            write_pos: 0,
            total_samples: 0,
        }
    }

    fn push(&mut self, value: T) {
        if self.data.len() < self.capacity {
            self.data.push(value);
        } else {
            self.data[self.write_pos] = value;
        }
        self.write_pos = (self.write_pos + 1) % self.capacity;
        self.total_samples += 1;
    }

    fn sorted_samples(&self) -> Vec<T> {
        let mut sorted = self.data.clone();
        sorted.sort();
        sorted
    }

    fn percentile(&self, p: f64) -> Option<T> {
        if self.data.is_empty() {
            return None;
        }
        // Nearest rank
        let sorted = self.sorted_samples();
        let rank = (p.clamp(0.0, 1.0) * sorted.len() as f64).ceil() as usize;
        let idx = rank.saturating_sub(1).min(sorted.len() - 1);
        sorted.get(idx).cloned()
    }
}

#[derive(Debug)]
struct Histogram(RwLock<RingBuffer<Duration>>);

impl Histogram {
    fn new() -> Self {
        Self(RwLock::new(RingBuffer::new(MAX_HISTOGRAM_SAMPLES)))
    }

    fn record(&self, value: Duration) {
        if let Ok(mut buf) = self.0.write() {
            buf.push(value);
        }
    }

    fn percentile(&self, p: f64) -> Option<Duration> {
        self.0.read().ok()?.percentile(p)
    }

    fn count(&self) -> u64 {
        self.0.read().map(|b| b.total_samples).unwrap_or(0)
    }

    fn reset(&self) {
        if let Ok(mut buf) = self.0.write() {
            *buf = RingBuffer::new(MAX_HISTOGRAM_SAMPLES);
        }
    }

    fn write_prometheus(&self, out: &mut String, name: &str, help: &str) {
        let Ok(buf) = self.0.read() else {
            return;
        };
        if buf.data.is_empty() {
            return;
        }

        let _ = writeln!(out, "# HELP {name}_seconds {help}");
        let _ = writeln!(out, "# TYPE {name}_seconds summary");
        for q in [0.5, 0.9, 0.95, 0.99] {
            if let Some(v) = buf.percentile(q) {
                let _ = writeln!(
                    out,
                    "{name}_seconds{{quantile=\"{q}\"}} {:.6}",
                    v.as_secs_f64()
                );
            }
        }
        let sum: f64 = buf.data.iter().map(Duration::as_secs_f64).sum();
        let _ = writeln!(out, "{name}_seconds_count {}", buf.total_samples);
        let _ = writeln!(out, "{name}_seconds_sum {sum:.6}\n");

        let _ = writeln!(out, "# HELP {name}_ms_bucket {help} (histogram buckets)");
        let _ = writeln!(out, "# TYPE {name}_ms_bucket histogram");
        let sorted = buf.sorted_samples();
        for bucket in DEFAULT_BUCKETS_MS {
            let limit = Duration::from_millis(*bucket);
            let count = sorted.iter().filter(|d| **d <= limit).count();
            let _ = writeln!(out, "{name}_ms_bucket{{le=\"{bucket}\"}} {count}");
        }
        let _ = writeln!(
            out,
            "{name}_ms_bucket{{le=\"+Inf\"}} {}\n",
            buf.total_samples
        );
    }
}

/// Gateway metrics collector
#[derive(Debug)]
pub struct GatewayMetrics {
    // === Counters ===
    /// Requests handled
    pub requests_total: AtomicU64,
    /// Fresh cache hits served
    pub cache_hits: AtomicU64,
    /// Stale cache hits served
    pub cache_stale: AtomicU64,
    /// Cache misses that went to render
    pub cache_misses: AtomicU64,
    /// Debug renders bypassing the cache
    pub cache_bypass: AtomicU64,
    /// Render attempts that produced a document
    pub renders_ok: AtomicU64,
    /// Render attempts that failed
    pub renders_failed: AtomicU64,
    /// Render requests answered by the origin instead
    pub origin_fallbacks: AtomicU64,
    /// Background revalidations started
    pub revalidations: AtomicU64,
    /// Background revalidations that failed
    pub revalidation_failures: AtomicU64,
    /// Error responses
    pub errors_total: AtomicU64,

    // === Histograms ===
    request_durations: Histogram,
    render_durations: Histogram,

    // === Labeled counters ===
    requests_by_action_status: RwLock<HashMap<(String, u16), u64>>,
    errors_by_type: RwLock<HashMap<String, u64>>,

    start_time: Instant,
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn load(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl GatewayMetrics {
    /// Create an empty collector; uptime starts now
    pub fn new() -> Self {
        Self {
            requests_total: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_stale: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            cache_bypass: AtomicU64::new(0),
            renders_ok: AtomicU64::new(0),
            renders_failed: AtomicU64::new(0),
            origin_fallbacks: AtomicU64::new(0),
            revalidations: AtomicU64::new(0),
            revalidation_failures: AtomicU64::new(0),
            errors_total: AtomicU64::new(0),
            request_durations: Histogram::new(),
            render_durations: Histogram::new(),
            requests_by_action_status: RwLock::new(HashMap::new()),
            errors_by_type: RwLock::new(HashMap::new()),
            start_time: Instant::now(),
        }
    }

    /// Seconds since the collector was created
    pub fn uptime_seconds(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }

    // === Recording ===

    /// Record a finished request
    pub fn record_request(&self, action: &str, status: u16, duration: Duration) {
        bump(&self.requests_total);
        self.request_durations.record(duration);
        if let Ok(mut by_action) = self.requests_by_action_status.write() {
            *by_action.entry((action.to_string(), status)).or_insert(0) += 1;
        }
    }

    /// Record an `X-SSR-Cache` outcome
    pub fn record_cache(&self, status: &str) {
        match status {
            "HIT" => bump(&self.cache_hits),
            "STALE" => bump(&self.cache_stale),
            "MISS" => bump(&self.cache_misses),
            "BYPASS" => bump(&self.cache_bypass),
            _ => {}
        }
    }

    /// Record a render attempt
    pub fn record_render(&self, success: bool, duration: Duration) {
        if success {
            bump(&self.renders_ok);
            self.render_durations.record(duration);
        } else {
            bump(&self.renders_failed);
        }
    }

    /// Record a render request answered by the origin
    pub fn record_fallback(&self) {
        bump(&self.origin_fallbacks);
    }

    /// Record the outcome of a background revalidation
    pub fn record_revalidation(&self, success: bool) {
        bump(&self.revalidations);
        if !success {
            bump(&self.revalidation_failures);
        }
    }

    /// Record an error by type
    pub fn record_error(&self, error_type: &str) {
        bump(&self.errors_total);
        if let Ok(mut by_type) = self.errors_by_type.write() {
            *by_type.entry(error_type.to_string()).or_insert(0) += 1;
        }
    }

    // === Queries ===

    /// Request duration percentile (`p` in `0.0..=1.0`)
    pub fn request_percentile(&self, p: f64) -> Option<Duration> {
        self.request_durations.percentile(p)
    }

    /// Render duration percentile (`p` in `0.0..=1.0`)
    pub fn render_percentile(&self, p: f64) -> Option<Duration> {
        self.render_durations.percentile(p)
    }

    /// Fresh + stale hits over all cache lookups
    pub fn cache_hit_ratio(&self) -> f64 {
        let hits = load(&self.cache_hits) + load(&self.cache_stale);
        let total = hits + load(&self.cache_misses);
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    // === Export ===

    /// Prometheus text exposition
    pub fn to_prometheus_format(&self) -> String {
        let mut out = String::with_capacity(4096);

        let counters: [(&str, &str, &AtomicU64); 5] = [
            ("rendergate_requests_total", "Requests handled by the gateway", &self.requests_total),
            ("rendergate_origin_fallbacks_total", "Render requests answered by the origin", &self.origin_fallbacks),
            ("rendergate_revalidations_total", "Background revalidations started", &self.revalidations),
            ("rendergate_revalidation_failures_total", "Background revalidations that failed", &self.revalidation_failures),
            ("rendergate_error_responses_total", "Error responses", &self.errors_total),
        ];
        for (name, help, counter) in counters {
            write_counter(&mut out, name, help, load(counter));
        }

        let _ = writeln!(out, "# HELP rendergate_cache_lookups_total Cache outcomes by X-SSR-Cache value");
        let _ = writeln!(out, "# TYPE rendergate_cache_lookups_total counter");
        for (status, counter) in [
            ("HIT", &self.cache_hits),
            ("STALE", &self.cache_stale),
            ("MISS", &self.cache_misses),
            ("BYPASS", &self.cache_bypass),
        ] {
            let _ = writeln!(
                out,
                "rendergate_cache_lookups_total{{status=\"{status}\"}} {}",
                load(counter)
            );
        }
        out.push('\n');

        let _ = writeln!(out, "# HELP rendergate_render_attempts_total Render attempts by outcome");
        let _ = writeln!(out, "# TYPE rendergate_render_attempts_total counter");
        let _ = writeln!(
            out,
            "rendergate_render_attempts_total{{outcome=\"success\"}} {}",
            load(&self.renders_ok)
        );
        let _ = writeln!(
            out,
            "rendergate_render_attempts_total{{outcome=\"failure\"}} {}\n",
            load(&self.renders_failed)
        );

        if let Ok(by_action) = self.requests_by_action_status.read() {
            if !by_action.is_empty() {
                let _ = writeln!(out, "# HELP rendergate_requests_by_action Requests by gate action and status");
                let _ = writeln!(out, "# TYPE rendergate_requests_by_action counter");
                for ((action, status), count) in by_action.iter() {
                    let _ = writeln!(
                        out,
                        "rendergate_requests_by_action{{action=\"{}\",status=\"{}\"}} {}",
                        escape_label_value(action),
                        status,
                        count
                    );
                }
                out.push('\n');
            }
        }

        if let Ok(by_type) = self.errors_by_type.read() {
            if !by_type.is_empty() {
                let _ = writeln!(out, "# HELP rendergate_errors_by_type Errors by type");
                let _ = writeln!(out, "# TYPE rendergate_errors_by_type counter");
                for (error_type, count) in by_type.iter() {
                    let _ = writeln!(
                        out,
                        "rendergate_errors_by_type{{type=\"{}\"}} {}",
                        escape_label_value(error_type),
                        count
                    );
                }
                out.push('\n');
            }
        }

        write_gauge(
            &mut out,
            "rendergate_uptime_seconds",
            "Process uptime in seconds",
            self.uptime_seconds(),
        );

        self.request_durations.write_prometheus(
            &mut out,
            "rendergate_request_duration",
            "Request duration",
        );
        self.render_durations.write_prometheus(
            &mut out,
            "rendergate_render_duration",
            "Successful render duration",
        );

        out
    }

    /// JSON view for `/_rendergate/status`
    pub fn to_json(&self) -> serde_json::Value {
        let ms = |d: Option<Duration>| d.map(|d| d.as_millis() as u64);

        serde_json::json!({
            "requests_total": load(&self.requests_total),
            "cache": {
                "hits": load(&self.cache_hits),
                "stale": load(&self.cache_stale),
                "misses": load(&self.cache_misses),
                "bypass": load(&self.cache_bypass),
                "hit_ratio": self.cache_hit_ratio(),
            },
            "renders": {
                "success": load(&self.renders_ok),
                "failure": load(&self.renders_failed),
                "origin_fallbacks": load(&self.origin_fallbacks),
                "revalidations": load(&self.revalidations),
                "revalidation_failures": load(&self.revalidation_failures),
            },
            "errors_total": load(&self.errors_total),
            "latency_ms": {
                "request_p50": ms(self.request_percentile(0.50)),
                "request_p95": ms(self.request_percentile(0.95)),
                "request_p99": ms(self.request_percentile(0.99)),
                "render_p50": ms(self.render_percentile(0.50)),
                "render_p95": ms(self.render_percentile(0.95)),
                "samples": self.request_durations.count(),
            },
            "uptime_seconds": self.uptime_seconds(),
        })
    }

    /// Reset all metrics (useful for testing)
    pub fn reset(&self) {
        for counter in [
            &self.requests_total,
            &self.cache_hits,
            &self.cache_stale,
            &self.cache_misses,
            &self.cache_bypass,
            &self.renders_ok,
            &self.renders_failed,
            &self.origin_fallbacks,
            &self.revalidations,
            &self.revalidation_failures,
            &self.errors_total,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.request_durations.reset();
        self.render_durations.reset();
        if let Ok(mut by_action) = self.requests_by_action_status.write() {
            by_action.clear();
        }
        if let Ok(mut by_type) = self.errors_by_type.write() {
            by_type.clear();
        }
    }
}

/// Append a single counter in Prometheus text format
pub fn write_counter(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} counter");
    let _ = writeln!(out, "{name} {value}\n");
}

/// Append a single gauge in Prometheus text format
pub fn write_gauge(out: &mut String, name: &str, help: &str, value: f64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} gauge");
    let _ = writeln!(out, "{name} {value}\n");
}

/// Escape a label value for Prometheus format
/// Prometheus requires escaping backslash, newline, and double quote
fn escape_label_value(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('\n', "\\n")
        .replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_buffer_overflow() {
        let mut buf: RingBuffer<u32> = RingBuffer::new(3);
        for i in 0..10 {
            buf.push(i);
        }
        assert_eq!(buf.data.len(), 3);
        assert_eq!(buf.total_samples, 10);
        assert_eq!(buf.sorted_samples(), vec![7, 8, 9]);
    }

    #[test]
    fn test_ring_buffer_percentile() {
        let mut buf: RingBuffer<u32> = RingBuffer::new(100);
        for i in 1..=100 {
            buf.push(i);
        }
        assert_eq!(buf.percentile(0.50), Some(50));
        assert_eq!(buf.percentile(0.99), Some(99));
        assert_eq!(buf.percentile(0.0), Some(1));
        assert_eq!(buf.percentile(1.0), Some(100));
    }

    #[test]
    fn test_cache_outcomes() {
        let metrics = GatewayMetrics::new();
        metrics.record_cache("HIT");
        metrics.record_cache("HIT");
        metrics.record_cache("STALE");
        metrics.record_cache("MISS");
        metrics.record_cache("BYPASS");

        assert_eq!(load(&metrics.cache_hits), 2);
        assert_eq!(load(&metrics.cache_bypass), 1);
        assert!((metrics.cache_hit_ratio() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_render_percentiles_only_count_successes() {
        let metrics = GatewayMetrics::new();
        for i in 1..=10 {
            metrics.record_render(true, Duration::from_millis(i * 100));
        }
        metrics.record_render(false, Duration::from_secs(30));

        assert_eq!(load(&metrics.renders_failed), 1);
        let p99 = metrics.render_percentile(0.99).unwrap();
        assert_eq!(p99, Duration::from_millis(1000));
    }

    #[test]
    fn test_prometheus_format() {
        let metrics = GatewayMetrics::new();
        metrics.record_request("RENDER", 200, Duration::from_millis(50));
        metrics.record_request("PROXY", 200, Duration::from_millis(5));
        metrics.record_request("RENDER", 502, Duration::from_millis(900));
        metrics.record_cache("MISS");
        metrics.record_error("origin");

        let output = metrics.to_prometheus_format();

        assert!(output.contains("rendergate_requests_total 3"));
        assert!(output.contains("rendergate_cache_lookups_total{status=\"MISS\"} 1"));
        assert!(output.contains("action=\"RENDER\",status=\"502\""));
        assert!(output.contains("type=\"origin\""));
        assert!(output.contains("rendergate_request_duration_seconds_count 3"));
        assert!(!output.contains("rendergate_render_duration_seconds"));
    }

    #[test]
    fn test_json_format() {
        let metrics = GatewayMetrics::new();
        metrics.record_fallback();
        metrics.record_revalidation(false);

        let json = metrics.to_json();
        assert_eq!(json["renders"]["origin_fallbacks"], 1);
        assert_eq!(json["renders"]["revalidation_failures"], 1);
        assert!(json["latency_ms"]["request_p50"].is_null());
    }

    #[test]
    fn test_reset() {
        let metrics = GatewayMetrics::new();
        metrics.record_request("RENDER", 200, Duration::from_millis(100));
        metrics.record_cache("HIT");
        metrics.reset();

        assert_eq!(load(&metrics.requests_total), 0);
        assert_eq!(load(&metrics.cache_hits), 0);
        assert!(metrics.request_percentile(0.5).is_none());
    }

    #[test]
    fn test_escape_label_value() {
        assert_eq!(escape_label_value("simple"), "simple");
        assert_eq!(escape_label_value("a\"b"), "a\\\"b");
        assert_eq!(escape_label_value("a\nb"), "a\\nb");
    }
}
