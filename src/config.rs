//! Gateway configuration
//!
//! Every setting has a default, can be overridden by an `RG_*` environment
//! variable, and the binary's CLI flags win over both.
//!
//! # Environment Variables
//!
//! | Variable | Default | Meaning |
//! |---|---|---|
//! | `RG_ORIGIN` | `http://127.0.0.1:3000` | origin application base URL |
//! | `RG_HOST` / `RG_PORT` | `0.0.0.0` / `8080` | listen address |
//! | `RG_CACHE_TTL` | `3600` | cache TTL in seconds |
//! | `RG_CACHE_MAX_ENTRIES` | `10000` | cache entry cap |
//! | `RG_MAX_RENDERS` | `4` | page pool size |
//! | `RG_RENDER_QUEUE` | `32` | renders allowed to wait for a page |
//! | `RG_RENDER_TIMEOUT_MS` | `30000` | overall render budget |
//! | `RG_CB_FAILURE_THRESHOLD` | `5` | failures that open the circuit |
//! | `RG_CB_SUCCESS_THRESHOLD` | `2` | trial successes that close it |
//! | `RG_CB_RESET_TIMEOUT_SECS` | `30` | OPEN duration |
//! | `RG_CB_TIMEOUT_MS` | `30000` | per-call hard timeout |
//! | `RG_CB_HALF_OPEN_MAX_CALLS` | `1` | concurrent trials |
//! | `RG_CB_WINDOW_SECS` | `60` | failure monitoring window |
//! | `RG_STATIC_EXTENSIONS` | built-in list | comma-separated extensions |
//! | `RG_BYPASS_PREFIXES` | `/health,/admin,/api/` | comma-separated prefixes |
//! | `RG_REVALIDATION_COUNTS_TOWARD_BREAKER` | `true` | breaker accounting for background refreshes |
//! | `RG_CHROME_PATH` | auto | Chrome executable |
//! | `RG_HEADLESS` | `true` | headless browser |
//! | `RG_NO_SANDBOX` | `false` | disable the Chrome sandbox |
//! | `RG_DRAIN_TIMEOUT_SECS` | `30` | shutdown drain timeout |

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use url::Url;

use crate::breaker::BreakerConfig;
use crate::cache::CacheConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::gate::GateConfig;
use crate::orchestrator::OrchestratorConfig;
use crate::render::RenderConfig;

/// Default origin when `RG_ORIGIN` is unset
pub const DEFAULT_ORIGIN: &str = "http://127.0.0.1:3000";

/// Complete gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Origin application base URL
    pub origin: Url,
    /// Bind host
    pub host: String,
    /// Bind port
    pub port: u16,
    /// Decision gate settings
    pub gate: GateConfig,
    /// Cache settings
    pub cache: CacheConfig,
    /// Render manager settings
    pub render: RenderConfig,
    /// Circuit breaker settings
    pub breaker: BreakerConfig,
    /// Orchestrator settings
    pub orchestrator: OrchestratorConfig,
    /// Chrome executable
    pub chrome_path: Option<PathBuf>,
    /// Run Chrome headless
    pub headless: bool,
    /// Disable the Chrome sandbox
    pub no_sandbox: bool,
    /// How long in-flight requests get to finish on shutdown
    pub drain_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            origin: Url::parse(DEFAULT_ORIGIN).expect("default origin is a valid URL"),
            host: "0.0.0.0".to_string(),
            port: 8080,
            gate: GateConfig::default(),
            cache: CacheConfig::default(),
            render: RenderConfig::default(),
            breaker: BreakerConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            chrome_path: None,
            headless: true,
            no_sandbox: false,
            drain_timeout: Duration::from_secs(30),
        }
    }
}

fn parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| v.trim().parse::<T>().ok())
}

fn parse_bool(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<bool> {
    lookup(key).map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

fn parse_list(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<Vec<String>> {
    lookup(key).map(|v| {
        v.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    })
}

impl GatewayConfig {
    /// Load configuration from `RG_*` environment variables
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] if `RG_ORIGIN` is not a valid URL
    /// or the result fails [`validate`](Self::validate).
    pub fn from_env() -> GatewayResult<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> GatewayResult<Self> {
        let mut config = Self::default();

        if let Some(origin) = lookup("RG_ORIGIN") {
            config.origin = parse_origin(&origin)?;
        }
        if let Some(host) = lookup("RG_HOST") {
            config.host = host;
        }
        if let Some(port) = parse(&lookup, "RG_PORT") {
            config.port = port;
        }

        // Cache
        if let Some(ttl) = parse::<u64>(&lookup, "RG_CACHE_TTL") {
            config.cache.default_ttl = Duration::from_secs(ttl);
        }
        if let Some(max) = parse(&lookup, "RG_CACHE_MAX_ENTRIES") {
            config.cache.max_entries = max;
        }

        // Render
        if let Some(max) = parse(&lookup, "RG_MAX_RENDERS") {
            config.render.max_concurrency = max;
        }
        if let Some(queue) = parse(&lookup, "RG_RENDER_QUEUE") {
            config.render.queue_capacity = queue;
        }
        if let Some(ms) = parse::<u64>(&lookup, "RG_RENDER_TIMEOUT_MS") {
            config.render.default_timeout = Duration::from_millis(ms);
        }

        // Circuit breaker
        if let Some(n) = parse(&lookup, "RG_CB_FAILURE_THRESHOLD") {
            config.breaker.failure_threshold = n;
        }
        if let Some(n) = parse(&lookup, "RG_CB_SUCCESS_THRESHOLD") {
            config.breaker.success_threshold = n;
        }
        if let Some(secs) = parse::<u64>(&lookup, "RG_CB_RESET_TIMEOUT_SECS") {
            config.breaker.reset_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = parse::<u64>(&lookup, "RG_CB_TIMEOUT_MS") {
            config.breaker.timeout_threshold = Duration::from_millis(ms);
        }
        if let Some(n) = parse(&lookup, "RG_CB_HALF_OPEN_MAX_CALLS") {
            config.breaker.half_open_max_calls = n;
        }
        if let Some(secs) = parse::<u64>(&lookup, "RG_CB_WINDOW_SECS") {
            config.breaker.monitoring_window = Duration::from_secs(secs);
        }

        // Gate
        if let Some(extensions) = parse_list(&lookup, "RG_STATIC_EXTENSIONS") {
            config.gate = config.gate.with_static_extensions(extensions);
        }
        if let Some(prefixes) = parse_list(&lookup, "RG_BYPASS_PREFIXES") {
            config.gate = config.gate.with_bypass_prefixes(prefixes);
        }

        if let Some(counts) = parse_bool(&lookup, "RG_REVALIDATION_COUNTS_TOWARD_BREAKER") {
            config.orchestrator.revalidation_counts_toward_breaker = counts;
        }

        // Browser
        if let Some(path) = lookup("RG_CHROME_PATH").filter(|p| !p.is_empty()) {
            config.chrome_path = Some(PathBuf::from(path));
        }
        if let Some(headless) = parse_bool(&lookup, "RG_HEADLESS") {
            config.headless = headless;
        }
        if let Some(no_sandbox) = parse_bool(&lookup, "RG_NO_SANDBOX") {
            config.no_sandbox = no_sandbox;
        }
        if let Some(secs) = parse::<u64>(&lookup, "RG_DRAIN_TIMEOUT_SECS") {
            config.drain_timeout = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Set the origin
    pub fn with_origin(mut self, origin: Url) -> Self {
        self.origin = origin;
        self
    }

    /// Set the cache TTL
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache.default_ttl = ttl;
        self
    }

    /// Set the page pool size
    pub fn with_max_renders(mut self, max: usize) -> Self {
        self.render.max_concurrency = max;
        self
    }

    /// Reject settings that would make the pipeline unusable
    pub fn validate(&self) -> GatewayResult<()> {
        let checks: [(bool, &str); 8] = [
            (
                matches!(self.origin.scheme(), "http" | "https"),
                "origin must be an http(s) URL",
            ),
            (self.render.max_concurrency > 0, "max renders must be at least 1"),
            (!self.render.default_timeout.is_zero(), "render timeout must be positive"),
            (!self.cache.default_ttl.is_zero(), "cache TTL must be positive"),
            (self.breaker.failure_threshold > 0, "failure threshold must be at least 1"),
            (self.breaker.success_threshold > 0, "success threshold must be at least 1"),
            (self.breaker.half_open_max_calls > 0, "half-open max calls must be at least 1"),
            (
                !self.breaker.reset_timeout.is_zero() && !self.breaker.timeout_threshold.is_zero(),
                "breaker timeouts must be positive",
            ),
        ];

        match checks.iter().find(|(ok, _)| !ok) {
            Some((_, message)) => Err(GatewayError::Config(message.to_string())),
            None => Ok(()),
        }
    }

    /// Listen address as `host:port`
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Parse and sanity-check an origin URL
pub fn parse_origin(raw: &str) -> GatewayResult<Url> {
    let url = Url::parse(raw.trim())
        .map_err(|e| GatewayError::Config(format!("invalid origin '{}': {}", raw, e)))?;
    if url.host_str().is_none() {
        return Err(GatewayError::Config(format!("origin '{}' has no host", raw)));
    }
    Ok(url)
}
