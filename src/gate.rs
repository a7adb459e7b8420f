//! Request classification
//!
//! The decision gate maps an inbound request plus its precomputed
//! [`BotSignal`] to an [`Action`]. Rules are evaluated in a fixed order and
//! the first match wins:
//!
//! ```text
//! method ∉ {GET, HEAD} ──▶ PROXY
//! bypass prefix        ──▶ BYPASS
//! static asset         ──▶ STATIC
//! render override      ──▶ RENDER (debug?)
//! bot signal           ──▶ RENDER
//! otherwise            ──▶ PROXY
//! ```

use std::fmt;

use axum::http::Method;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::bot::BotSignal;
use crate::error::{GatewayError, GatewayResult};

/// Query parameters that control rendering; stripped from cache keys
pub const RENDER_PARAMS: &[&str] = &["render", "_render"];

/// Default static-asset extensions (lowercase, without the dot)
pub const DEFAULT_STATIC_EXTENSIONS: &[&str] = &[
    "js", "mjs", "css", "map", "png", "jpg", "jpeg", "gif", "webp", "avif", "svg", "ico", "bmp",
    "woff", "woff2", "ttf", "otf", "eot", "mp4", "webm", "mp3", "wav", "ogg", "pdf", "zip", "gz",
    "wasm", "json", "xml", "txt", "csv", "webmanifest",
];

/// Default bypass prefixes
pub const DEFAULT_BYPASS_PREFIXES: &[&str] = &["/health", "/admin", "/api/"];

/// What to do with a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    /// Static asset, forwarded to origin untouched
    Static,
    /// Ordinary traffic, forwarded to origin untouched
    Proxy,
    /// Serve a rendered snapshot
    Render,
    /// Explicitly excluded path, forwarded to origin untouched
    Bypass,
}

impl Action {
    /// Label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Static => "STATIC",
            Action::Proxy => "PROXY",
            Action::Render => "RENDER",
            Action::Bypass => "BYPASS",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// The chosen action
    pub action: Action,
    /// Diagnostic render requested (`render=debug` / `_render=debug`)
    pub debug: bool,
    /// Rule that produced the decision
    pub reason: &'static str,
}

impl Decision {
    fn new(action: Action, reason: &'static str) -> Self {
        Self {
            action,
            debug: false,
            reason,
        }
    }
}

/// The parts of a request the gate looks at
#[derive(Debug, Clone, Copy)]
pub struct GateInput<'a> {
    /// HTTP method
    pub method: &'a Method,
    /// Request path (must start with `/`)
    pub path: &'a str,
    /// Raw query string without the leading `?`
    pub query: Option<&'a str>,
}

/// Gate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Lowercase extensions treated as static assets
    pub static_extensions: Vec<String>,
    /// Paths never treated as static even with a static extension
    pub static_exempt_paths: Vec<String>,
    /// Path prefixes forwarded to origin without classification
    pub bypass_prefixes: Vec<String>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            static_extensions: DEFAULT_STATIC_EXTENSIONS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            static_exempt_paths: Vec::new(),
            bypass_prefixes: DEFAULT_BYPASS_PREFIXES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl GateConfig {
    /// Replace the static extension list (case-insensitive, leading dots ignored)
    pub fn with_static_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.static_extensions = extensions
            .into_iter()
            .map(|e| e.as_ref().trim_start_matches('.').to_ascii_lowercase())
            .filter(|e| !e.is_empty())
            .collect();
        self
    }

    /// Exclude a path from static treatment
    pub fn exempt_from_static(mut self, path: impl Into<String>) -> Self {
        self.static_exempt_paths.push(path.into());
        self
    }

    /// Replace the bypass prefix list
    pub fn with_bypass_prefixes<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.bypass_prefixes = prefixes.into_iter().map(Into::into).collect();
        self
    }
}

/// Pure request classifier
#[derive(Debug, Clone, Default)]
pub struct DecisionGate {
    config: GateConfig,
}

impl DecisionGate {
    /// Create a gate with the given configuration
    pub fn new(config: GateConfig) -> Self {
        Self { config }
    }

    /// Get configuration
    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Classify a request, defaulting malformed input to PROXY
    pub fn classify(&self, input: GateInput<'_>, signal: &BotSignal) -> Decision {
        let decision = match self.try_classify(input, signal) {
            Ok(decision) => decision,
            Err(e) => {
                warn!(path = %input.path, error = %e, "Classification failed, proxying");
                Decision::new(Action::Proxy, "malformed")
            }
        };

        metrics::counter!(
            "rendergate_gate_decisions_total",
            "action" => decision.action.as_str(),
            "reason" => decision.reason
        )
        .increment(1);
        debug!(
            method = %input.method,
            path = %input.path,
            action = %decision.action,
            debug = decision.debug,
            reason = decision.reason,
            is_bot = signal.is_bot,
            "Request classified"
        );

        decision
    }

    /// Classify a request, surfacing malformed input as an error
    pub fn try_classify(
        &self,
        input: GateInput<'_>,
        signal: &BotSignal,
    ) -> GatewayResult<Decision> {
        if input.path.is_empty() || !input.path.starts_with('/') {
            return Err(GatewayError::Classification(format!(
                "path must start with '/': {:?}",
                input.path
            )));
        }

        if input.method != Method::GET && input.method != Method::HEAD {
            return Ok(Decision::new(Action::Proxy, "method"));
        }

        if self.is_bypassed(input.path) {
            return Ok(Decision::new(Action::Bypass, "bypass_prefix"));
        }

        if self.is_static_asset(input.path) {
            return Ok(Decision::new(Action::Static, "static_extension"));
        }

        if let Some(debug) = render_override(input.query) {
            return Ok(Decision {
                action: Action::Render,
                debug,
                reason: "render_override",
            });
        }

        if signal.is_bot {
            return Ok(Decision::new(Action::Render, "bot_signal"));
        }

        Ok(Decision::new(Action::Proxy, "default"))
    }

    fn is_bypassed(&self, path: &str) -> bool {
        self.config
            .bypass_prefixes
            .iter()
            .any(|prefix| !prefix.is_empty() && path.starts_with(prefix.as_str()))
    }

    fn is_static_asset(&self, path: &str) -> bool {
        if path == "/" || self.config.static_exempt_paths.iter().any(|p| p == path) {
            return false;
        }

        let segment = path.rsplit('/').next().unwrap_or_default();
        match segment.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => {
                let ext = ext.to_ascii_lowercase();
                self.config.static_extensions.iter().any(|e| *e == ext)
            }
            _ => false,
        }
    }
}

/// Look for an explicit render override in the query string
///
/// Returns `Some(debug)` when the query requests a render.
pub fn render_override(query: Option<&str>) -> Option<bool> {
    let query = query?;
    let mut found = None;

    for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
        let value = value.to_ascii_lowercase();
        match &*name {
            "render" if matches!(value.as_str(), "preview" | "true" | "debug") => {}
            "_render" => {}
            _ => continue,
        }
        let debug = value == "debug";
        found = Some(found.unwrap_or(false) || debug);
    }

    found
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input<'a>(method: &'a Method, path: &'a str, query: Option<&'a str>) -> GateInput<'a> {
        GateInput {
            method,
            path,
            query,
        }
    }

    fn gate() -> DecisionGate {
        DecisionGate::default()
    }

    #[test]
    fn test_non_idempotent_methods_are_proxied() {
        let bot = BotSignal::bot(0.9, vec!["googlebot".into()]);
        for method in [Method::POST, Method::PUT, Method::DELETE, Method::PATCH] {
            let d = gate().classify(input(&method, "/about", None), &bot);
            assert_eq!(d.action, Action::Proxy, "{} should proxy", method);
        }
    }

    #[test]
    fn test_head_is_treated_like_get() {
        let bot = BotSignal::bot(0.9, vec![]);
        let d = gate().classify(input(&Method::HEAD, "/about", None), &bot);
        assert_eq!(d.action, Action::Render);
    }

    #[test]
    fn test_bypass_prefix_wins_over_bot() {
        let bot = BotSignal::bot(1.0, vec![]);
        let d = gate().classify(input(&Method::GET, "/health", None), &bot);
        assert_eq!(d.action, Action::Bypass);
        let d = gate().classify(input(&Method::GET, "/api/users", Some("render=true")), &bot);
        assert_eq!(d.action, Action::Bypass);
    }

    #[test]
    fn test_static_assets() {
        let bot = BotSignal::bot(1.0, vec![]);
        for path in ["/app.js", "/img/logo.PNG", "/fonts/a.woff2", "/static/site.css"] {
            let d = gate().classify(input(&Method::GET, path, None), &bot);
            assert_eq!(d.action, Action::Static, "{} should be static", path);
        }
    }

    #[test]
    fn test_root_and_exempt_paths_are_not_static() {
        let gate = DecisionGate::new(GateConfig::default().exempt_from_static("/sitemap.xml"));
        let bot = BotSignal::bot(1.0, vec![]);
        assert_eq!(
            gate.classify(input(&Method::GET, "/", None), &bot).action,
            Action::Render
        );
        assert_eq!(
            gate.classify(input(&Method::GET, "/sitemap.xml", None), &bot)
                .action,
            Action::Render
        );
    }

    #[test]
    fn test_dotted_directory_is_not_an_extension() {
        let human = BotSignal::human();
        let d = gate().classify(input(&Method::GET, "/v1.2/docs", None), &human);
        assert_eq!(d.action, Action::Proxy);
        assert_eq!(d.reason, "default");
        let d = gate().classify(input(&Method::GET, "/.js", None), &human);
        assert_eq!(d.reason, "default");
    }

    #[test]
    fn test_render_override_for_humans() {
        let human = BotSignal::human();
        for query in ["render=preview", "render=true", "_render=1", "_render="] {
            let d = gate().classify(input(&Method::GET, "/about", Some(query)), &human);
            assert_eq!(d.action, Action::Render, "{} should render", query);
            assert!(!d.debug);
        }
    }

    #[test]
    fn test_debug_override() {
        let human = BotSignal::human();
        for query in ["render=debug", "_render=debug", "a=1&_render=DEBUG"] {
            let d = gate().classify(input(&Method::GET, "/about", Some(query)), &human);
            assert_eq!(d.action, Action::Render);
            assert!(d.debug, "{} should be debug", query);
        }
    }

    #[test]
    fn test_unknown_render_value_is_ignored() {
        let human = BotSignal::human();
        let d = gate().classify(input(&Method::GET, "/about", Some("render=false")), &human);
        assert_eq!(d.action, Action::Proxy);
    }

    #[test]
    fn test_bot_and_human_defaults() {
        let d = gate().classify(
            input(&Method::GET, "/about", None),
            &BotSignal::bot(0.8, vec![]),
        );
        assert_eq!(d.action, Action::Render);
        assert_eq!(d.reason, "bot_signal");

        let d = gate().classify(input(&Method::GET, "/about", None), &BotSignal::human());
        assert_eq!(d.action, Action::Proxy);
    }

    #[test]
    fn test_malformed_path_defaults_to_proxy() {
        let bot = BotSignal::bot(1.0, vec![]);
        assert!(gate()
            .try_classify(input(&Method::GET, "about", None), &bot)
            .is_err());
        let d = gate().classify(input(&Method::GET, "", None), &bot);
        assert_eq!(d.action, Action::Proxy);
        assert_eq!(d.reason, "malformed");
    }

    #[test]
    fn test_custom_extension_list() {
        let gate = DecisionGate::new(GateConfig::default().with_static_extensions([".Foo"]));
        let human = BotSignal::human();
        assert_eq!(
            gate.classify(input(&Method::GET, "/a.foo", None), &human).action,
            Action::Static
        );
        assert_eq!(
            gate.classify(input(&Method::GET, "/a.js", None), &human).action,
            Action::Proxy
        );
    }
}
