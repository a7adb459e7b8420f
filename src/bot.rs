//! Bot signal and classifier seam
//!
//! Bot classification internals (IP reputation, cloud ranges, behavioural
//! heuristics) live outside the gateway. The pipeline only consumes the
//! precomputed [`BotSignal`]. [`UserAgentClassifier`] is the minimal default
//! used by the binary: it matches known crawler tokens in the User-Agent.

use std::net::IpAddr;

use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};

/// Externally computed classification of a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct BotSignal {
    /// Whether the request comes from an automated crawler
    pub is_bot: bool,
    /// Classifier confidence in `0.0..=1.0`
    pub confidence: f32,
    /// Names of the rules that matched
    pub matched_rules: Vec<String>,
}

impl BotSignal {
    /// Signal for a crawler
    pub fn bot(confidence: f32, matched_rules: Vec<String>) -> Self {
        Self {
            is_bot: true,
            confidence: clamp_confidence(confidence),
            matched_rules,
        }
    }

    /// Signal for ordinary human traffic
    pub fn human() -> Self {
        Self::default()
    }
}

fn clamp_confidence(confidence: f32) -> f32 {
    if confidence.is_nan() {
        0.0
    } else {
        confidence.clamp(0.0, 1.0)
    }
}

/// Computes a [`BotSignal`] for an inbound request
pub trait BotClassifier: Send + Sync + 'static {
    /// Classify a request from its user agent, client IP and headers
    fn classify(&self, user_agent: Option<&str>, ip: Option<IpAddr>, headers: &HeaderMap)
        -> BotSignal;
}

/// Crawler tokens recognised by the default classifier (lowercase)
pub const DEFAULT_CRAWLER_TOKENS: &[&str] = &[
    "googlebot",
    "google-inspectiontool",
    "bingbot",
    "yandexbot",
    "duckduckbot",
    "baiduspider",
    "slurp",
    "applebot",
    "facebookexternalhit",
    "twitterbot",
    "linkedinbot",
    "slackbot",
    "discordbot",
    "whatsapp",
    "telegrambot",
    "embedly",
    "pinterestbot",
    "petalbot",
    "semrushbot",
    "ahrefsbot",
];

/// User-Agent token matcher
#[derive(Debug, Clone)]
pub struct UserAgentClassifier {
    tokens: Vec<String>,
}

impl UserAgentClassifier {
    /// Create a classifier with the default crawler tokens
    pub fn new() -> Self {
        Self::with_tokens(DEFAULT_CRAWLER_TOKENS.iter().copied())
    }

    /// Create a classifier with a custom token list
    pub fn with_tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            tokens: tokens
                .into_iter()
                .map(|t| t.as_ref().to_ascii_lowercase())
                .filter(|t| !t.is_empty())
                .collect(),
        }
    }
}

impl Default for UserAgentClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl BotClassifier for UserAgentClassifier {
    fn classify(
        &self,
        user_agent: Option<&str>,
        _ip: Option<IpAddr>,
        _headers: &HeaderMap,
    ) -> BotSignal {
        let Some(ua) = user_agent else {
            return BotSignal::human();
        };
        let ua = ua.to_ascii_lowercase();

        let matched: Vec<String> = self
            .tokens
            .iter()
            .filter(|t| ua.contains(t.as_str()))
            .map(|t| format!("ua:{}", t))
            .collect();

        if matched.is_empty() {
            BotSignal::human()
        } else {
            BotSignal::bot(0.9, matched)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_googlebot_is_detected() {
        let classifier = UserAgentClassifier::new();
        let signal = classifier.classify(
            Some("Mozilla/5.0 (compatible; Googlebot/2.1; +http://www.google.com/bot.html)"),
            None,
            &HeaderMap::new(),
        );
        assert!(signal.is_bot);
        assert_eq!(signal.matched_rules, vec!["ua:googlebot".to_string()]);
    }

    #[test]
    fn test_browser_is_human() {
        let classifier = UserAgentClassifier::new();
        let signal = classifier.classify(
            Some("Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 Chrome/120.0 Safari/537.36"),
            None,
            &HeaderMap::new(),
        );
        assert_eq!(signal, BotSignal::human());
    }

    #[test]
    fn test_missing_user_agent_is_human() {
        let signal = UserAgentClassifier::new().classify(None, None, &HeaderMap::new());
        assert!(!signal.is_bot);
    }

    #[test]
    fn test_confidence_is_clamped() {
        assert_eq!(BotSignal::bot(3.0, vec![]).confidence, 1.0);
        assert_eq!(BotSignal::bot(-1.0, vec![]).confidence, 0.0);
        assert_eq!(BotSignal::bot(f32::NAN, vec![]).confidence, 0.0);
    }
}
