//! Traffic event sink
//!
//! One [`TrafficEvent`] is recorded per gateway request. Recording is
//! fire-and-forget: a slow or full sink never delays or alters a response.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::gate::Action;

/// A request as seen by the gateway
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrafficEvent {
    /// When the request finished
    pub timestamp: DateTime<Utc>,
    /// Request path (no query)
    pub path: String,
    /// Bot signal verdict
    pub is_bot: bool,
    /// Gate action taken
    pub action: Action,
    /// `X-SSR-Cache` value, if a render path was taken
    pub cache_status: Option<String>,
    /// Status returned to the client
    pub status_code: u16,
    /// Total handling time
    pub duration_ms: u64,
}

/// Receives traffic events
pub trait TrafficSink: Send + Sync + 'static {
    /// Record an event; must not block
    fn record(&self, event: TrafficEvent);
}

/// Writes events to the `rendergate::traffic` tracing target
#[derive(Debug, Clone, Default)]
pub struct LogTrafficSink;

impl TrafficSink for LogTrafficSink {
    fn record(&self, event: TrafficEvent) {
        info!(
            target: "rendergate::traffic",
            path = %event.path,
            is_bot = event.is_bot,
            action = %event.action,
            cache = event.cache_status.as_deref().unwrap_or("-"),
            status = event.status_code,
            duration_ms = event.duration_ms,
            "traffic"
        );
    }
}

/// Forwards events over a bounded channel, dropping them when it is full
#[derive(Debug, Clone)]
pub struct ChannelTrafficSink {
    tx: mpsc::Sender<TrafficEvent>,
}

impl ChannelTrafficSink {
    /// Create a sink and the receiving end of its channel
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<TrafficEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl TrafficSink for ChannelTrafficSink {
    fn record(&self, event: TrafficEvent) {
        if let Err(e) = self.tx.try_send(event) {
            metrics::counter!("rendergate_traffic_events_dropped_total").increment(1);
            debug!(error = %e, "Traffic event dropped");
        }
    }
}

/// Discards every event
#[derive(Debug, Clone, Default)]
pub struct NullTrafficSink;

impl TrafficSink for NullTrafficSink {
    fn record(&self, _event: TrafficEvent) {}
}
