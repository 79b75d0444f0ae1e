//! Prometheus Metrics Module
//!
//! Exposes stream metrics in Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Frames**: received, dropped and undecodable frames per stream
//! - **Callbacks**: subscriber callbacks that failed or panicked
//! - **Connections**: open connections, reconnects, maintenance pauses
//! - **Caches**: order book resynchronizations by outcome
//!
//! # Integration
//!
//! `init_metrics(port)` installs the exporter with its own HTTP listener,
//! serving `/metrics` on `port`. Without an installed recorder every
//! `record_*` call is a no-op, which is what unit tests rely on.

use std::net::SocketAddr;
use std::sync::OnceLock;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

// =============================================================================
// Installation
// =============================================================================

static INSTALLED: OnceLock<SocketAddr> = OnceLock::new();

/// Install the Prometheus exporter listening on `0.0.0.0:port`.
///
/// Port 0 disables the exporter. Installing twice is a no-op. Must be
/// called from within a Tokio runtime.
pub fn init_metrics(port: u16) -> Result<(), BuildError> {
    if port == 0 || INSTALLED.get().is_some() {
        return Ok(());
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    let _ = INSTALLED.set(addr);

    register_metrics();
    tracing::info!(%addr, "Prometheus exporter listening");
    Ok(())
}

/// Address of the installed exporter, if any.
#[must_use]
pub fn metrics_address() -> Option<SocketAddr> {
    INSTALLED.get().copied()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Frame counters
    describe_counter!(
        "binance_stream_frames_received_total",
        "Total frames received from exchange streams"
    );
    describe_counter!(
        "binance_stream_frames_dropped_total",
        "Total frames dropped before reaching a subscriber"
    );
    describe_counter!(
        "binance_stream_decode_errors_total",
        "Total frames that failed to decode into typed events"
    );
    describe_counter!(
        "binance_stream_callback_failures_total",
        "Total subscriber callbacks that returned an error or panicked"
    );

    // Connection metrics
    describe_gauge!(
        "binance_stream_connections",
        "Number of open exchange connections"
    );
    describe_counter!(
        "binance_stream_reconnects_total",
        "Total failed connection attempts followed by a retry"
    );
    describe_counter!(
        "binance_stream_maintenance_pauses_total",
        "Total pauses caused by exchange maintenance"
    );

    // Cache metrics
    describe_counter!(
        "binance_stream_order_book_resyncs_total",
        "Total order book resynchronizations by outcome"
    );
}

// =============================================================================
// Metric Labels
// =============================================================================

/// Why a frame never reached a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// No subscriber for the frame's topic.
    Unrouted,
    /// Frame could not be attributed to a topic.
    Unaddressed,
}

impl DropReason {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Unrouted => "unrouted",
            Self::Unaddressed => "unaddressed",
        }
    }
}

/// Result of an order book resynchronization step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncOutcome {
    /// Desync detected; a new snapshot was requested.
    Requested,
    /// Snapshot fetched and reconciled.
    Reconciled,
    /// Snapshot fetch or reconciliation failed.
    Failed,
    /// Budget exhausted; the book stopped synchronizing.
    Abandoned,
}

impl ResyncOutcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Reconciled => "reconciled",
            Self::Failed => "failed",
            Self::Abandoned => "abandoned",
        }
    }
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record a frame received on a stream.
pub fn record_frame_received(stream: &'static str) {
    counter!("binance_stream_frames_received_total", "stream" => stream).increment(1);
}

/// Record a frame that reached no subscriber.
pub fn record_frame_dropped(stream: &'static str, reason: DropReason) {
    counter!(
        "binance_stream_frames_dropped_total",
        "stream" => stream,
        "reason" => reason.as_str()
    )
    .increment(1);
}

/// Record a frame that failed to decode.
pub fn record_decode_error(family: &'static str) {
    counter!("binance_stream_decode_errors_total", "family" => family).increment(1);
}

/// Record a subscriber callback failure.
pub fn record_callback_failure(stream: &'static str) {
    counter!("binance_stream_callback_failures_total", "stream" => stream).increment(1);
}

/// Record a connection opening or closing.
pub fn record_connection(stream: &'static str, open: bool) {
    let connections = gauge!("binance_stream_connections", "stream" => stream);
    if open {
        connections.increment(1.0);
    } else {
        connections.decrement(1.0);
    }
}

/// Record a failed attempt that will be retried.
pub fn record_reconnect(stream: &'static str) {
    counter!("binance_stream_reconnects_total", "stream" => stream).increment(1);
}

/// Record a maintenance pause.
pub fn record_maintenance_pause(stream: &'static str) {
    counter!("binance_stream_maintenance_pauses_total", "stream" => stream).increment(1);
}

/// Record an order book resynchronization step.
pub fn record_resync(symbol: &str, outcome: ResyncOutcome) {
    counter!(
        "binance_stream_order_book_resyncs_total",
        "symbol" => symbol.to_string(),
        "outcome" => outcome.as_str()
    )
    .increment(1);
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_names() {
        assert_eq!(DropReason::Unrouted.as_str(), "unrouted");
        assert_eq!(DropReason::Unaddressed.as_str(), "unaddressed");
        assert_eq!(ResyncOutcome::Abandoned.as_str(), "abandoned");
    }

    #[test]
    fn recording_without_recorder_is_noop() {
        record_frame_received("test");
        record_frame_dropped("test", DropReason::Unrouted);
        record_decode_error("trade");
        record_callback_failure("test");
        record_connection("test", true);
        record_connection("test", false);
        record_reconnect("test");
        record_maintenance_pause("test");
        record_resync("BTCUSDT", ResyncOutcome::Requested);
    }

    #[test]
    fn port_zero_disables_exporter() {
        assert!(init_metrics(0).is_ok());
        assert!(metrics_address().is_none());
    }
}
