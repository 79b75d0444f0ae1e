//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following
//! the Hexagonal Architecture pattern. These are the contracts that
//! infrastructure adapters must implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - `ExchangeRest`: request/response calls the streaming layer depends on
//!   (system status, server time, depth snapshots, user-data listen keys)
//! - `StreamOperation`: one connection attempt, run until it ends or is
//!   cancelled

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::domain::candlestick::Candlestick;
use crate::domain::market::{CandlestickInterval, ListenKey, Symbol, SystemStatus};
use crate::domain::order_book::DepthSnapshot;

// =============================================================================
// Exchange REST
// =============================================================================

/// Errors from the exchange REST collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RestError {
    /// Request could not be sent or the response could not be read.
    #[error("network error: {0}")]
    Network(String),

    /// Exchange answered with an error status.
    #[error("api error (status {status}, code {code:?}): {message}")]
    Api {
        /// HTTP status.
        status: u16,
        /// Exchange error code, when the body carried one.
        code: Option<i64>,
        /// Error message.
        message: String,
    },

    /// Response body did not match the expected shape.
    #[error("failed to decode response: {0}")]
    Decode(String),

    /// Request needs an API key and none is configured.
    #[error("api key required")]
    MissingApiKey,
}

/// Exchange REST calls used by the streaming runtime.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExchangeRest: Send + Sync {
    /// Exchange-wide status (normal or maintenance).
    async fn system_status(&self) -> Result<SystemStatus, RestError>;

    /// Current exchange time.
    async fn server_time(&self) -> Result<DateTime<Utc>, RestError>;

    /// Order book snapshot with up to `limit` levels per side.
    async fn order_book(&self, symbol: &Symbol, limit: u32) -> Result<DepthSnapshot, RestError>;

    /// Most recent `limit` candlesticks, oldest first.
    async fn candlesticks(
        &self,
        symbol: &Symbol,
        interval: CandlestickInterval,
        limit: u32,
    ) -> Result<Vec<Candlestick>, RestError>;

    /// Open a user-data stream and return its listen key.
    async fn start_user_stream(&self, api_key: &str) -> Result<ListenKey, RestError>;

    /// Extend the validity of a listen key.
    async fn keep_alive_user_stream(
        &self,
        api_key: &str,
        listen_key: &ListenKey,
    ) -> Result<(), RestError>;

    /// Close a user-data stream.
    async fn close_user_stream(&self, api_key: &str, listen_key: &ListenKey)
    -> Result<(), RestError>;
}

// =============================================================================
// Stream Operation
// =============================================================================

/// Error surfaced by a failed connection attempt.
pub type OperationError = Box<dyn std::error::Error + Send + Sync>;

/// One supervised streaming operation (usually a multiplexer).
#[async_trait]
pub trait StreamOperation: Send + Sync {
    /// Run one connection attempt until it ends or `cancel` fires.
    ///
    /// Returning `Ok(())` after cancellation is a normal completion.
    async fn run(&self, cancel: CancellationToken) -> Result<(), OperationError>;

    /// Whether there is anything to stream (at least one topic).
    fn is_ready(&self) -> bool;

    /// Whether an attempt is currently in progress.
    fn is_running(&self) -> bool;

    /// Number of connections opened so far; used to reset backoff after
    /// an attempt that got connected before failing.
    fn opened_count(&self) -> u64;

    /// Label used in logs and metrics.
    fn name(&self) -> &'static str;
}
