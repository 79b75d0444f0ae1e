//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `StreamController`: supervised, retrying connection attempts
//! - `StreamManager`: per-family cancel-mutate-restart queues
//! - Caches: order books, candlesticks and 24h statistics
//! - `ClockSync`: exchange clock offset
//! - `UserDataStream`: listen key lifecycle

pub mod cache;
pub mod clock;
pub mod controller;
pub mod manager;
pub mod retry;
pub mod user_stream;

pub use cache::{CacheError, CandlestickCache, OrderBookCache, StatisticsCache};
pub use clock::ClockSync;
pub use controller::{
    ControllerError, ControllerEvent, ControllerStatus, MaintenanceCheck, PauseReason,
    StreamController,
};
pub use manager::{ManagedClient, ManagerError, StreamManager};
pub use retry::{FixedDelay, ReconnectConfig, ReconnectPolicy, RetryPolicy, RetryStrategy};
pub use user_stream::{UserDataStream, UserStreamError};
