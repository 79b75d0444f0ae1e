#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements,
        clippy::unreadable_literal
    )
)]

//! Binance Stream - Exchange Push-Data Runtime
//!
//! Maintains Binance WebSocket connections for market and user data,
//! multiplexing many logical topics onto one connection per stream family,
//! and keeps local caches (order books, candlesticks, 24h statistics)
//! consistent with the exchange.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: topics, connection targets, order books, candlestick
//!   series and typed event payloads
//!
//! - **Application**: ports and services
//!   - `ports`: exchange REST collaborator, stream operation
//!   - `services`: controller, manager, caches, clock sync, user data
//!
//! - **Infrastructure**: adapters and external integrations
//!   - `binance`: transport, multiplexer, typed clients, REST client
//!   - `config`: configuration from the environment
//!   - `metrics`, `telemetry`: observability
//!
//! # Data Flow
//!
//! ```text
//! WebSocket ──► Transport ──► Multiplexer ──► EventClient<F> ──► callbacks
//!                  ▲              (topic)        (decode)     └─► broadcast
//!                  │                                              │
//!            StreamController ◄── StreamManager            Caches ◄┘
//!              (retry loop)     (cancel-mutate-restart)   (REST sync)
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core streaming types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::events::{
    AggregateTrade, CandlestickUpdate, DepthUpdate, DepthUpdateKind, StatisticsUpdate,
    SymbolStatistics, Trade, UserDataEvent,
};
pub use domain::market::{CandlestickInterval, ListenKey, Symbol, SystemStatus};
pub use domain::order_book::OrderBookSnapshot;
pub use domain::topic::{ConnectionTarget, Topic};

// Ports
pub use application::ports::{ExchangeRest, RestError, StreamOperation};

// Services
pub use application::services::{
    CacheError, CandlestickCache, ClockSync, ControllerEvent, ControllerStatus, ManagedClient,
    ManagerError, OrderBookCache, StatisticsCache, StreamController, StreamManager,
    UserDataStream, UserStreamError,
};

// Stream adapters
pub use infrastructure::binance::{
    BinanceRestClient, CandlestickKey, ClientError, DepthKey, EventCallback, EventClient,
    EventFamily, EventSubscriber, HandlerError, StatisticsKey, StreamEvent, StreamMultiplexer,
    SubscriptionId,
};

// Infrastructure config
pub use infrastructure::config::{
    ApiKey, CacheSettings, ConfigError, EndpointSettings, StreamConfig, StreamSettings,
    UserStreamSettings,
};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
