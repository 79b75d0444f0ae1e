//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the WebSocket and REST adapters for the exchange
//! together with configuration, metrics and tracing setup.

/// Binance WebSocket transport, multiplexer, event clients and REST client.
pub mod binance;

/// Configuration loaded from the environment.
pub mod config;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// OpenTelemetry tracing integration.
pub mod telemetry;
