//! Domain Layer - Core streaming types and business logic.
//!
//! Pure types for symbols, topics, subscription tables, order books and
//! candlestick series. Nothing here performs I/O; the synchronization
//! state machines are driven by the application layer.

/// Symbols, candlestick intervals, listen keys and exchange status.
pub mod market;

/// Stream topic names and connection targets.
pub mod topic;

/// Topic to callback tables used by the stream multiplexer.
pub mod subscription;

/// Order book levels, snapshots and the depth synchronizer.
pub mod order_book;

/// Bounded candlestick series.
pub mod candlestick;

/// Decoded event payloads for every stream family.
pub mod events;
