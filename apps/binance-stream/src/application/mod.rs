//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the stream supervisor, the client manager, the
//! synchronizing caches and the port interfaces they drive.

/// Port interfaces for external systems (exchange REST, stream operations).
pub mod ports;

/// Supervision, manager and cache services.
pub mod services;
