//! Configuration Module
//!
//! Environment-driven configuration for the stream runtime and binary.

mod settings;

pub use settings::{
    ApiKey, CacheSettings, ConfigError, DEFAULT_REST_URL, DEFAULT_STREAM_URL, EndpointSettings,
    StreamConfig, StreamSettings, UserStreamSettings,
};
