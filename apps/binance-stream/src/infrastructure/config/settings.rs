//! Stream Configuration Settings
//!
//! Configuration types for the stream runtime, loaded from environment variables.

use std::time::Duration;

use crate::domain::market::Symbol;

/// Default WebSocket base URI.
pub const DEFAULT_STREAM_URL: &str = "wss://stream.binance.com:9443";

/// Default REST base URI.
pub const DEFAULT_REST_URL: &str = "https://api.binance.com";

/// Exchange API key.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    /// Wrap an API key.
    #[must_use]
    pub const fn new(key: String) -> Self {
        Self(key)
    }

    /// Get the API key.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ApiKey([REDACTED])")
    }
}

/// Endpoints of the exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSettings {
    /// WebSocket base URI (without `/ws` or `/stream`).
    pub stream_url: String,
    /// REST base URI.
    pub rest_url: String,
    /// Timeout for REST requests.
    pub rest_timeout: Duration,
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self {
            stream_url: DEFAULT_STREAM_URL.to_string(),
            rest_url: DEFAULT_REST_URL.to_string(),
            rest_timeout: Duration::from_secs(10),
        }
    }
}

/// Connection supervision settings.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSettings {
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Reconnection delay multiplier for exponential backoff.
    pub reconnect_delay_multiplier: f64,
    /// Jitter fraction applied to every delay.
    pub reconnect_jitter: f64,
    /// Maximum reconnection attempts before giving up (0 = unlimited).
    pub max_reconnect_attempts: u32,
    /// Bound on the graceful close handshake.
    pub close_timeout: Duration,
    /// Polling interval while the exchange is under maintenance.
    pub maintenance_check_interval: Duration,
    /// Capacity of each family's event broadcast channel.
    pub event_capacity: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            reconnect_delay_initial: Duration::from_millis(500),
            reconnect_delay_max: Duration::from_secs(30),
            reconnect_delay_multiplier: 2.0,
            reconnect_jitter: 0.1,
            max_reconnect_attempts: 0, // Unlimited
            close_timeout: Duration::from_millis(1000),
            maintenance_check_interval: Duration::from_secs(60),
            event_capacity: 1024,
        }
    }
}

/// Local cache settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSettings {
    /// Candlesticks kept per series.
    pub candlestick_capacity: usize,
    /// Levels requested per side for order book snapshots.
    pub depth_snapshot_limit: u32,
    /// Consecutive failed resyncs before an order book gives up.
    pub max_resync_attempts: u32,
    /// Delay between resync attempts.
    pub resync_delay: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            candlestick_capacity: 500,
            depth_snapshot_limit: 1000,
            max_resync_attempts: 5,
            resync_delay: Duration::from_secs(1),
        }
    }
}

/// User-data stream settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserStreamSettings {
    /// API key used to obtain listen keys.
    pub api_key: Option<ApiKey>,
    /// Keep-alive period for listen keys.
    pub keep_alive_interval: Duration,
}

impl Default for UserStreamSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            keep_alive_interval: Duration::from_secs(1800),
        }
    }
}

/// Complete runtime configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    /// Exchange endpoints.
    pub endpoints: EndpointSettings,
    /// Connection supervision.
    pub stream: StreamSettings,
    /// Local caches.
    pub cache: CacheSettings,
    /// User-data stream.
    pub user_stream: UserStreamSettings,
    /// Prometheus exporter port (0 = disabled).
    pub metrics_port: u16,
    /// Symbols the binary streams.
    pub symbols: Vec<Symbol>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            endpoints: EndpointSettings::default(),
            stream: StreamSettings::default(),
            cache: CacheSettings::default(),
            user_stream: UserStreamSettings::default(),
            metrics_port: 0,
            symbols: vec![Symbol::new("BTCUSDT")],
        }
    }
}

impl StreamConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but empty or malformed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(&lookup);
        let defaults = Self::default();

        let endpoints = EndpointSettings {
            stream_url: env.url("BINANCE_STREAM_URL", defaults.endpoints.stream_url)?,
            rest_url: env.url("BINANCE_REST_URL", defaults.endpoints.rest_url)?,
            rest_timeout: env.millis("BINANCE_REST_TIMEOUT_MS", defaults.endpoints.rest_timeout)?,
        };

        let stream = StreamSettings {
            reconnect_delay_initial: env.millis(
                "BINANCE_RECONNECT_DELAY_INITIAL_MS",
                defaults.stream.reconnect_delay_initial,
            )?,
            reconnect_delay_max: env.secs(
                "BINANCE_RECONNECT_DELAY_MAX_SECS",
                defaults.stream.reconnect_delay_max,
            )?,
            reconnect_delay_multiplier: env.parse(
                "BINANCE_RECONNECT_DELAY_MULTIPLIER",
                defaults.stream.reconnect_delay_multiplier,
            )?,
            reconnect_jitter: env
                .parse("BINANCE_RECONNECT_JITTER", defaults.stream.reconnect_jitter)?,
            max_reconnect_attempts: env.parse(
                "BINANCE_MAX_RECONNECT_ATTEMPTS",
                defaults.stream.max_reconnect_attempts,
            )?,
            close_timeout: env.millis("BINANCE_CLOSE_TIMEOUT_MS", defaults.stream.close_timeout)?,
            maintenance_check_interval: env.secs(
                "BINANCE_MAINTENANCE_CHECK_SECS",
                defaults.stream.maintenance_check_interval,
            )?,
            event_capacity: env.parse("BINANCE_EVENT_CAPACITY", defaults.stream.event_capacity)?,
        };

        let cache = CacheSettings {
            candlestick_capacity: env
                .parse("BINANCE_CANDLESTICK_CAPACITY", defaults.cache.candlestick_capacity)?,
            depth_snapshot_limit: env
                .parse("BINANCE_DEPTH_SNAPSHOT_LIMIT", defaults.cache.depth_snapshot_limit)?,
            max_resync_attempts: env
                .parse("BINANCE_MAX_RESYNC_ATTEMPTS", defaults.cache.max_resync_attempts)?,
            resync_delay: env.millis("BINANCE_RESYNC_DELAY_MS", defaults.cache.resync_delay)?,
        };

        let user_stream = UserStreamSettings {
            api_key: env.optional("BINANCE_API_KEY")?.map(ApiKey::new),
            keep_alive_interval: env.secs(
                "BINANCE_LISTEN_KEY_KEEPALIVE_SECS",
                defaults.user_stream.keep_alive_interval,
            )?,
        };

        let symbols = match env.optional("BINANCE_SYMBOLS")? {
            Some(list) => parse_symbols(&list)?,
            None => defaults.symbols,
        };

        if stream.event_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "BINANCE_EVENT_CAPACITY".to_string(),
                value: "0".to_string(),
            });
        }

        Ok(Self {
            endpoints,
            stream,
            cache,
            user_stream,
            metrics_port: env.parse("BINANCE_METRICS_PORT", defaults.metrics_port)?,
            symbols,
        })
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable could not be parsed.
    #[error("environment variable {key} has invalid value {value:?}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Offending value.
        value: String,
    },
}

// =============================================================================
// Parsing Helpers
// =============================================================================

struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn optional(&self, key: &str) -> Result<Option<String>, ConfigError> {
        match (self.0)(key) {
            None => Ok(None),
            Some(value) if value.trim().is_empty() => Err(ConfigError::EmptyValue(key.to_string())),
            Some(value) => Ok(Some(value.trim().to_string())),
        }
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        match self.optional(key)? {
            None => Ok(default),
            Some(value) => value.parse().map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value,
            }),
        }
    }

    fn secs(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse(key, default.as_secs()).map(Duration::from_secs)
    }

    fn millis(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        let default = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
        self.parse(key, default).map(Duration::from_millis)
    }

    fn url(&self, key: &str, default: String) -> Result<String, ConfigError> {
        let value = self.optional(key)?.unwrap_or(default);
        let valid = ["ws://", "wss://", "http://", "https://"]
            .iter()
            .any(|scheme| value.starts_with(scheme));
        if !valid {
            return Err(ConfigError::InvalidValue {
                key: key.to_string(),
                value,
            });
        }
        Ok(value.trim_end_matches('/').to_string())
    }
}

fn parse_symbols(list: &str) -> Result<Vec<Symbol>, ConfigError> {
    let symbols: Vec<Symbol> = list
        .split(',')
        .map(Symbol::new)
        .filter(|s| !s.is_empty())
        .collect();
    if symbols.is_empty() {
        return Err(ConfigError::EmptyValue("BINANCE_SYMBOLS".to_string()));
    }
    Ok(symbols)
}
