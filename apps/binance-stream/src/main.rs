//! Binance Stream Binary
//!
//! Streams trades, order books, candlesticks and 24h statistics for the
//! configured symbols and keeps local caches synchronized.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin binance-stream
//! ```
//!
//! # Environment Variables
//!
//! ## Optional
//! - `BINANCE_SYMBOLS`: Comma-separated symbols (default: BTCUSDT)
//! - `BINANCE_STREAM_URL`: WebSocket base URL (default: <wss://stream.binance.com:9443>)
//! - `BINANCE_REST_URL`: REST base URL (default: <https://api.binance.com>)
//! - `BINANCE_REST_TIMEOUT_MS`: REST request timeout (default: 10000)
//! - `BINANCE_API_KEY`: Enables the user-data stream when set
//! - `BINANCE_LISTEN_KEY_KEEPALIVE_SECS`: Listen key keep-alive interval (default: 1800)
//! - `BINANCE_RECONNECT_DELAY_INITIAL_MS`: First reconnect delay (default: 500)
//! - `BINANCE_RECONNECT_DELAY_MAX_SECS`: Reconnect delay cap (default: 30)
//! - `BINANCE_RECONNECT_DELAY_MULTIPLIER`: Backoff multiplier (default: 2.0)
//! - `BINANCE_RECONNECT_JITTER`: Backoff jitter fraction (default: 0.1)
//! - `BINANCE_MAX_RECONNECT_ATTEMPTS`: 0 = unlimited (default: 0)
//! - `BINANCE_CLOSE_TIMEOUT_MS`: Close handshake timeout (default: 1000)
//! - `BINANCE_MAINTENANCE_CHECK_SECS`: Maintenance poll interval (default: 60)
//! - `BINANCE_EVENT_CAPACITY`: Broadcast buffer per family (default: 1024)
//! - `BINANCE_CANDLESTICK_CAPACITY`: Candles kept per series (default: 500)
//! - `BINANCE_DEPTH_SNAPSHOT_LIMIT`: Order book snapshot depth (default: 1000)
//! - `BINANCE_MAX_RESYNC_ATTEMPTS`: Snapshot attempts per resync (default: 5)
//! - `BINANCE_RESYNC_DELAY_MS`: Delay between snapshot attempts (default: 1000)
//! - `BINANCE_METRICS_PORT`: Prometheus metrics port, 0 disables (default: 0)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4317>)
//! - `OTEL_SERVICE_NAME`: Service name (default: binance-stream)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;

use anyhow::{Context, anyhow};
use binance_stream::domain::events::{StatisticsUpdate, Trade, UserDataEvent};
use binance_stream::{
    BinanceRestClient, CandlestickCache, CandlestickInterval, CandlestickKey, ClockSync,
    EventCallback, ExchangeRest, HandlerError, ManagerError, OrderBookCache, StatisticsCache,
    StatisticsKey, StreamConfig, StreamEvent, StreamManager, Symbol, UserDataStream, init_metrics,
    init_telemetry,
};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("failed to install rustls crypto provider"))?;

    load_dotenv();

    let _telemetry_guard = init_telemetry()?;

    tracing::info!("Starting Binance Stream");

    let config = StreamConfig::from_env()?;
    log_config(&config);

    if config.metrics_port > 0 {
        init_metrics(config.metrics_port).context("failed to start metrics exporter")?;
    }

    let rest: Arc<dyn ExchangeRest> = Arc::new(BinanceRestClient::new(&config.endpoints)?);
    let clock = Arc::new(ClockSync::new(Arc::clone(&rest)));
    match clock.offset_millis().await {
        Ok(offset_ms) => tracing::info!(offset_ms, "Server clock calibrated"),
        Err(e) => tracing::warn!(error = %e, "Server clock calibration failed, using local time"),
    }

    let manager = StreamManager::new(
        &config.endpoints.stream_url,
        &config.stream,
        Arc::clone(&rest),
        Some(Arc::clone(&clock)),
    );

    // Register everything before the first connection opens
    manager.suppress_auto_run();

    let order_books = OrderBookCache::new(
        Arc::new(manager.depth().clone()),
        Arc::clone(&rest),
        config.cache.clone(),
    );
    let candlesticks = CandlestickCache::new(
        Arc::new(manager.candlesticks().clone()),
        Arc::clone(&rest),
        config.cache.candlestick_capacity,
    );
    let statistics = StatisticsCache::new(Arc::new(manager.statistics().clone()));

    for symbol in &config.symbols {
        manager
            .trades()
            .subscribe(
                symbol.clone(),
                Some(Arc::new(
                    |event: &StreamEvent<Trade>| -> Result<(), HandlerError> {
                        tracing::debug!(
                            symbol = %event.data.symbol,
                            price = %event.data.price,
                            quantity = %event.data.quantity,
                            "Trade"
                        );
                        Ok(())
                    },
                )),
            )
            .await?;
        order_books.subscribe(symbol.clone(), None).await?;

        let key = CandlestickKey::new(symbol.clone(), CandlestickInterval::OneMinute);
        if let Err(e) = candlesticks.subscribe(key.clone()).await {
            tracing::warn!(key = %key, error = %e, "Candlestick history not loaded");
        }
        statistics.subscribe(StatisticsKey::Symbol(symbol.clone())).await?;
    }

    let user_stream = match config.user_stream.api_key.clone() {
        Some(api_key) => {
            let stream = UserDataStream::new(
                Arc::clone(&rest),
                Arc::new(manager.user_data().clone()),
                Some(api_key),
                config.user_stream.keep_alive_interval,
            )?;
            let callback: EventCallback<UserDataEvent> = Arc::new(
                |event: &StreamEvent<UserDataEvent>| -> Result<(), HandlerError> {
                    tracing::info!(event = ?event.data, "User data event");
                    Ok(())
                },
            );
            match stream.open(Some(callback)).await {
                Ok(_) => Some(stream),
                Err(e) => {
                    tracing::error!(error = %e, "User data stream unavailable");
                    None
                }
            }
        }
        None => None,
    };

    manager.resume_auto_run();

    tokio::spawn(log_manager_errors(manager.errors()));
    tokio::spawn(log_statistics(manager.statistics().events()));

    let mut book_errors = order_books.errors();
    tokio::spawn(async move {
        loop {
            match book_errors.recv().await {
                Ok(e) => tracing::error!(error = %e, "Order book error"),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Order book errors lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    tracing::info!(symbols = config.symbols.len(), "Binance stream ready");

    await_shutdown().await;

    if let Some(stream) = user_stream
        && let Err(e) = stream.close().await
    {
        tracing::warn!(error = %e, "Failed to close user data stream");
    }
    for symbol in order_books.symbols() {
        if let Some(book) = order_books.snapshot(&symbol) {
            tracing::info!(
                symbol = %symbol,
                last_update_id = book.last_update_id,
                best_bid = ?book.best_bid().map(|level| level.price),
                best_ask = ?book.best_ask().map(|level| level.price),
                "Final order book"
            );
        }
    }
    manager.shutdown().await;

    tracing::info!("Binance stream stopped");
    Ok(())
}

/// Log errors reported by any stream family.
async fn log_manager_errors(mut errors: tokio::sync::broadcast::Receiver<ManagerError>) {
    loop {
        match errors.recv().await {
            Ok(e) => tracing::error!(family = e.family, error = %e, "Stream error"),
            Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "Stream errors lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}

/// Log 24h statistics as they arrive.
async fn log_statistics(
    mut events: tokio::sync::broadcast::Receiver<StreamEvent<StatisticsUpdate>>,
) {
    loop {
        match events.recv().await {
            Ok(event) => {
                for stats in &event.data.statistics {
                    tracing::debug!(
                        symbol = %stats.symbol,
                        last_price = %stats.last_price,
                        price_change_percent = %stats.price_change_percent,
                        "24h statistics"
                    );
                }
            }
            Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => break,
        }
    }
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_err() {
        load_dotenv_from_ancestors();
    }
}

/// Log the parsed configuration.
fn log_config(config: &StreamConfig) {
    let symbols: Vec<&str> = config.symbols.iter().map(Symbol::as_str).collect();
    tracing::info!(
        symbols = ?symbols,
        user_stream = config.user_stream.api_key.is_some(),
        metrics_port = config.metrics_port,
        "Configuration loaded"
    );
    tracing::debug!(
        stream_url = %config.endpoints.stream_url,
        rest_url = %config.endpoints.rest_url,
        "Exchange endpoints"
    );
}

/// Load .env file from any ancestor directory.
fn load_dotenv_from_ancestors() {
    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn await_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
