//! User-Data Stream
//!
//! Opens a listen key, subscribes the user-data client to it and keeps the
//! key alive on a timer. When a keep-alive fails the key is replaced: a new
//! key is requested, the subscription is re-pointed in one step and the
//! stale key is closed best-effort.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::application::ports::{ExchangeRest, RestError};
use crate::domain::events::UserDataEvent;
use crate::domain::market::ListenKey;
use crate::infrastructure::binance::client::{
    ClientError, EventCallback, EventSubscriber, SubscriptionId,
};
use crate::infrastructure::binance::families::UserDataFamily;
use crate::infrastructure::config::ApiKey;

/// User-data stream errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UserStreamError {
    /// Listen key request failed.
    #[error("listen key request failed: {0}")]
    Rest(#[from] RestError),

    /// Subscribing the listen key failed.
    #[error(transparent)]
    Client(#[from] ClientError),

    /// The stream is already open.
    #[error("user data stream already open")]
    AlreadyOpen,

    /// No API key is configured.
    #[error("api key required for user data streams")]
    MissingApiKey,
}

struct OpenStream {
    listen_key: Arc<Mutex<ListenKey>>,
    subscription: SubscriptionId,
    cancel: CancellationToken,
    keep_alive: JoinHandle<()>,
}

/// One user's private event stream.
pub struct UserDataStream {
    rest: Arc<dyn ExchangeRest>,
    client: Arc<dyn EventSubscriber<UserDataFamily>>,
    api_key: ApiKey,
    keep_alive_interval: Duration,
    open: tokio::sync::Mutex<Option<OpenStream>>,
}

impl UserDataStream {
    /// Create a closed stream; fails without an API key.
    pub fn new(
        rest: Arc<dyn ExchangeRest>,
        client: Arc<dyn EventSubscriber<UserDataFamily>>,
        api_key: Option<ApiKey>,
        keep_alive_interval: Duration,
    ) -> Result<Self, UserStreamError> {
        let api_key = api_key
            .filter(|key| !key.expose().is_empty())
            .ok_or(UserStreamError::MissingApiKey)?;
        Ok(Self {
            rest,
            client,
            api_key,
            keep_alive_interval,
            open: tokio::sync::Mutex::new(None),
        })
    }

    /// Start a listen key, subscribe `callback` and begin keep-alives.
    pub async fn open(
        &self,
        callback: Option<EventCallback<UserDataEvent>>,
    ) -> Result<ListenKey, UserStreamError> {
        let mut open = self.open.lock().await;
        if open.is_some() {
            return Err(UserStreamError::AlreadyOpen);
        }

        let listen_key = self.rest.start_user_stream(self.api_key.expose()).await?;
        let subscription = match self.client.subscribe(listen_key.clone(), callback).await {
            Ok(id) => id,
            Err(error) => {
                self.close_key(&listen_key).await;
                return Err(error.into());
            }
        };

        let current = Arc::new(Mutex::new(listen_key.clone()));
        let cancel = CancellationToken::new();
        let keep_alive = tokio::spawn(
            KeepAlive {
                rest: Arc::clone(&self.rest),
                client: Arc::clone(&self.client),
                api_key: self.api_key.clone(),
                interval: self.keep_alive_interval,
                listen_key: Arc::clone(&current),
                cancel: cancel.clone(),
            }
            .run(),
        );

        info!(listen_key = ?listen_key, "user data stream opened");
        *open = Some(OpenStream {
            listen_key: current,
            subscription,
            cancel,
            keep_alive,
        });
        Ok(listen_key)
    }

    /// Stop keep-alives, unsubscribe and close the listen key.
    ///
    /// Returns `false` when the stream was not open.
    pub async fn close(&self) -> Result<bool, UserStreamError> {
        let Some(stream) = self.open.lock().await.take() else {
            return Ok(false);
        };

        stream.cancel.cancel();
        // Joining avoids closing a key while a rotation is in flight.
        let _ = stream.keep_alive.await;

        let listen_key = stream.listen_key.lock().clone();
        self.client
            .unsubscribe(listen_key.clone(), stream.subscription)
            .await?;
        self.rest
            .close_user_stream(self.api_key.expose(), &listen_key)
            .await?;
        info!(listen_key = ?listen_key, "user data stream closed");
        Ok(true)
    }

    /// Listen key currently in use.
    pub async fn listen_key(&self) -> Option<ListenKey> {
        self.open
            .lock()
            .await
            .as_ref()
            .map(|stream| stream.listen_key.lock().clone())
    }

    async fn close_key(&self, listen_key: &ListenKey) {
        if let Err(error) = self
            .rest
            .close_user_stream(self.api_key.expose(), listen_key)
            .await
        {
            warn!(error = %error, "failed to close listen key");
        }
    }
}

impl std::fmt::Debug for UserDataStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserDataStream")
            .field("api_key", &self.api_key)
            .field("keep_alive_interval", &self.keep_alive_interval)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Keep-alive
// =============================================================================

struct KeepAlive {
    rest: Arc<dyn ExchangeRest>,
    client: Arc<dyn EventSubscriber<UserDataFamily>>,
    api_key: ApiKey,
    interval: Duration,
    listen_key: Arc<Mutex<ListenKey>>,
    cancel: CancellationToken,
}

impl KeepAlive {
    async fn run(self) {
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return,
                () = tokio::time::sleep(self.interval) => {}
            }

            let current = self.listen_key.lock().clone();
            match self
                .rest
                .keep_alive_user_stream(self.api_key.expose(), &current)
                .await
            {
                Ok(()) => info!(listen_key = ?current, "listen key kept alive"),
                Err(error) => {
                    warn!(
                        listen_key = ?current,
                        error = %error,
                        "keep-alive failed, rotating listen key"
                    );
                    self.rotate(current).await;
                }
            }
        }
    }

    async fn rotate(&self, stale: ListenKey) {
        let fresh = match self.rest.start_user_stream(self.api_key.expose()).await {
            Ok(key) => key,
            Err(error) => {
                warn!(error = %error, "failed to start replacement listen key");
                return;
            }
        };

        match self.client.rekey(stale.clone(), fresh.clone()).await {
            Ok(_) => {
                *self.listen_key.lock() = fresh.clone();
                info!(listen_key = ?fresh, "listen key replaced");
            }
            Err(error) => {
                warn!(error = %error, "failed to re-point user data subscription");
                if let Err(error) = self
                    .rest
                    .close_user_stream(self.api_key.expose(), &fresh)
                    .await
                {
                    warn!(error = %error, "failed to close replacement listen key");
                }
                return;
            }
        }

        if let Err(error) = self
            .rest
            .close_user_stream(self.api_key.expose(), &stale)
            .await
        {
            warn!(error = %error, "failed to close stale listen key");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use mockall::predicate::always;

    use super::*;
    use crate::application::ports::MockExchangeRest;
    use crate::infrastructure::binance::client::EventClient;
    use crate::infrastructure::binance::multiplexer::StreamMultiplexer;
    use crate::infrastructure::binance::transport::WebSocketTransport;

    fn client() -> Arc<EventClient<UserDataFamily>> {
        let transport = Arc::new(WebSocketTransport::new(Duration::from_secs(1)));
        let multiplexer = Arc::new(StreamMultiplexer::new("userData", "wss://test", transport));
        Arc::new(EventClient::new(multiplexer, 16))
    }

    fn key() -> Option<ApiKey> {
        Some(ApiKey::new("api-key".to_string()))
    }

    #[test]
    fn requires_api_key() {
        let result = UserDataStream::new(
            Arc::new(MockExchangeRest::new()),
            client(),
            None,
            Duration::from_secs(60),
        );
        assert!(matches!(result, Err(UserStreamError::MissingApiKey)));
    }

    #[tokio::test]
    async fn open_and_close() {
        let mut rest = MockExchangeRest::new();
        rest.expect_start_user_stream()
            .times(1)
            .returning(|_| Ok(ListenKey::new("first")));
        rest.expect_close_user_stream()
            .times(1)
            .withf(|api_key, listen_key| api_key == "api-key" && listen_key.as_str() == "first")
            .returning(|_, _| Ok(()));
        let client = client();
        let stream = UserDataStream::new(
            Arc::new(rest),
            Arc::clone(&client) as Arc<dyn EventSubscriber<UserDataFamily>>,
            key(),
            Duration::from_secs(1800),
        )
        .unwrap();

        let listen_key = stream.open(None).await.unwrap();
        assert_eq!(listen_key.as_str(), "first");
        assert_eq!(client.topics().len(), 1);
        assert!(matches!(stream.open(None).await, Err(UserStreamError::AlreadyOpen)));

        assert!(stream.close().await.unwrap());
        assert!(client.topics().is_empty());
        assert!(!stream.close().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn keep_alive_runs_on_interval() {
        let pings = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&pings);
        let mut rest = MockExchangeRest::new();
        rest.expect_start_user_stream()
            .returning(|_| Ok(ListenKey::new("first")));
        rest.expect_keep_alive_user_stream()
            .with(always(), always())
            .returning(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        rest.expect_close_user_stream().returning(|_, _| Ok(()));

        let stream =
            UserDataStream::new(Arc::new(rest), client(), key(), Duration::from_secs(60)).unwrap();
        stream.open(None).await.unwrap();

        tokio::time::sleep(Duration::from_secs(185)).await;
        assert_eq!(pings.load(Ordering::SeqCst), 3);
        stream.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_keep_alive_rotates_key() {
        let starts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&starts);
        let mut rest = MockExchangeRest::new();
        rest.expect_start_user_stream().returning(move |_| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            Ok(ListenKey::new(if n == 0 { "first" } else { "second" }))
        });
        rest.expect_keep_alive_user_stream()
            .returning(|_, _| Err(RestError::Network("expired".to_string())));
        rest.expect_close_user_stream()
            .withf(|_, listen_key| listen_key.as_str() == "first")
            .times(1)
            .returning(|_, _| Ok(()));
        rest.expect_close_user_stream()
            .withf(|_, listen_key| listen_key.as_str() == "second")
            .times(1)
            .returning(|_, _| Ok(()));

        let client = client();
        let stream = UserDataStream::new(
            Arc::new(rest),
            Arc::clone(&client) as Arc<dyn EventSubscriber<UserDataFamily>>,
            key(),
            Duration::from_secs(60),
        )
        .unwrap();
        stream.open(None).await.unwrap();

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(stream.listen_key().await.unwrap().as_str(), "second");
        assert_eq!(client.keys(), vec![ListenKey::new("second")]);

        stream.close().await.unwrap();
    }
    #[tokio::test(start_paused = true)]
    async fn failed_rekey_closes_replacement_and_keeps_stale_key() {
        let starts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&starts);
        let mut rest = MockExchangeRest::new();
        rest.expect_start_user_stream().returning(move |_| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            Ok(ListenKey::new(if n == 0 { "first" } else { "second" }))
        });
        rest.expect_keep_alive_user_stream()
            .returning(|_, _| Err(RestError::Network("expired".to_string())));
        rest.expect_close_user_stream()
            .withf(|_, listen_key| listen_key.as_str() == "second")
            .times(1)
            .returning(|_, _| Err(RestError::Network("unreachable".to_string())));
        rest.expect_close_user_stream()
            .withf(|_, listen_key| listen_key.as_str() == "first")
            .times(1)
            .returning(|_, _| Ok(()));

        let client = client();
        // The replacement topic is already taken, so the re-point is rejected.
        client.subscribe(ListenKey::new("second"), None).unwrap();
        let stream = UserDataStream::new(
            Arc::new(rest),
            Arc::clone(&client) as Arc<dyn EventSubscriber<UserDataFamily>>,
            key(),
            Duration::from_secs(60),
        )
        .unwrap();
        stream.open(None).await.unwrap();

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(starts.load(Ordering::SeqCst), 2);
        assert_eq!(stream.listen_key().await.unwrap().as_str(), "first");
        assert_eq!(client.keys(), vec![ListenKey::new("first"), ListenKey::new("second")]);

        assert!(stream.close().await.unwrap());
    }
}
