//! Binance REST Client
//!
//! The request/response calls the streaming runtime depends on: system
//! status, server time, depth snapshots, candlestick history and user-data
//! listen key management.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder};
use serde::de::{DeserializeOwned, IgnoredAny};
use tracing::debug;

use super::codec::timestamp;
use super::messages::{
    ApiErrorResponse, KlineRow, ListenKeyResponse, PartialDepthMessage, ServerTimeResponse,
    SystemStatusResponse,
};
use crate::application::ports::{ExchangeRest, RestError};
use crate::domain::candlestick::Candlestick;
use crate::domain::market::{CandlestickInterval, ListenKey, Symbol, SystemStatus};
use crate::domain::order_book::DepthSnapshot;
use crate::infrastructure::config::EndpointSettings;

const API_KEY_HEADER: &str = "X-MBX-APIKEY";
const USER_DATA_STREAM_PATH: &str = "/api/v3/userDataStream";

/// HTTP client for the Binance REST API.
#[derive(Debug, Clone)]
pub struct BinanceRestClient {
    client: Client,
    base_url: String,
}

impl BinanceRestClient {
    /// Create a client for the configured REST endpoint.
    pub fn new(settings: &EndpointSettings) -> Result<Self, RestError> {
        Self::with_base_url(&settings.rest_url, settings.rest_timeout)
    }

    /// Create a client for an explicit base URL.
    pub fn with_base_url(base_url: &str, timeout: Duration) -> Result<Self, RestError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RestError::Network(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Base URL requests are sent to.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        path: &str,
        request: RequestBuilder,
    ) -> Result<T, RestError> {
        let response = request
            .send()
            .await
            .map_err(|e| RestError::Network(e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| RestError::Network(e.to_string()))?;

        debug!(path, status = status.as_u16(), "rest response");

        if !status.is_success() {
            let (code, message) = match serde_json::from_str::<ApiErrorResponse>(&body) {
                Ok(error) => (Some(error.code), error.msg),
                Err(_) => (None, body),
            };
            return Err(RestError::Api {
                status: status.as_u16(),
                code,
                message,
            });
        }

        serde_json::from_str(&body).map_err(|e| RestError::Decode(e.to_string()))
    }
}

#[async_trait]
impl ExchangeRest for BinanceRestClient {
    async fn system_status(&self) -> Result<SystemStatus, RestError> {
        let path = "/sapi/v1/system/status";
        let response: SystemStatusResponse =
            self.send(path, self.client.get(self.url(path))).await?;
        Ok(SystemStatus::from_code(response.status))
    }

    async fn server_time(&self) -> Result<DateTime<Utc>, RestError> {
        let path = "/api/v3/time";
        let response: ServerTimeResponse = self.send(path, self.client.get(self.url(path))).await?;
        timestamp(response.server_time).map_err(|e| RestError::Decode(e.to_string()))
    }

    async fn order_book(&self, symbol: &Symbol, limit: u32) -> Result<DepthSnapshot, RestError> {
        let path = "/api/v3/depth";
        let request = self
            .client
            .get(self.url(path))
            .query(&[("symbol", symbol.as_str().to_string()), ("limit", limit.to_string())]);
        let response: PartialDepthMessage = self.send(path, request).await?;
        Ok(response.into())
    }

    async fn candlesticks(
        &self,
        symbol: &Symbol,
        interval: CandlestickInterval,
        limit: u32,
    ) -> Result<Vec<Candlestick>, RestError> {
        let path = "/api/v3/klines";
        let request = self.client.get(self.url(path)).query(&[
            ("symbol", symbol.as_str().to_string()),
            ("interval", interval.to_string()),
            ("limit", limit.to_string()),
        ]);
        let rows: Vec<KlineRow> = self.send(path, request).await?;

        let now = Utc::now().timestamp_millis();
        rows.into_iter()
            .map(|row| {
                let is_final = row.6 < now;
                row.into_domain(symbol, interval, is_final)
                    .map_err(|e| RestError::Decode(e.to_string()))
            })
            .collect()
    }

    async fn start_user_stream(&self, api_key: &str) -> Result<ListenKey, RestError> {
        if api_key.is_empty() {
            return Err(RestError::MissingApiKey);
        }
        let request = self
            .client
            .post(self.url(USER_DATA_STREAM_PATH))
            .header(API_KEY_HEADER, api_key);
        let response: ListenKeyResponse = self.send(USER_DATA_STREAM_PATH, request).await?;
        Ok(response.into())
    }

    async fn keep_alive_user_stream(
        &self,
        api_key: &str,
        listen_key: &ListenKey,
    ) -> Result<(), RestError> {
        if api_key.is_empty() {
            return Err(RestError::MissingApiKey);
        }
        let request = self
            .client
            .put(self.url(USER_DATA_STREAM_PATH))
            .header(API_KEY_HEADER, api_key)
            .query(&[("listenKey", listen_key.as_str())]);
        let IgnoredAny = self.send(USER_DATA_STREAM_PATH, request).await?;
        Ok(())
    }

    async fn close_user_stream(
        &self,
        api_key: &str,
        listen_key: &ListenKey,
    ) -> Result<(), RestError> {
        if api_key.is_empty() {
            return Err(RestError::MissingApiKey);
        }
        let request = self
            .client
            .delete(self.url(USER_DATA_STREAM_PATH))
            .header(API_KEY_HEADER, api_key)
            .query(&[("listenKey", listen_key.as_str())]);
        let IgnoredAny = self.send(USER_DATA_STREAM_PATH, request).await?;
        Ok(())
    }
}
