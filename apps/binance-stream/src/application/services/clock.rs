//! Server Clock Synchronization
//!
//! Tracks the offset between the local clock and the exchange clock. The
//! offset is calibrated from the REST server time on first use, cached, and
//! can be reset to force a new calibration.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::RwLock;
use tracing::info;

use crate::application::ports::{ExchangeRest, RestError};

/// Owned exchange clock offset.
pub struct ClockSync {
    rest: Arc<dyn ExchangeRest>,
    offset: RwLock<Option<i64>>,
    calibrating: tokio::sync::Mutex<()>,
}

impl ClockSync {
    /// Create an uncalibrated clock.
    #[must_use]
    pub fn new(rest: Arc<dyn ExchangeRest>) -> Self {
        Self {
            rest,
            offset: RwLock::new(None),
            calibrating: tokio::sync::Mutex::new(()),
        }
    }

    /// Server minus local time in milliseconds, calibrating on first use.
    ///
    /// Concurrent first callers share one calibration request.
    pub async fn offset_millis(&self) -> Result<i64, RestError> {
        if let Some(offset) = self.cached_offset() {
            return Ok(offset);
        }

        let _calibrating = self.calibrating.lock().await;
        if let Some(offset) = self.cached_offset() {
            return Ok(offset);
        }

        let sent = Utc::now();
        let server_time = self.rest.server_time().await?;
        let received = Utc::now();

        // Assume the server stamped the response halfway through the round trip.
        let midpoint = sent + (received - sent) / 2;
        let offset = (server_time - midpoint).num_milliseconds();

        *self.offset.write() = Some(offset);
        info!(
            offset_ms = offset,
            round_trip_ms = (received - sent).num_milliseconds(),
            "server clock calibrated"
        );
        Ok(offset)
    }

    /// Offset if already calibrated.
    #[must_use]
    pub fn cached_offset(&self) -> Option<i64> {
        *self.offset.read()
    }

    /// Estimated exchange time (local time until calibrated).
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        Utc::now() + TimeDelta::milliseconds(self.cached_offset().unwrap_or(0))
    }

    /// Forget the offset; the next `offset_millis` recalibrates.
    pub fn reset(&self) {
        *self.offset.write() = None;
    }
}

impl std::fmt::Debug for ClockSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClockSync")
            .field("offset", &self.cached_offset())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::MockExchangeRest;

    fn ahead_by(millis: i64, calls: usize) -> Arc<dyn ExchangeRest> {
        let mut rest = MockExchangeRest::new();
        rest.expect_server_time()
            .times(calls)
            .returning(move || Ok(Utc::now() + TimeDelta::milliseconds(millis)));
        Arc::new(rest)
    }

    #[tokio::test]
    async fn calibrates_once() {
        let clock = ClockSync::new(ahead_by(5_000, 1));
        assert_eq!(clock.cached_offset(), None);

        let first = clock.offset_millis().await.unwrap();
        let second = clock.offset_millis().await.unwrap();

        assert!((4_900..=5_100).contains(&first), "offset {first}");
        assert_eq!(first, second);
        assert!(clock.now() > Utc::now() + TimeDelta::milliseconds(4_000));
    }

    #[tokio::test]
    async fn reset_recalibrates() {
        let clock = ClockSync::new(ahead_by(0, 2));
        clock.offset_millis().await.unwrap();
        clock.reset();
        assert_eq!(clock.cached_offset(), None);
        clock.offset_millis().await.unwrap();
    }

    #[tokio::test]
    async fn failure_leaves_clock_uncalibrated() {
        let mut rest = MockExchangeRest::new();
        rest.expect_server_time()
            .returning(|| Err(RestError::Network("timeout".to_string())));
        let clock = ClockSync::new(Arc::new(rest));

        assert!(clock.offset_millis().await.is_err());
        assert_eq!(clock.cached_offset(), None);
    }
}
