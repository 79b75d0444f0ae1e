//! Stream Codec
//!
//! JSON decoding for Binance stream frames.
//!
//! A combined-stream connection wraps every payload in an envelope naming
//! its topic:
//!
//! ```json
//! {"stream":"btcusdt@trade","data":{"e":"trade","E":1700000000000,...}}
//! ```
//!
//! A single-stream connection delivers the payload itself. Family payloads
//! carry their event type in `e` and the event time (epoch millis) in `E`.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::value::RawValue;

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Payload carried a different event type.
    #[error("unexpected event type {actual:?} (expected {expected:?})")]
    UnexpectedEventType {
        /// Event type the decoder handles.
        expected: &'static str,
        /// Event type found in the payload.
        actual: String,
    },

    /// Payload has no `e` field.
    #[error("payload has no event type")]
    MissingEventType,

    /// Payload is not shaped like any known message.
    #[error("invalid message format: {0}")]
    InvalidFormat(String),

    /// Epoch millis out of range.
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(i64),
}

/// A combined-stream envelope with the payload left undecoded.
#[derive(Debug, Deserialize)]
pub struct Envelope<'a> {
    /// Topic the payload belongs to.
    pub stream: String,
    /// Raw payload.
    #[serde(borrow)]
    pub data: &'a RawValue,
}

impl Envelope<'_> {
    /// Raw payload text.
    #[must_use]
    pub fn payload(&self) -> &str {
        self.data.get()
    }
}

#[derive(Deserialize)]
struct EventTypeProbe {
    #[serde(rename = "e")]
    event_type: Option<String>,
}

/// JSON codec for stream frames.
#[derive(Debug, Default, Clone)]
pub struct JsonCodec;

impl JsonCodec {
    /// Create a new JSON codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Split a combined-stream frame into topic and payload.
    pub fn envelope<'a>(&self, text: &'a str) -> Result<Envelope<'a>, CodecError> {
        let trimmed = text.trim();
        if !trimmed.starts_with('{') {
            return Err(CodecError::InvalidFormat(format!(
                "expected JSON object, got: {}...",
                prefix(trimmed)
            )));
        }
        Ok(serde_json::from_str(trimmed)?)
    }

    /// Read the `e` discriminator of a payload.
    pub fn event_type(&self, payload: &str) -> Result<String, CodecError> {
        let probe: EventTypeProbe = serde_json::from_str(payload)?;
        probe.event_type.ok_or(CodecError::MissingEventType)
    }

    /// Decode a payload after checking its event type.
    pub fn decode_event<T: DeserializeOwned>(
        &self,
        payload: &str,
        expected: &'static str,
    ) -> Result<T, CodecError> {
        let actual = self.event_type(payload)?;
        if actual != expected {
            return Err(CodecError::UnexpectedEventType { expected, actual });
        }
        Ok(serde_json::from_str(payload)?)
    }

    /// Decode a payload that carries no event type.
    pub fn decode<T: DeserializeOwned>(&self, payload: &str) -> Result<T, CodecError> {
        Ok(serde_json::from_str(payload)?)
    }
}

/// Convert exchange epoch millis into a timestamp.
pub fn timestamp(millis: i64) -> Result<DateTime<Utc>, CodecError> {
    DateTime::from_timestamp_millis(millis).ok_or(CodecError::InvalidTimestamp(millis))
}

fn prefix(text: &str) -> &str {
    let end = text
        .char_indices()
        .nth(50)
        .map_or(text.len(), |(index, _)| index);
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize)]
    struct Ping {
        #[serde(rename = "E")]
        event_time: i64,
    }

    #[test]
    fn envelope_keeps_payload_raw() {
        let codec = JsonCodec::new();
        let text = r#"{"stream":"btcusdt@trade","data":{"e":"trade","E":1}}"#;

        let envelope = codec.envelope(text).unwrap();
        assert_eq!(envelope.stream, "btcusdt@trade");
        assert_eq!(envelope.payload(), r#"{"e":"trade","E":1}"#);
    }

    #[test]
    fn envelope_rejects_arrays() {
        let codec = JsonCodec::new();
        assert!(matches!(
            codec.envelope("[1,2,3]"),
            Err(CodecError::InvalidFormat(_))
        ));
    }

    #[test]
    fn envelope_without_stream_is_an_error() {
        let codec = JsonCodec::new();
        assert!(codec.envelope(r#"{"e":"trade","E":1}"#).is_err());
    }

    #[test]
    fn decode_event_checks_type() {
        let codec = JsonCodec::new();
        let ok: Ping = codec.decode_event(r#"{"e":"trade","E":7}"#, "trade").unwrap();
        assert_eq!(ok.event_time, 7);

        let err = codec
            .decode_event::<Ping>(r#"{"e":"aggTrade","E":7}"#, "trade")
            .unwrap_err();
        assert!(matches!(
            err,
            CodecError::UnexpectedEventType {
                expected: "trade",
                ref actual,
            } if actual == "aggTrade"
        ));

        let err = codec.decode_event::<Ping>(r#"{"E":7}"#, "trade").unwrap_err();
        assert!(matches!(err, CodecError::MissingEventType));
    }

    #[test]
    fn malformed_json_is_an_error() {
        let codec = JsonCodec::new();
        assert!(matches!(
            codec.event_type("{not json"),
            Err(CodecError::Json(_))
        ));
    }

    #[test]
    fn timestamp_from_millis() {
        let ts = timestamp(1_700_000_000_123).unwrap();
        assert_eq!(ts.timestamp_millis(), 1_700_000_000_123);
        assert!(matches!(
            timestamp(i64::MAX),
            Err(CodecError::InvalidTimestamp(_))
        ));
    }
}
