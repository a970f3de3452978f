//! Raw broker records and their decoding into structured values.
//!
//! Decoding has two failure modes with different policies: a payload that is
//! not structured data at all is a *soft* failure (the record is dropped and
//! its offset still counts as processed), while corruption below the parse
//! layer is a fatal [`DecodeError`] that aborts the batch.

use serde_json::error::Category;
use serde_json::Value;
use tracing::warn;

use crate::error::DecodeError;

/// Record payload as handed over by the broker layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Bytes(Vec<u8>),
    Text(String),
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Bytes(bytes)
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Payload::Bytes(bytes.to_vec())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_owned())
    }
}

/// One record of a delivered batch. `payload` is `None` for tombstones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub payload: Option<Payload>,
    pub position: Option<i64>,
}

impl RawRecord {
    pub fn new(payload: impl Into<Payload>, position: Option<i64>) -> Self {
        Self {
            payload: Some(payload.into()),
            position,
        }
    }

    pub fn at(position: i64, payload: impl Into<Payload>) -> Self {
        Self::new(payload, Some(position))
    }

    pub fn tombstone(position: Option<i64>) -> Self {
        Self {
            payload: None,
            position,
        }
    }
}

/// Result of decoding one record. `value` is `None` when the payload was not
/// structured data.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedMessage {
    pub value: Option<Value>,
    pub position: Option<i64>,
}

impl DecodedMessage {
    pub fn is_soft_failure(&self) -> bool {
        self.value.is_none()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RecordDecoder;

impl RecordDecoder {
    pub fn new() -> Self {
        Self
    }

    pub fn decode(&self, record: &RawRecord) -> Result<DecodedMessage, DecodeError> {
        let position = record.position;

        let text = match &record.payload {
            None => {
                warn!(offset = ?position, "Record has no payload, dropping");
                return Ok(DecodedMessage {
                    value: None,
                    position,
                });
            }
            Some(Payload::Text(text)) => text.as_str(),
            Some(Payload::Bytes(bytes)) => std::str::from_utf8(bytes).map_err(|source| {
                DecodeError::InvalidEncoding {
                    offset: position,
                    source,
                }
            })?,
        };

        match serde_json::from_str::<Value>(text) {
            Ok(value) => Ok(DecodedMessage {
                value: Some(value),
                position,
            }),
            Err(e) if e.classify() == Category::Io => Err(DecodeError::Io {
                offset: position,
                source: e,
            }),
            Err(e) => {
                warn!(offset = ?position, error = %e, "Record payload is not valid JSON, dropping");
                Ok(DecodedMessage {
                    value: None,
                    position,
                })
            }
        }
    }
}
