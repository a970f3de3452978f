use std::time::Duration;

use thiserror::Error;

use crate::types::PartitionKey;

/// Corruption below the structured-parse layer. Aborts the whole batch.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("payload at offset {offset:?} is not valid UTF-8")]
    InvalidEncoding {
        offset: Option<i64>,
        #[source]
        source: std::str::Utf8Error,
    },
    #[error("I/O failure decoding payload at offset {offset:?}")]
    Io {
        offset: Option<i64>,
        #[source]
        source: serde_json::Error,
    },
}

/// A payload that parsed but is not a recognized operation.
#[derive(Error, Debug)]
#[error("Non-operation encountered at offset {offset:?}: {value} ({reason})")]
pub struct ValidationError {
    pub value: String,
    pub offset: Option<i64>,
    pub reason: String,
}

/// Errors surfaced by the dispatch queue itself, never by the task it runs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("dispatch queue is full ({depth} tasks waiting)")]
    QueueFull { depth: usize },
    #[error("dispatch queue is closed")]
    Closed,
    #[error("task was dropped before it completed")]
    Cancelled,
    #[error("task panicked")]
    Panicked,
}

/// Failure of the application handler for one offset.
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("handler failed: {0:#}")]
    Failed(#[from] anyhow::Error),
    #[error("handler did not complete within {0:?}")]
    TimedOut(Duration),
    #[error("handler panicked")]
    Panicked,
    #[error("handler was never started: {0}")]
    Rejected(DispatchError),
}

impl From<DispatchError> for HandlerError {
    fn from(e: DispatchError) -> Self {
        match e {
            DispatchError::Panicked => HandlerError::Panicked,
            other => HandlerError::Rejected(other),
        }
    }
}

/// The coordinator could not persist a watermark.
#[derive(Error, Debug)]
pub enum CommitError {
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
    #[error("offset store unavailable: {0}")]
    Unavailable(String),
}

/// Reasons a whole batch is rejected before any of its offsets can count.
#[derive(Error, Debug)]
pub enum BatchError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("partition {0} is not assigned to this consumer")]
    NotAssigned(PartitionKey),
}
