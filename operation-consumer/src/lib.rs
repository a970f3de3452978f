//! Operation consumer: a Kafka consumer-group pipeline that decodes records
//! into typed operations, runs an application handler for each under a
//! concurrency ceiling, and commits a partition's offset only once every
//! offset below it has been handled.
//!
//! ## Error logging (anyhow)
//!
//! When logging `anyhow::Error` or other error types with a cause chain, use
//! formats that include the full chain:
//!
//! - **Inline format:** `{e:#}`, the full chain on one line.
//! - **Structured field:** `error = ?e`, the full chain with `Caused by:` sections.
//!
//! Avoid `{}` / `%e` for errors, they only show the top-level message.

pub mod batch_processor;
pub mod config;
pub mod consumer;
pub mod coordinator;
pub mod dispatch_queue;
pub mod error;
pub mod handler;
pub mod kafka;
pub mod metrics_consts;
pub mod metrics_server;
pub mod operation;
pub mod progress_tracker;
pub mod record;
pub mod service;
pub mod test_utils;
pub mod types;

pub use batch_processor::{BatchOutcome, BatchProcessor, BatchProcessorConfig, BatchState};
pub use consumer::OperationConsumer;
pub use coordinator::GroupCoordinator;
pub use dispatch_queue::{BoundedDispatchQueue, DispatchQueueConfig};
pub use error::{BatchError, CommitError, DecodeError, DispatchError, HandlerError, ValidationError};
pub use handler::{handler_fn, OperationHandler};
pub use operation::{is_operation, MessageValidator, Operation};
pub use progress_tracker::{PartitionProgressTracker, ProgressArena};
pub use record::{DecodedMessage, Payload, RawRecord, RecordDecoder};
pub use service::{create_receive, OperationConsumerService, RunningService};
pub use types::{PartitionAssignment, PartitionKey, ProgressRecord};
