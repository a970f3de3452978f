#![allow(dead_code)]

use std::sync::Arc;

use operation_consumer::batch_processor::BatchProcessorConfig;
use operation_consumer::consumer::OperationConsumer;
use operation_consumer::dispatch_queue::DispatchQueueConfig;
use operation_consumer::record::RawRecord;
use operation_consumer::test_utils::{operation_record, RecordingCoordinator, ScriptedHandler};
use operation_consumer::types::{PartitionAssignment, PartitionKey};
use serde_json::Value;

pub const TOPIC: &str = "operations";

pub type TestConsumer = OperationConsumer<Value, ScriptedHandler, RecordingCoordinator>;

pub struct Harness {
    pub consumer: Arc<TestConsumer>,
    pub handler: Arc<ScriptedHandler>,
    pub coordinator: Arc<RecordingCoordinator>,
    pub key: PartitionKey,
}

impl Harness {
    pub fn new(handler: ScriptedHandler, config: BatchProcessorConfig) -> Self {
        let handler = Arc::new(handler);
        let coordinator = Arc::new(RecordingCoordinator::new());
        let consumer = Arc::new(OperationConsumer::new(
            handler.clone(),
            coordinator.clone(),
            config,
        ));
        Self {
            consumer,
            handler,
            coordinator,
            key: PartitionKey::new(TOPIC, 0),
        }
    }

    pub fn with_concurrency(handler: ScriptedHandler, concurrency: usize) -> Self {
        Self::new(
            handler,
            BatchProcessorConfig {
                queue: DispatchQueueConfig::with_concurrency(concurrency),
                handler_timeout: None,
            },
        )
    }

    /// Assign the harness partition, resuming after `committed`.
    pub fn assign(&self, committed: Option<i64>) {
        self.consumer
            .on_assign(PartitionAssignment::new(self.key.clone(), committed));
    }

    pub fn committed(&self) -> Vec<i64> {
        self.coordinator.committed_offsets(&self.key)
    }
}

pub fn kind(offset: i64) -> String {
    format!("op-{offset}")
}

/// Valid operations for every offset in `offsets`, kind `op-<offset>`.
pub fn operations(offsets: impl IntoIterator<Item = i64>) -> Vec<RawRecord> {
    offsets
        .into_iter()
        .map(|offset| operation_record(offset, &kind(offset)))
        .collect()
}

/// Highest `k` such that every offset in `first..=k` is in `done`.
pub fn contiguous_prefix(first: i64, done: &[i64]) -> Option<i64> {
    let mut watermark = None;
    let mut next = first;
    while done.contains(&next) {
        watermark = Some(next);
        next += 1;
    }
    watermark
}
