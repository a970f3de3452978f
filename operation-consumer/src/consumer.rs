use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::info;

use crate::batch_processor::{BatchOutcome, BatchProcessor, BatchProcessorConfig};
use crate::coordinator::GroupCoordinator;
use crate::error::BatchError;
use crate::handler::OperationHandler;
use crate::kafka::batch_consumer::BatchSink;
use crate::kafka::rebalance_handler::RebalanceHandler;
use crate::progress_tracker::ProgressArena;
use crate::record::RawRecord;
use crate::types::{PartitionAssignment, PartitionKey};

/// The surface a group coordinator drives: batches in, assignment changes in,
/// commits out through `C`.
///
/// Owns one progress tracker per assigned partition and the dispatch queue
/// shared by all of them.
pub struct OperationConsumer<T, H, C> {
    arena: ProgressArena,
    processor: BatchProcessor<T, H, C>,
}

impl<T, H, C> OperationConsumer<T, H, C>
where
    T: DeserializeOwned + Send + 'static,
    H: OperationHandler<T> + 'static,
    C: GroupCoordinator + 'static,
{
    /// Must be called within a Tokio runtime.
    pub fn new(handler: Arc<H>, coordinator: Arc<C>, config: BatchProcessorConfig) -> Self {
        Self {
            arena: ProgressArena::new(),
            processor: BatchProcessor::new(handler, coordinator, config),
        }
    }

    /// Process one batch of records belonging to `key`, whatever assignment
    /// of `key` is live.
    pub async fn deliver_batch(
        &self,
        records: Vec<RawRecord>,
        key: &PartitionKey,
    ) -> Result<BatchOutcome, BatchError> {
        self.processor
            .process_batch(&self.arena, key, None, records)
            .await
    }

    /// Process one batch read under assignment `generation` of `key`. Refused
    /// with `NotAssigned` once `key` has been revoked or re-assigned since.
    pub async fn deliver_batch_for(
        &self,
        records: Vec<RawRecord>,
        key: &PartitionKey,
        generation: u64,
    ) -> Result<BatchOutcome, BatchError> {
        self.processor
            .process_batch(&self.arena, key, Some(generation), records)
            .await
    }

    pub fn assignment_generation(&self, key: &PartitionKey) -> Option<u64> {
        self.arena.get(key).map(|tracked| tracked.generation())
    }

    /// Start tracking a partition handed to this consumer.
    pub fn on_assign(&self, assignment: impl Into<PartitionAssignment>) {
        self.arena.assign(assignment.into());
    }

    /// Drop a partition and all of its uncommitted progress. Handlers still
    /// running for it finish but their results are discarded.
    pub fn on_revoke(&self, key: &PartitionKey) {
        self.arena.revoke(key);
    }

    pub fn arena(&self) -> &ProgressArena {
        &self.arena
    }

    pub fn processor(&self) -> &BatchProcessor<T, H, C> {
        &self.processor
    }

    /// Stop intake, let queued handlers finish and release every partition.
    pub async fn shutdown(&self) {
        info!(
            partitions = self.arena.partition_count(),
            running = self.processor.queue().running(),
            pending = self.processor.queue().pending(),
            "Shutting down operation consumer"
        );
        self.processor.queue().shutdown().await;
        self.arena.clear_all();
    }
}

impl<T, H, C> RebalanceHandler for OperationConsumer<T, H, C>
where
    T: DeserializeOwned + Send + 'static,
    H: OperationHandler<T> + 'static,
    C: GroupCoordinator + 'static,
{
    fn on_partitions_assigned(&self, partitions: &[PartitionAssignment]) {
        for assignment in partitions {
            self.on_assign(assignment.clone());
        }
    }

    fn on_partitions_revoked(&self, partitions: &[PartitionKey]) {
        for key in partitions {
            self.on_revoke(key);
        }
    }
}

#[async_trait]
impl<T, H, C> BatchSink for OperationConsumer<T, H, C>
where
    T: DeserializeOwned + Send + 'static,
    H: OperationHandler<T> + 'static,
    C: GroupCoordinator + 'static,
{
    fn assignment_generation(&self, key: &PartitionKey) -> Option<u64> {
        OperationConsumer::assignment_generation(self, key)
    }

    async fn deliver_batch(
        &self,
        records: Vec<RawRecord>,
        key: &PartitionKey,
        generation: u64,
    ) -> Result<BatchOutcome, BatchError> {
        self.deliver_batch_for(records, key, generation).await
    }
}
