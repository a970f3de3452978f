//! Partition Worker - one task per owned partition
//!
//! Each partition gets its own worker with a bounded channel, so:
//! 1. batches of one partition are delivered one at a time, in order
//! 2. partitions progress in parallel
//! 3. a slow partition applies backpressure to the stream loop
//!
//! A worker serves one assignment generation of its partition. Batches still
//! queued when that assignment ends are refused by the sink.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::BatchError;
use crate::kafka::batch_consumer::BatchSink;
use crate::record::RawRecord;
use crate::types::PartitionKey;

/// Errors that must stop the stream loop, reported by workers.
pub type FatalSender = mpsc::UnboundedSender<BatchError>;
pub type FatalReceiver = mpsc::UnboundedReceiver<BatchError>;

/// Records of a single partition collected in one poll cycle.
pub struct PartitionBatch {
    pub key: PartitionKey,
    pub records: Vec<RawRecord>,
    /// Sequential batch id, for log correlation
    pub batch_id: u64,
}

impl PartitionBatch {
    pub fn new(key: PartitionKey, records: Vec<RawRecord>, batch_id: u64) -> Self {
        Self {
            key,
            records,
            batch_id,
        }
    }

    pub fn first_offset(&self) -> Option<i64> {
        self.records.iter().filter_map(|r| r.position).min()
    }

    pub fn last_offset(&self) -> Option<i64> {
        self.records.iter().filter_map(|r| r.position).max()
    }
}

#[derive(Debug, Clone)]
pub struct PartitionWorkerConfig {
    /// Batches buffered per partition before the stream loop waits
    pub channel_buffer_size: usize,
}

impl Default for PartitionWorkerConfig {
    fn default() -> Self {
        Self {
            channel_buffer_size: 10,
        }
    }
}

pub struct PartitionWorker {
    key: PartitionKey,
    generation: u64,
    sender: mpsc::Sender<PartitionBatch>,
    handle: Option<JoinHandle<()>>,
}

impl PartitionWorker {
    pub fn new<S>(
        key: PartitionKey,
        generation: u64,
        sink: Arc<S>,
        fatal_tx: FatalSender,
        config: &PartitionWorkerConfig,
    ) -> Self
    where
        S: BatchSink + 'static,
    {
        let (sender, receiver) = mpsc::channel(config.channel_buffer_size.max(1));
        let handle = tokio::spawn(Self::run_worker(
            key.clone(),
            generation,
            receiver,
            sink,
            fatal_tx,
        ));

        Self {
            key,
            generation,
            sender,
            handle: Some(handle),
        }
    }

    /// A sender usable after releasing whatever guard holds this worker.
    pub fn sender(&self) -> mpsc::Sender<PartitionBatch> {
        self.sender.clone()
    }

    pub fn capacity(&self) -> usize {
        self.sender.capacity()
    }

    pub fn key(&self) -> &PartitionKey {
        &self.key
    }

    /// Assignment generation every batch of this worker is delivered under.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Stop accepting batches and wait for the queued ones to be delivered.
    pub async fn shutdown(mut self) {
        drop(self.sender);

        if let Some(handle) = self.handle.take() {
            match handle.await {
                Ok(()) => debug!(
                    topic = self.key.topic(),
                    partition = self.key.partition_number(),
                    "Partition worker shut down gracefully"
                ),
                Err(e) => warn!(
                    topic = self.key.topic(),
                    partition = self.key.partition_number(),
                    "Partition worker panicked during shutdown: {e}"
                ),
            }
        }
    }

    async fn run_worker<S>(
        key: PartitionKey,
        generation: u64,
        mut receiver: mpsc::Receiver<PartitionBatch>,
        sink: Arc<S>,
        fatal_tx: FatalSender,
    ) where
        S: BatchSink + 'static,
    {
        info!(
            topic = key.topic(),
            partition = key.partition_number(),
            generation,
            "Starting partition worker"
        );

        while let Some(batch) = receiver.recv().await {
            let batch_id = batch.batch_id;
            let first_offset = batch.first_offset();
            let last_offset = batch.last_offset();

            match sink
                .deliver_batch(batch.records, &batch.key, generation)
                .await
            {
                Ok(outcome) => {
                    debug!(
                        topic = key.topic(),
                        partition = key.partition_number(),
                        batch_id,
                        received = outcome.received,
                        succeeded = outcome.succeeded,
                        failed = outcome.failed.len(),
                        committed = ?outcome.committed,
                        discarded = outcome.discarded,
                        "Batch delivered"
                    );
                }
                Err(BatchError::NotAssigned(_)) => {
                    debug!(
                        topic = key.topic(),
                        partition = key.partition_number(),
                        batch_id,
                        generation,
                        "Dropped batch for partition no longer assigned"
                    );
                }
                Err(e @ BatchError::Validation(_)) => {
                    // the partition stays stalled on this batch, later batches still run
                    error!(
                        topic = key.topic(),
                        partition = key.partition_number(),
                        batch_id,
                        first_offset = ?first_offset,
                        last_offset = ?last_offset,
                        "Batch rejected, offsets not advanced: {e:#}"
                    );
                }
                Err(e @ BatchError::Decode(_)) => {
                    error!(
                        topic = key.topic(),
                        partition = key.partition_number(),
                        batch_id,
                        first_offset = ?first_offset,
                        last_offset = ?last_offset,
                        "Fatal decode failure: {e:#}"
                    );
                    if fatal_tx.send(e).is_err() {
                        warn!("Stream loop already stopped, fatal error not reported");
                    }
                }
            }
        }

        info!(
            topic = key.topic(),
            partition = key.partition_number(),
            "Partition worker shutting down"
        );
    }
}
