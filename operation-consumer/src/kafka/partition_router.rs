//! Partition Router - routes per-partition batches to partition workers
//!
//! Workers are created synchronously when partitions are assigned and removed
//! when they are revoked, wrapping an inner [`RebalanceHandler`] that owns the
//! progress state. Routing only ever sends to existing workers.
//!
//! Each worker is bound to the assignment generation its partition had when
//! the worker was created. A re-assignment with a new generation replaces the
//! worker, and the old one drains its queue into the sink, which refuses it.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use dashmap::DashMap;
use futures::future::join_all;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::kafka::batch_consumer::BatchSink;
use crate::kafka::partition_worker::{
    FatalSender, PartitionBatch, PartitionWorker, PartitionWorkerConfig,
};
use crate::kafka::rebalance_handler::RebalanceHandler;
use crate::record::RawRecord;
use crate::types::{PartitionAssignment, PartitionKey};

pub struct PartitionRouter<S>
where
    S: BatchSink + RebalanceHandler + 'static,
{
    workers: DashMap<PartitionKey, PartitionWorker>,
    sink: Arc<S>,
    fatal_tx: FatalSender,
    config: PartitionWorkerConfig,
    /// Runtime to drain revoked workers on, since rebalance callbacks are sync
    rt_handle: Handle,
}

impl<S> PartitionRouter<S>
where
    S: BatchSink + RebalanceHandler + 'static,
{
    /// Must be called within a Tokio runtime.
    pub fn new(sink: Arc<S>, fatal_tx: FatalSender, config: PartitionWorkerConfig) -> Self {
        Self {
            workers: DashMap::new(),
            sink,
            fatal_tx,
            config,
            rt_handle: Handle::current(),
        }
    }

    /// Start a worker for the sink's live assignment of `key`. Reuses the
    /// worker already routed for that same assignment.
    pub fn add_partition(&self, key: PartitionKey) {
        let Some(generation) = self.sink.assignment_generation(&key) else {
            warn!(
                topic = key.topic(),
                partition = key.partition_number(),
                "Partition not assigned in sink, no worker started"
            );
            return;
        };

        if let Some(existing) = self.workers.get(&key) {
            if existing.generation() == generation {
                debug!(
                    topic = key.topic(),
                    partition = key.partition_number(),
                    generation,
                    "Worker already exists, reusing"
                );
                return;
            }
        }

        let _enter = self.rt_handle.enter();
        let worker = PartitionWorker::new(
            key.clone(),
            generation,
            self.sink.clone(),
            self.fatal_tx.clone(),
            &self.config,
        );
        if let Some(stale) = self.workers.insert(key.clone(), worker) {
            info!(
                topic = key.topic(),
                partition = key.partition_number(),
                stale_generation = stale.generation(),
                generation,
                "Replaced worker of an earlier assignment"
            );
            self.rt_handle.spawn(stale.shutdown());
        }
    }

    pub fn remove_partition(&self, key: &PartitionKey) -> Option<PartitionWorker> {
        let worker = self.workers.remove(key).map(|(_, w)| w);
        if worker.is_some() {
            info!(
                topic = key.topic(),
                partition = key.partition_number(),
                "Removed partition worker"
            );
        }
        worker
    }

    /// Clone the sender so the map guard is released before awaiting capacity.
    fn partition_sender(&self, key: &PartitionKey) -> Result<mpsc::Sender<PartitionBatch>> {
        let worker = self
            .workers
            .get(key)
            .ok_or_else(|| anyhow!("No worker for partition {key} - was it assigned?"))?;
        Ok(worker.sender())
    }

    /// Hand a batch to its partition's worker, waiting while the worker is full.
    pub async fn route_batch(
        &self,
        key: PartitionKey,
        records: Vec<RawRecord>,
        batch_id: u64,
    ) -> Result<()> {
        let sender = self.partition_sender(&key)?;
        sender
            .send(PartitionBatch::new(key.clone(), records, batch_id))
            .await
            .map_err(|_| anyhow!("Failed to send batch to worker for {key}: channel closed"))
    }

    pub async fn route_batches(
        &self,
        batches: HashMap<PartitionKey, Vec<RawRecord>>,
        next_batch_id: &mut u64,
    ) -> Vec<(PartitionKey, anyhow::Error)> {
        let mut failures = Vec::new();
        for (key, records) in batches {
            *next_batch_id += 1;
            if let Err(e) = self.route_batch(key.clone(), records, *next_batch_id).await {
                failures.push((key, e));
            }
        }
        failures
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn has_partition(&self, key: &PartitionKey) -> bool {
        self.workers.contains_key(key)
    }

    /// Remove every worker, returning them for draining.
    pub fn shutdown_all(&self) -> Vec<PartitionWorker> {
        info!(workers = self.workers.len(), "Shutting down partition router");
        let keys: Vec<PartitionKey> = self.workers.iter().map(|r| r.key().clone()).collect();
        keys.iter()
            .filter_map(|key| self.workers.remove(key).map(|(_, w)| w))
            .collect()
    }
}

/// Drain workers concurrently.
pub async fn shutdown_workers(workers: Vec<PartitionWorker>) {
    join_all(workers.into_iter().map(PartitionWorker::shutdown)).await;
}

impl<S> RebalanceHandler for PartitionRouter<S>
where
    S: BatchSink + RebalanceHandler + 'static,
{
    fn on_partitions_assigned(&self, partitions: &[PartitionAssignment]) {
        // trackers first, so the first routed batch finds its partition assigned
        self.sink.on_partitions_assigned(partitions);
        for assignment in partitions {
            self.add_partition(assignment.partition_key().clone());
        }
    }

    fn on_partitions_revoked(&self, partitions: &[PartitionKey]) {
        self.sink.on_partitions_revoked(partitions);

        let workers: Vec<PartitionWorker> = partitions
            .iter()
            .filter_map(|key| self.remove_partition(key))
            .collect();
        if !workers.is_empty() {
            self.rt_handle.spawn(shutdown_workers(workers));
        }
    }
}
