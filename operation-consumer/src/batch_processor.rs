//! Batch Processor - per-batch orchestration
//!
//! One delivered batch moves through
//! `Decoding -> Validating -> Dispatching -> AwaitingCompletion -> Committing -> Done`,
//! or ends in `Failed` on a decode or validation error. A rejected batch
//! dispatches nothing and its offsets are held back in the tracker, so nothing
//! at or after its first offset can be committed. Handler failures only stall
//! their own offset; sibling operations still run and still count.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, warn};

use crate::coordinator::GroupCoordinator;
use crate::dispatch_queue::{BoundedDispatchQueue, DispatchQueueConfig};
use crate::error::{BatchError, HandlerError};
use crate::handler::OperationHandler;
use crate::metrics_consts::{
    BATCHES_REJECTED, BATCH_PROCESSING_DURATION, BATCH_SIZE, HANDLER_DURATION, HANDLER_OUTCOMES,
    OFFSET_COMMITS, PARTITION_COMMITTED_WATERMARK, PARTITION_STALLED, RECORDS_RECEIVED,
    RECORDS_SOFT_DECODE_FAILED, RESULTS_DISCARDED_REVOKED,
};
use crate::operation::{MessageValidator, Operation};
use crate::progress_tracker::{ProgressArena, TrackedPartition};
use crate::record::{RawRecord, RecordDecoder};
use crate::types::{PartitionKey, ProgressRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Decoding,
    Validating,
    Dispatching,
    AwaitingCompletion,
    Committing,
    Done,
    Failed,
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BatchState::Decoding => "decoding",
            BatchState::Validating => "validating",
            BatchState::Dispatching => "dispatching",
            BatchState::AwaitingCompletion => "awaiting_completion",
            BatchState::Committing => "committing",
            BatchState::Done => "done",
            BatchState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What happened to one batch that was not rejected.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub received: usize,
    /// Records dropped because their payload was not structured data.
    pub soft_failures: usize,
    pub dispatched: usize,
    pub succeeded: usize,
    /// Offsets whose handler failed.
    pub failed: Vec<i64>,
    /// Watermark committed at the end of this batch, if it moved.
    pub committed: Option<i64>,
    /// Offset the partition is stuck on after this batch, if any.
    pub stalled_at: Option<i64>,
    /// The partition was revoked while the batch ran; its results were dropped.
    pub discarded: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BatchProcessorConfig {
    pub queue: DispatchQueueConfig,
    /// Fail a handler invocation that runs longer than this. `None` waits forever.
    pub handler_timeout: Option<Duration>,
}

pub struct BatchProcessor<T, H, C> {
    decoder: RecordDecoder,
    validator: MessageValidator<T>,
    queue: Arc<BoundedDispatchQueue>,
    handler: Arc<H>,
    coordinator: Arc<C>,
    handler_timeout: Option<Duration>,
}

impl<T, H, C> BatchProcessor<T, H, C>
where
    T: DeserializeOwned + Send + 'static,
    H: OperationHandler<T> + 'static,
    C: GroupCoordinator + 'static,
{
    /// Must be called within a Tokio runtime (starts the dispatch queue).
    pub fn new(handler: Arc<H>, coordinator: Arc<C>, config: BatchProcessorConfig) -> Self {
        Self {
            decoder: RecordDecoder::new(),
            validator: MessageValidator::new(),
            queue: Arc::new(BoundedDispatchQueue::new(config.queue)),
            handler,
            coordinator,
            handler_timeout: config.handler_timeout,
        }
    }

    pub fn queue(&self) -> &Arc<BoundedDispatchQueue> {
        &self.queue
    }

    pub fn coordinator(&self) -> &Arc<C> {
        &self.coordinator
    }

    /// Run one batch for `key` through decode, validation, dispatch and commit.
    ///
    /// With `generation` set, the batch is refused unless it belongs to the
    /// live assignment of `key`, so records read under an earlier assignment
    /// never touch the tracker of a later one.
    pub async fn process_batch(
        &self,
        arena: &ProgressArena,
        key: &PartitionKey,
        generation: Option<u64>,
        records: Vec<RawRecord>,
    ) -> Result<BatchOutcome, BatchError> {
        let started = Instant::now();
        let topic = key.topic().to_string();

        let tracked = arena
            .get(key)
            .filter(|t| generation.map_or(true, |g| t.generation() == g));
        let Some(tracked) = tracked else {
            warn!(
                topic = key.topic(),
                partition = key.partition_number(),
                records = records.len(),
                expected_generation = ?generation,
                current_generation = ?arena.get(key).map(|t| t.generation()),
                "Batch delivered for a partition that is not assigned, dropping"
            );
            metrics::counter!(BATCHES_REJECTED, "reason" => "not_assigned").increment(1);
            return Err(BatchError::NotAssigned(key.clone()));
        };

        let mut outcome = BatchOutcome {
            received: records.len(),
            ..BatchOutcome::default()
        };
        metrics::counter!(RECORDS_RECEIVED, "topic" => topic.clone())
            .increment(records.len() as u64);
        metrics::histogram!(BATCH_SIZE).record(records.len() as f64);

        let positions: Vec<i64> = records.iter().filter_map(|r| r.position).collect();
        let mut state = BatchState::Decoding;

        let mut decoded = Vec::with_capacity(records.len());
        for record in &records {
            match self.decoder.decode(record) {
                Ok(message) => decoded.push(message),
                Err(e) => {
                    transition(&mut state, BatchState::Failed, key);
                    return Err(self.reject(&tracked, &positions, "decode", e.into()));
                }
            }
        }

        transition(&mut state, BatchState::Validating, key);
        let mut soft_failed = Vec::new();
        let mut operations: Vec<(Option<i64>, Operation<T>)> = Vec::with_capacity(decoded.len());
        for message in decoded {
            let Some(value) = message.value else {
                soft_failed.push(message.position);
                continue;
            };
            match self.validator.validate(value, message.position) {
                Ok(operation) => operations.push((message.position, operation)),
                Err(e) => {
                    transition(&mut state, BatchState::Failed, key);
                    return Err(self.reject(&tracked, &positions, "validation", e.into()));
                }
            }
        }

        outcome.soft_failures = soft_failed.len();
        if !soft_failed.is_empty() {
            metrics::counter!(RECORDS_SOFT_DECODE_FAILED, "topic" => topic.clone())
                .increment(soft_failed.len() as u64);
        }

        transition(&mut state, BatchState::Dispatching, key);
        {
            let mut progress = tracked.lock();
            progress.register(&positions);
            // nothing to act on, so these count as processed
            for offset in soft_failed.iter().flatten() {
                progress.confirm(*offset);
            }
        }

        let handles: Vec<_> = operations
            .into_iter()
            .map(|(position, operation)| {
                let handler = self.handler.clone();
                let timeout = self.handler_timeout;
                let handle = self
                    .queue
                    .submit(async move { invoke(handler, operation, timeout).await });
                (position, handle)
            })
            .collect();
        outcome.dispatched = handles.len();

        transition(&mut state, BatchState::AwaitingCompletion, key);
        let (positions, handles): (Vec<Option<i64>>, Vec<_>) = handles.into_iter().unzip();
        let results = join_all(handles).await;

        transition(&mut state, BatchState::Committing, key);
        if !arena.is_current(&tracked) {
            info!(
                topic = key.topic(),
                partition = key.partition_number(),
                settled = results.len(),
                "Partition revoked during batch, discarding results"
            );
            metrics::counter!(RESULTS_DISCARDED_REVOKED).increment(results.len() as u64);
            outcome.discarded = true;
            transition(&mut state, BatchState::Done, key);
            return Ok(outcome);
        }

        {
            let mut progress = tracked.lock();
            for (position, result) in positions.into_iter().zip(results) {
                let result = result.map_err(HandlerError::from).and_then(|r| r);
                match (position, result) {
                    (Some(offset), Ok(())) => {
                        outcome.succeeded += 1;
                        progress.confirm(offset);
                    }
                    (None, Ok(())) => {
                        outcome.succeeded += 1;
                    }
                    (position, Err(e)) => {
                        error!(
                            topic = key.topic(),
                            partition = key.partition_number(),
                            offset = ?position,
                            error = ?e,
                            "Handler failed, offset will not be committed"
                        );
                        if let Some(offset) = position {
                            progress.fail(offset);
                            outcome.failed.push(offset);
                        }
                    }
                }
            }
            outcome.stalled_at = progress.stalled_at();
        }
        tracked.publish_metrics();

        if let Some(stalled) = outcome.stalled_at {
            warn!(
                topic = key.topic(),
                partition = key.partition_number(),
                offset = stalled,
                "Partition watermark stalled on failed offset"
            );
            metrics::counter!(
                PARTITION_STALLED,
                "topic" => topic.clone(),
                "partition" => key.partition_number().to_string()
            )
            .increment(1);
        }

        outcome.committed = self.commit_progress(arena, &tracked).await;

        transition(&mut state, BatchState::Done, key);
        metrics::histogram!(BATCH_PROCESSING_DURATION).record(started.elapsed().as_secs_f64());

        Ok(outcome)
    }

    /// Persist the partition's watermark if it moved past the last commit.
    ///
    /// Commits for one partition are serialized and re-check ownership under
    /// the lock, so the committed sequence is strictly increasing and nothing
    /// is committed for a revoked assignment.
    pub async fn commit_progress(
        &self,
        arena: &ProgressArena,
        tracked: &TrackedPartition,
    ) -> Option<i64> {
        let key = tracked.key();
        let _commit_guard = tracked.commit_guard().await;

        if !arena.is_current(tracked) {
            debug!(
                topic = key.topic(),
                partition = key.partition_number(),
                "Skipping commit for revoked partition"
            );
            metrics::counter!(OFFSET_COMMITS, "status" => "skipped_revoked").increment(1);
            return None;
        }

        let target = tracked.lock().committable()?;
        let progress = ProgressRecord::new(key.clone(), target);

        match self.coordinator.commit_offset(progress).await {
            Ok(()) => {
                tracked.lock().mark_committed(target);
                debug!(
                    topic = key.topic(),
                    partition = key.partition_number(),
                    watermark = target,
                    "Committed watermark"
                );
                metrics::counter!(OFFSET_COMMITS, "status" => "success").increment(1);
                metrics::gauge!(
                    PARTITION_COMMITTED_WATERMARK,
                    "topic" => key.topic().to_string(),
                    "partition" => key.partition_number().to_string()
                )
                .set(target as f64);
                Some(target)
            }
            Err(e) => {
                warn!(
                    topic = key.topic(),
                    partition = key.partition_number(),
                    watermark = target,
                    "Failed to commit watermark, will retry with the next batch: {e:#}"
                );
                metrics::counter!(OFFSET_COMMITS, "status" => "failure").increment(1);
                None
            }
        }
    }

    fn reject(
        &self,
        tracked: &TrackedPartition,
        positions: &[i64],
        reason: &'static str,
        error: BatchError,
    ) -> BatchError {
        {
            let mut progress = tracked.lock();
            progress.register(positions);
            for offset in positions {
                progress.fail(*offset);
            }
        }

        let key = tracked.key();
        error!(
            topic = key.topic(),
            partition = key.partition_number(),
            first_offset = ?positions.iter().min(),
            last_offset = ?positions.iter().max(),
            reason,
            "Rejecting batch: {error:#}"
        );
        metrics::counter!(BATCHES_REJECTED, "reason" => reason).increment(1);

        error
    }
}

fn transition(state: &mut BatchState, next: BatchState, key: &PartitionKey) {
    debug!(
        topic = key.topic(),
        partition = key.partition_number(),
        from = %state,
        to = %next,
        "Batch state transition"
    );
    *state = next;
}

async fn invoke<T, H>(
    handler: Arc<H>,
    operation: Operation<T>,
    timeout: Option<Duration>,
) -> Result<(), HandlerError>
where
    H: OperationHandler<T>,
{
    let started = Instant::now();

    let result = match timeout {
        Some(limit) => match tokio::time::timeout(limit, handler.receive(operation)).await {
            Ok(result) => result.map_err(HandlerError::from),
            Err(_) => Err(HandlerError::TimedOut(limit)),
        },
        None => handler.receive(operation).await.map_err(HandlerError::from),
    };

    let status = match &result {
        Ok(()) => "success",
        Err(HandlerError::Failed(_)) => "failed",
        Err(HandlerError::TimedOut(_)) => "timed_out",
        Err(HandlerError::Panicked) => "panicked",
        Err(HandlerError::Rejected(_)) => "rejected",
    };
    metrics::counter!(HANDLER_OUTCOMES, "status" => status).increment(1);
    metrics::histogram!(HANDLER_DURATION).record(started.elapsed().as_secs_f64());

    result
}
