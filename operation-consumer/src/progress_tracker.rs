//! Partition Progress Tracker - highest offset safe to commit per partition
//!
//! Handlers finish out of order, so an offset can only count once every
//! offset below it has been confirmed. Each owned partition keeps a set of
//! confirmed-but-not-yet-contiguous offsets and a watermark; the watermark
//! only moves through `watermark + 1`, which turns arbitrary completion order
//! into a strictly increasing commit sequence. A failed offset is never
//! confirmed, so the watermark stalls right below it.
//!
//! Offsets that the broker will never deliver (gaps between the records of a
//! batch, e.g. transaction markers or compacted records) are registered as
//! skipped ranges and are stepped over by the same `watermark + 1` walk.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::metrics_consts::PARTITION_PENDING_CONFIRMATIONS;
use crate::types::{PartitionAssignment, PartitionKey};

/// Progress state for one partition. Not synchronized; see [`TrackedPartition`].
#[derive(Debug, Default, Clone)]
pub struct PartitionProgressTracker {
    /// Highest offset with every offset at or below it resolved. `None` until
    /// the starting position is known.
    watermark: Option<i64>,
    /// Confirmed offsets above the watermark, waiting for the gap below them to close.
    confirmed: BTreeSet<i64>,
    /// Offsets whose handler failed. These block the watermark.
    failed: BTreeSet<i64>,
    /// Inclusive ranges of offsets that will never be delivered, keyed by start.
    skipped: BTreeMap<i64, i64>,
    /// Highest offset handed to us so far.
    highest_seen: Option<i64>,
    /// Last watermark the coordinator acknowledged.
    last_committed: Option<i64>,
}

impl PartitionProgressTracker {
    /// `committed` is the last committed watermark, when the coordinator knows it.
    pub fn new(committed: Option<i64>) -> Self {
        Self {
            watermark: committed,
            highest_seen: committed,
            last_committed: committed,
            ..Self::default()
        }
    }

    pub fn watermark(&self) -> Option<i64> {
        self.watermark
    }

    pub fn last_committed(&self) -> Option<i64> {
        self.last_committed
    }

    /// Number of confirmed offsets held back behind an unresolved one.
    pub fn pending_count(&self) -> usize {
        self.confirmed.len()
    }

    pub fn failed_offsets(&self) -> Vec<i64> {
        self.failed.iter().copied().collect()
    }

    /// The offset the watermark is stuck on because its handler failed.
    pub fn stalled_at(&self) -> Option<i64> {
        let next = self.watermark? + 1;
        self.failed.contains(&next).then_some(next)
    }

    /// Register the offsets of a freshly delivered batch.
    ///
    /// Seeds the watermark from the lowest offset when no starting position
    /// was known, and records offsets missing between delivered records as
    /// skipped. Offsets at or below the watermark are replays and are ignored.
    pub fn register(&mut self, offsets: &[i64]) {
        let mut sorted: Vec<i64> = offsets
            .iter()
            .copied()
            .filter(|o| self.watermark.map_or(true, |w| *o > w))
            .collect();
        sorted.sort_unstable();
        sorted.dedup();

        let Some(&lowest) = sorted.first() else {
            return;
        };

        if self.watermark.is_none() {
            debug!(offset = lowest, "Seeding watermark from first delivered offset");
            self.watermark = Some(lowest - 1);
            self.highest_seen = Some(lowest - 1);
            // the resume position is already durable, nothing to commit for it
            self.last_committed = Some(lowest - 1);
        }

        for offset in sorted {
            if let Some(high) = self.highest_seen {
                if offset > high + 1 {
                    self.skipped.insert(high + 1, offset - 1);
                }
                if offset > high {
                    self.highest_seen = Some(offset);
                }
            }
        }

        self.advance();
    }

    /// Confirm `offset` as processed. Returns the new watermark if it moved.
    pub fn confirm(&mut self, offset: i64) -> Option<i64> {
        if self.watermark.is_some_and(|w| offset <= w) {
            debug!(offset, watermark = ?self.watermark, "Ignoring confirmation at or below watermark");
            return None;
        }

        self.failed.remove(&offset);
        self.confirmed.insert(offset);

        let before = self.watermark;
        self.advance();
        (self.watermark != before).then_some(self.watermark).flatten()
    }

    /// Record that the handler for `offset` failed. The watermark will not
    /// pass it unless the offset is later confirmed.
    pub fn fail(&mut self, offset: i64) {
        if self.watermark.is_some_and(|w| offset <= w) {
            return;
        }
        self.confirmed.remove(&offset);
        self.failed.insert(offset);
    }

    /// Watermark not yet acknowledged by the coordinator, if any.
    pub fn committable(&self) -> Option<i64> {
        match (self.watermark, self.last_committed) {
            (Some(w), Some(c)) if w > c => Some(w),
            (Some(w), None) if w >= 0 => Some(w),
            _ => None,
        }
    }

    /// Record a coordinator acknowledgement. Never moves backwards.
    pub fn mark_committed(&mut self, offset: i64) {
        if self.last_committed.map_or(true, |c| offset > c) {
            self.last_committed = Some(offset);
        }
    }

    fn advance(&mut self) {
        let Some(mut watermark) = self.watermark else {
            return;
        };

        loop {
            let next = watermark + 1;
            if self.confirmed.remove(&next) {
                watermark = next;
            } else if let Some(end) = self.skipped.remove(&next) {
                watermark = end;
            } else {
                break;
            }
        }

        self.watermark = Some(watermark);
    }
}

/// A tracker owned by one assignment of one partition.
///
/// The generation distinguishes a re-assignment of the same partition from the
/// assignment that was revoked, so late results of the old one are dropped.
#[derive(Debug)]
pub struct TrackedPartition {
    key: PartitionKey,
    generation: u64,
    state: Mutex<PartitionProgressTracker>,
    revoked: AtomicBool,
    commit_lock: tokio::sync::Mutex<()>,
}

impl TrackedPartition {
    fn new(key: PartitionKey, generation: u64, committed: Option<i64>) -> Self {
        Self {
            key,
            generation,
            state: Mutex::new(PartitionProgressTracker::new(committed)),
            revoked: AtomicBool::new(false),
            commit_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn key(&self) -> &PartitionKey {
        &self.key
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::SeqCst)
    }

    /// Lock the tracker state. A poisoned lock is recovered since every
    /// mutation leaves the tracker consistent.
    pub fn lock(&self) -> MutexGuard<'_, PartitionProgressTracker> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn watermark(&self) -> Option<i64> {
        self.lock().watermark()
    }

    pub fn last_committed(&self) -> Option<i64> {
        self.lock().last_committed()
    }

    pub fn stalled_at(&self) -> Option<i64> {
        self.lock().stalled_at()
    }

    /// Serializes commit requests for this partition.
    pub async fn commit_guard(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.commit_lock.lock().await
    }

    pub(crate) fn publish_metrics(&self) {
        let pending = self.lock().pending_count();
        metrics::gauge!(
            PARTITION_PENDING_CONFIRMATIONS,
            "topic" => self.key.topic().to_string(),
            "partition" => self.key.partition_number().to_string()
        )
        .set(pending as f64);
    }

    fn mark_revoked(&self) {
        self.revoked.store(true, Ordering::SeqCst);
    }
}

/// The set of trackers for the partitions currently owned, keyed by partition.
pub struct ProgressArena {
    partitions: DashMap<PartitionKey, Arc<TrackedPartition>>,
    next_generation: AtomicU64,
}

impl Default for ProgressArena {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressArena {
    pub fn new() -> Self {
        Self {
            partitions: DashMap::new(),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Create a tracker for a newly assigned partition. Assigning a partition
    /// that is already owned keeps the existing tracker.
    pub fn assign(&self, assignment: PartitionAssignment) -> Arc<TrackedPartition> {
        let key = assignment.partition_key().clone();
        self.partitions
            .entry(key.clone())
            .or_insert_with(|| {
                let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
                info!(
                    topic = key.topic(),
                    partition = key.partition_number(),
                    generation,
                    committed = ?assignment.committed(),
                    "Created progress tracker for assigned partition"
                );
                Arc::new(TrackedPartition::new(
                    key.clone(),
                    generation,
                    assignment.committed(),
                ))
            })
            .value()
            .clone()
    }

    /// Discard the tracker of a revoked partition along with all pending progress.
    pub fn revoke(&self, key: &PartitionKey) -> Option<Arc<TrackedPartition>> {
        let (_, tracked) = self.partitions.remove(key)?;
        tracked.mark_revoked();

        let state = tracked.lock();
        if state.pending_count() > 0 || !state.failed.is_empty() {
            warn!(
                topic = key.topic(),
                partition = key.partition_number(),
                watermark = ?state.watermark(),
                pending = state.pending_count(),
                failed = state.failed.len(),
                "Discarding uncommitted progress for revoked partition"
            );
        } else {
            debug!(
                topic = key.topic(),
                partition = key.partition_number(),
                "Discarded progress tracker for revoked partition"
            );
        }
        drop(state);

        Some(tracked)
    }

    pub fn get(&self, key: &PartitionKey) -> Option<Arc<TrackedPartition>> {
        self.partitions.get(key).map(|entry| entry.value().clone())
    }

    /// Whether `tracked` is still the live tracker for its partition.
    pub fn is_current(&self, tracked: &TrackedPartition) -> bool {
        !tracked.is_revoked()
            && self
                .partitions
                .get(tracked.key())
                .is_some_and(|entry| entry.generation() == tracked.generation())
    }

    pub fn assigned(&self) -> Vec<PartitionKey> {
        let mut keys: Vec<PartitionKey> =
            self.partitions.iter().map(|entry| entry.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Revoke everything (during shutdown).
    pub fn clear_all(&self) {
        for key in self.assigned() {
            self.revoke(&key);
        }
    }
}
