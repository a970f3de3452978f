//! In-memory collaborators for tests: a coordinator that records commits, a
//! scriptable handler and a rebalance handler that records calls.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::watch;

use crate::coordinator::GroupCoordinator;
use crate::error::CommitError;
use crate::handler::OperationHandler;
use crate::kafka::rebalance_handler::RebalanceHandler;
use crate::operation::Operation;
use crate::record::RawRecord;
use crate::types::{PartitionAssignment, PartitionKey, ProgressRecord};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// A record carrying a valid operation of kind `kind`.
pub fn operation_record(offset: i64, kind: &str) -> RawRecord {
    let body = json!({ "type": kind, "payload": { "offset": offset } });
    RawRecord::at(offset, body.to_string())
}

/// Records every commit request, optionally failing them.
#[derive(Default)]
pub struct RecordingCoordinator {
    commits: Mutex<Vec<ProgressRecord>>,
    failing: AtomicBool,
    attempts: AtomicUsize,
}

impl RecordingCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent commits fail (or succeed again).
    pub fn fail_commits(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn commits(&self) -> Vec<ProgressRecord> {
        lock(&self.commits).clone()
    }

    /// Acknowledged watermarks for `key`, in commit order.
    pub fn committed_offsets(&self, key: &PartitionKey) -> Vec<i64> {
        lock(&self.commits)
            .iter()
            .filter(|c| c.partition_key() == key)
            .map(ProgressRecord::offset)
            .collect()
    }

    pub fn last_committed(&self, key: &PartitionKey) -> Option<i64> {
        self.committed_offsets(key).last().copied()
    }

    /// Commit requests seen, including failed ones.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GroupCoordinator for RecordingCoordinator {
    async fn commit_offset(&self, progress: ProgressRecord) -> Result<(), CommitError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(CommitError::Unavailable("offset store down".to_string()));
        }
        lock(&self.commits).push(progress);
        Ok(())
    }
}

/// Handler for `Operation<Value>` driven by the operation kind: kinds can be
/// made to fail, panic, sleep, or finish in a fixed order.
pub struct ScriptedHandler {
    failing: Mutex<HashSet<String>>,
    panicking: Mutex<HashSet<String>>,
    delays: Mutex<HashMap<String, Duration>>,
    completion_order: Mutex<Vec<String>>,
    turn: watch::Sender<usize>,
    started: Mutex<Vec<String>>,
    completed: Mutex<Vec<String>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl Default for ScriptedHandler {
    fn default() -> Self {
        Self {
            failing: Mutex::default(),
            panicking: Mutex::default(),
            delays: Mutex::default(),
            completion_order: Mutex::default(),
            turn: watch::channel(0).0,
            started: Mutex::default(),
            completed: Mutex::default(),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
        }
    }
}

impl ScriptedHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(self, kind: &str) -> Self {
        lock(&self.failing).insert(kind.to_string());
        self
    }

    pub fn panic_on(self, kind: &str) -> Self {
        lock(&self.panicking).insert(kind.to_string());
        self
    }

    pub fn delay(self, kind: &str, delay: Duration) -> Self {
        lock(&self.delays).insert(kind.to_string(), delay);
        self
    }

    /// Hold each listed kind until every kind before it in `order` has
    /// finished. All listed operations must be able to run at once.
    pub fn complete_in_order(self, order: &[&str]) -> Self {
        *lock(&self.completion_order) = order.iter().map(|k| k.to_string()).collect();
        self
    }

    /// Stop failing `kind`.
    pub fn recover(&self, kind: &str) {
        lock(&self.failing).remove(kind);
    }

    pub fn started(&self) -> Vec<String> {
        lock(&self.started).clone()
    }

    pub fn completed(&self) -> Vec<String> {
        lock(&self.completed).clone()
    }

    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    async fn wait_turn(&self, kind: &str) {
        let position = lock(&self.completion_order).iter().position(|k| k == kind);
        if let Some(position) = position {
            let mut turn = self.turn.subscribe();
            if turn.wait_for(|t| *t >= position).await.is_err() {
                return;
            }
        }
    }
}

#[async_trait]
impl OperationHandler<Value> for ScriptedHandler {
    async fn receive(&self, operation: Operation<Value>) -> anyhow::Result<()> {
        let kind = operation.kind;
        lock(&self.started).push(kind.clone());
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(running, Ordering::SeqCst);

        let delay = lock(&self.delays).get(&kind).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.wait_turn(&kind).await;

        self.running.fetch_sub(1, Ordering::SeqCst);
        lock(&self.completed).push(kind.clone());
        self.turn.send_modify(|t| *t += 1);

        if lock(&self.panicking).contains(&kind) {
            panic!("handler panicked on {kind}");
        }
        if lock(&self.failing).contains(&kind) {
            anyhow::bail!("handler rejected {kind}");
        }
        Ok(())
    }
}

/// Records rebalance calls.
#[derive(Default)]
pub struct TestRebalanceHandler {
    pub assigned: Mutex<Vec<PartitionKey>>,
    pub assignments: Mutex<Vec<PartitionAssignment>>,
    pub revoked: Mutex<Vec<PartitionKey>>,
}

impl RebalanceHandler for TestRebalanceHandler {
    fn on_partitions_assigned(&self, partitions: &[PartitionAssignment]) {
        let mut assigned = lock(&self.assigned);
        let mut assignments = lock(&self.assignments);
        for assignment in partitions {
            assigned.push(assignment.partition_key().clone());
            assignments.push(assignment.clone());
        }
    }

    fn on_partitions_revoked(&self, partitions: &[PartitionKey]) {
        lock(&self.revoked).extend(partitions.iter().cloned());
    }
}
