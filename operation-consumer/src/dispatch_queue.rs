//! Bounded Dispatch Queue - fixed-concurrency runner for handler invocations
//!
//! Submitted tasks are queued immediately and start in strict submission order
//! as soon as fewer than `concurrency` tasks are executing. Completion order is
//! whatever the tasks make it; callers that care about ordering (offset
//! commits) must not rely on it.
//!
//! Submission never waits. Queue depth is unbounded unless a `max_depth` is
//! configured, in which case submissions beyond it are rejected with
//! [`DispatchError::QueueFull`].

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::DispatchError;
use crate::metrics_consts::{DISPATCH_PENDING, DISPATCH_RUNNING};

pub const DEFAULT_CONCURRENCY: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchQueueConfig {
    /// Max tasks executing at once. Values below 1 are treated as 1.
    pub concurrency: usize,
    /// Max tasks waiting for a slot; `None` means unbounded.
    pub max_depth: Option<usize>,
}

impl Default for DispatchQueueConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            max_depth: None,
        }
    }
}

impl DispatchQueueConfig {
    pub fn with_concurrency(concurrency: usize) -> Self {
        Self {
            concurrency,
            ..Self::default()
        }
    }

    pub fn max_depth(mut self, max_depth: Option<usize>) -> Self {
        self.max_depth = max_depth;
        self
    }
}

/// A task is counted as pending from submission until the dispatcher has
/// counted it as running, so at least one counter is non-zero for as long as
/// any submitted task has not finished.
#[derive(Default)]
struct QueueState {
    running: AtomicUsize,
    pending: AtomicUsize,
    closed: AtomicBool,
    idle: Notify,
}

impl QueueState {
    fn publish(&self) {
        metrics::gauge!(DISPATCH_RUNNING).set(self.running.load(Ordering::SeqCst) as f64);
        metrics::gauge!(DISPATCH_PENDING).set(self.pending.load(Ordering::SeqCst) as f64);
    }

    fn is_idle(&self) -> bool {
        self.pending.load(Ordering::SeqCst) == 0 && self.running.load(Ordering::SeqCst) == 0
    }

    fn notify_if_idle(&self) {
        if self.is_idle() {
            self.idle.notify_waiters();
        }
    }
}

/// Holds a slot for one executing task. The running count is released before
/// the permit so that `running` never exceeds the permit count.
struct RunningSlot {
    state: Arc<QueueState>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for RunningSlot {
    fn drop(&mut self) {
        self.state.running.fetch_sub(1, Ordering::SeqCst);
        self.state.publish();
        self.state.notify_if_idle();
    }
}

type Job = BoxFuture<'static, ()>;

pub struct BoundedDispatchQueue {
    sender: mpsc::UnboundedSender<Job>,
    state: Arc<QueueState>,
    config: DispatchQueueConfig,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl BoundedDispatchQueue {
    /// Create a queue and start its dispatcher. Must be called within a Tokio runtime.
    pub fn new(config: DispatchQueueConfig) -> Self {
        let config = DispatchQueueConfig {
            concurrency: config.concurrency.max(1),
            ..config
        };
        let (sender, receiver) = mpsc::unbounded_channel();
        let state = Arc::new(QueueState::default());
        let semaphore = Arc::new(Semaphore::new(config.concurrency));

        info!(
            concurrency = config.concurrency,
            max_depth = ?config.max_depth,
            "Starting dispatch queue"
        );

        let dispatcher = tokio::spawn(Self::run_dispatcher(receiver, semaphore, state.clone()));

        Self {
            sender,
            state,
            config,
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    pub fn with_concurrency(concurrency: usize) -> Self {
        Self::new(DispatchQueueConfig::with_concurrency(concurrency))
    }

    /// Queue `task` for execution and return a handle resolving to its output.
    ///
    /// The task is owned by the queue from here on: dropping the handle does
    /// not cancel it.
    pub fn submit<F, R>(&self, task: F) -> TaskHandle<R>
    where
        F: Future<Output = R> + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();

        if self.state.closed.load(Ordering::SeqCst) {
            return TaskHandle::rejected(tx, rx, DispatchError::Closed);
        }

        let max_depth = self.config.max_depth;
        let admitted = self
            .state
            .pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |pending| match max_depth {
                Some(max) if pending >= max => None,
                _ => Some(pending + 1),
            });
        if let Err(depth) = admitted {
            debug!(depth, "Dispatch queue full, rejecting task");
            return TaskHandle::rejected(tx, rx, DispatchError::QueueFull { depth });
        }

        let job: Job = Box::pin(async move {
            let outcome = AssertUnwindSafe(task)
                .catch_unwind()
                .await
                .map_err(|_| DispatchError::Panicked);
            if tx.send(outcome).is_err() {
                debug!("Task completed after its handle was dropped");
            }
        });

        if self.sender.send(job).is_err() {
            self.state.pending.fetch_sub(1, Ordering::SeqCst);
            self.state.notify_if_idle();
            // the job (and its sender) went down with the channel
            return TaskHandle { rx };
        }
        self.state.publish();

        TaskHandle { rx }
    }

    /// Number of tasks currently executing.
    pub fn running(&self) -> usize {
        self.state.running.load(Ordering::SeqCst)
    }

    /// Number of tasks waiting for a free slot.
    pub fn pending(&self) -> usize {
        self.state.pending.load(Ordering::SeqCst)
    }

    pub fn concurrency(&self) -> usize {
        self.config.concurrency
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// Stop accepting new tasks. Already queued tasks still run.
    pub fn close(&self) {
        if !self.state.closed.swap(true, Ordering::SeqCst) {
            info!(
                pending = self.pending(),
                running = self.running(),
                "Dispatch queue closed to new tasks"
            );
        }
    }

    /// Wait until nothing is queued or executing.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.state.idle.notified();
            tokio::pin!(notified);
            // register before checking, so a wakeup between the two is not lost
            notified.as_mut().enable();
            if self.state.is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Close the queue, wait for every queued task to finish and stop the dispatcher.
    pub async fn shutdown(&self) {
        self.close();
        self.wait_idle().await;

        let dispatcher = match self.dispatcher.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = dispatcher {
            handle.abort();
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!("Dispatch queue dispatcher failed: {e}");
                }
            }
        }
    }

    async fn run_dispatcher(
        mut receiver: mpsc::UnboundedReceiver<Job>,
        semaphore: Arc<Semaphore>,
        state: Arc<QueueState>,
    ) {
        while let Some(job) = receiver.recv().await {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    error!("Dispatch semaphore closed, stopping dispatcher");
                    break;
                }
            };

            state.running.fetch_add(1, Ordering::SeqCst);
            state.pending.fetch_sub(1, Ordering::SeqCst);
            state.publish();

            let slot = RunningSlot {
                state: state.clone(),
                _permit: permit,
            };
            tokio::spawn(async move {
                job.await;
                drop(slot);
            });
        }

        debug!("Dispatch queue dispatcher shutting down");
    }
}

impl Drop for BoundedDispatchQueue {
    fn drop(&mut self) {
        self.state.closed.store(true, Ordering::SeqCst);
    }
}

/// Completion handle for one submitted task.
#[must_use = "a TaskHandle does nothing unless awaited"]
pub struct TaskHandle<R> {
    rx: oneshot::Receiver<Result<R, DispatchError>>,
}

impl<R> TaskHandle<R> {
    fn rejected(
        tx: oneshot::Sender<Result<R, DispatchError>>,
        rx: oneshot::Receiver<Result<R, DispatchError>>,
        error: DispatchError,
    ) -> Self {
        if tx.send(Err(error)).is_err() {
            debug!("Rejected task handle receiver already gone");
        }
        Self { rx }
    }
}

impl<R> Future for TaskHandle<R> {
    type Output = Result<R, DispatchError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(DispatchError::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::time::sleep;

    #[tokio::test]
    async fn test_submit_resolves_with_task_output() {
        let queue = BoundedDispatchQueue::with_concurrency(2);

        let handle = queue.submit(async { 40 + 2 });

        assert_eq!(handle.await, Ok(42));
    }

    #[tokio::test]
    async fn test_task_error_is_passed_through() {
        let queue = BoundedDispatchQueue::with_concurrency(2);

        let handle = queue.submit(async { Err::<(), String>("boom".to_string()) });

        assert_eq!(handle.await, Ok(Err("boom".to_string())));
    }

    #[tokio::test]
    async fn test_never_exceeds_concurrency() {
        let concurrency = 3;
        let queue = BoundedDispatchQueue::with_concurrency(concurrency);
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..25u64)
            .map(|i| {
                let active = active.clone();
                let max_seen = max_seen.clone();
                queue.submit(async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    assert!(now <= concurrency);
                    sleep(Duration::from_millis(1 + i % 4)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap();
        }

        assert!(max_seen.load(Ordering::SeqCst) <= concurrency);
        assert_eq!(max_seen.load(Ordering::SeqCst), concurrency);
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_start_order_is_fifo() {
        let queue = BoundedDispatchQueue::with_concurrency(1);
        let started = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..10)
            .map(|i| {
                let started = started.clone();
                queue.submit(async move {
                    started.lock().unwrap().push(i);
                    sleep(Duration::from_millis(1)).await;
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*started.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_completion_order_is_not_submission_order() {
        let queue = BoundedDispatchQueue::with_concurrency(2);
        let finished = Arc::new(Mutex::new(Vec::new()));

        let slow = {
            let finished = finished.clone();
            queue.submit(async move {
                sleep(Duration::from_millis(50)).await;
                finished.lock().unwrap().push("slow");
            })
        };
        let fast = {
            let finished = finished.clone();
            queue.submit(async move {
                finished.lock().unwrap().push("fast");
            })
        };

        fast.await.unwrap();
        slow.await.unwrap();

        assert_eq!(*finished.lock().unwrap(), vec!["fast", "slow"]);
    }

    #[tokio::test]
    async fn test_queued_task_waits_for_free_slot() {
        let queue = BoundedDispatchQueue::with_concurrency(1);
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let blocker = queue.submit(async move {
            release_rx.await.unwrap();
        });
        let waiter = queue.submit(async { "done" });

        sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.running(), 1);
        assert_eq!(queue.pending(), 1);

        release_tx.send(()).unwrap();
        blocker.await.unwrap();
        assert_eq!(waiter.await, Ok("done"));

        queue.wait_idle().await;
        assert_eq!(queue.running(), 0);
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn test_max_depth_rejects_overflow() {
        let queue = BoundedDispatchQueue::new(
            DispatchQueueConfig::with_concurrency(1).max_depth(Some(1)),
        );
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let blocker = queue.submit(async move {
            release_rx.await.unwrap();
        });
        // let the dispatcher move the blocker into its slot
        sleep(Duration::from_millis(20)).await;

        let queued = queue.submit(async { 1 });
        let rejected = queue.submit(async { 2 });

        assert_eq!(rejected.await, Err(DispatchError::QueueFull { depth: 1 }));

        release_tx.send(()).unwrap();
        blocker.await.unwrap();
        assert_eq!(queued.await, Ok(1));
    }

    #[tokio::test]
    async fn test_closed_queue_rejects_but_drains() {
        let queue = BoundedDispatchQueue::with_concurrency(1);

        let queued = queue.submit(async {
            sleep(Duration::from_millis(10)).await;
            "queued"
        });
        queue.close();
        let rejected = queue.submit(async { "late" });

        assert_eq!(rejected.await, Err(DispatchError::Closed));
        assert_eq!(queued.await, Ok("queued"));
        queue.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_wait_idle_covers_task_between_queue_and_slot() {
        let queue = BoundedDispatchQueue::with_concurrency(2);

        for round in 0..200 {
            let finished = Arc::new(AtomicBool::new(false));
            let flag = finished.clone();
            let handle = queue.submit(async move {
                tokio::task::yield_now().await;
                flag.store(true, Ordering::SeqCst);
            });

            queue.wait_idle().await;
            assert!(finished.load(Ordering::SeqCst), "round {round} not finished");
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_queued_tasks() {
        let queue = BoundedDispatchQueue::with_concurrency(1);
        let finished = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let finished = finished.clone();
            let _handle = queue.submit(async move {
                sleep(Duration::from_millis(5)).await;
                finished.fetch_add(1, Ordering::SeqCst);
            });
        }

        queue.shutdown().await;
        assert_eq!(finished.load(Ordering::SeqCst), 5);
        assert_eq!(queue.running(), 0);
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn test_wait_idle_on_empty_queue_returns() {
        let queue = BoundedDispatchQueue::with_concurrency(1);
        tokio::time::timeout(Duration::from_secs(1), queue.wait_idle())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_panicking_task_releases_its_slot() {
        let queue = BoundedDispatchQueue::with_concurrency(1);

        let panicked = queue.submit(async {
            panic!("handler blew up");
        });
        let next = queue.submit(async { "still running" });

        assert_eq!(panicked.await, Err::<(), _>(DispatchError::Panicked));
        assert_eq!(next.await, Ok("still running"));
    }
}
