use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use operation_consumer::dispatch_queue::{BoundedDispatchQueue, DispatchQueueConfig};
use operation_consumer::error::DispatchError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use test_case::test_case;

#[derive(Default)]
struct Gauge {
    running: AtomicUsize,
    peak: AtomicUsize,
    started: Mutex<Vec<usize>>,
}

impl Gauge {
    fn start(&self, id: usize, ceiling: usize) {
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        assert!(running <= ceiling, "{running} tasks running, ceiling {ceiling}");
        self.peak.fetch_max(running, Ordering::SeqCst);
        self.started.lock().unwrap().push(id);
    }

    fn finish(&self, ceiling: usize) {
        let running = self.running.fetch_sub(1, Ordering::SeqCst);
        assert!(running <= ceiling, "{running} tasks running, ceiling {ceiling}");
    }
}

#[test_case(1, 11; "serial")]
#[test_case(3, 23; "three slots")]
#[test_case(8, 47; "default ceiling")]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_random_burst_never_exceeds_ceiling(concurrency: usize, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    let queue = BoundedDispatchQueue::with_concurrency(concurrency);
    let gauge = Arc::new(Gauge::default());

    let handles: Vec<_> = (0..60)
        .map(|id| {
            let gauge = gauge.clone();
            let work = Duration::from_millis(rng.gen_range(2..8));
            queue.submit(async move {
                gauge.start(id, concurrency);
                tokio::time::sleep(work).await;
                gauge.finish(concurrency);
                id
            })
        })
        .collect();

    let results = join_all(handles).await;

    let ids: Vec<usize> = results.into_iter().map(Result::unwrap).collect();
    assert_eq!(ids, (0..60).collect::<Vec<_>>());
    assert_eq!(gauge.peak.load(Ordering::SeqCst), concurrency);
    queue.shutdown().await;
}

#[tokio::test]
async fn test_start_order_follows_submission_order() {
    let queue = BoundedDispatchQueue::with_concurrency(2);
    let gauge = Arc::new(Gauge::default());

    let handles: Vec<_> = (0..10)
        .map(|id| {
            let gauge = gauge.clone();
            queue.submit(async move {
                gauge.start(id, 2);
                tokio::time::sleep(Duration::from_millis(2)).await;
                gauge.finish(2);
            })
        })
        .collect();
    join_all(handles).await;

    assert_eq!(*gauge.started.lock().unwrap(), (0..10).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_bounded_depth_rejects_then_recovers() {
    let queue =
        BoundedDispatchQueue::new(DispatchQueueConfig::with_concurrency(1).max_depth(Some(3)));

    let accepted: Vec<_> = (0..3)
        .map(|_| queue.submit(tokio::time::sleep(Duration::from_millis(5))))
        .collect();
    let overflow = queue.submit(async {});
    assert_eq!(overflow.await, Err(DispatchError::QueueFull { depth: 3 }));

    for result in join_all(accepted).await {
        assert!(result.is_ok());
    }

    assert_eq!(queue.pending(), 0);
    assert_eq!(queue.submit(async { 7 }).await, Ok(7));
}
