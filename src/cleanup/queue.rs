//! Client cleanup queue
//!
//! Attempts the local client could not finish (post-commit failures,
//! expired attempts, deferred rollbacks) are queued here and finalized by a
//! background drain loop once their expiry plus a grace window has passed.
//!
//! Enqueueing never blocks: a full queue drops the request and the
//! lost-transaction sweeper eventually finds the attempt instead.

use crate::cleanup::cleaner::{CleanupAttempt, Cleaner};
use crate::cleanup::CleanupRequest;
use parking_lot::Mutex;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Heap slot ordered by readiness, then arrival
struct Queued {
    seq: u64,
    request: CleanupRequest,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap; the earliest request must come out first.
        other
            .request
            .ready_at
            .cmp(&self.request.ready_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Bounded queue of attempts awaiting cleanup
pub struct CleanupQueue {
    heap: Mutex<BinaryHeap<Queued>>,
    capacity: usize,
    next_seq: AtomicU64,
    notify: Notify,
    cleaner: Arc<Cleaner>,
    max_retries: u32,
    retry_delay: Duration,
}

impl CleanupQueue {
    pub fn new(
        capacity: usize,
        cleaner: Arc<Cleaner>,
        max_retries: u32,
        retry_delay: Duration,
    ) -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            capacity,
            next_seq: AtomicU64::new(0),
            notify: Notify::new(),
            cleaner,
            max_retries,
            retry_delay,
        }
    }

    /// Queue a request; false if the queue is full
    pub fn enqueue(&self, request: CleanupRequest) -> bool {
        {
            let mut heap = self.heap.lock();
            if heap.len() >= self.capacity {
                warn!(
                    attempt_id = %request.attempt_id,
                    capacity = self.capacity,
                    "Cleanup queue full, dropping request"
                );
                #[cfg(feature = "metrics")]
                metrics::counter!("kvtxn_cleanup_dropped_total").increment(1);
                return false;
            }
            debug!(attempt_id = %request.attempt_id, state = %request.state, "Queued attempt for cleanup");
            heap.push(Queued {
                seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                request,
            });
        }
        self.notify.notify_one();
        true
    }

    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }

    fn pop_ready(&self, now: Instant) -> Option<CleanupRequest> {
        let mut heap = self.heap.lock();
        if heap.peek().is_some_and(|q| q.request.ready_at <= now) {
            heap.pop().map(|q| q.request)
        } else {
            None
        }
    }

    fn next_ready_at(&self) -> Option<Instant> {
        self.heap.lock().peek().map(|q| q.request.ready_at)
    }

    fn drain_all(&self) -> Vec<CleanupRequest> {
        let mut heap = self.heap.lock();
        let mut requests = Vec::with_capacity(heap.len());
        while let Some(q) = heap.pop() {
            requests.push(q.request);
        }
        requests
    }

    /// Process one request, requeueing it after a transient failure
    async fn process(&self, request: CleanupRequest) -> CleanupAttempt {
        let result = self.cleaner.cleanup_attempt(&request, false).await;
        let report = CleanupAttempt {
            attempt_id: request.attempt_id.clone(),
            atr_key: request.atr.key.clone(),
            atr_bucket: request.atr.bucket.clone(),
            outcome: result.as_ref().ok().copied(),
            error: result.as_ref().err().map(|e| e.to_string()),
        };

        if let Err(e) = result {
            if e.is_retryable() && request.retries < self.max_retries {
                debug!(
                    attempt_id = %request.attempt_id,
                    retries = request.retries,
                    error = %e,
                    "Cleanup failed, requeueing"
                );
                let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                self.heap.lock().push(Queued {
                    seq,
                    request: request.retry_after(self.retry_delay),
                });
            } else {
                warn!(
                    attempt_id = %request.attempt_id,
                    atr = %request.atr,
                    error = %e,
                    "Cleanup failed, leaving attempt to lost-transaction cleanup"
                );
                #[cfg(feature = "metrics")]
                metrics::counter!("kvtxn_cleanup_failed_total").increment(1);
            }
        }
        report
    }

    /// Process every queued request now, regardless of readiness
    pub async fn force_drain(&self) -> Vec<CleanupAttempt> {
        let mut reports = Vec::new();
        for request in self.drain_all() {
            reports.push(self.process(request).await);
        }
        reports
    }

    /// Spawn the drain loop; it stops once `shutdown` flips to true
    ///
    /// A request being processed when shutdown is signalled is finished
    /// before the loop exits; requests not yet started stay queued.
    pub fn start(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            info!(capacity = queue.capacity, "Cleanup queue started");
            loop {
                if *shutdown.borrow() {
                    break;
                }
                let wake_at = queue
                    .next_ready_at()
                    .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = queue.notify.notified() => {}
                    _ = tokio::time::sleep_until(wake_at) => {
                        while let Some(request) = queue.pop_ready(Instant::now()) {
                            queue.process(request).await;
                            if *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
            }
            info!(remaining = queue.len(), "Cleanup queue stopped");
        })
    }
}

impl std::fmt::Debug for CleanupQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atr::{AtrLocation, AttemptState};
    use crate::cleanup::CleanupOutcome;
    use crate::config::DurabilityLevel;
    use crate::hooks::DefaultHooks;
    use crate::storage::{DocumentLocation, DocumentStore, MemoryStore, NoStoreResolver, StoreRegistry};

    fn queue(capacity: usize) -> Arc<CleanupQueue> {
        let registry = Arc::new(StoreRegistry::new(Arc::new(NoStoreResolver)));
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new("b"));
        registry.register(&store);
        let cleaner = Arc::new(Cleaner::new(
            registry,
            Duration::from_secs(1),
            Arc::new(DefaultHooks),
        ));
        Arc::new(CleanupQueue::new(capacity, cleaner, 2, Duration::from_millis(10)))
    }

    fn request(attempt_id: &str, ready_at: Instant) -> CleanupRequest {
        CleanupRequest {
            attempt_id: attempt_id.into(),
            transaction_id: "t".into(),
            atr: AtrLocation::new(&DocumentLocation::default_collection("b"), "_txn:atr-0"),
            state: AttemptState::Committing,
            docs: Vec::new(),
            durability: DurabilityLevel::None,
            ready_at,
            retries: 0,
        }
    }

    #[tokio::test]
    async fn test_full_queue_drops() {
        let q = queue(2);
        let now = Instant::now();
        assert!(q.enqueue(request("a", now)));
        assert!(q.enqueue(request("b", now)));
        assert!(!q.enqueue(request("c", now)));
        assert_eq!(q.len(), 2);
    }

    #[tokio::test]
    async fn test_pops_in_readiness_order() {
        let q = queue(10);
        let now = Instant::now();
        q.enqueue(request("late", now + Duration::from_secs(60)));
        q.enqueue(request("early", now));
        q.enqueue(request("early-2", now));

        assert_eq!(q.pop_ready(now).unwrap().attempt_id, "early");
        assert_eq!(q.pop_ready(now).unwrap().attempt_id, "early-2");
        assert!(q.pop_ready(now).is_none());
        assert_eq!(q.len(), 1);
    }

    #[tokio::test]
    async fn test_force_drain_ignores_readiness() {
        let q = queue(10);
        q.enqueue(request("a", Instant::now() + Duration::from_secs(600)));
        let reports = q.force_drain().await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].outcome, Some(CleanupOutcome::NothingToDo));
        assert!(reports[0].success());
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_drain_loop_processes_and_stops() {
        let q = queue(10);
        let (tx, rx) = watch::channel(false);
        let handle = q.start(rx);
        q.enqueue(request("a", Instant::now()));

        for _ in 0..50 {
            if q.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(q.is_empty());

        tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
