//! Bounded work queue with fixed worker concurrency.
//!
//! Tasks are popped from the head; a failed task sleeps `retry_delay ×
//! attempts` and is pushed back to the *front*, so retries preempt newer
//! work.  Exceeding the per-task timeout counts as a failure.  `stop`
//! refuses new enqueues, lets in-flight tasks finish (bounded by their
//! timeouts), and abandons anything still queued.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_queue_size: usize,
    pub max_concurrent: usize,
    pub task_timeout: Duration,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 10_000,
            max_concurrent: 10,
            task_timeout: Duration::from_secs(60),
            retry_attempts: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue full")]
    Full,
    #[error("queue stopped")]
    Stopped,
}

/// The worker body.  Returning `Err` requests a retry (until the attempt
/// budget runs out); drop-class outcomes must be mapped to `Ok` by the
/// runner itself.  `attempt` is 0 on the first run and counts up across
/// retries, so runners can keep first-attempt-only guards out of the way
/// of their own retries.
pub trait JobRunner<T>: Send + Sync + 'static {
    type Error: std::fmt::Display + Send;

    fn run(&self, job: &T, attempt: u32)
    -> impl Future<Output = Result<(), Self::Error>> + Send;
}

struct Job<T> {
    id: u64,
    payload: T,
    attempts: u32,
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    dropped: AtomicU64,
    total_process_ms: AtomicU64,
    timed_jobs: AtomicU64,
}

struct Inner<T> {
    cfg: QueueConfig,
    deque: Mutex<VecDeque<Job<T>>>,
    notify: Notify,
    accepting: AtomicBool,
    stopping: AtomicBool,
    processing: AtomicUsize,
    next_id: AtomicU64,
    counters: Counters,
}

/// Snapshot of queue health for the stats surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueStats {
    pub queue_size: usize,
    pub processing: usize,
    pub processed: u64,
    pub failed: u64,
    pub retried: u64,
    pub dropped: u64,
    pub avg_process_ms: u64,
    pub success_rate: f64,
}

pub struct WorkQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> WorkQueue<T> {
    pub fn new(cfg: QueueConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                cfg,
                deque: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                accepting: AtomicBool::new(true),
                stopping: AtomicBool::new(false),
                processing: AtomicUsize::new(0),
                next_id: AtomicU64::new(1),
                counters: Counters::default(),
            }),
        }
    }

    /// Append a task.  Fails with [`QueueError::Full`] at capacity and
    /// [`QueueError::Stopped`] once `stop` has begun.
    pub fn enqueue(&self, payload: T) -> Result<u64, QueueError> {
        if !self.inner.accepting.load(Ordering::SeqCst) {
            return Err(QueueError::Stopped);
        }
        let mut deque = self.inner.deque.lock().unwrap();
        if deque.len() >= self.inner.cfg.max_queue_size {
            self.inner.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return Err(QueueError::Full);
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        deque.push_back(Job {
            id,
            payload,
            attempts: 0,
        });
        drop(deque);
        self.inner.notify.notify_one();
        Ok(id)
    }

    /// Spawn the worker pool.  Workers exit on the shutdown watch or after
    /// [`WorkQueue::stop`].
    pub fn start<R>(&self, runner: Arc<R>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>>
    where
        R: JobRunner<T>,
    {
        (0..self.inner.cfg.max_concurrent)
            .map(|worker_id| {
                let inner = Arc::clone(&self.inner);
                let runner = Arc::clone(&runner);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    worker_loop(worker_id, inner, runner, shutdown).await;
                })
            })
            .collect()
    }

    /// Refuse new enqueues, finish in-flight tasks, and return once every
    /// worker has exited (`processing == 0`).  Queued-but-unstarted tasks
    /// are abandoned.
    pub async fn stop(&self, handles: Vec<JoinHandle<()>>) {
        self.inner.accepting.store(false, Ordering::SeqCst);
        self.inner.stopping.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
        for handle in handles {
            let _ = handle.await;
        }
        debug_assert_eq!(self.inner.processing.load(Ordering::SeqCst), 0);
    }

    pub fn len(&self) -> usize {
        self.inner.deque.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> QueueStats {
        let c = &self.inner.counters;
        let processed = c.processed.load(Ordering::Relaxed);
        let failed = c.failed.load(Ordering::Relaxed);
        let timed = c.timed_jobs.load(Ordering::Relaxed);
        let total_ms = c.total_process_ms.load(Ordering::Relaxed);
        QueueStats {
            queue_size: self.len(),
            processing: self.inner.processing.load(Ordering::Relaxed),
            processed,
            failed,
            retried: c.retried.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            avg_process_ms: if timed == 0 { 0 } else { total_ms / timed },
            success_rate: if processed + failed == 0 {
                1.0
            } else {
                processed as f64 / (processed + failed) as f64
            },
        }
    }
}

async fn worker_loop<T, R>(
    worker_id: usize,
    inner: Arc<Inner<T>>,
    runner: Arc<R>,
    mut shutdown: watch::Receiver<bool>,
) where
    T: Send + 'static,
    R: JobRunner<T>,
{
    loop {
        if inner.stopping.load(Ordering::SeqCst) {
            break;
        }
        let job = inner.deque.lock().unwrap().pop_front();
        let Some(mut job) = job else {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    // A dropped sender means the process is tearing down.
                    if changed.is_err() || *shutdown.borrow() {
                        inner.accepting.store(false, Ordering::SeqCst);
                        inner.stopping.store(true, Ordering::SeqCst);
                        inner.notify.notify_waiters();
                        break;
                    }
                }
                _ = inner.notify.notified() => {}
            }
            continue;
        };

        inner.processing.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();
        let result = tokio::time::timeout(
            inner.cfg.task_timeout,
            runner.run(&job.payload, job.attempts),
        )
        .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        inner.processing.fetch_sub(1, Ordering::SeqCst);
        inner
            .counters
            .total_process_ms
            .fetch_add(elapsed_ms, Ordering::Relaxed);
        inner.counters.timed_jobs.fetch_add(1, Ordering::Relaxed);

        let failure = match result {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!(
                "timed out after {}ms",
                inner.cfg.task_timeout.as_millis()
            )),
        };

        match failure {
            None => {
                inner.counters.processed.fetch_add(1, Ordering::Relaxed);
            }
            Some(reason) => {
                job.attempts += 1;
                if job.attempts < inner.cfg.retry_attempts
                    && !inner.stopping.load(Ordering::SeqCst)
                {
                    debug!(
                        worker = worker_id,
                        job = job.id,
                        attempt = job.attempts,
                        reason = %reason,
                        "job failed, requeueing at head"
                    );
                    inner.counters.retried.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(inner.cfg.retry_delay * job.attempts).await;
                    inner.deque.lock().unwrap().push_front(job);
                    inner.notify.notify_one();
                } else {
                    warn!(
                        worker = worker_id,
                        job = job.id,
                        attempts = job.attempts,
                        reason = %reason,
                        "job failed permanently"
                    );
                    inner.counters.failed.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// Records the order jobs were run in and fails scripted attempts.
    struct ScriptedRunner {
        /// job label → how many times it should fail before succeeding
        failures: StdMutex<std::collections::HashMap<String, u32>>,
        ran: StdMutex<Vec<String>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        delay: Duration,
    }

    impl ScriptedRunner {
        fn new(delay: Duration) -> Self {
            Self {
                failures: StdMutex::new(std::collections::HashMap::new()),
                ran: StdMutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                delay,
            }
        }

        fn fail_first(&self, label: &str, times: u32) {
            self.failures.lock().unwrap().insert(label.to_owned(), times);
        }

        fn order(&self) -> Vec<String> {
            self.ran.lock().unwrap().clone()
        }
    }

    impl JobRunner<String> for ScriptedRunner {
        type Error = String;

        async fn run(&self, job: &String, _attempt: u32) -> Result<(), String> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.ran.lock().unwrap().push(job.clone());
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let mut failures = self.failures.lock().unwrap();
            if let Some(left) = failures.get_mut(job)
                && *left > 0
            {
                *left -= 1;
                return Err("scripted failure".to_owned());
            }
            Ok(())
        }
    }

    fn queue(cfg: QueueConfig) -> WorkQueue<String> {
        WorkQueue::new(cfg)
    }

    async fn settle(q: &WorkQueue<String>) {
        while q.stats().processing > 0 || !q.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // One extra turn so counter updates land.
        tokio::task::yield_now().await;
    }

    #[tokio::test(start_paused = true)]
    async fn enqueue_fails_when_full() {
        let q = queue(QueueConfig {
            max_queue_size: 2,
            ..QueueConfig::default()
        });
        assert!(q.enqueue("a".into()).is_ok());
        assert!(q.enqueue("b".into()).is_ok());
        assert_eq!(q.enqueue("c".into()), Err(QueueError::Full));
        assert_eq!(q.stats().dropped, 1);
        assert_eq!(q.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn jobs_run_in_fifo_order() {
        let q = queue(QueueConfig {
            max_concurrent: 1,
            ..QueueConfig::default()
        });
        let runner = Arc::new(ScriptedRunner::new(Duration::ZERO));
        let (_tx, rx) = watch::channel(false);
        let handles = q.start(Arc::clone(&runner), rx);

        for label in ["a", "b", "c"] {
            q.enqueue(label.into()).unwrap();
        }
        settle(&q).await;
        assert_eq!(runner.order(), vec!["a", "b", "c"]);
        q.stop(handles).await;
    }

    #[tokio::test(start_paused = true)]
    async fn retry_preempts_later_work() {
        let q = queue(QueueConfig {
            max_concurrent: 1,
            retry_attempts: 3,
            retry_delay: Duration::from_millis(50),
            ..QueueConfig::default()
        });
        let runner = Arc::new(ScriptedRunner::new(Duration::ZERO));
        runner.fail_first("a", 1);
        let (_tx, rx) = watch::channel(false);
        let handles = q.start(Arc::clone(&runner), rx);

        q.enqueue("a".into()).unwrap();
        q.enqueue("b".into()).unwrap();
        q.enqueue("c".into()).unwrap();
        settle(&q).await;

        // The retried "a" must run again before "b" and "c".
        assert_eq!(runner.order(), vec!["a", "a", "b", "c"]);
        let stats = q.stats();
        assert_eq!(stats.retried, 1);
        assert_eq!(stats.processed, 3);
        assert_eq!(stats.failed, 0);
        q.stop(handles).await;
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_count_as_permanent_failure() {
        let q = queue(QueueConfig {
            max_concurrent: 1,
            retry_attempts: 2,
            retry_delay: Duration::from_millis(10),
            ..QueueConfig::default()
        });
        let runner = Arc::new(ScriptedRunner::new(Duration::ZERO));
        runner.fail_first("doomed", 10);
        let (_tx, rx) = watch::channel(false);
        let handles = q.start(Arc::clone(&runner), rx);

        q.enqueue("doomed".into()).unwrap();
        while q.stats().failed == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let stats = q.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.retried, 1);
        assert_eq!(stats.processed, 0);
        // attempts = retry_attempts total runs
        assert_eq!(runner.order().len(), 2);
        q.stop(handles).await;
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_counts_as_failure() {
        let q = queue(QueueConfig {
            max_concurrent: 1,
            task_timeout: Duration::from_millis(100),
            retry_attempts: 1,
            ..QueueConfig::default()
        });
        let runner = Arc::new(ScriptedRunner::new(Duration::from_secs(60)));
        let (_tx, rx) = watch::channel(false);
        let handles = q.start(Arc::clone(&runner), rx);

        q.enqueue("slow".into()).unwrap();
        while q.stats().failed == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(q.stats().failed, 1);
        q.stop(handles).await;
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_is_capped() {
        let q = queue(QueueConfig {
            max_concurrent: 2,
            ..QueueConfig::default()
        });
        let runner = Arc::new(ScriptedRunner::new(Duration::from_millis(100)));
        let (_tx, rx) = watch::channel(false);
        let handles = q.start(Arc::clone(&runner), rx);

        for i in 0..6 {
            q.enqueue(format!("job{i}")).unwrap();
        }
        settle(&q).await;
        assert_eq!(runner.max_in_flight.load(Ordering::SeqCst), 2);
        assert_eq!(q.stats().processed, 6);
        q.stop(handles).await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_finishes_in_flight_and_abandons_queued() {
        let q = queue(QueueConfig {
            max_concurrent: 1,
            ..QueueConfig::default()
        });
        let runner = Arc::new(ScriptedRunner::new(Duration::from_millis(200)));
        let (_tx, rx) = watch::channel(false);
        let handles = q.start(Arc::clone(&runner), rx);

        for label in ["a", "b", "c"] {
            q.enqueue(label.into()).unwrap();
        }
        // Let the worker pick up "a".
        while q.stats().processing == 0 {
            tokio::task::yield_now().await;
        }
        q.stop(handles).await;

        assert_eq!(runner.order(), vec!["a"]);
        assert_eq!(q.stats().processed, 1);
        assert_eq!(q.len(), 2, "queued tasks are abandoned on stop");
        assert_eq!(q.enqueue("d".into()), Err(QueueError::Stopped));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_watch_stops_idle_workers() {
        let q = queue(QueueConfig {
            max_concurrent: 3,
            ..QueueConfig::default()
        });
        let runner = Arc::new(ScriptedRunner::new(Duration::ZERO));
        let (tx, rx) = watch::channel(false);
        let handles = q.start(Arc::clone(&runner), rx);

        tokio::task::yield_now().await;
        tx.send(true).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(q.enqueue("x".into()), Err(QueueError::Stopped));
    }
}
