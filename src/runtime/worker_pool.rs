//! Resizable thread pool fed by a bounded queue.
//!
//! Workers pull jobs from one `crossbeam-channel`. A monitor thread
//! re-evaluates the pool size on a fixed interval: two workers are added
//! while more than ten jobs are queued, one is retired while the queue is
//! empty, always staying within `[min_workers, max_workers]`.

use super::CancellationToken;
use crate::config::ConcurrencyConfig;
use crate::error::{IndexError, IndexResult};
use crossbeam_channel::{
    Receiver, RecvTimeoutError, Sender, TrySendError, bounded, unbounded,
};
use parking_lot::Mutex;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Queue length above which the pool grows.
const GROW_THRESHOLD: usize = 10;
const GROW_STEP: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPoolOptions {
    pub min_workers: usize,
    pub max_workers: usize,
    pub queue_size: usize,
    pub adjust_interval: Duration,
}

impl Default for WorkerPoolOptions {
    fn default() -> Self {
        Self::from_config(&ConcurrencyConfig::default())
    }
}

impl WorkerPoolOptions {
    /// Bounds are clamped to `1 ≤ min ≤ max ≤ 2 × CPUs`.
    pub fn from_config(config: &ConcurrencyConfig) -> Self {
        let ceiling = (num_cpus::get() * 2).max(1);
        let max_workers = config.max_workers.clamp(1, ceiling);
        Self {
            min_workers: config.min_workers.clamp(1, max_workers),
            max_workers,
            queue_size: config.worker_queue_size.max(1),
            adjust_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerPoolStats {
    pub workers: usize,
    pub active: usize,
    pub queued: usize,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
}

enum Outcome {
    Completed,
    Failed,
    TimedOut,
}

type Job = Box<dyn FnOnce() -> Outcome + Send + 'static>;

enum Message {
    Run(Job),
    Retire,
}

struct Shared {
    rx: Receiver<Message>,
    min_workers: usize,
    workers: AtomicUsize,
    active: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    fn spawn_worker(self: &Arc<Self>) {
        self.workers.fetch_add(1, Ordering::AcqRel);
        let shared = Arc::clone(self);
        let spawned = std::thread::Builder::new()
            .name("clindex-worker".to_string())
            .spawn(move || worker_loop(&shared));
        match spawned {
            Ok(handle) => self.handles.lock().push(handle),
            Err(e) => {
                self.workers.fetch_sub(1, Ordering::AcqRel);
                warn!("failed to spawn worker thread: {e}");
            }
        }
    }

    /// Claim a retirement slot unless the pool is already at its minimum.
    fn try_retire(&self) -> bool {
        self.workers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n > self.min_workers).then(|| n - 1)
            })
            .is_ok()
    }
}

fn worker_loop(shared: &Shared) {
    while let Ok(message) = shared.rx.recv() {
        match message {
            Message::Retire => {
                if shared.try_retire() {
                    debug!("worker retired");
                    return;
                }
            }
            Message::Run(job) => {
                shared.active.fetch_add(1, Ordering::AcqRel);
                let outcome = catch_unwind(AssertUnwindSafe(job)).unwrap_or(Outcome::Failed);
                shared.active.fetch_sub(1, Ordering::AcqRel);
                let counter = match outcome {
                    Outcome::Completed => &shared.completed,
                    Outcome::Failed => &shared.failed,
                    Outcome::TimedOut => &shared.timed_out,
                };
                counter.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
    shared.workers.fetch_sub(1, Ordering::AcqRel);
}

fn adjust(shared: &Arc<Shared>, tx: &Sender<Message>, options: &WorkerPoolOptions) {
    let queued = tx.len();
    let workers = shared.workers.load(Ordering::Acquire);
    if queued > GROW_THRESHOLD && workers < options.max_workers {
        let add = GROW_STEP.min(options.max_workers - workers);
        debug!(queued, workers, add, "growing worker pool");
        for _ in 0..add {
            shared.spawn_worker();
        }
    } else if queued == 0 && workers > options.min_workers {
        let _ = tx.try_send(Message::Retire);
    }
}

/// Result handle for a submitted job.
pub struct WorkFuture<T> {
    rx: Receiver<IndexResult<T>>,
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl<T> WorkFuture<T> {
    /// Block until the job finishes or its timeout passes.
    ///
    /// On timeout the job's token is cancelled; the worker itself keeps
    /// running and picks up the next job once the task returns.
    pub fn wait(self) -> IndexResult<T> {
        let received = match self.deadline {
            Some(deadline) => self.rx.recv_deadline(deadline).map_err(|e| match e {
                RecvTimeoutError::Timeout => {
                    self.token.cancel();
                    IndexError::Timeout {
                        operation: "work item".to_string(),
                    }
                }
                RecvTimeoutError::Disconnected => IndexError::Unavailable,
            }),
            None => self.rx.recv().map_err(|_| IndexError::Unavailable),
        };
        received?
    }

    pub fn is_ready(&self) -> bool {
        !self.rx.is_empty()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }
}

/// Dynamically sized pool of worker threads.
pub struct WorkerPool {
    tx: Option<Sender<Message>>,
    shared: Arc<Shared>,
    options: WorkerPoolOptions,
    monitor: Option<(Sender<()>, JoinHandle<()>)>,
}

impl WorkerPool {
    pub fn new(options: WorkerPoolOptions) -> Self {
        let (tx, rx) = bounded(options.queue_size.max(1));
        let shared = Arc::new(Shared {
            rx,
            min_workers: options.min_workers.max(1),
            workers: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
            handles: Mutex::new(Vec::new()),
        });
        for _ in 0..shared.min_workers {
            shared.spawn_worker();
        }

        let (stop_tx, stop_rx) = unbounded::<()>();
        let monitor = {
            let shared = Arc::clone(&shared);
            let tx = tx.clone();
            let options = options.clone();
            std::thread::Builder::new()
                .name("clindex-pool-monitor".to_string())
                .spawn(move || {
                    while let Err(RecvTimeoutError::Timeout) =
                        stop_rx.recv_timeout(options.adjust_interval)
                    {
                        adjust(&shared, &tx, &options);
                    }
                })
                .map_err(|e| warn!("failed to spawn pool monitor: {e}"))
                .ok()
                .map(|handle| (stop_tx, handle))
        };

        Self {
            tx: Some(tx),
            shared,
            options,
            monitor,
        }
    }

    /// Queue `task`; `QueueFull` when the queue is at capacity.
    pub fn submit<T, F>(&self, task: F) -> IndexResult<WorkFuture<T>>
    where
        T: Send + 'static,
        F: FnOnce(&CancellationToken) -> IndexResult<T> + Send + 'static,
    {
        self.submit_with_timeout(task, None)
    }

    /// Like [`submit`](Self::submit); the task's token expires after
    /// `timeout` and waiting past it yields `Timeout`.
    pub fn submit_with_timeout<T, F>(
        &self,
        task: F,
        timeout: Option<Duration>,
    ) -> IndexResult<WorkFuture<T>>
    where
        T: Send + 'static,
        F: FnOnce(&CancellationToken) -> IndexResult<T> + Send + 'static,
    {
        let tx = self.tx.as_ref().ok_or(IndexError::Unavailable)?;
        let token = match timeout {
            Some(timeout) => CancellationToken::with_timeout(timeout),
            None => CancellationToken::new(),
        };
        let (result_tx, result_rx) = bounded(1);

        let job_token = token.clone();
        let job: Job = Box::new(move || {
            if job_token.is_cancelled() {
                let _ = result_tx.send(Err(IndexError::Timeout {
                    operation: "work item".to_string(),
                }));
                return Outcome::TimedOut;
            }
            let result = task(&job_token);
            let outcome = match &result {
                Ok(_) if job_token.is_cancelled() => Outcome::TimedOut,
                Ok(_) => Outcome::Completed,
                Err(IndexError::Timeout { .. }) => Outcome::TimedOut,
                Err(_) => Outcome::Failed,
            };
            let _ = result_tx.send(result);
            outcome
        });

        tx.try_send(Message::Run(job)).map_err(|e| match e {
            TrySendError::Full(_) => IndexError::QueueFull { waited_ms: 0 },
            TrySendError::Disconnected(_) => IndexError::Unavailable,
        })?;

        Ok(WorkFuture {
            rx: result_rx,
            deadline: token.deadline(),
            token,
        })
    }

    /// Run one sizing step immediately.
    pub fn adjust_now(&self) {
        if let Some(tx) = &self.tx {
            adjust(&self.shared, tx, &self.options);
        }
    }

    pub fn options(&self) -> &WorkerPoolOptions {
        &self.options
    }

    pub fn stats(&self) -> WorkerPoolStats {
        WorkerPoolStats {
            workers: self.shared.workers.load(Ordering::Acquire),
            active: self.shared.active.load(Ordering::Acquire),
            queued: self.tx.as_ref().map_or(0, Sender::len),
            completed: self.shared.completed.load(Ordering::Relaxed),
            failed: self.shared.failed.load(Ordering::Relaxed),
            timed_out: self.shared.timed_out.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting work, finish queued jobs and join every thread.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some((stop_tx, handle)) = self.monitor.take() {
            let _ = stop_tx.send(());
            let _ = handle.join();
        }
        self.tx.take();
        let handles = std::mem::take(&mut *self.shared.handles.lock());
        for handle in handles {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn options(min: usize, max: usize, queue: usize) -> WorkerPoolOptions {
        WorkerPoolOptions {
            min_workers: min,
            max_workers: max,
            queue_size: queue,
            adjust_interval: Duration::from_secs(3600),
        }
    }

    #[test]
    fn test_submit_and_wait() {
        let pool = WorkerPool::new(options(2, 4, 16));
        let futures: Vec<_> = (0..8u64)
            .map(|i| pool.submit(move |_| Ok(i * i)).unwrap())
            .collect();
        let results: Vec<u64> = futures.into_iter().map(|f| f.wait().unwrap()).collect();
        assert_eq!(results, vec![0, 1, 4, 9, 16, 25, 36, 49]);
        pool.shutdown();
    }

    #[test]
    fn test_errors_are_returned_and_counted() {
        let pool = WorkerPool::new(options(1, 1, 4));
        let err = pool
            .submit(|_| -> IndexResult<()> { Err(IndexError::invalid("bad")) })
            .unwrap()
            .wait()
            .unwrap_err();
        assert_eq!(err.status_code(), "INVALID_ARGUMENT");
        assert!(pool.submit(|_| Ok(())).unwrap().wait().is_ok());
        let stats = pool.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.completed, 1);
    }

    #[test]
    fn test_queue_full() {
        let pool = WorkerPool::new(options(1, 1, 1));
        let (release_tx, release_rx) = bounded::<()>(0);
        let started = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&started);
        let blocker = pool
            .submit(move |_| {
                flag.store(true, Ordering::SeqCst);
                let _ = release_rx.recv();
                Ok(())
            })
            .unwrap();
        while !started.load(Ordering::SeqCst) {
            std::thread::yield_now();
        }
        let queued = pool.submit(|_| Ok(())).unwrap();
        let err = pool.submit(|_| Ok(())).err().unwrap();
        assert!(matches!(err, IndexError::QueueFull { .. }));

        release_tx.send(()).unwrap();
        blocker.wait().unwrap();
        queued.wait().unwrap();
    }

    #[test]
    fn test_timeout_keeps_worker_alive() {
        let pool = WorkerPool::new(options(1, 1, 4));
        let slow = pool
            .submit_with_timeout(
                |token| {
                    while !token.is_cancelled() {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    token.check("slow task")
                },
                Some(Duration::from_millis(20)),
            )
            .unwrap();
        let err = slow.wait().unwrap_err();
        assert!(matches!(err, IndexError::Timeout { .. }));

        assert_eq!(pool.submit(|_| Ok(7)).unwrap().wait().unwrap(), 7);
        assert_eq!(pool.stats().workers, 1);
    }

    #[test]
    fn test_panicking_job_does_not_kill_worker() {
        let pool = WorkerPool::new(options(1, 1, 4));
        let err = pool
            .submit(|_| -> IndexResult<()> { panic!("boom") })
            .unwrap()
            .wait()
            .unwrap_err();
        assert!(matches!(err, IndexError::Unavailable));
        assert_eq!(pool.submit(|_| Ok(1)).unwrap().wait().unwrap(), 1);
    }

    #[test]
    fn test_grows_under_load_and_shrinks_when_idle() {
        let pool = WorkerPool::new(options(1, 3, 64));
        let (release_tx, release_rx) = bounded::<()>(0);
        let mut futures = Vec::new();
        for _ in 0..20 {
            let rx = release_rx.clone();
            futures.push(
                pool.submit(move |_| {
                    let _ = rx.recv();
                    Ok(())
                })
                .unwrap(),
            );
        }
        pool.adjust_now();
        assert_eq!(pool.stats().workers, 3);
        pool.adjust_now();
        assert_eq!(pool.stats().workers, 3);

        drop(release_tx);
        for future in futures {
            future.wait().unwrap();
        }

        pool.adjust_now();
        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.stats().workers > 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(pool.stats().workers, 2);
    }

    #[test]
    fn test_options_are_clamped() {
        let config = ConcurrencyConfig {
            min_workers: 0,
            max_workers: 10_000,
            ..ConcurrencyConfig::default()
        };
        let options = WorkerPoolOptions::from_config(&config);
        assert_eq!(options.min_workers, 1);
        assert!(options.max_workers <= num_cpus::get() * 2);
    }
}
