use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::IngestError;

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    /// Backoff unit; attempt `n` waits `n * delay` before running again.
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(retries: u32, delay: Duration) -> Self {
        Self { retries, delay }
    }
}

#[derive(Debug)]
pub struct TaskReport<T> {
    pub result: Result<T, IngestError>,
    pub attempts: u32,
}

pub struct TaskHandle<T> {
    receiver: mpsc::Receiver<TaskReport<T>>,
}

impl<T> TaskHandle<T> {
    pub fn wait(self) -> TaskReport<T> {
        self.receiver.recv().unwrap_or_else(|_| TaskReport {
            result: Err(IngestError::WorkerPool(
                "worker exited without reporting a result".to_string(),
            )),
            attempts: 0,
        })
    }
}

pub struct WorkerPool {
    workers: Vec<JoinHandle<()>>,
    sender: Option<mpsc::Sender<Job>>,
    cancelled: Arc<AtomicBool>,
    retry: RetryPolicy,
}

impl WorkerPool {
    pub fn new(size: usize, retry: RetryPolicy) -> Result<Self, IngestError> {
        if size == 0 {
            return Err(IngestError::InvalidConfig(
                "worker count must be positive".to_string(),
            ));
        }
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let mut workers = Vec::with_capacity(size);
        for id in 0..size {
            let receiver = Arc::clone(&receiver);
            let handle = thread::Builder::new()
                .name(format!("grid-ingest-worker-{id}"))
                .spawn(move || worker_loop(receiver))
                .map_err(|err| IngestError::WorkerPool(err.to_string()))?;
            workers.push(handle);
        }
        debug!(workers = size, retries = retry.retries, "worker pool started");
        Ok(Self {
            workers,
            sender: Some(sender),
            cancelled: Arc::new(AtomicBool::new(false)),
            retry,
        })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn submit<T, F>(&self, task: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: Fn() -> Result<T, IngestError> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let cancelled = Arc::clone(&self.cancelled);
        let retry = self.retry;
        let job: Job = Box::new(move || {
            let report = run_with_retries(&task, retry, &cancelled);
            let _ = tx.send(report);
        });
        if let Some(sender) = &self.sender {
            // A send error drops `tx`, which `wait` reports as a pool failure.
            let _ = sender.send(job);
        }
        TaskHandle { receiver: rx }
    }

    pub fn await_all<T>(&self, handles: Vec<TaskHandle<T>>) -> Vec<TaskReport<T>> {
        handles.into_iter().map(TaskHandle::wait).collect()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.cancel();
        drop(self.sender.take());
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("worker thread panicked during shutdown");
            }
        }
        debug!("worker pool stopped");
    }
}

fn worker_loop(receiver: Arc<Mutex<mpsc::Receiver<Job>>>) {
    loop {
        let message = match receiver.lock() {
            Ok(guard) => guard.recv(),
            Err(_) => break,
        };
        match message {
            Ok(job) => job(),
            Err(_) => break,
        }
    }
}

fn run_with_retries<T, F>(task: &F, retry: RetryPolicy, cancelled: &AtomicBool) -> TaskReport<T>
where
    F: Fn() -> Result<T, IngestError>,
{
    let mut attempts = 0u32;
    loop {
        if cancelled.load(Ordering::SeqCst) {
            return TaskReport {
                result: Err(IngestError::Cancelled),
                attempts,
            };
        }
        attempts += 1;
        let result = panic::catch_unwind(AssertUnwindSafe(task)).unwrap_or_else(|payload| {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(IngestError::WorkerPool(format!("task panicked: {message}")))
        });
        match result {
            Err(err) if err.is_retryable() && attempts <= retry.retries => {
                debug!(attempt = attempts, error = %err, "retrying task");
                if !retry.delay.is_zero() {
                    thread::sleep(retry.delay * attempts);
                }
            }
            result => return TaskReport { result, attempts },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;

    fn decode_failure() -> IngestError {
        IngestError::Decode {
            location: "memory://x".to_string(),
            reason: "corrupt".to_string(),
        }
    }

    #[test]
    fn retries_until_budget_is_exhausted() {
        let pool = WorkerPool::new(2, RetryPolicy::new(2, Duration::ZERO)).unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let handle = pool.submit(move || -> Result<(), IngestError> {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(decode_failure())
        });
        let report = handle.wait();
        assert!(report.result.is_err());
        assert_eq!(report.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn non_retryable_errors_fail_once() {
        let pool = WorkerPool::new(1, RetryPolicy::new(5, Duration::ZERO)).unwrap();
        let report = pool
            .submit(|| -> Result<(), IngestError> {
                Err(IngestError::Schema {
                    location: "memory://x".to_string(),
                    reason: "empty".to_string(),
                })
            })
            .wait();
        assert_eq!(report.attempts, 1);
    }

    #[test]
    fn panics_become_failures_and_worker_survives() {
        let pool = WorkerPool::new(1, RetryPolicy::new(0, Duration::ZERO)).unwrap();
        let panicked = pool.submit(|| -> Result<u8, IngestError> { panic!("boom") });
        let fine = pool.submit(|| Ok(7u8));
        let reports = pool.await_all(vec![panicked, fine]);
        assert!(matches!(reports[0].result, Err(IngestError::WorkerPool(_))));
        assert_eq!(reports[1].result.as_ref().unwrap(), &7);
    }

    #[test]
    fn cancelled_pool_skips_queued_tasks() {
        let pool = WorkerPool::new(1, RetryPolicy::new(0, Duration::ZERO)).unwrap();
        pool.cancel();
        let report = pool.submit(|| Ok(1u8)).wait();
        assert!(matches!(report.result, Err(IngestError::Cancelled)));
        assert_eq!(report.attempts, 0);
    }
}
