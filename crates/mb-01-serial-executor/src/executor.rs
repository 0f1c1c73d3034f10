//! The serial executor.

use crate::job::{AwaitJob, FireJob, Job};
use parking_lot::Mutex;
use shared_types::MessagingError;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

type BoxedJob = Box<dyn Job>;

/// Counters for an executor.
#[derive(Debug, Default)]
pub struct ExecutorStats {
    /// Jobs run to completion (successful or not).
    pub executed: AtomicU64,
    /// Jobs cancelled by shutdown.
    pub cancelled: AtomicU64,
    queued: AtomicUsize,
}

impl ExecutorStats {
    /// Jobs waiting to run.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Relaxed)
    }
}

/// Runs channel operations one at a time, in enqueue order, on a dedicated
/// worker thread.
pub struct SerialExecutor {
    name: String,
    sender: Mutex<Option<mpsc::UnboundedSender<BoxedJob>>>,
    shutdown: Arc<AtomicBool>,
    stats: Arc<ExecutorStats>,
}

impl SerialExecutor {
    /// Start an executor and its worker thread.
    ///
    /// # Errors
    ///
    /// Fails if the OS refuses to spawn the thread.
    pub fn start(name: impl Into<String>) -> Result<Self, MessagingError> {
        let name = name.into();
        let (sender, receiver) = mpsc::unbounded_channel::<BoxedJob>();
        let shutdown = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(ExecutorStats::default());

        let worker_shutdown = shutdown.clone();
        let worker_stats = stats.clone();
        let worker_name = name.clone();
        std::thread::Builder::new()
            .name(format!("serial-{}", name))
            .spawn(move || worker_loop(worker_name, receiver, worker_shutdown, worker_stats))
            .map_err(|e| MessagingError::Broker(format!("failed to start executor: {}", e)))?;

        debug!(executor = %name, "Serial executor started");
        Ok(Self {
            name,
            sender: Mutex::new(Some(sender)),
            shutdown,
            stats,
        })
    }

    /// Executor name (used as the worker thread name).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn stats(&self) -> &ExecutorStats {
        &self.stats
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn submit(&self, job: BoxedJob) -> Result<(), BoxedJob> {
        let guard = self.sender.lock();
        let Some(sender) = guard.as_ref() else {
            return Err(job);
        };
        self.stats.queued.fetch_add(1, Ordering::Relaxed);
        sender.send(job).map_err(|mpsc::error::SendError(job)| {
            self.stats.queued.fetch_sub(1, Ordering::Relaxed);
            job
        })
    }

    /// Queue an operation without waiting for it.
    ///
    /// Failures are logged by the worker. After shutdown the operation is
    /// dropped and logged.
    pub fn enqueue<F>(&self, label: &'static str, op: F)
    where
        F: FnOnce() -> Result<(), MessagingError> + Send + 'static,
    {
        if let Err(job) = self.submit(Box::new(FireJob { label, op })) {
            job.cancel();
        }
    }

    /// Queue an operation and wait for its result.
    ///
    /// # Errors
    ///
    /// Returns the operation's own error, or
    /// [`MessagingError::ExecutorShutdown`] if the executor shut down before
    /// the operation ran.
    pub async fn enqueue_and_await<T, F>(&self, op: F) -> Result<T, MessagingError>
    where
        F: FnOnce() -> Result<T, MessagingError> + Send + 'static,
        T: Send + 'static,
    {
        let (reply, result) = oneshot::channel();
        if let Err(job) = self.submit(Box::new(AwaitJob { op, reply })) {
            job.cancel();
        }
        result
            .await
            .unwrap_or(Err(MessagingError::ExecutorShutdown))
    }

    /// Stop accepting work. Jobs still queued are cancelled; a job already
    /// running completes.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.sender.lock().take();
        info!(executor = %self.name, "Serial executor shutting down");
    }
}

impl Drop for SerialExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    name: String,
    mut receiver: mpsc::UnboundedReceiver<BoxedJob>,
    shutdown: Arc<AtomicBool>,
    stats: Arc<ExecutorStats>,
) {
    while let Some(job) = receiver.blocking_recv() {
        stats.queued.fetch_sub(1, Ordering::Relaxed);
        if shutdown.load(Ordering::SeqCst) {
            job.cancel();
            stats.cancelled.fetch_add(1, Ordering::Relaxed);
        } else {
            job.run();
            stats.executed.fetch_add(1, Ordering::Relaxed);
        }
    }
    debug!(executor = %name, "Serial executor worker exited");
}
