//! Units of work accepted by the executor.

use shared_types::MessagingError;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tokio::sync::oneshot;
use tracing::warn;

/// A queued operation. Exactly one of `run` or `cancel` is called.
pub(crate) trait Job: Send {
    fn run(self: Box<Self>);
    fn cancel(self: Box<Self>);
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn run_guarded<T, F>(f: F) -> Result<T, MessagingError>
where
    F: FnOnce() -> Result<T, MessagingError>,
{
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        Err(MessagingError::Dispatch(format!(
            "channel operation panicked: {}",
            panic_message(payload)
        )))
    })
}

/// Fire-and-forget job. Failures are logged.
pub(crate) struct FireJob<F> {
    pub(crate) label: &'static str,
    pub(crate) op: F,
}

impl<F> Job for FireJob<F>
where
    F: FnOnce() -> Result<(), MessagingError> + Send,
{
    fn run(self: Box<Self>) {
        let FireJob { label, op } = *self;
        if let Err(e) = run_guarded(op) {
            warn!(operation = label, error = %e, "Fire-and-forget operation failed");
        }
    }

    fn cancel(self: Box<Self>) {
        warn!(operation = self.label, "Operation dropped: executor shut down");
    }
}

/// Job whose result is delivered to a waiting caller.
pub(crate) struct AwaitJob<F, T> {
    pub(crate) op: F,
    pub(crate) reply: oneshot::Sender<Result<T, MessagingError>>,
}

impl<F, T> Job for AwaitJob<F, T>
where
    F: FnOnce() -> Result<T, MessagingError> + Send,
    T: Send,
{
    fn run(self: Box<Self>) {
        let AwaitJob { op, reply } = *self;
        // Caller may have stopped waiting.
        let _ = reply.send(run_guarded(op));
    }

    fn cancel(self: Box<Self>) {
        let AwaitJob { reply, .. } = *self;
        let _ = reply.send(Err(MessagingError::ExecutorShutdown));
    }
}
