//! Deadline enforcement for whole-document and single-page work.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    #[error("operation did not finish within {}s", .duration.as_secs_f64())]
    Elapsed { duration: Duration },

    #[error("operation crashed: {0}")]
    Crashed(String),
}

/// Runs `fut` on its own task and waits at most `duration` for it.
///
/// On expiry, or if this future is dropped, the task is aborted; on expiry the
/// caller gets [`GuardError::Elapsed`] right away. Abort only lands at the task's next await point, so blocking work
/// it started (a `spawn_blocking` decode, a child process) may keep a thread
/// busy until it finishes on its own; its result is dropped.
pub async fn with_timeout<T, F>(duration: Duration, fut: F) -> Result<T, GuardError>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let mut guard = AbortOnDrop(tokio::spawn(fut));

    match tokio::time::timeout(duration, &mut guard.0).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(join_err)) => Err(GuardError::Crashed(join_err.to_string())),
        Err(_) => Err(GuardError::Elapsed { duration }),
    }
}

/// Join handle that aborts its task when dropped, so abandoning the waiter
/// also abandons the work.
pub(crate) struct AbortOnDrop<T>(pub(crate) JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}
