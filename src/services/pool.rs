//! Adaptive page-level worker pool.

use futures::stream::{FuturesUnordered, StreamExt};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinError;

use crate::models::load::{LoadSample, Watermark, GROW_FRACTION};
use crate::services::monitor::LoadState;
use crate::services::timeout::AbortOnDrop;

/// Next pool size for the given load.
///
/// Above the watermark the pool halves (floor 1); below 70% of it the pool
/// grows by one (cap `hardware_limit`); in between it holds.
pub fn desired_capacity(
    load: &LoadSample,
    current: usize,
    hardware_limit: usize,
    watermark: &Watermark,
) -> usize {
    let limit = hardware_limit.max(1);
    let current = current.clamp(1, limit);

    if watermark.is_exceeded(load) {
        (current / 2).max(1)
    } else if watermark.is_below(load, GROW_FRACTION) {
        (current + 1).min(limit)
    } else {
        current
    }
}

/// Bounded pool of page execution slots whose size follows system load.
///
/// Size changes only happen in [`rescale`](Self::rescale), once per monitor
/// tick; batches read the size at dispatch and keep it until they finish.
pub struct AdaptiveWorkerPool {
    load: Arc<LoadState>,
    watermark: Watermark,
    hardware_limit: usize,
    active: Arc<AtomicUsize>,
}

impl AdaptiveWorkerPool {
    pub fn new(load: Arc<LoadState>, watermark: Watermark, hardware_limit: usize) -> Self {
        Self {
            load,
            watermark,
            hardware_limit: hardware_limit.max(1),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.load.capacity()
    }

    pub fn hardware_limit(&self) -> usize {
        self.hardware_limit
    }

    pub fn watermark(&self) -> Watermark {
        self.watermark
    }

    /// Page tasks currently executing.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Whether the latest sample is above the watermark.
    pub fn is_overloaded(&self) -> bool {
        self.watermark.is_exceeded(&self.load.current())
    }

    /// Recomputes capacity from the latest sample. Returns the new capacity.
    pub fn rescale(&self) -> usize {
        let (previous, next) = self.load.update_capacity(|sample, current| {
            desired_capacity(sample, current, self.hardware_limit, &self.watermark)
        });
        if previous != next {
            tracing::info!(from = previous, to = next, "Page pool resized");
        }
        metrics::gauge!("extraction_pool_capacity").set(next as f64);
        next
    }

    /// Runs `work` over every task with at most `capacity` in flight and waits
    /// for all of them.
    ///
    /// Returns one `(slot, result)` per task in completion order. A failing or
    /// panicking task only produces an error in its own slot. Dropping the
    /// returned future aborts the tasks still running.
    pub async fn submit_batch<T, R, E, F, Fut>(
        &self,
        tasks: Vec<T>,
        capacity: usize,
        work: F,
    ) -> Vec<(usize, Result<R, E>)>
    where
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
        R: Send + 'static,
        E: From<JoinError> + Send + 'static,
    {
        let slots = Arc::new(Semaphore::new(capacity.clamp(1, self.hardware_limit)));
        let mut running = FuturesUnordered::new();

        for (slot, task) in tasks.into_iter().enumerate() {
            let fut = work(task);
            let slots = slots.clone();
            let active = self.active.clone();
            let mut handle = AbortOnDrop(tokio::spawn(async move {
                // The semaphore is never closed.
                let _permit = slots.acquire_owned().await.ok();
                let _guard = ActiveGuard::enter(active);
                fut.await
            }));
            running.push(async move {
                let result = match (&mut handle.0).await {
                    Ok(result) => result,
                    Err(join_err) => Err(E::from(join_err)),
                };
                (slot, result)
            });
        }

        let mut outcomes = Vec::with_capacity(running.len());
        while let Some(outcome) = running.next().await {
            outcomes.push(outcome);
        }
        outcomes
    }
}

/// Counts a task as active for as long as it is alive, including on panic.
struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn enter(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
