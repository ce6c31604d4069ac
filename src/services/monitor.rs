//! System load sampling.
//!
//! `LoadState` holds the only cross-cutting mutable state of the pipeline: the
//! latest [`LoadSample`] and the current page-pool capacity. Both sit behind a
//! single lock that is held only for a copy in or out.

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::System;
use tokio_util::sync::CancellationToken;

use crate::models::load::LoadSample;
use crate::services::pool::AdaptiveWorkerPool;

#[derive(Debug, Clone, Copy)]
struct Snapshot {
    sample: LoadSample,
    capacity: usize,
}

/// Lock-guarded load reading and pool size.
#[derive(Debug)]
pub struct LoadState {
    inner: RwLock<Snapshot>,
}

impl LoadState {
    pub fn new(initial_capacity: usize) -> Self {
        Self {
            inner: RwLock::new(Snapshot {
                sample: LoadSample::idle(),
                capacity: initial_capacity.max(1),
            }),
        }
    }

    /// Last recorded sample. Never blocks on sampling.
    pub fn current(&self) -> LoadSample {
        self.inner.read().sample
    }

    pub fn record(&self, sample: LoadSample) {
        self.inner.write().sample = sample;
    }

    pub fn capacity(&self) -> usize {
        self.inner.read().capacity
    }

    /// Applies `f` to the current sample and capacity under one write lock and
    /// stores the returned capacity. Returns `(previous, new)`.
    pub fn update_capacity(&self, f: impl FnOnce(&LoadSample, usize) -> usize) -> (usize, usize) {
        let mut guard = self.inner.write();
        let previous = guard.capacity;
        let next = f(&guard.sample, previous).max(1);
        guard.capacity = next;
        (previous, next)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("memory totals unavailable from the operating system")]
    MemoryUnavailable,

    #[error("load sampling failed: {0}")]
    Sampling(String),
}

/// Source of load readings.
pub trait LoadSampler: Send + 'static {
    fn sample(&mut self) -> Result<LoadSample, MonitorError>;
}

/// Reads global CPU and memory utilization through `sysinfo`.
pub struct SysinfoSampler {
    system: System,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        // CPU usage is a delta between two refreshes; prime the first one.
        system.refresh_cpu_usage();
        Self { system }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadSampler for SysinfoSampler {
    fn sample(&mut self) -> Result<LoadSample, MonitorError> {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();

        let total = self.system.total_memory();
        if total == 0 {
            return Err(MonitorError::MemoryUnavailable);
        }
        let memory_percent = self.system.used_memory() as f64 / total as f64 * 100.0;

        Ok(LoadSample::new(
            self.system.global_cpu_usage(),
            memory_percent as f32,
        ))
    }
}

/// Periodically samples load, publishes it, and lets the pool rescale once per tick.
pub struct ResourceMonitor<S: LoadSampler> {
    sampler: S,
    interval: Duration,
}

impl<S: LoadSampler> ResourceMonitor<S> {
    pub fn new(sampler: S, interval: Duration) -> Self {
        Self { sampler, interval }
    }

    /// One sampling step. Failures are logged and leave the previous sample in place.
    pub fn tick(&mut self, load: &LoadState, pool: &AdaptiveWorkerPool) -> Option<LoadSample> {
        match self.sampler.sample() {
            Ok(sample) => {
                load.record(sample);
                metrics::gauge!("system_cpu_percent").set(sample.cpu_percent as f64);
                metrics::gauge!("system_memory_percent").set(sample.memory_percent as f64);
                tracing::debug!(
                    cpu = sample.cpu_percent,
                    memory = sample.memory_percent,
                    "Load sampled"
                );
                pool.rescale();
                Some(sample)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Load sampling failed, keeping previous sample");
                None
            }
        }
    }

    /// Runs until `shutdown` is cancelled.
    pub async fn run(
        mut self,
        load: Arc<LoadState>,
        pool: Arc<AdaptiveWorkerPool>,
        shutdown: CancellationToken,
    ) {
        tracing::info!(interval_ms = self.interval.as_millis() as u64, "Resource monitor started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick(&load, &pool);
                }
            }
        }
        tracing::info!("Resource monitor stopped");
    }
}
