use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One CPU/memory utilization reading. Both percentages are clamped to [0, 100].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct LoadSample {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub sampled_at: DateTime<Utc>,
}

impl LoadSample {
    pub fn new(cpu_percent: f32, memory_percent: f32) -> Self {
        Self::at(cpu_percent, memory_percent, Utc::now())
    }

    pub fn at(cpu_percent: f32, memory_percent: f32, sampled_at: DateTime<Utc>) -> Self {
        Self {
            cpu_percent: clamp_percent(cpu_percent),
            memory_percent: clamp_percent(memory_percent),
            sampled_at,
        }
    }

    /// Placeholder reading used before the first sample lands.
    pub fn idle() -> Self {
        Self::new(0.0, 0.0)
    }
}

fn clamp_percent(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 100.0)
    }
}

/// Load thresholds driving admission, pool sizing and resolution escalation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Watermark {
    pub high_percent: f32,
}

/// Fraction of the watermark below which the pool may grow.
pub const GROW_FRACTION: f32 = 0.7;

/// Fraction of the watermark below which a page may be re-rendered at higher resolution.
pub const ESCALATE_FRACTION: f32 = 0.8;

impl Watermark {
    pub fn new(high_percent: f32) -> Self {
        Self { high_percent }
    }

    /// CPU or memory above the watermark.
    pub fn is_exceeded(&self, sample: &LoadSample) -> bool {
        sample.cpu_percent > self.high_percent || sample.memory_percent > self.high_percent
    }

    /// Both CPU and memory strictly below `fraction` of the watermark.
    pub fn is_below(&self, sample: &LoadSample, fraction: f32) -> bool {
        let limit = self.high_percent * fraction;
        sample.cpu_percent < limit && sample.memory_percent < limit
    }
}

impl Default for Watermark {
    fn default() -> Self {
        Self::new(85.0)
    }
}

/// Snapshot returned by the load-query operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStats {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub sampled_at: DateTime<Utc>,
    pub high_watermark: f32,
    pub overloaded: bool,
    pub queue_depth: usize,
    pub job_workers: usize,
    pub pool_capacity: usize,
    pub hardware_limit: usize,
    pub active_page_workers: usize,
    pub jobs: JobCounts,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobCounts {
    pub queued: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_is_clamped() {
        let s = LoadSample::new(140.0, -3.0);
        assert_eq!(s.cpu_percent, 100.0);
        assert_eq!(s.memory_percent, 0.0);
        assert_eq!(LoadSample::new(f32::NAN, 50.0).cpu_percent, 0.0);
    }

    #[test]
    fn test_watermark_bands() {
        let wm = Watermark::new(80.0);
        assert!(wm.is_exceeded(&LoadSample::new(81.0, 10.0)));
        assert!(wm.is_exceeded(&LoadSample::new(10.0, 81.0)));
        assert!(!wm.is_exceeded(&LoadSample::new(80.0, 80.0)));

        assert!(wm.is_below(&LoadSample::new(55.0, 55.0), GROW_FRACTION));
        assert!(!wm.is_below(&LoadSample::new(56.0, 10.0), GROW_FRACTION));
        assert!(wm.is_below(&LoadSample::new(63.0, 63.0), ESCALATE_FRACTION));
    }
}
