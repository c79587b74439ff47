// src/pipeline/metrics.rs
//
// Frame-loop counters and stage timings. Cloning shares the counters, so
// the runner and the CLI can read what the loop thread writes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct PipelineMetrics {
    pub total_frames: Arc<AtomicU64>,
    pub frames_processed: Arc<AtomicU64>,
    pub frames_skipped: Arc<AtomicU64>,
    pub detector_errors: Arc<AtomicU64>,
    pub persons_processed: Arc<AtomicU64>,
    pub crops_dropped: Arc<AtomicU64>,
    pub identities_registered: Arc<AtomicU64>,
    pub identities_matched: Arc<AtomicU64>,
    pub registration_failures: Arc<AtomicU64>,
    pub violations_logged: Arc<AtomicU64>,
    pub violations_deferred: Arc<AtomicU64>,
    pub detection_time_us: Arc<AtomicU64>,
    pub persons_time_us: Arc<AtomicU64>,
    pub started_at: Instant,
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            total_frames: Arc::new(AtomicU64::new(0)),
            frames_processed: Arc::new(AtomicU64::new(0)),
            frames_skipped: Arc::new(AtomicU64::new(0)),
            detector_errors: Arc::new(AtomicU64::new(0)),
            persons_processed: Arc::new(AtomicU64::new(0)),
            crops_dropped: Arc::new(AtomicU64::new(0)),
            identities_registered: Arc::new(AtomicU64::new(0)),
            identities_matched: Arc::new(AtomicU64::new(0)),
            registration_failures: Arc::new(AtomicU64::new(0)),
            violations_logged: Arc::new(AtomicU64::new(0)),
            violations_deferred: Arc::new(AtomicU64::new(0)),
            detection_time_us: Arc::new(AtomicU64::new(0)),
            persons_time_us: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }

    pub fn inc(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn set_timing(&self, counter: &AtomicU64, duration_us: u64) {
        counter.store(duration_us, Ordering::Relaxed);
    }

    pub fn fps(&self) -> f64 {
        let frames = self.frames_processed.load(Ordering::Relaxed);
        let elapsed = self.started_at.elapsed().as_secs_f64();
        if elapsed > 0.01 {
            frames as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            total_frames: self.total_frames.load(Ordering::Relaxed),
            frames_processed: self.frames_processed.load(Ordering::Relaxed),
            frames_skipped: self.frames_skipped.load(Ordering::Relaxed),
            detector_errors: self.detector_errors.load(Ordering::Relaxed),
            fps: self.fps(),
            persons_processed: self.persons_processed.load(Ordering::Relaxed),
            crops_dropped: self.crops_dropped.load(Ordering::Relaxed),
            identities_registered: self.identities_registered.load(Ordering::Relaxed),
            identities_matched: self.identities_matched.load(Ordering::Relaxed),
            registration_failures: self.registration_failures.load(Ordering::Relaxed),
            violations_logged: self.violations_logged.load(Ordering::Relaxed),
            violations_deferred: self.violations_deferred.load(Ordering::Relaxed),
            last_detection_us: self.detection_time_us.load(Ordering::Relaxed),
            last_persons_us: self.persons_time_us.load(Ordering::Relaxed),
            elapsed_secs: self.started_at.elapsed().as_secs_f64(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSummary {
    pub total_frames: u64,
    pub frames_processed: u64,
    pub frames_skipped: u64,
    pub detector_errors: u64,
    pub fps: f64,
    pub persons_processed: u64,
    pub crops_dropped: u64,
    pub identities_registered: u64,
    pub identities_matched: u64,
    pub registration_failures: u64,
    pub violations_logged: u64,
    pub violations_deferred: u64,
    pub last_detection_us: u64,
    pub last_persons_us: u64,
    pub elapsed_secs: f64,
}
