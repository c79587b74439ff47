// src/pipeline/stats.rs
//
// Session aggregator. Equipment counts and workers-in-frame describe the
// current frame only; the violation count and frames processed accumulate
// until `reset`.

use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionStats {
    /// Track states alive in this session
    pub total_active_tracks: usize,
    /// Tracked persons in the current frame
    pub workers_in_frame: usize,
    /// Equipment kind -> detections in the current frame
    pub equipment_counts: BTreeMap<String, usize>,
    pub violation_count: u64,
    pub frames_processed: u64,
}

#[derive(Debug, Default)]
pub struct SessionAggregator {
    stats: SessionStats,
    pending: BTreeMap<String, usize>,
}

impl SessionAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_frame(&mut self) {
        self.pending.clear();
    }

    pub fn record_equipment(&mut self, kind: &str) {
        *self.pending.entry(kind.to_string()).or_insert(0) += 1;
    }

    pub fn record_violation(&mut self) {
        self.stats.violation_count += 1;
    }

    /// Publish the frame's counts. Until this is called, readers see the
    /// previous frame.
    pub fn finish_frame(&mut self, workers_in_frame: usize, active_tracks: usize) {
        self.stats.equipment_counts = std::mem::take(&mut self.pending);
        self.stats.workers_in_frame = workers_in_frame;
        self.stats.total_active_tracks = active_tracks;
        self.stats.frames_processed += 1;
    }

    pub fn snapshot(&self) -> SessionStats {
        self.stats.clone()
    }

    pub fn reset(&mut self) {
        self.stats = SessionStats::default();
        self.pending.clear();
    }
}
