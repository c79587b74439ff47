// src/detection/tracker.rs
//
// Greedy IoU tracker for person boxes, for detector output that carries
// no track ids of its own. Tracks coast through short detection gaps and
// are pruned after `max_coast_frames` misses. Ids are never reused until
// `reset`.

use crate::geometry::iou;
use crate::types::{BBox, PersonTrackerConfig};
use tracing::debug;

#[derive(Debug, Clone)]
struct Track {
    id: u32,
    bbox: BBox,
    frames_since_hit: u32,
}

pub struct PersonTracker {
    config: PersonTrackerConfig,
    tracks: Vec<Track>,
    next_id: u32,
}

impl PersonTracker {
    pub fn new(config: PersonTrackerConfig) -> Self {
        Self {
            config,
            tracks: Vec::with_capacity(32),
            next_id: 1,
        }
    }

    /// Assign a track id to each box, in input order.
    pub fn update(&mut self, boxes: &[BBox]) -> Vec<u32> {
        let mut matched_tracks = vec![false; self.tracks.len()];
        let mut assigned: Vec<Option<u32>> = vec![None; boxes.len()];

        let mut pairs: Vec<(usize, usize, f32)> = Vec::new();
        for (ti, track) in self.tracks.iter().enumerate() {
            for (di, b) in boxes.iter().enumerate() {
                let score = iou(&track.bbox, b);
                if score >= self.config.min_iou {
                    pairs.push((ti, di, score));
                }
            }
        }
        pairs.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));

        for (ti, di, _) in pairs {
            if matched_tracks[ti] || assigned[di].is_some() {
                continue;
            }
            matched_tracks[ti] = true;
            let track = &mut self.tracks[ti];
            track.bbox = boxes[di];
            track.frames_since_hit = 0;
            assigned[di] = Some(track.id);
        }

        for (ti, track) in self.tracks.iter_mut().enumerate() {
            if !matched_tracks[ti] {
                track.frames_since_hit += 1;
            }
        }

        let ids = assigned
            .into_iter()
            .zip(boxes.iter())
            .map(|(id, b)| match id {
                Some(id) => id,
                None => {
                    let id = self.next_id;
                    self.next_id = self.next_id.wrapping_add(1).max(1);
                    self.tracks.push(Track {
                        id,
                        bbox: *b,
                        frames_since_hit: 0,
                    });
                    id
                }
            })
            .collect();

        let max_coast = self.config.max_coast_frames;
        self.tracks.retain(|t| {
            if t.frames_since_hit > max_coast {
                debug!("Person track {} pruned (coasted {} frames)", t.id, t.frames_since_hit);
                return false;
            }
            true
        });

        ids
    }

    pub fn active_tracks(&self) -> usize {
        self.tracks.len()
    }

    pub fn reset(&mut self) {
        self.tracks.clear();
        self.next_id = 1;
    }
}
