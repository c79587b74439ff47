// src/track_state.rs
//
// Per-track mutable state, keyed by the tracker's short-lived id. Lives for
// one session only. Persons of one frame can be processed in parallel by
// checking their states out of the store and back in afterwards.

use crate::identity::IdentityId;
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionPhase {
    Unresolved,
    FaceMatchAttempted,
    AppearanceMatchAttempted,
    Resolved,
}

impl ResolutionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unresolved => "unresolved",
            Self::FaceMatchAttempted => "face_attempted",
            Self::AppearanceMatchAttempted => "appearance_attempted",
            Self::Resolved => "resolved",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrackState {
    pub track_id: u32,
    resolved_identity: Option<IdentityId>,
    pub frames_seen: u32,
    violation_logged: bool,
    pub phase: ResolutionPhase,
    /// Pending matches for the confirmation policy
    pub ballot: Vec<IdentityId>,
    pub registration_failures: u32,
    /// No registration attempt before this track-local frame count
    pub retry_after_frame: u32,
    /// The missing signature kind was already attached for this track
    pub enriched: bool,
}

impl TrackState {
    pub fn new(track_id: u32) -> Self {
        Self {
            track_id,
            resolved_identity: None,
            frames_seen: 0,
            violation_logged: false,
            phase: ResolutionPhase::Unresolved,
            ballot: Vec::new(),
            registration_failures: 0,
            retry_after_frame: 0,
            enriched: false,
        }
    }

    pub fn resolved_identity(&self) -> Option<&IdentityId> {
        self.resolved_identity.as_ref()
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved_identity.is_some()
    }

    /// Bind the track to `id`. A track that is already resolved keeps its
    /// identity; returns false in that case.
    pub fn resolve(&mut self, id: IdentityId) -> bool {
        if self.resolved_identity.is_some() {
            return false;
        }
        self.resolved_identity = Some(id);
        self.phase = ResolutionPhase::Resolved;
        self.ballot.clear();
        true
    }

    pub fn violation_logged(&self) -> bool {
        self.violation_logged
    }

    /// One-way. Only called after a violation was persisted.
    pub fn mark_violation_logged(&mut self) {
        self.violation_logged = true;
    }
}

#[derive(Debug, Default)]
pub struct TrackStateStore {
    tracks: HashMap<u32, TrackState>,
}

impl TrackStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&mut self, track_id: u32) -> &mut TrackState {
        self.tracks
            .entry(track_id)
            .or_insert_with(|| TrackState::new(track_id))
    }

    pub fn get(&self, track_id: u32) -> Option<&TrackState> {
        self.tracks.get(&track_id)
    }

    /// Take the state out for exclusive processing. Creates it if missing.
    pub fn checkout(&mut self, track_id: u32) -> TrackState {
        self.tracks
            .remove(&track_id)
            .unwrap_or_else(|| TrackState::new(track_id))
    }

    pub fn checkin(&mut self, state: TrackState) {
        self.tracks.insert(state.track_id, state);
    }

    pub fn reset(&mut self) {
        self.tracks.clear();
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn resolved_count(&self) -> usize {
        self.tracks.values().filter(|t| t.is_resolved()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_or_create_defaults() {
        let mut store = TrackStateStore::new();
        let state = store.get_or_create(4);
        assert_eq!(state.track_id, 4);
        assert!(state.resolved_identity().is_none());
        assert_eq!(state.frames_seen, 0);
        assert!(!state.violation_logged());
        assert_eq!(state.phase, ResolutionPhase::Unresolved);
    }

    #[test]
    fn test_resolution_is_immutable() {
        let mut state = TrackState::new(1);
        assert!(state.resolve(IdentityId::new("a")));
        assert!(!state.resolve(IdentityId::new("b")));
        assert_eq!(state.resolved_identity(), Some(&IdentityId::new("a")));
        assert_eq!(state.phase, ResolutionPhase::Resolved);
    }

    #[test]
    fn test_reset_clears_reused_track_id() {
        let mut store = TrackStateStore::new();
        {
            let state = store.get_or_create(9);
            state.frames_seen = 40;
            state.resolve(IdentityId::new("a"));
            state.mark_violation_logged();
        }
        assert_eq!(store.resolved_count(), 1);

        store.reset();
        assert!(store.is_empty());

        let state = store.get_or_create(9);
        assert!(!state.is_resolved());
        assert_eq!(state.frames_seen, 0);
        assert!(!state.violation_logged());
    }

    #[test]
    fn test_checkout_checkin_roundtrip() {
        let mut store = TrackStateStore::new();
        store.get_or_create(2).frames_seen = 5;

        let mut state = store.checkout(2);
        assert!(store.get(2).is_none());
        state.frames_seen += 1;
        store.checkin(state);

        assert_eq!(store.get(2).map(|s| s.frames_seen), Some(6));

        let fresh = store.checkout(3);
        assert_eq!(fresh.frames_seen, 0);
        store.checkin(fresh);
        assert_eq!(store.len(), 2);
    }
}
