// src/pipeline/event_bus.rs
//
// Bounded queue of identity and violation events. The session publishes
// while processing a frame and drains into that frame's report.

use crate::identity::{IdentityId, SignatureKind};
use crate::persistence::ViolationEvent;
use serde::Serialize;
use std::collections::{BTreeSet, VecDeque};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    IdentityRegistered {
        track_id: u32,
        identity_id: IdentityId,
        kind: SignatureKind,
    },
    IdentityResolved {
        track_id: u32,
        identity_id: IdentityId,
        kind: SignatureKind,
    },
    SignatureAttached {
        track_id: u32,
        identity_id: IdentityId,
        kind: SignatureKind,
    },
    RegistrationFailed {
        track_id: u32,
        kind: SignatureKind,
        failures: u32,
        error: String,
    },
    ViolationLogged(ViolationEvent),
    ViolationDeferred {
        track_id: u32,
        missing: BTreeSet<String>,
        error: String,
    },
    SessionReset {
        epoch: u64,
    },
}

pub struct EventBus {
    events: VecDeque<PipelineEvent>,
    max_pending: usize,
}

impl EventBus {
    pub fn new(max_pending: usize) -> Self {
        let max_pending = max_pending.max(1);
        Self {
            events: VecDeque::with_capacity(max_pending),
            max_pending,
        }
    }

    pub fn publish(&mut self, event: PipelineEvent) {
        if self.events.len() >= self.max_pending {
            warn!(
                "Event bus full ({} events), dropping oldest",
                self.max_pending
            );
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    pub fn drain(&mut self) -> Vec<PipelineEvent> {
        self.events.drain(..).collect()
    }

    pub fn pending_count(&self) -> usize {
        self.events.len()
    }
}
