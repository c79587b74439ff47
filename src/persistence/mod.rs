// src/persistence/mod.rs
//
// Durable storage of worker identities and violation records, plus the
// evidence images both refer to. The frame loop only sees the traits;
// a store being unavailable is an ordinary `Err` it must survive.

pub mod evidence;
pub mod memory;
pub mod sqlite;

pub use evidence::{DiskEvidenceSink, EvidenceCategory, EvidenceSink, MemoryEvidenceSink};
pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

use crate::identity::{Identity, IdentityId, Signature, SignatureKind};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Registration request. The store assigns the id.
#[derive(Debug, Clone)]
pub struct NewIdentity {
    pub kind: SignatureKind,
    pub signature: Signature,
    pub evidence_ref: String,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewViolation {
    pub identity_id: IdentityId,
    pub track_id: u32,
    pub equipped_items: BTreeSet<String>,
    pub violated_items: BTreeSet<String>,
    pub evidence_ref: String,
    pub timestamp: DateTime<Utc>,
}

/// Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViolationEvent {
    pub id: String,
    pub identity_id: IdentityId,
    pub display_name: Option<String>,
    pub track_id: u32,
    pub equipped_items: BTreeSet<String>,
    pub violated_items: BTreeSet<String>,
    pub evidence_ref: String,
    pub timestamp: DateTime<Utc>,
}

impl ViolationEvent {
    pub fn from_new(id: String, display_name: Option<String>, new: NewViolation) -> Self {
        Self {
            id,
            identity_id: new.identity_id,
            display_name,
            track_id: new.track_id,
            equipped_items: new.equipped_items,
            violated_items: new.violated_items,
            evidence_ref: new.evidence_ref,
            timestamp: new.timestamp,
        }
    }
}

pub trait PersistenceStore: Send + Sync {
    /// Persist a new identity and return it with its assigned id.
    fn register_identity(&self, new: NewIdentity) -> Result<Identity>;

    /// Store `signature` as the identity's `kind` signature unless one is
    /// already present. Ok(false) means nothing was written.
    fn attach_signature(
        &self,
        id: &IdentityId,
        kind: SignatureKind,
        signature: &Signature,
    ) -> Result<bool>;

    fn log_violation(&self, violation: NewViolation) -> Result<ViolationEvent>;

    /// Violations at or after `since`, newest first.
    fn list_recent_violations(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ViolationEvent>>;

    /// All identities in creation order.
    fn list_identities(&self) -> Result<Vec<Identity>>;
}

pub(crate) fn default_display_name(id: &IdentityId) -> String {
    format!("Worker {}", id.short())
}
