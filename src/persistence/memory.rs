// src/persistence/memory.rs
//
// Process-local store. Used by tests and by `run --no-db`; can be taken
// offline to exercise the outage paths of the frame loop.

use super::{default_display_name, NewIdentity, NewViolation, PersistenceStore, ViolationEvent};
use crate::identity::{Identity, IdentityId, Signature, SignatureKind};
use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct Tables {
    identities: Vec<Identity>,
    violations: Vec<ViolationEvent>,
}

#[derive(Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
    offline: AtomicBool,
    next_id: AtomicU64,
    write_attempts: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline every operation fails.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn identity_count(&self) -> usize {
        self.lock().identities.len()
    }

    pub fn violation_count(&self) -> usize {
        self.lock().violations.len()
    }

    /// Writes attempted, including ones rejected while offline.
    pub fn write_attempts(&self) -> u64 {
        self.write_attempts.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            bail!("store offline");
        }
        Ok(())
    }

    fn next_id(&self, prefix: &str) -> String {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}-{:06}", prefix, n)
    }
}

impl PersistenceStore for InMemoryStore {
    fn register_identity(&self, new: NewIdentity) -> Result<Identity> {
        self.write_attempts.fetch_add(1, Ordering::SeqCst);
        self.ensure_online()?;

        let id = IdentityId::new(self.next_id("w"));
        let display_name = new
            .display_name
            .unwrap_or_else(|| default_display_name(&id));
        let identity = Identity::new(
            id,
            new.kind,
            new.signature,
            display_name,
            new.evidence_ref,
            Utc::now(),
        );
        self.lock().identities.push(identity.clone());
        Ok(identity)
    }

    fn attach_signature(
        &self,
        id: &IdentityId,
        kind: SignatureKind,
        signature: &Signature,
    ) -> Result<bool> {
        self.write_attempts.fetch_add(1, Ordering::SeqCst);
        self.ensure_online()?;

        let mut tables = self.lock();
        let identity = tables
            .identities
            .iter_mut()
            .find(|i| &i.id == id)
            .ok_or_else(|| anyhow!("unknown identity {}", id))?;
        Ok(identity.attach(kind, signature.clone()))
    }

    fn log_violation(&self, violation: NewViolation) -> Result<ViolationEvent> {
        self.write_attempts.fetch_add(1, Ordering::SeqCst);
        self.ensure_online()?;

        let mut tables = self.lock();
        let display_name = tables
            .identities
            .iter()
            .find(|i| i.id == violation.identity_id)
            .map(|i| i.display_name.clone());
        let event = ViolationEvent::from_new(self.next_id("v"), display_name, violation);
        tables.violations.push(event.clone());
        Ok(event)
    }

    fn list_recent_violations(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ViolationEvent>> {
        self.ensure_online()?;
        let tables = self.lock();
        Ok(tables
            .violations
            .iter()
            .rev()
            .filter(|v| v.timestamp >= since)
            .take(limit)
            .cloned()
            .collect())
    }

    fn list_identities(&self) -> Result<Vec<Identity>> {
        self.ensure_online()?;
        Ok(self.lock().identities.clone())
    }
}
