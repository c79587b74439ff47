// src/identity/registry.rs
//
// Global identity registry. The only cross-track shared mutable state in
// the pipeline. Lookup and enrollment happen under one lock so two tracks
// of the same person in one frame cannot both register.

use super::{Identity, IdentityId, Signature, SignatureKind};
use crate::persistence::{NewIdentity, PersistenceStore};
use anyhow::{Context, Result};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq)]
pub enum RegistryResolution {
    Matched { id: IdentityId, similarity: f32 },
    Registered { id: IdentityId },
}

impl RegistryResolution {
    pub fn id(&self) -> &IdentityId {
        match self {
            Self::Matched { id, .. } | Self::Registered { id } => id,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Self::Registered { .. })
    }
}

pub struct IdentityRegistry {
    // Insertion order is the first-seen tie-break.
    identities: Mutex<Vec<Identity>>,
    store: Arc<dyn PersistenceStore>,
}

impl IdentityRegistry {
    pub fn new(store: Arc<dyn PersistenceStore>) -> Self {
        Self {
            identities: Mutex::new(Vec::new()),
            store,
        }
    }

    /// Warm start from every identity the store already knows.
    pub fn load(store: Arc<dyn PersistenceStore>) -> Result<Self> {
        let identities = store
            .list_identities()
            .context("Failed to load identities")?;
        info!("🗂️  Registry loaded {} identities", identities.len());
        Ok(Self {
            identities: Mutex::new(identities),
            store,
        })
    }

    pub fn store(&self) -> &Arc<dyn PersistenceStore> {
        &self.store
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn get(&self, id: &IdentityId) -> Option<Identity> {
        self.lock().iter().find(|i| &i.id == id).cloned()
    }

    /// Best identity whose `kind` signature is strictly more similar than
    /// `threshold`. Candidates of another dimension are skipped.
    pub fn find_match(
        &self,
        signature: &Signature,
        kind: SignatureKind,
        threshold: f32,
    ) -> Option<IdentityId> {
        best_match(&self.lock(), signature, kind, threshold).map(|(id, _)| id)
    }

    /// Enroll a new identity. Persisted before it becomes visible.
    pub fn register(
        &self,
        signature: Signature,
        kind: SignatureKind,
        evidence_ref: String,
        display_name: Option<String>,
    ) -> Result<IdentityId> {
        let mut identities = self.lock();
        self.register_locked(&mut identities, signature, kind, evidence_ref, display_name)
    }

    /// `find_match` and, on a miss, `register`, as one atomic unit.
    /// `evidence` runs only when a new identity is about to be stored.
    pub fn resolve_or_register<F>(
        &self,
        signature: Signature,
        kind: SignatureKind,
        threshold: f32,
        evidence: F,
    ) -> Result<RegistryResolution>
    where
        F: FnOnce() -> Result<String>,
    {
        let mut identities = self.lock();
        if let Some((id, similarity)) = best_match(&identities, &signature, kind, threshold) {
            debug!("{} match {} (sim {:.3})", kind, id.short(), similarity);
            return Ok(RegistryResolution::Matched { id, similarity });
        }
        let evidence_ref = evidence().context("Failed to store registration evidence")?;
        let id = self.register_locked(&mut identities, signature, kind, evidence_ref, None)?;
        Ok(RegistryResolution::Registered { id })
    }

    /// Add the missing signature kind. Ok(false) if it was already set, or
    /// if the signature matches another identity above `threshold`.
    pub fn attach_signature(
        &self,
        id: &IdentityId,
        signature: Signature,
        kind: SignatureKind,
        threshold: f32,
    ) -> Result<bool> {
        let mut identities = self.lock();
        if let Some((other, similarity)) = best_match(&identities, &signature, kind, threshold) {
            if &other != id {
                debug!(
                    "{} signature for {} matches {} (sim {:.3}), not attached",
                    kind,
                    id.short(),
                    other.short(),
                    similarity
                );
                return Ok(false);
            }
        }
        let Some(identity) = identities.iter_mut().find(|i| &i.id == id) else {
            anyhow::bail!("unknown identity {}", id);
        };
        if identity.has_signature(kind) {
            return Ok(false);
        }
        if !self.store.attach_signature(id, kind, &signature)? {
            return Ok(false);
        }
        identity.attach(kind, signature);
        info!("🔗 Attached {} signature to {}", kind, id.short());
        Ok(true)
    }

    fn register_locked(
        &self,
        identities: &mut Vec<Identity>,
        signature: Signature,
        kind: SignatureKind,
        evidence_ref: String,
        display_name: Option<String>,
    ) -> Result<IdentityId> {
        let identity = self
            .store
            .register_identity(NewIdentity {
                kind,
                signature,
                evidence_ref,
                display_name,
            })
            .context("Failed to persist new identity")?;
        let id = identity.id.clone();
        info!(
            "🆕 Registered {} ({} signature, {} total)",
            identity.display_name,
            kind,
            identities.len() + 1
        );
        identities.push(identity);
        Ok(id)
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Identity>> {
        self.identities.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn best_match(
    identities: &[Identity],
    signature: &Signature,
    kind: SignatureKind,
    threshold: f32,
) -> Option<(IdentityId, f32)> {
    let mut best: Option<(&Identity, f32)> = None;
    for identity in identities {
        let Some(stored) = identity.signature(kind) else {
            continue;
        };
        let Some(similarity) = signature.cosine_similarity(stored) else {
            continue;
        };
        if similarity <= threshold {
            continue;
        }
        // Strictly greater keeps the earlier identity on exact ties.
        if best.map_or(true, |(_, s)| similarity > s) {
            best = Some((identity, similarity));
        }
    }
    best.map(|(identity, similarity)| (identity.id.clone(), similarity))
}
