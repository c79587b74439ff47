// src/identity/mod.rs
//
// Durable worker identities and the per-track resolution that maps a
// short-lived tracker id onto one of them.
//
//   person crop → resolver ─┬→ face signature ───────┐
//                           └→ appearance (patience) ┴→ registry (find | register) → IdentityId
//
// confirmation.rs decides when a registry match is committed.

pub mod confirmation;
pub mod registry;
pub mod resolver;

pub use confirmation::{policy_from_config, ConfirmationPolicy, ImmediateCommit, MajorityVote};
pub use registry::{IdentityRegistry, RegistryResolution};
pub use resolver::{IdentityResolver, ResolutionOutcome};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque identity token. Storage decides the representation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityId(String);

impl IdentityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 8 characters, for log lines and default display names.
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(8) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        }
    }
}

impl std::fmt::Display for IdentityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureKind {
    Face,
    Appearance,
}

impl SignatureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Face => "face",
            Self::Appearance => "appearance",
        }
    }

    pub fn other(&self) -> Self {
        match self {
            Self::Face => Self::Appearance,
            Self::Appearance => Self::Face,
        }
    }
}

impl std::fmt::Display for SignatureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Fixed-length embedding vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Signature(Vec<f32>);

impl Signature {
    pub fn new(values: Vec<f32>) -> Self {
        Self(values)
    }

    /// Scale to unit L2 norm. Zero vectors are returned unchanged.
    pub fn normalized(values: Vec<f32>) -> Self {
        let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 1e-12 {
            Self(values.into_iter().map(|v| v / norm).collect())
        } else {
            Self(values)
        }
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Cosine similarity. None when dimensions differ or either vector is zero.
    pub fn cosine_similarity(&self, other: &Signature) -> Option<f32> {
        if self.0.len() != other.0.len() || self.0.is_empty() {
            return None;
        }
        let mut dot = 0.0f64;
        let mut na = 0.0f64;
        let mut nb = 0.0f64;
        for (a, b) in self.0.iter().zip(other.0.iter()) {
            dot += (*a as f64) * (*b as f64);
            na += (*a as f64) * (*a as f64);
            nb += (*b as f64) * (*b as f64);
        }
        if na <= 0.0 || nb <= 0.0 {
            return None;
        }
        Some((dot / (na.sqrt() * nb.sqrt())) as f32)
    }
}

/// Durable worker record. At least one signature is always present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityId,
    pub face_signature: Option<Signature>,
    pub appearance_signature: Option<Signature>,
    pub display_name: String,
    pub evidence_ref: String,
    pub created_at: DateTime<Utc>,
}

impl Identity {
    pub fn new(
        id: IdentityId,
        kind: SignatureKind,
        signature: Signature,
        display_name: String,
        evidence_ref: String,
        created_at: DateTime<Utc>,
    ) -> Self {
        let mut identity = Self {
            id,
            face_signature: None,
            appearance_signature: None,
            display_name,
            evidence_ref,
            created_at,
        };
        *identity.slot_mut(kind) = Some(signature);
        identity
    }

    pub fn signature(&self, kind: SignatureKind) -> Option<&Signature> {
        match kind {
            SignatureKind::Face => self.face_signature.as_ref(),
            SignatureKind::Appearance => self.appearance_signature.as_ref(),
        }
    }

    pub fn has_signature(&self, kind: SignatureKind) -> bool {
        self.signature(kind).is_some()
    }

    /// Set a signature of `kind` if none is stored yet. Returns false when
    /// one already exists (it is never overwritten).
    pub fn attach(&mut self, kind: SignatureKind, signature: Signature) -> bool {
        let slot = self.slot_mut(kind);
        if slot.is_some() {
            return false;
        }
        *slot = Some(signature);
        true
    }

    fn slot_mut(&mut self, kind: SignatureKind) -> &mut Option<Signature> {
        match kind {
            SignatureKind::Face => &mut self.face_signature,
            SignatureKind::Appearance => &mut self.appearance_signature,
        }
    }
}
