// src/persistence/sqlite.rs
//
// SQLite-backed store. One connection behind a mutex; WAL so the CLI can
// read violations while a session is writing. Signatures are stored as
// JSON arrays, timestamps as unix millis.

use super::{default_display_name, NewIdentity, NewViolation, PersistenceStore, ViolationEvent};
use crate::identity::{Identity, IdentityId, Signature, SignatureKind};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS identities (
    id                   TEXT PRIMARY KEY,
    face_signature       TEXT,
    appearance_signature TEXT,
    display_name         TEXT NOT NULL,
    evidence_ref         TEXT NOT NULL,
    created_at           INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS violations (
    id             TEXT PRIMARY KEY,
    identity_id    TEXT NOT NULL REFERENCES identities(id),
    track_id       INTEGER NOT NULL,
    equipped_items TEXT NOT NULL,
    violated_items TEXT NOT NULL,
    evidence_ref   TEXT NOT NULL,
    timestamp      INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_violations_timestamp ON violations(timestamp);
";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

struct IdentityRow {
    id: String,
    face: Option<String>,
    appearance: Option<String>,
    display_name: String,
    evidence_ref: String,
    created_at: i64,
}

struct ViolationRow {
    id: String,
    identity_id: String,
    display_name: Option<String>,
    track_id: i64,
    equipped: String,
    violated: String,
    evidence_ref: String,
    timestamp: i64,
}

impl SqliteStore {
    /// Open or create the database file with full schema.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database {}", path.display()))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA foreign_keys = ON;",
        )
        .context("Failed to apply pragmas")?;
        Self::with_schema(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Self::with_schema(conn)
    }

    fn with_schema(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialise schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn millis_to_utc(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| anyhow!("invalid timestamp {}", ms))
}

fn signature_to_json(signature: &Signature) -> Result<String> {
    Ok(serde_json::to_string(signature)?)
}

fn signature_from_json(text: Option<String>) -> Result<Option<Signature>> {
    text.map(|t| serde_json::from_str(&t).context("Corrupt signature column"))
        .transpose()
}

fn items_from_json(text: &str) -> Result<BTreeSet<String>> {
    serde_json::from_str(text).context("Corrupt item list column")
}

impl IdentityRow {
    fn into_identity(self) -> Result<Identity> {
        Ok(Identity {
            id: IdentityId::new(self.id),
            face_signature: signature_from_json(self.face)?,
            appearance_signature: signature_from_json(self.appearance)?,
            display_name: self.display_name,
            evidence_ref: self.evidence_ref,
            created_at: millis_to_utc(self.created_at)?,
        })
    }
}

impl ViolationRow {
    fn into_event(self) -> Result<ViolationEvent> {
        Ok(ViolationEvent {
            id: self.id,
            identity_id: IdentityId::new(self.identity_id),
            display_name: self.display_name,
            track_id: u32::try_from(self.track_id).context("track_id out of range")?,
            equipped_items: items_from_json(&self.equipped)?,
            violated_items: items_from_json(&self.violated)?,
            evidence_ref: self.evidence_ref,
            timestamp: millis_to_utc(self.timestamp)?,
        })
    }
}

impl PersistenceStore for SqliteStore {
    fn register_identity(&self, new: NewIdentity) -> Result<Identity> {
        let id = IdentityId::new(uuid::Uuid::new_v4().to_string());
        let display_name = new
            .display_name
            .unwrap_or_else(|| default_display_name(&id));
        let created_at = Utc::now();
        let json = signature_to_json(&new.signature)?;
        let (face, appearance) = match new.kind {
            SignatureKind::Face => (Some(json), None),
            SignatureKind::Appearance => (None, Some(json)),
        };

        self.conn()
            .execute(
                "INSERT INTO identities
                    (id, face_signature, appearance_signature, display_name, evidence_ref, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id.as_str(),
                    face,
                    appearance,
                    display_name,
                    new.evidence_ref,
                    created_at.timestamp_millis()
                ],
            )
            .context("Failed to insert identity")?;
        debug!("Stored identity {} ({})", id, new.kind);

        Ok(Identity::new(
            id,
            new.kind,
            new.signature,
            display_name,
            new.evidence_ref,
            created_at,
        ))
    }

    fn attach_signature(
        &self,
        id: &IdentityId,
        kind: SignatureKind,
        signature: &Signature,
    ) -> Result<bool> {
        let sql = match kind {
            SignatureKind::Face => {
                "UPDATE identities SET face_signature = ?1 WHERE id = ?2 AND face_signature IS NULL"
            }
            SignatureKind::Appearance => {
                "UPDATE identities SET appearance_signature = ?1 WHERE id = ?2 AND appearance_signature IS NULL"
            }
        };
        let changed = self
            .conn()
            .execute(sql, params![signature_to_json(signature)?, id.as_str()])
            .context("Failed to attach signature")?;
        Ok(changed == 1)
    }

    fn log_violation(&self, violation: NewViolation) -> Result<ViolationEvent> {
        let id = uuid::Uuid::new_v4().to_string();
        let equipped = serde_json::to_string(&violation.equipped_items)?;
        let violated = serde_json::to_string(&violation.violated_items)?;

        // Nothing may fail after the row lands, or a stored violation would
        // be reported as lost and logged again.
        let mut conn = self.conn();
        let tx = conn.transaction().context("Failed to begin violation insert")?;
        let display_name: Option<String> = tx
            .query_row(
                "SELECT display_name FROM identities WHERE id = ?1",
                params![violation.identity_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to look up worker name")?;
        tx.execute(
            "INSERT INTO violations
                (id, identity_id, track_id, equipped_items, violated_items, evidence_ref, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id,
                violation.identity_id.as_str(),
                violation.track_id as i64,
                equipped,
                violated,
                violation.evidence_ref,
                violation.timestamp.timestamp_millis()
            ],
        )
        .context("Failed to insert violation")?;
        tx.commit().context("Failed to commit violation")?;

        Ok(ViolationEvent::from_new(id, display_name, violation))
    }

    fn list_recent_violations(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ViolationEvent>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT v.id, v.identity_id, i.display_name, v.track_id, v.equipped_items,
                    v.violated_items, v.evidence_ref, v.timestamp
             FROM violations v
             LEFT JOIN identities i ON i.id = v.identity_id
             WHERE v.timestamp >= ?1
             ORDER BY v.timestamp DESC, v.rowid DESC
             LIMIT ?2",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt
            .query_map(params![since.timestamp_millis(), limit], |row| {
                Ok(ViolationRow {
                    id: row.get(0)?,
                    identity_id: row.get(1)?,
                    display_name: row.get(2)?,
                    track_id: row.get(3)?,
                    equipped: row.get(4)?,
                    violated: row.get(5)?,
                    evidence_ref: row.get(6)?,
                    timestamp: row.get(7)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter().map(ViolationRow::into_event).collect()
    }

    fn list_identities(&self) -> Result<Vec<Identity>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, face_signature, appearance_signature, display_name, evidence_ref, created_at
             FROM identities
             ORDER BY created_at, rowid",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(IdentityRow {
                    id: row.get(0)?,
                    face: row.get(1)?,
                    appearance: row.get(2)?,
                    display_name: row.get(3)?,
                    evidence_ref: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter().map(IdentityRow::into_identity).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn register(store: &SqliteStore, kind: SignatureKind, values: Vec<f32>) -> Identity {
        store
            .register_identity(NewIdentity {
                kind,
                signature: Signature::new(values),
                evidence_ref: "storage/faces/face_1.jpg".to_string(),
                display_name: None,
            })
            .unwrap()
    }

    #[test]
    fn test_identity_roundtrip_preserves_order() {
        let store = SqliteStore::open_in_memory().unwrap();
        let a = register(&store, SignatureKind::Face, vec![0.25, 0.5]);
        let b = register(&store, SignatureKind::Appearance, vec![1.0, 0.0, 0.0]);

        let listed = store.list_identities().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, a.id);
        assert_eq!(listed[0].face_signature, Some(Signature::new(vec![0.25, 0.5])));
        assert!(listed[0].appearance_signature.is_none());
        assert_eq!(listed[1].id, b.id);
        assert!(listed[1].face_signature.is_none());
    }

    #[test]
    fn test_attach_only_fills_empty_slot() {
        let store = SqliteStore::open_in_memory().unwrap();
        let a = register(&store, SignatureKind::Face, vec![1.0, 0.0]);
        let other = Signature::new(vec![0.0, 1.0]);

        assert!(!store
            .attach_signature(&a.id, SignatureKind::Face, &other)
            .unwrap());
        assert!(store
            .attach_signature(&a.id, SignatureKind::Appearance, &other)
            .unwrap());
        assert!(!store
            .attach_signature(&a.id, SignatureKind::Appearance, &Signature::new(vec![0.5, 0.5]))
            .unwrap());

        let stored = &store.list_identities().unwrap()[0];
        assert_eq!(stored.face_signature, Some(Signature::new(vec![1.0, 0.0])));
        assert_eq!(stored.appearance_signature, Some(other));
    }

    #[test]
    fn test_violations_listed_newest_first_with_display_name() {
        let store = SqliteStore::open_in_memory().unwrap();
        let worker = register(&store, SignatureKind::Face, vec![1.0, 0.0]);
        let now = Utc::now();

        for (i, age) in [30i64, 10, 0].iter().enumerate() {
            store
                .log_violation(NewViolation {
                    identity_id: worker.id.clone(),
                    track_id: i as u32,
                    equipped_items: BTreeSet::from(["helmet".to_string()]),
                    violated_items: BTreeSet::from([
                        "boots".to_string(),
                        "gloves".to_string(),
                        "vest".to_string(),
                    ]),
                    evidence_ref: format!("violation_{}.jpg", i),
                    timestamp: now - Duration::minutes(*age),
                })
                .unwrap();
        }

        let recent = store
            .list_recent_violations(now - Duration::minutes(15), 10)
            .unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].track_id, 2);
        assert_eq!(recent[1].track_id, 1);
        assert_eq!(recent[0].display_name.as_deref(), Some(worker.display_name.as_str()));
        assert_eq!(recent[0].violated_items.len(), 3);

        let limited = store
            .list_recent_violations(now - Duration::hours(1), 1)
            .unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].track_id, 2);
    }

    #[test]
    fn test_violation_for_unknown_identity_fails() {
        let store = SqliteStore::open_in_memory().unwrap();
        let result = store.log_violation(NewViolation {
            identity_id: IdentityId::new("missing"),
            track_id: 1,
            equipped_items: BTreeSet::new(),
            violated_items: BTreeSet::from(["vest".to_string()]),
            evidence_ref: String::new(),
            timestamp: Utc::now(),
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_failed_violation_write_leaves_no_row() {
        let store = SqliteStore::open_in_memory().unwrap();
        let worker = register(&store, SignatureKind::Face, vec![1.0, 0.0]);
        let violation = || NewViolation {
            identity_id: worker.id.clone(),
            track_id: 7,
            equipped_items: BTreeSet::new(),
            violated_items: BTreeSet::from(["helmet".to_string()]),
            evidence_ref: "violation_7.jpg".to_string(),
            timestamp: Utc::now(),
        };
        let rows = |store: &SqliteStore| -> i64 {
            store
                .conn()
                .query_row("SELECT COUNT(*) FROM violations", [], |row| row.get(0))
                .unwrap()
        };

        store
            .conn()
            .execute_batch(
                "CREATE TRIGGER reject_violation AFTER INSERT ON violations
                 BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
            )
            .unwrap();
        assert!(store.log_violation(violation()).is_err());
        assert_eq!(rows(&store), 0);

        store
            .conn()
            .execute_batch("DROP TRIGGER reject_violation;")
            .unwrap();
        let logged = store.log_violation(violation()).unwrap();
        assert_eq!(logged.display_name.as_deref(), Some(worker.display_name.as_str()));
        assert_eq!(rows(&store), 1);
    }
}
