//! JSON-file backed record stores
//!
//! [`JsonStore`] owns one backing file and serializes every
//! read-modify-write cycle through a single async lock. Files are untrusted:
//! loading always goes through [`RecordSet::repair`], and malformed input
//! degrades to an empty or partial record set instead of an error.
//!
//! Writes go to a `.tmp` sibling which is synced and renamed over the
//! original, so a crash never leaves a half-written file behind. A failed
//! write is reported as a [`PersistenceError`]; the in-memory set stays
//! authoritative and the next write carries the full state again.

pub mod dossier;
pub mod memory;

use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::PersistenceError;

pub use dossier::{Dossier, DossierStore};
pub use memory::{MemoryEntry, MemoryScope, MemoryStore, UpsertOutcome};

/// Result of defensively parsing a stored document
#[derive(Debug)]
pub struct Repaired<R> {
    /// Records that survived
    pub records: R,
    /// Human-readable description of every fix applied
    pub issues: Vec<String>,
    /// Whether any stored data was dropped (not merely defaulted)
    pub discarded: bool,
}

impl<R> Repaired<R> {
    /// A clean parse
    pub const fn clean(records: R) -> Self {
        Self {
            records,
            issues: Vec::new(),
            discarded: false,
        }
    }

    /// Record a defaulted or normalized field
    pub fn fixed(&mut self, issue: impl Into<String>) {
        self.issues.push(issue.into());
    }

    /// Record dropped data
    pub fn dropped(&mut self, issue: impl Into<String>) {
        self.issues.push(issue.into());
        self.discarded = true;
    }
}

/// A record set that can be persisted by a [`JsonStore`]
pub trait RecordSet: Default + Clone + Serialize + Send + Sync + 'static {
    /// Caps applied while repairing
    type Limits: Copy + Send + Sync + std::fmt::Debug;

    /// Label used in logs
    const KIND: &'static str;

    /// Parse `value`, defaulting missing fields and dropping invalid records
    ///
    /// Must be idempotent: repairing the serialized output of a repair yields
    /// the same set and no issues.
    fn repair(value: Value, limits: Self::Limits) -> Repaired<Self>;
}

/// Outcome of [`JsonStore::validate_and_repair`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairReport {
    /// Whether anything had to change
    pub repaired: bool,
    /// Fixes applied
    pub issues: Vec<String>,
}

struct StoreState<R> {
    records: R,
    loaded: bool,
}

/// One record set backed by one JSON file
pub struct JsonStore<R: RecordSet> {
    path: PathBuf,
    limits: R::Limits,
    state: Mutex<StoreState<R>>,
}

impl<R: RecordSet> std::fmt::Debug for JsonStore<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonStore")
            .field("kind", &R::KIND)
            .field("path", &self.path)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl<R: RecordSet> JsonStore<R> {
    /// Create a store; the file is read lazily on first access
    #[must_use]
    pub fn new(path: PathBuf, limits: R::Limits) -> Self {
        Self {
            path,
            limits,
            state: Mutex::new(StoreState {
                records: R::default(),
                loaded: false,
            }),
        }
    }

    /// Backing file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Limits this store prunes to
    #[must_use]
    pub const fn limits(&self) -> R::Limits {
        self.limits
    }

    /// Re-read the backing file, replacing the in-memory set
    pub async fn load(&self) -> RepairReport {
        let mut state = self.state.lock().await;
        let repaired = self.read_repaired().await;
        let report = RepairReport {
            repaired: !repaired.issues.is_empty(),
            issues: repaired.issues,
        };
        state.records = repaired.records;
        state.loaded = true;
        report
    }

    /// Write the in-memory set to disk
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be written
    pub async fn save(&self) -> Result<(), PersistenceError> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await;
        self.write(&state.records).await
    }

    /// Clone of the current set
    pub async fn snapshot(&self) -> R {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await;
        state.records.clone()
    }

    /// Read without mutating
    pub async fn read<T>(&self, f: impl FnOnce(&R) -> T) -> T {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await;
        f(&state.records)
    }

    /// Mutate the set and persist it under one lock
    ///
    /// # Errors
    ///
    /// Returns error if the write fails; the mutation is kept in memory
    pub async fn update<T>(&self, f: impl FnOnce(&mut R) -> T) -> Result<T, PersistenceError> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await;
        let out = f(&mut state.records);
        self.write(&state.records).await?;
        Ok(out)
    }

    /// Validate the set, repair it, and write the result back
    ///
    /// Once loaded, the in-memory set is authoritative and is what gets
    /// checked; it is always written so a previously failed write is retried.
    /// Before that, the file itself is read and repaired.
    ///
    /// # Errors
    ///
    /// Returns error if the repaired set cannot be written
    pub async fn validate_and_repair(&self) -> Result<RepairReport, PersistenceError> {
        let mut state = self.state.lock().await;
        let was_loaded = state.loaded;
        let repaired = if was_loaded {
            match serde_json::to_value(&state.records) {
                Ok(value) => R::repair(value, self.limits),
                Err(e) => {
                    let mut repaired = Repaired::clean(R::default());
                    repaired.dropped(format!("in-memory set could not be serialized: {e}"));
                    repaired
                }
            }
        } else {
            self.read_repaired().await
        };
        state.records = repaired.records;
        state.loaded = true;

        let report = RepairReport {
            repaired: !repaired.issues.is_empty(),
            issues: repaired.issues,
        };
        if report.repaired || was_loaded {
            self.write(&state.records).await?;
        }
        if report.repaired {
            tracing::info!(
                kind = R::KIND,
                issues = report.issues.len(),
                "store repaired"
            );
        }
        Ok(report)
    }

    /// Replace the set with an empty one
    ///
    /// # Errors
    ///
    /// Returns error if the empty set cannot be written
    pub async fn reset(&self) -> Result<(), PersistenceError> {
        let mut state = self.state.lock().await;
        state.records = R::default();
        state.loaded = true;
        self.write(&state.records).await?;
        tracing::info!(kind = R::KIND, path = %self.path.display(), "store reset");
        Ok(())
    }

    async fn ensure_loaded(&self, state: &mut StoreState<R>) {
        if state.loaded {
            return;
        }
        let repaired = self.read_repaired().await;
        state.records = repaired.records;
        state.loaded = true;
    }

    /// Read and repair the backing file; never fails
    async fn read_repaired(&self) -> Repaired<R> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(kind = R::KIND, path = %self.path.display(), "no store file yet");
                return Repaired::clean(R::default());
            }
            Err(e) => {
                tracing::warn!(
                    kind = R::KIND,
                    path = %self.path.display(),
                    error = %e,
                    "failed to read store file, starting empty"
                );
                return Repaired::clean(R::default());
            }
        };

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Repaired::clean(R::default());
        }

        let repaired = match serde_json::from_slice::<Value>(&bytes) {
            Ok(value) => R::repair(value, self.limits),
            Err(e) => {
                let mut repaired = Repaired::clean(R::default());
                repaired.dropped(format!("unparseable JSON: {e}"));
                repaired
            }
        };

        for issue in &repaired.issues {
            tracing::warn!(kind = R::KIND, issue = %issue, "store validation issue");
        }
        if repaired.discarded {
            self.backup_corrupt(&bytes).await;
        }
        repaired
    }

    /// Keep the unrepaired original next to the file
    async fn backup_corrupt(&self, bytes: &[u8]) {
        let backup = sibling(&self.path, "corrupt");
        match tokio::fs::write(&backup, bytes).await {
            Ok(()) => tracing::warn!(
                kind = R::KIND,
                backup = %backup.display(),
                "saved unrepaired store file"
            ),
            Err(e) => tracing::warn!(
                kind = R::KIND,
                backup = %backup.display(),
                error = %e,
                "failed to back up store file"
            ),
        }
    }

    async fn write(&self, records: &R) -> Result<(), PersistenceError> {
        let mut content = serde_json::to_vec_pretty(records).map_err(|e| {
            PersistenceError::new(self.path.clone(), std::io::Error::other(e))
        })?;
        content.push(b'\n');

        write_atomic(&self.path, &content).await.map_err(|e| {
            tracing::warn!(
                kind = R::KIND,
                path = %self.path.display(),
                error = %e,
                "store write failed, keeping in-memory state"
            );
            PersistenceError::new(self.path.clone(), e)
        })
    }
}

/// `path` with `.suffix` appended to the full file name
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let filename = path
        .file_name()
        .map_or_else(|| "store.json".to_string(), |f| f.to_string_lossy().to_string());
    path.with_file_name(format!("{filename}.{suffix}"))
}

/// Write to a synced temp file, then rename it over `path`
async fn write_atomic(path: &Path, content: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    let tmp_path = sibling(path, "tmp");
    let written: std::io::Result<()> = async {
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(content).await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }
    .await;

    if let Err(e) = written {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e);
    }

    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e);
    }
    Ok(())
}

/// Parse a stored timestamp
///
/// Accepts RFC 3339 and naive ISO-8601 (read as UTC).
pub(crate) fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|t| t.and_utc())
        })
}

/// Field lookup outcome for defensive parsing
pub(crate) enum Field<T> {
    Missing,
    Invalid,
    Present(T),
}

/// Read an optional string field
pub(crate) fn string_field(obj: &serde_json::Map<String, Value>, key: &str) -> Field<String> {
    match obj.get(key) {
        None | Some(Value::Null) => Field::Missing,
        Some(Value::String(s)) => Field::Present(s.clone()),
        Some(_) => Field::Invalid,
    }
}

/// Read an optional timestamp field
pub(crate) fn timestamp_field(
    obj: &serde_json::Map<String, Value>,
    key: &str,
) -> Field<DateTime<Utc>> {
    match string_field(obj, key) {
        Field::Missing => Field::Missing,
        Field::Invalid => Field::Invalid,
        Field::Present(s) => parse_timestamp(&s).map_or(Field::Invalid, Field::Present),
    }
}
