//! Long-lived memories
//!
//! Salient facts keyed by scope (global or one user). Near-duplicate content
//! reinforces an existing entry instead of appending, and every scope is
//! capped: on overflow the least important entry goes, oldest first on ties.

use std::collections::{BTreeMap, HashMap};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{Field, JsonStore, RecordSet, RepairReport, Repaired, string_field, timestamp_field};
use crate::clock::Clock;
use crate::config::MemoryConfig;
use crate::error::PersistenceError;
use crate::similarity;

/// Importance given to entries stored without one
pub const DEFAULT_IMPORTANCE: f64 = 0.5;

/// Importance added when a near-duplicate is observed again
const REINFORCE_STEP: f64 = 0.1;

/// Current file format version
const FORMAT_VERSION: u64 = 1;

/// Who a memory is about
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum MemoryScope {
    Global,
    User(String),
}

impl MemoryScope {
    /// Parse `global` or `user:<id>`
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case("global") {
            return Some(Self::Global);
        }
        raw.strip_prefix("user:")
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(|id| Self::User(id.to_string()))
    }

    /// Whether this scope is visible when talking to `user_id`
    #[must_use]
    pub fn visible_to(&self, user_id: Option<&str>) -> bool {
        match self {
            Self::Global => true,
            Self::User(id) => user_id == Some(id.as_str()),
        }
    }
}

impl std::fmt::Display for MemoryScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Global => f.write_str("global"),
            Self::User(id) => write!(f, "user:{id}"),
        }
    }
}

impl TryFrom<String> for MemoryScope {
    type Error = String;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(&raw).ok_or_else(|| format!("invalid memory scope {raw:?}"))
    }
}

impl From<MemoryScope> for String {
    fn from(scope: MemoryScope) -> Self {
        scope.to_string()
    }
}

/// One remembered fact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: String,
    pub scope: MemoryScope,
    pub content: String,
    pub created_at: DateTime<Utc>,
    /// Within `0.0..=1.0`
    pub importance: f64,
    /// Fields this version does not know about
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// On-disk memory document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemorySet {
    pub version: u64,
    pub entries: Vec<MemoryEntry>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MemorySet {
    /// Number of entries in `scope`
    #[must_use]
    pub fn count(&self, scope: &MemoryScope) -> usize {
        self.entries.iter().filter(|e| &e.scope == scope).count()
    }

    /// Enforce the per-scope cap; returns how many entries were evicted
    pub fn prune(&mut self, max_per_scope: usize) -> usize {
        let mut by_scope: HashMap<&MemoryScope, Vec<usize>> = HashMap::new();
        for (i, entry) in self.entries.iter().enumerate() {
            by_scope.entry(&entry.scope).or_default().push(i);
        }

        let mut evict = Vec::new();
        for mut indices in by_scope.into_values() {
            if indices.len() <= max_per_scope {
                continue;
            }
            // Least important first, then oldest, then id
            indices.sort_by(|&a, &b| {
                let (a, b) = (&self.entries[a], &self.entries[b]);
                a.importance
                    .total_cmp(&b.importance)
                    .then(a.created_at.cmp(&b.created_at))
                    .then(a.id.cmp(&b.id))
            });
            evict.extend_from_slice(&indices[..indices.len() - max_per_scope]);
        }

        if evict.is_empty() {
            return 0;
        }
        evict.sort_unstable();
        let evicted = evict.len();
        let mut i = 0;
        self.entries.retain(|_| {
            let keep = evict.binary_search(&i).is_err();
            i += 1;
            keep
        });
        evicted
    }

    fn sort(&mut self) {
        self.entries
            .sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    }
}

impl RecordSet for MemorySet {
    type Limits = MemoryConfig;

    const KIND: &'static str = "memory";

    fn repair(value: Value, limits: Self::Limits) -> Repaired<Self> {
        let mut out = Repaired::clean(Self {
            version: FORMAT_VERSION,
            ..Self::default()
        });

        let mut doc = match value {
            Value::Object(doc) => doc,
            Value::Array(items) => {
                out.fixed("bare array read as entry list");
                let mut doc = Map::new();
                doc.insert("entries".to_string(), Value::Array(items));
                doc
            }
            other => {
                out.dropped(format!("expected an object, found {}", kind_of(&other)));
                return out;
            }
        };

        match doc.remove("version") {
            Some(Value::Number(n)) if n.as_u64() == Some(FORMAT_VERSION) => {}
            Some(other) => out.fixed(format!("unexpected version {other}, rewriting as {FORMAT_VERSION}")),
            None => out.fixed("missing version"),
        }

        let mut entries = Vec::new();

        if let Some(legacy) = doc.remove("memories") {
            migrate_legacy(legacy, &mut doc, &mut entries, &mut out);
        }

        match doc.remove("entries") {
            None => {}
            Some(Value::Array(items)) => {
                for (i, item) in items.into_iter().enumerate() {
                    if let Some(entry) = repair_entry(i, item, &mut out) {
                        entries.push(entry);
                    }
                }
            }
            Some(other) => out.dropped(format!("entries: expected an array, found {}", kind_of(&other))),
        }

        // Duplicate ids: keep the most recent, later position wins ties
        let mut latest: BTreeMap<String, MemoryEntry> = BTreeMap::new();
        for entry in entries {
            if let Some(existing) = latest.get(&entry.id) {
                out.dropped(format!("duplicate id {}", entry.id));
                if existing.created_at > entry.created_at {
                    continue;
                }
            }
            latest.insert(entry.id.clone(), entry);
        }

        out.records.entries = latest.into_values().collect();
        out.records.extra = doc;
        out.records.sort();

        let evicted = out.records.prune(limits.max_entries_per_scope);
        if evicted > 0 {
            out.dropped(format!("{evicted} entries over the per-scope cap"));
        }
        out
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Stable id for an entry stored without one
fn derived_id(scope: &MemoryScope, content: &str) -> String {
    let mut hasher = DefaultHasher::new();
    scope.hash(&mut hasher);
    content.hash(&mut hasher);
    format!("mem-{:016x}", hasher.finish())
}

/// Convert the legacy `{"memories": ["..."]}` layout into global entries
///
/// Order is kept by spacing timestamps one second apart, ending at the
/// document's `last_updated` (or the epoch when absent).
fn migrate_legacy(
    legacy: Value,
    doc: &mut Map<String, Value>,
    entries: &mut Vec<MemoryEntry>,
    out: &mut Repaired<MemorySet>,
) {
    let anchor = match timestamp_field(doc, "last_updated") {
        Field::Present(t) => t,
        _ => DateTime::<Utc>::UNIX_EPOCH,
    };
    doc.remove("last_updated");
    doc.remove("total_entries");

    let Value::Array(items) = legacy else {
        out.dropped(format!("memories: expected an array, found {}", kind_of(&legacy)));
        return;
    };

    let count = items.len();
    let mut migrated = 0usize;
    for (i, item) in items.into_iter().enumerate() {
        let Value::String(content) = item else {
            out.dropped(format!("memories[{i}]: expected a string"));
            continue;
        };
        let content = content.trim().to_string();
        if content.is_empty() {
            out.dropped(format!("memories[{i}]: empty"));
            continue;
        }
        let offset = i64::try_from(count - i).unwrap_or(i64::MAX);
        entries.push(MemoryEntry {
            id: derived_id(&MemoryScope::Global, &content),
            scope: MemoryScope::Global,
            content,
            created_at: anchor - Duration::seconds(offset),
            importance: DEFAULT_IMPORTANCE,
            extra: Map::new(),
        });
        migrated += 1;
    }
    out.fixed(format!("migrated {migrated} legacy memories"));
}

fn repair_entry(i: usize, item: Value, out: &mut Repaired<MemorySet>) -> Option<MemoryEntry> {
    let Value::Object(mut obj) = item else {
        out.dropped(format!("entries[{i}]: expected an object, found {}", kind_of(&item)));
        return None;
    };

    let content = match string_field(&obj, "content") {
        Field::Present(c) if !c.trim().is_empty() => c.trim().to_string(),
        Field::Present(_) | Field::Missing => {
            out.dropped(format!("entries[{i}]: missing content"));
            return None;
        }
        Field::Invalid => {
            out.dropped(format!("entries[{i}]: content is not a string"));
            return None;
        }
    };

    let scope = match string_field(&obj, "scope") {
        Field::Missing => {
            out.fixed(format!("entries[{i}]: missing scope, using global"));
            MemoryScope::Global
        }
        Field::Present(raw) => {
            if let Some(scope) = MemoryScope::parse(&raw) {
                scope
            } else {
                out.dropped(format!("entries[{i}]: invalid scope {raw:?}"));
                return None;
            }
        }
        Field::Invalid => {
            out.dropped(format!("entries[{i}]: scope is not a string"));
            return None;
        }
    };

    let importance = match obj.get("importance") {
        None | Some(Value::Null) => {
            out.fixed(format!("entries[{i}]: missing importance"));
            DEFAULT_IMPORTANCE
        }
        Some(Value::Number(n)) => match n.as_f64() {
            Some(v) if (0.0..=1.0).contains(&v) => v,
            _ => {
                out.dropped(format!("entries[{i}]: importance {n} out of range"));
                return None;
            }
        },
        Some(_) => {
            out.dropped(format!("entries[{i}]: importance is not a number"));
            return None;
        }
    };

    let created_at = match timestamp_field(&obj, "created_at") {
        Field::Present(t) => t,
        Field::Missing => {
            out.fixed(format!("entries[{i}]: missing created_at"));
            DateTime::<Utc>::UNIX_EPOCH
        }
        Field::Invalid => {
            out.dropped(format!("entries[{i}]: unreadable created_at"));
            return None;
        }
    };

    let id = match string_field(&obj, "id") {
        Field::Present(id) if !id.trim().is_empty() => id.trim().to_string(),
        Field::Present(_) | Field::Missing => {
            out.fixed(format!("entries[{i}]: missing id"));
            derived_id(&scope, &content)
        }
        Field::Invalid => {
            out.dropped(format!("entries[{i}]: id is not a string"));
            return None;
        }
    };

    for key in ["id", "scope", "content", "created_at", "importance"] {
        obj.remove(key);
    }

    Some(MemoryEntry {
        id,
        scope,
        content,
        created_at,
        importance,
        extra: obj,
    })
}

/// What an upsert did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// New entry with this id
    Inserted(String),
    /// Existing entry reinforced
    Merged(String),
    /// Nothing to store
    Skipped,
}

/// Memory store
pub struct MemoryStore {
    store: JsonStore<MemorySet>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl MemoryStore {
    /// Create a store backed by `path`
    #[must_use]
    pub fn new(path: PathBuf, config: MemoryConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            store: JsonStore::new(path, config),
            clock,
        }
    }

    fn config(&self) -> MemoryConfig {
        self.store.limits()
    }

    /// Re-read the backing file
    pub async fn load(&self) -> RepairReport {
        self.store.load().await
    }

    /// Persist the current set
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be written
    pub async fn save(&self) -> Result<(), PersistenceError> {
        self.store.save().await
    }

    /// Store a fact, reinforcing a near-duplicate in the same scope if present
    ///
    /// # Errors
    ///
    /// Returns error if the write fails; the change is kept in memory
    pub async fn upsert(
        &self,
        scope: MemoryScope,
        content: &str,
        importance: f64,
    ) -> Result<UpsertOutcome, PersistenceError> {
        let content = content.trim().to_string();
        if content.is_empty() {
            return Ok(UpsertOutcome::Skipped);
        }
        let importance = if importance.is_nan() {
            DEFAULT_IMPORTANCE
        } else {
            importance.clamp(0.0, 1.0)
        };
        let now = self.clock.now();
        let config = self.config();

        let outcome = self
            .store
            .update(|set| {
                let normalized = similarity::normalize(&content);
                let duplicate = set
                    .entries
                    .iter()
                    .enumerate()
                    .filter(|(_, e)| {
                        e.scope == scope
                            && similarity::is_near_duplicate(
                                &e.content,
                                &content,
                                config.merge_threshold,
                            )
                    })
                    .map(|(i, e)| {
                        let score = similarity::ratio(&similarity::normalize(&e.content), &normalized);
                        (score, i)
                    })
                    .max_by(|(a, _), (b, _)| a.total_cmp(b))
                    .map(|(_, i)| i);

                let outcome = if let Some(i) = duplicate {
                    let entry = &mut set.entries[i];
                    entry.importance = (entry.importance.max(importance) + REINFORCE_STEP).min(1.0);
                    entry.created_at = now;
                    UpsertOutcome::Merged(entry.id.clone())
                } else {
                    let id = uuid::Uuid::new_v4().to_string();
                    set.entries.push(MemoryEntry {
                        id: id.clone(),
                        scope: scope.clone(),
                        content: content.clone(),
                        created_at: now,
                        importance,
                        extra: Map::new(),
                    });
                    UpsertOutcome::Inserted(id)
                };
                set.version = FORMAT_VERSION;
                set.sort();
                set.prune(config.max_entries_per_scope);
                outcome
            })
            .await?;

        tracing::debug!(scope = %scope, outcome = ?outcome, "memory upserted");
        Ok(outcome)
    }

    /// Enforce per-scope caps; returns how many entries were evicted
    ///
    /// # Errors
    ///
    /// Returns error if the write fails
    pub async fn prune(&self) -> Result<usize, PersistenceError> {
        let cap = self.config().max_entries_per_scope;
        self.store.update(|set| set.prune(cap)).await
    }

    /// Global entries plus the user's, most important first, then newest
    pub async fn relevant(&self, user_id: Option<&str>, k: usize) -> Vec<MemoryEntry> {
        self.store
            .read(|set| {
                let mut hits: Vec<MemoryEntry> = set
                    .entries
                    .iter()
                    .filter(|e| e.scope.visible_to(user_id))
                    .cloned()
                    .collect();
                hits.sort_by(|a, b| {
                    b.importance
                        .total_cmp(&a.importance)
                        .then(b.created_at.cmp(&a.created_at))
                        .then(a.id.cmp(&b.id))
                });
                hits.truncate(k);
                hits
            })
            .await
    }

    /// Every entry, oldest first
    pub async fn entries(&self) -> Vec<MemoryEntry> {
        self.store.snapshot().await.entries
    }

    /// Number of entries
    pub async fn len(&self) -> usize {
        self.store.read(|set| set.entries.len()).await
    }

    /// Whether the store is empty
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Check and repair the set, then write it back
    ///
    /// # Errors
    ///
    /// Returns error if the repaired set cannot be written
    pub async fn validate_and_repair(&self) -> Result<RepairReport, PersistenceError> {
        self.store.validate_and_repair().await
    }

    /// Forget everything
    ///
    /// # Errors
    ///
    /// Returns error if the empty set cannot be written
    pub async fn reset(&self) -> Result<(), PersistenceError> {
        self.store.reset().await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::clock::ManualClock;

    fn limits(cap: usize) -> MemoryConfig {
        MemoryConfig {
            max_entries_per_scope: cap,
            ..MemoryConfig::default()
        }
    }

    #[test]
    fn scope_round_trips_through_strings() {
        assert_eq!(MemoryScope::parse("global"), Some(MemoryScope::Global));
        assert_eq!(
            MemoryScope::parse("user:42"),
            Some(MemoryScope::User("42".to_string()))
        );
        assert_eq!(MemoryScope::parse("user:"), None);
        assert_eq!(MemoryScope::User("42".to_string()).to_string(), "user:42");
    }

    #[test]
    fn repair_defaults_missing_fields() {
        let repaired = MemorySet::repair(
            json!({"version": 1, "entries": [{"content": "likes tea"}]}),
            limits(10),
        );
        assert!(!repaired.discarded);
        assert_eq!(repaired.issues.len(), 4);
        let entry = &repaired.records.entries[0];
        assert_eq!(entry.scope, MemoryScope::Global);
        assert!((entry.importance - DEFAULT_IMPORTANCE).abs() < f64::EPSILON);
        assert!(entry.id.starts_with("mem-"));
    }

    #[test]
    fn repair_drops_invalid_entries() {
        let repaired = MemorySet::repair(
            json!({"version": 1, "entries": [
                {"id": "a", "scope": "global", "content": "ok", "created_at": "2024-01-01T00:00:00Z", "importance": 0.4},
                {"id": "b", "scope": "global", "content": "too important", "created_at": "2024-01-01T00:00:00Z", "importance": 7},
                {"id": "c", "scope": 5, "content": "bad scope", "created_at": "2024-01-01T00:00:00Z", "importance": 0.4},
                "not an object"
            ]}),
            limits(10),
        );
        assert!(repaired.discarded);
        assert_eq!(repaired.issues.len(), 3);
        assert_eq!(repaired.records.entries.len(), 1);
        assert_eq!(repaired.records.entries[0].id, "a");
    }

    #[test]
    fn duplicate_ids_keep_newest() {
        let repaired = MemorySet::repair(
            json!({"version": 1, "entries": [
                {"id": "a", "scope": "global", "content": "new", "created_at": "2024-02-01T00:00:00Z", "importance": 0.4},
                {"id": "a", "scope": "global", "content": "old", "created_at": "2024-01-01T00:00:00Z", "importance": 0.4}
            ]}),
            limits(10),
        );
        assert_eq!(repaired.records.entries.len(), 1);
        assert_eq!(repaired.records.entries[0].content, "new");
    }

    #[test]
    fn repair_is_idempotent() {
        let first = MemorySet::repair(
            json!({"memories": ["one", "two", 3], "last_updated": "2024-05-01T12:00:00.000001", "total_entries": 3, "custom": true}),
            limits(10),
        );
        assert_eq!(first.records.entries.len(), 2);
        assert_eq!(first.records.entries[0].content, "one");

        let value = serde_json::to_value(&first.records).unwrap();
        let second = MemorySet::repair(value, limits(10));
        assert!(second.issues.is_empty(), "{:?}", second.issues);
        assert_eq!(second.records, first.records);
        assert_eq!(second.records.extra.get("custom"), Some(&json!(true)));
    }

    #[test]
    fn unknown_entry_fields_survive() {
        let repaired = MemorySet::repair(
            json!({"version": 1, "entries": [
                {"id": "a", "scope": "user:1", "content": "x", "created_at": "2024-01-01T00:00:00Z", "importance": 0.4, "source": "import"}
            ]}),
            limits(10),
        );
        let value = serde_json::to_value(&repaired.records).unwrap();
        assert_eq!(value["entries"][0]["source"], json!("import"));
        assert_eq!(value["entries"][0]["scope"], json!("user:1"));
    }

    #[test]
    fn prune_evicts_least_important_then_oldest() {
        let t0 = DateTime::<Utc>::UNIX_EPOCH;
        let entry = |id: &str, importance: f64, secs: i64| MemoryEntry {
            id: id.to_string(),
            scope: MemoryScope::Global,
            content: id.to_string(),
            created_at: t0 + Duration::seconds(secs),
            importance,
            extra: Map::new(),
        };
        let mut set = MemorySet {
            version: 1,
            entries: vec![
                entry("keep-high", 0.9, 0),
                entry("old-low", 0.2, 1),
                entry("new-low", 0.2, 2),
            ],
            extra: Map::new(),
        };
        assert_eq!(set.prune(2), 1);
        let ids: Vec<&str> = set.entries.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["keep-high", "new-low"]);
    }

    #[tokio::test]
    async fn upsert_merges_near_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::default());
        let store = MemoryStore::new(dir.path().join("memories.json"), limits(10), clock.clone());

        let first = store
            .upsert(MemoryScope::Global, "Alice loves green tea", 0.5)
            .await
            .unwrap();
        clock.advance(Duration::minutes(1));
        let second = store
            .upsert(MemoryScope::Global, "alice loves green tea!", 0.3)
            .await
            .unwrap();

        let UpsertOutcome::Inserted(id) = first else {
            panic!("expected insert");
        };
        assert_eq!(second, UpsertOutcome::Merged(id));
        let entries = store.entries().await;
        assert_eq!(entries.len(), 1);
        assert!((entries[0].importance - 0.6).abs() < 1e-9);
        assert_eq!(entries[0].created_at, clock.now());
    }

    #[tokio::test]
    async fn same_content_in_other_scope_is_separate() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(
            dir.path().join("memories.json"),
            limits(10),
            Arc::new(ManualClock::default()),
        );
        store.upsert(MemoryScope::Global, "likes cats", 0.5).await.unwrap();
        store
            .upsert(MemoryScope::User("1".to_string()), "likes cats", 0.5)
            .await
            .unwrap();
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn relevant_ranks_by_importance_then_recency() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::default());
        let store = MemoryStore::new(dir.path().join("memories.json"), limits(10), clock.clone());

        store.upsert(MemoryScope::Global, "server motto is be kind", 0.5).await.unwrap();
        clock.advance(Duration::minutes(1));
        store
            .upsert(MemoryScope::User("1".to_string()), "alice is learning rust", 0.5)
            .await
            .unwrap();
        store
            .upsert(MemoryScope::User("2".to_string()), "bob has a dog", 0.9)
            .await
            .unwrap();
        store.upsert(MemoryScope::Global, "the server turned five", 0.8).await.unwrap();

        let hits = store.relevant(Some("1"), 10).await;
        let contents: Vec<&str> = hits.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(
            contents,
            vec!["the server turned five", "alice is learning rust", "server motto is be kind"]
        );
        assert_eq!(store.relevant(Some("1"), 1).await.len(), 1);
    }
}
