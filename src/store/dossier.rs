//! Per-user dossiers
//!
//! A dossier is an ordered list of observed traits, oldest first. Observing
//! a trait again (or a near-identical wording) moves it to the end; when the
//! list is over the cap the oldest traits go.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{Field, JsonStore, RecordSet, RepairReport, Repaired, string_field, timestamp_field};
use crate::clock::Clock;
use crate::config::DossierConfig;
use crate::error::PersistenceError;
use crate::similarity;

const FORMAT_VERSION: u64 = 1;

/// Profile of one participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dossier {
    pub user_id: String,
    pub display_name: String,
    /// Oldest first
    pub traits: Vec<String>,
    pub last_updated: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Dossier {
    fn new(user_id: &str, display_name: &str, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.to_string(),
            display_name: display_name.to_string(),
            traits: Vec::new(),
            last_updated: now,
            extra: Map::new(),
        }
    }

    /// Add a trait, replacing a near-identical one; returns whether it was new
    pub fn observe(&mut self, observed: &str, threshold: f64) -> bool {
        let observed = observed.trim();
        if observed.is_empty() {
            return false;
        }
        let existing = self
            .traits
            .iter()
            .position(|t| similarity::is_near_duplicate(t, observed, threshold));
        if let Some(i) = existing {
            self.traits.remove(i);
        }
        self.traits.push(observed.to_string());
        existing.is_none()
    }

    /// Drop the oldest traits beyond `max`; returns how many went
    pub fn trim(&mut self, max: usize) -> usize {
        let over = self.traits.len().saturating_sub(max);
        self.traits.drain(..over);
        over
    }
}

/// On-disk dossier document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DossierSet {
    pub version: u64,
    pub users: BTreeMap<String, Dossier>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RecordSet for DossierSet {
    type Limits = DossierConfig;

    const KIND: &'static str = "dossier";

    fn repair(value: Value, limits: Self::Limits) -> Repaired<Self> {
        let mut out = Repaired::clean(Self {
            version: FORMAT_VERSION,
            ..Self::default()
        });

        let Value::Object(mut doc) = value else {
            out.dropped("expected an object");
            return out;
        };

        match doc.remove("version") {
            Some(Value::Number(n)) if n.as_u64() == Some(FORMAT_VERSION) => {}
            Some(other) => out.fixed(format!("unexpected version {other}, rewriting as {FORMAT_VERSION}")),
            None => out.fixed("missing version"),
        }
        // Derived counters written by older versions
        for legacy in ["last_updated", "total_users"] {
            if doc.remove(legacy).is_some() {
                out.fixed(format!("dropped legacy field {legacy}"));
            }
        }

        let records: Vec<(Option<String>, Value)> = match doc.remove("users") {
            None => Vec::new(),
            Some(Value::Object(users)) => users.into_iter().map(|(k, v)| (Some(k), v)).collect(),
            Some(Value::Array(users)) => {
                out.fixed("users stored as an array");
                users.into_iter().map(|v| (None, v)).collect()
            }
            Some(_) => {
                out.dropped("users: expected an object");
                Vec::new()
            }
        };

        for (key, record) in records {
            let Some(dossier) = repair_dossier(key, record, limits, &mut out) else {
                continue;
            };
            let previous = out.records.users.get(&dossier.user_id).map(|d| d.last_updated);
            if let Some(previous) = previous {
                out.dropped(format!("duplicate dossier for {}", dossier.user_id));
                if previous > dossier.last_updated {
                    continue;
                }
            }
            out.records.users.insert(dossier.user_id.clone(), dossier);
        }

        out.records.extra = doc;
        out
    }
}

/// Split free-text profile prose into traits on sentence boundaries
fn split_profile(profile: &str) -> Vec<String> {
    profile
        .split(['.', '!', '?', '\n', ';'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

#[allow(clippy::too_many_lines)]
fn repair_dossier(
    key: Option<String>,
    record: Value,
    limits: DossierConfig,
    out: &mut Repaired<DossierSet>,
) -> Option<Dossier> {
    let label = key.clone().unwrap_or_else(|| "?".to_string());
    let Value::Object(mut obj) = record else {
        out.dropped(format!("users[{label}]: expected an object"));
        return None;
    };

    let user_id = match (key, string_field(&obj, "user_id")) {
        (Some(key), Field::Present(id)) if id == key => key,
        (Some(key), Field::Missing) => {
            out.fixed(format!("users[{key}]: missing user_id"));
            key
        }
        (Some(key), _) => {
            out.fixed(format!("users[{key}]: user_id disagrees with key"));
            key
        }
        (None, Field::Present(id)) if !id.trim().is_empty() => id.trim().to_string(),
        (None, _) => {
            out.dropped("users[?]: missing user_id");
            return None;
        }
    };
    if user_id.trim().is_empty() {
        out.dropped("users: empty user id");
        return None;
    }

    let display_name = match string_field(&obj, "display_name") {
        Field::Present(name) => name,
        Field::Invalid => {
            out.dropped(format!("users[{user_id}]: display_name is not a string"));
            return None;
        }
        Field::Missing => match string_field(&obj, "name") {
            Field::Present(name) => {
                out.fixed(format!("users[{user_id}]: migrated legacy name"));
                obj.remove("name");
                name
            }
            _ => {
                out.fixed(format!("users[{user_id}]: missing display_name"));
                user_id.clone()
            }
        },
    };

    let mut traits = match obj.remove("traits") {
        Some(Value::Array(items)) => {
            let mut traits = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::String(t) if !t.trim().is_empty() => traits.push(t.trim().to_string()),
                    _ => out.dropped(format!("users[{user_id}]: invalid trait dropped")),
                }
            }
            traits
        }
        None | Some(Value::Null) => match string_field(&obj, "profile") {
            Field::Present(profile) => {
                out.fixed(format!("users[{user_id}]: migrated legacy profile"));
                obj.remove("profile");
                split_profile(&profile)
            }
            _ => {
                out.fixed(format!("users[{user_id}]: missing traits"));
                Vec::new()
            }
        },
        Some(_) => {
            out.dropped(format!("users[{user_id}]: traits is not an array"));
            return None;
        }
    };

    // Exact repeats (after normalization) keep their latest position
    let mut seen = std::collections::HashSet::new();
    let before = traits.len();
    let mut deduped: Vec<String> = traits
        .drain(..)
        .rev()
        .filter(|t| seen.insert(similarity::normalize(t)))
        .collect();
    deduped.reverse();
    if deduped.len() < before {
        out.fixed(format!("users[{user_id}]: repeated traits merged"));
    }
    let mut traits = deduped;

    let over = traits.len().saturating_sub(limits.max_traits);
    if over > 0 {
        traits.drain(..over);
        out.dropped(format!("users[{user_id}]: {over} traits over the cap"));
    }

    let last_updated = match timestamp_field(&obj, "last_updated") {
        Field::Present(t) => t,
        Field::Invalid => {
            out.dropped(format!("users[{user_id}]: unreadable last_updated"));
            return None;
        }
        Field::Missing => match timestamp_field(&obj, "last_seen") {
            Field::Present(t) => {
                out.fixed(format!("users[{user_id}]: migrated legacy last_seen"));
                obj.remove("last_seen");
                t
            }
            _ => {
                out.fixed(format!("users[{user_id}]: missing last_updated"));
                DateTime::<Utc>::UNIX_EPOCH
            }
        },
    };

    for field in ["user_id", "display_name", "last_updated"] {
        obj.remove(field);
    }

    Some(Dossier {
        user_id,
        display_name,
        traits,
        last_updated,
        extra: obj,
    })
}

/// Dossier store
pub struct DossierStore {
    store: JsonStore<DossierSet>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for DossierStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DossierStore")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl DossierStore {
    /// Create a store backed by `path`
    #[must_use]
    pub fn new(path: PathBuf, config: DossierConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            store: JsonStore::new(path, config),
            clock,
        }
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

    /// Record observations about a user, creating the dossier if needed
    ///
    /// # Errors
    ///
    /// Returns error if the write fails; the change is kept in memory
    pub async fn upsert(
        &self,
        user_id: &str,
        display_name: &str,
        traits: &[String],
    ) -> Result<Dossier, PersistenceError> {
        let now = self.clock.now();
        let config = self.store.limits();
        let display_name = display_name.trim();

        let dossier = self
            .store
            .update(|set| {
                set.version = FORMAT_VERSION;
                let dossier = set
                    .users
                    .entry(user_id.to_string())
                    .or_insert_with(|| Dossier::new(user_id, display_name, now));
                if !display_name.is_empty() {
                    display_name.clone_into(&mut dossier.display_name);
                }
                let added = traits
                    .iter()
                    .filter(|t| dossier.observe(t, config.trait_merge_threshold))
                    .count();
                let evicted = dossier.trim(config.max_traits);
                dossier.last_updated = now;
                tracing::debug!(user_id, added, evicted, "dossier updated");
                dossier.clone()
            })
            .await?;
        Ok(dossier)
    }

    /// Enforce the trait cap on every dossier; returns traits evicted
    ///
    /// # Errors
    ///
    /// Returns error if the write fails
    pub async fn prune(&self) -> Result<usize, PersistenceError> {
        let max = self.store.limits().max_traits;
        self.store
            .update(|set| set.users.values_mut().map(|d| d.trim(max)).sum())
            .await
    }

    /// Dossier for one user
    pub async fn get(&self, user_id: &str) -> Option<Dossier> {
        self.store.read(|set| set.users.get(user_id).cloned()).await
    }

    /// Dossiers for several users, in the order given, skipping unknowns
    pub async fn get_many(&self, user_ids: &[String]) -> Vec<Dossier> {
        self.store
            .read(|set| {
                user_ids
                    .iter()
                    .filter_map(|id| set.users.get(id).cloned())
                    .collect()
            })
            .await
    }

    /// Number of dossiers
    pub async fn len(&self) -> usize {
        self.store.read(|set| set.users.len()).await
    }

    /// Whether there are no dossiers
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

    /// Forget every dossier
    ///
    /// # Errors
    ///
    /// Returns error if the empty set cannot be written
    pub async fn reset(&self) -> Result<(), PersistenceError> {
        self.store.reset().await
    }
}
