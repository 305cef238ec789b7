//! Channels the agent never engages in

use std::collections::HashSet;
use std::path::Path;

/// Set of channel ids and names, matched case-insensitively
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlacklistSet {
    entries: HashSet<String>,
}

impl BlacklistSet {
    /// Build from raw entries; blanks and `#` comments are skipped
    #[must_use]
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let entries = entries
            .into_iter()
            .filter_map(|e| {
                let e = e.as_ref().trim().trim_start_matches('#').trim();
                (!e.is_empty()).then(|| e.to_lowercase())
            })
            .collect();
        Self { entries }
    }

    /// Read a blacklist file (one entry per line, `#` starts a comment line)
    ///
    /// A missing or unreadable file yields an empty set.
    #[must_use]
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let set = Self::from_entries(
                    content
                        .lines()
                        .map(str::trim)
                        .filter(|l| !l.is_empty() && !l.starts_with('#')),
                );
                tracing::info!(path = %path.display(), entries = set.len(), "loaded channel blacklist");
                set
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no blacklist file");
                Self::default()
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to read blacklist");
                Self::default()
            }
        }
    }

    /// Merge another set into this one
    pub fn extend(&mut self, other: Self) {
        self.entries.extend(other.entries);
    }

    /// Whether the channel (by id or display name) is blacklisted
    #[must_use]
    pub fn contains(&self, channel_id: &str, channel_name: Option<&str>) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let by_id = self.entries.contains(&channel_id.to_lowercase());
        let by_name = channel_name.is_some_and(|name| {
            let name = name.trim().trim_start_matches('#').to_lowercase();
            self.entries.contains(&name)
        });
        by_id || by_name
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the set is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
