//! Cache index model
//!
//! The index is the authoritative description of what lives under
//! `<plugin_dir>/cache`. It is loaded whole, mutated in memory and written
//! back atomically; `total_size_bytes` is always recomputed from entries.

use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::path::PathBuf;

/// Current on-disk index format
pub const INDEX_FORMAT_VERSION: u32 = 1;

/// Number of eviction records retained in the index
pub const EVICTION_LOG_CAPACITY: usize = 100;

/// Bytes per configured megabyte (limits are decimal)
pub const BYTES_PER_MB: u64 = 1_000_000;

/// Format bytes as human-readable size (e.g., "1.5 GB")
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1_000;
    const MB: u64 = KB * 1_000;
    const GB: u64 = MB * 1_000;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Convert configured megabytes to bytes
pub fn mb_to_bytes(mb: u64) -> u64 {
    mb.saturating_mul(BYTES_PER_MB)
}

/// Cache size status relative to configured limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheSizeStatus {
    /// Under 80% of limit
    Ok,
    /// Between 80% and 100% of limit
    Warning,
    /// At or over the limit
    Exceeded,
}

impl CacheSizeStatus {
    /// Determine status based on current size and limit
    pub fn from_usage(current_bytes: u64, limit_bytes: u64) -> Self {
        if limit_bytes == 0 {
            return Self::Ok;
        }
        let percent = Self::percentage(current_bytes, limit_bytes);
        if percent >= 100.0 {
            Self::Exceeded
        } else if percent >= 80.0 {
            Self::Warning
        } else {
            Self::Ok
        }
    }

    /// Get percentage of limit used
    pub fn percentage(current_bytes: u64, limit_bytes: u64) -> f64 {
        if limit_bytes == 0 {
            return 0.0;
        }
        (current_bytes as f64 / limit_bytes as f64) * 100.0
    }
}

impl fmt::Display for CacheSizeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Warning => write!(f, "warning"),
            Self::Exceeded => write!(f, "exceeded"),
        }
    }
}

/// Parse a version leniently: `v` prefixes are stripped and short forms
/// like `1.2` or `3` are padded to full semantic versions.
pub fn parse_version(raw: &str) -> Option<Version> {
    let trimmed = raw.trim().trim_start_matches('v');
    if let Ok(v) = Version::parse(trimmed) {
        return Some(v);
    }

    let split = trimmed.find(['-', '+']).unwrap_or(trimmed.len());
    let (core, suffix) = trimmed.split_at(split);
    let parts: Vec<&str> = core.split('.').collect();
    if parts.is_empty()
        || parts.len() > 3
        || parts
            .iter()
            .any(|p| p.is_empty() || !p.chars().all(|c| c.is_ascii_digit()))
    {
        return None;
    }

    let mut padded = parts.join(".");
    for _ in parts.len()..3 {
        padded.push_str(".0");
    }
    padded.push_str(suffix);
    Version::parse(&padded).ok()
}

/// Total order over version strings: semantic versions ascending,
/// unparsable versions after them in lexical order
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    match (parse_version(a), parse_version(b)) {
        (Some(va), Some(vb)) => va.cmp(&vb).then_with(|| a.cmp(b)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

/// One cached artifact set, identified by `(plugin_id, version)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    /// Plugin identifier
    pub plugin_id: String,

    /// Cached version
    pub version: String,

    /// Absolute location of the artifact tree
    pub cache_path: PathBuf,

    /// Size of the artifact tree in bytes
    pub size_bytes: u64,

    /// Last time the artifacts were retrieved
    pub last_access_time: DateTime<Utc>,

    /// Protected from eviction
    pub pinned: bool,

    /// Version the plugin's activation link points at
    pub is_current_version: bool,

    /// Tree checksum computed at promotion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,

    /// When the version was promoted into the cache
    pub promoted_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Create an unpinned, non-current entry
    pub fn new(
        plugin_id: impl Into<String>,
        version: impl Into<String>,
        cache_path: PathBuf,
        size_bytes: u64,
        checksum: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            plugin_id: plugin_id.into(),
            version: version.into(),
            cache_path,
            size_bytes,
            last_access_time: now,
            pinned: false,
            is_current_version: false,
            checksum,
            promoted_at: now,
        }
    }

    /// Pinned and current entries are never evicted
    pub fn is_protected(&self) -> bool {
        self.pinned || self.is_current_version
    }
}

/// Why an entry left the cache (or was kept)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvictionReason {
    /// Total cache size exceeded the configured limit
    SizeLimit,
    /// A plugin had more cached versions than allowed
    VersionLimit,
    /// Marker for candidates skipped because they are pinned or current
    PinProtected,
    /// Explicit operator or uninstall request
    ManualCleanup,
    /// Stale staging workspace reclaimed
    OrphanedTemp,
    /// Entry failed integrity verification
    Corruption,
}

impl fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::SizeLimit => "SIZE_LIMIT",
            Self::VersionLimit => "VERSION_LIMIT",
            Self::PinProtected => "PIN_PROTECTED",
            Self::ManualCleanup => "MANUAL_CLEANUP",
            Self::OrphanedTemp => "ORPHANED_TEMP",
            Self::Corruption => "CORRUPTION",
        };
        write!(f, "{}", name)
    }
}

/// One record in the bounded eviction log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvictionLogEntry {
    pub timestamp: DateTime<Utc>,
    pub reason: EvictionReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub was_pinned: bool,
}

/// An entry removed by an eviction pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvictedEntry {
    pub plugin_id: String,
    pub version: String,
    pub size_bytes: u64,
    pub reason: EvictionReason,
}

/// An entry an eviction pass wanted to consider but could not touch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtectedEntry {
    pub plugin_id: String,
    pub version: String,
    pub pinned: bool,
    pub is_current_version: bool,
    /// Always [`EvictionReason::PinProtected`]
    pub reason: EvictionReason,
}

/// Summary of one eviction pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvictionResult {
    /// Whether any limit was exceeded
    pub triggered: bool,
    /// Passes that ran
    pub reasons: Vec<EvictionReason>,
    /// Number of entries removed
    pub entries_evicted: usize,
    /// Removed entries in removal order
    pub evicted: Vec<EvictedEntry>,
    /// Entries skipped because they are pinned or current
    pub protected: Vec<ProtectedEntry>,
    pub bytes_freed: u64,
    pub total_before: u64,
    pub total_after: u64,
    pub timestamp: DateTime<Utc>,
    /// Planned only, nothing removed
    #[serde(default)]
    pub dry_run: bool,
}

impl EvictionResult {
    /// Result of a pass that found nothing to do
    pub fn untriggered(total: u64) -> Self {
        Self {
            triggered: false,
            reasons: vec![],
            entries_evicted: 0,
            evicted: vec![],
            protected: vec![],
            bytes_freed: 0,
            total_before: total,
            total_after: total,
            timestamp: Utc::now(),
            dry_run: false,
        }
    }
}

/// Top-level persisted cache structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheIndex {
    /// Index format version
    pub version: u32,

    /// Incremented on every committed write; used to detect concurrent writers
    #[serde(default)]
    pub revision: u64,

    /// Sum of all entries' sizes
    pub total_size_bytes: u64,

    pub last_updated: DateTime<Utc>,

    /// Entries grouped by plugin id
    #[serde(default)]
    pub entries: BTreeMap<String, Vec<CacheEntry>>,

    /// Most recent evictions, oldest first
    #[serde(default)]
    pub eviction_log: VecDeque<EvictionLogEntry>,
}

impl Default for CacheIndex {
    fn default() -> Self {
        Self {
            version: INDEX_FORMAT_VERSION,
            revision: 0,
            total_size_bytes: 0,
            last_updated: Utc::now(),
            entries: BTreeMap::new(),
            eviction_log: VecDeque::new(),
        }
    }
}

impl CacheIndex {
    /// Look up one entry
    pub fn get(&self, plugin_id: &str, version: &str) -> Option<&CacheEntry> {
        self.entries
            .get(plugin_id)?
            .iter()
            .find(|e| e.version == version)
    }

    /// Look up one entry mutably
    pub fn get_mut(&mut self, plugin_id: &str, version: &str) -> Option<&mut CacheEntry> {
        self.entries
            .get_mut(plugin_id)?
            .iter_mut()
            .find(|e| e.version == version)
    }

    /// All cached versions of a plugin, oldest version first
    pub fn versions_of(&self, plugin_id: &str) -> Vec<&CacheEntry> {
        let mut versions: Vec<&CacheEntry> = self
            .entries
            .get(plugin_id)
            .map(|v| v.iter().collect())
            .unwrap_or_default();
        versions.sort_by(|a, b| compare_versions(&a.version, &b.version));
        versions
    }

    /// Iterate every entry
    pub fn iter(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.values().flatten()
    }

    /// Number of entries across all plugins
    pub fn entry_count(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    /// Insert an entry, replacing any entry with the same key.
    /// Returns the replaced entry.
    pub fn upsert(&mut self, entry: CacheEntry) -> Option<CacheEntry> {
        let versions = self.entries.entry(entry.plugin_id.clone()).or_default();
        let previous = match versions.iter().position(|e| e.version == entry.version) {
            Some(pos) => Some(std::mem::replace(&mut versions[pos], entry)),
            None => {
                versions.push(entry);
                None
            }
        };
        self.recompute_total();
        previous
    }

    /// Remove an entry; drops the plugin key once it has no versions left
    pub fn remove(&mut self, plugin_id: &str, version: &str) -> Option<CacheEntry> {
        let versions = self.entries.get_mut(plugin_id)?;
        let pos = versions.iter().position(|e| e.version == version)?;
        let removed = versions.remove(pos);
        if versions.is_empty() {
            self.entries.remove(plugin_id);
        }
        self.recompute_total();
        Some(removed)
    }

    /// Mark `version` as the plugin's only current version (or clear it)
    pub fn set_current(&mut self, plugin_id: &str, version: Option<&str>) -> bool {
        let mut changed = false;
        if let Some(versions) = self.entries.get_mut(plugin_id) {
            for entry in versions.iter_mut() {
                let current = Some(entry.version.as_str()) == version;
                if entry.is_current_version != current {
                    entry.is_current_version = current;
                    changed = true;
                }
            }
        }
        changed
    }

    /// Recompute `total_size_bytes` from entries
    pub fn recompute_total(&mut self) -> u64 {
        self.total_size_bytes = self.iter().map(|e| e.size_bytes).sum();
        self.total_size_bytes
    }

    /// Append to the eviction log, dropping the oldest records beyond capacity
    pub fn record_eviction(&mut self, record: EvictionLogEntry) {
        self.eviction_log.push_back(record);
        while self.eviction_log.len() > EVICTION_LOG_CAPACITY {
            self.eviction_log.pop_front();
        }
    }

    /// Structural invariant violations, empty when healthy
    pub fn invariant_violations(&self) -> Vec<String> {
        let mut violations = Vec::new();

        for (plugin_id, versions) in &self.entries {
            let mut seen = std::collections::HashSet::new();
            for entry in versions {
                if &entry.plugin_id != plugin_id {
                    violations.push(format!(
                        "entry {}@{} filed under {}",
                        entry.plugin_id, entry.version, plugin_id
                    ));
                }
                if !seen.insert(entry.version.as_str()) {
                    violations.push(format!("duplicate entry {}@{}", plugin_id, entry.version));
                }
            }
            let current = versions.iter().filter(|e| e.is_current_version).count();
            if current > 1 {
                violations.push(format!(
                    "{} has {} current versions",
                    plugin_id, current
                ));
            }
        }

        let computed: u64 = self.iter().map(|e| e.size_bytes).sum();
        if computed != self.total_size_bytes {
            violations.push(format!(
                "total size {} does not match sum of entries {}",
                self.total_size_bytes, computed
            ));
        }

        violations
    }
}
