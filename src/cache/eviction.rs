//! Deterministic eviction planning
//!
//! Planning is a pure function of the index so the exact removal order can
//! be tested without touching the filesystem. The cache service executes
//! plans one removal at a time and re-plans after every step.

use crate::cache::index::{
    compare_versions, CacheEntry, CacheIndex, EvictionReason, ProtectedEntry,
};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};

/// Default number of cached versions kept per plugin
pub const DEFAULT_MAX_VERSIONS_PER_PLUGIN: usize = 3;

/// Limits an eviction pass enforces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionLimits {
    /// Global size ceiling in bytes
    pub max_size_bytes: u64,
    /// Per-plugin version ceiling (0 disables the version pass)
    pub max_versions_per_plugin: usize,
}

/// One removal the planner decided on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedRemoval {
    pub plugin_id: String,
    pub version: String,
    pub size_bytes: u64,
    pub reason: EvictionReason,
}

/// Complete plan for one eviction pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionPlan {
    pub total_before: u64,
    pub projected_after: u64,
    /// Passes that were entered
    pub reasons: Vec<EvictionReason>,
    /// Removals in execution order
    pub removals: Vec<PlannedRemoval>,
    /// Pinned or current entries in scope of a triggered pass
    pub protected: Vec<ProtectedEntry>,
}

impl EvictionPlan {
    /// Whether any limit was exceeded
    pub fn triggered(&self) -> bool {
        !self.reasons.is_empty()
    }
}

/// Least-recently-used first; ties broken by version ascending, then plugin id
fn lru_order(a: &CacheEntry, b: &CacheEntry) -> Ordering {
    a.last_access_time
        .cmp(&b.last_access_time)
        .then_with(|| compare_versions(&a.version, &b.version))
        .then_with(|| a.plugin_id.cmp(&b.plugin_id))
}

/// Plan an eviction pass over `index`
pub fn plan_eviction(index: &CacheIndex, limits: &EvictionLimits) -> EvictionPlan {
    plan_eviction_excluding(index, limits, &HashSet::new())
}

/// Plan an eviction pass, never selecting the `(plugin_id, version)` keys
/// in `exclude` (used to step past entries whose removal failed)
pub fn plan_eviction_excluding(
    index: &CacheIndex,
    limits: &EvictionLimits,
    exclude: &HashSet<(String, String)>,
) -> EvictionPlan {
    let total_before: u64 = index.iter().map(|e| e.size_bytes).sum();
    let mut total = total_before;

    let mut candidates: Vec<&CacheEntry> = index
        .iter()
        .filter(|e| !e.is_protected())
        .filter(|e| !exclude.contains(&(e.plugin_id.clone(), e.version.clone())))
        .collect();
    candidates.sort_by(|a, b| lru_order(a, b));

    let mut reasons = Vec::new();
    let mut removals = Vec::new();
    let mut removed: HashSet<(&str, &str)> = HashSet::new();
    let mut removed_per_plugin: HashMap<&str, usize> = HashMap::new();

    let size_triggered = total > limits.max_size_bytes;
    if size_triggered {
        reasons.push(EvictionReason::SizeLimit);
        for candidate in &candidates {
            if total <= limits.max_size_bytes {
                break;
            }
            total = total.saturating_sub(candidate.size_bytes);
            removed.insert((&candidate.plugin_id, &candidate.version));
            *removed_per_plugin.entry(&candidate.plugin_id).or_default() += 1;
            removals.push(PlannedRemoval {
                plugin_id: candidate.plugin_id.clone(),
                version: candidate.version.clone(),
                size_bytes: candidate.size_bytes,
                reason: EvictionReason::SizeLimit,
            });
        }
    }

    let mut version_plugins: BTreeSet<&str> = BTreeSet::new();
    if limits.max_versions_per_plugin > 0 {
        for (plugin_id, versions) in &index.entries {
            if versions.len() <= limits.max_versions_per_plugin {
                continue;
            }
            version_plugins.insert(plugin_id);

            let mut remaining =
                versions.len() - removed_per_plugin.get(plugin_id.as_str()).copied().unwrap_or(0);
            for candidate in candidates.iter().filter(|c| &c.plugin_id == plugin_id) {
                if remaining <= limits.max_versions_per_plugin {
                    break;
                }
                if !removed.insert((&candidate.plugin_id, &candidate.version)) {
                    continue;
                }
                remaining -= 1;
                total = total.saturating_sub(candidate.size_bytes);
                removals.push(PlannedRemoval {
                    plugin_id: candidate.plugin_id.clone(),
                    version: candidate.version.clone(),
                    size_bytes: candidate.size_bytes,
                    reason: EvictionReason::VersionLimit,
                });
            }
        }
        if !version_plugins.is_empty() {
            reasons.push(EvictionReason::VersionLimit);
        }
    }

    let mut protected: Vec<ProtectedEntry> = index
        .iter()
        .filter(|e| e.is_protected())
        .filter(|e| size_triggered || version_plugins.contains(e.plugin_id.as_str()))
        .map(|e| ProtectedEntry {
            plugin_id: e.plugin_id.clone(),
            version: e.version.clone(),
            pinned: e.pinned,
            is_current_version: e.is_current_version,
            reason: EvictionReason::PinProtected,
        })
        .collect();
    protected.sort_by(|a, b| {
        a.plugin_id
            .cmp(&b.plugin_id)
            .then_with(|| compare_versions(&a.version, &b.version))
    });

    EvictionPlan {
        total_before,
        projected_after: total,
        reasons,
        removals,
        protected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::index::{mb_to_bytes, CacheEntry};
    use chrono::{Duration, TimeZone, Utc};
    use std::path::PathBuf;

    fn entry(plugin: &str, version: &str, size: u64, age_minutes: i64) -> CacheEntry {
        let mut e = CacheEntry::new(
            plugin,
            version,
            PathBuf::from(format!("/cache/{}/{}", plugin, version)),
            size,
            None,
        );
        let base = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        e.last_access_time = base - Duration::minutes(age_minutes);
        e
    }

    fn limits(max_mb: u64) -> EvictionLimits {
        EvictionLimits {
            max_size_bytes: mb_to_bytes(max_mb),
            max_versions_per_plugin: DEFAULT_MAX_VERSIONS_PER_PLUGIN,
        }
    }

    fn keys(plan: &EvictionPlan) -> Vec<(String, String)> {
        plan.removals
            .iter()
            .map(|r| (r.plugin_id.clone(), r.version.clone()))
            .collect()
    }

    #[test]
    fn scenario_size_limit_removes_only_oldest_non_current() {
        let mb150 = mb_to_bytes(150);
        let mut index = CacheIndex::default();
        // Equal access times: ties fall back to version order
        index.upsert(entry("alpha", "1.0", mb150, 0));
        index.upsert(entry("alpha", "1.1", mb150, 0));
        let mut current = entry("alpha", "1.2", mb150, 0);
        current.is_current_version = true;
        index.upsert(current);
        index.upsert(entry("alpha", "1.3", mb150, 0));

        let plan = plan_eviction(&index, &limits(500));

        assert_eq!(plan.total_before, mb_to_bytes(600));
        assert_eq!(keys(&plan), vec![("alpha".into(), "1.0".into())]);
        assert_eq!(plan.removals[0].reason, EvictionReason::SizeLimit);
        assert_eq!(plan.projected_after, mb_to_bytes(450));
        assert!(plan.reasons.contains(&EvictionReason::SizeLimit));
        assert!(plan.reasons.contains(&EvictionReason::VersionLimit));
        assert_eq!(plan.protected.len(), 1);
        assert_eq!(plan.protected[0].version, "1.2");
    }

    #[test]
    fn lru_order_beats_version_order() {
        let mut index = CacheIndex::default();
        index.upsert(entry("alpha", "1.0", 100, 10));
        index.upsert(entry("alpha", "2.0", 100, 60));
        let plan = plan_eviction(
            &index,
            &EvictionLimits {
                max_size_bytes: 150,
                max_versions_per_plugin: 3,
            },
        );
        assert_eq!(keys(&plan), vec![("alpha".into(), "2.0".into())]);
    }

    #[test]
    fn protected_entries_are_never_planned() {
        let mut index = CacheIndex::default();
        let mut pinned = entry("alpha", "1.0", mb_to_bytes(900), 500);
        pinned.pinned = true;
        index.upsert(pinned);
        let mut current = entry("alpha", "1.1", mb_to_bytes(900), 400);
        current.is_current_version = true;
        index.upsert(current);

        let plan = plan_eviction(&index, &limits(500));
        assert!(plan.triggered());
        assert!(plan.removals.is_empty());
        // Left permanently over the limit
        assert_eq!(plan.projected_after, mb_to_bytes(1800));
        assert_eq!(plan.protected.len(), 2);
        assert!(plan
            .protected
            .iter()
            .all(|p| p.reason == EvictionReason::PinProtected));
    }

    #[test]
    fn size_pass_converges_across_plugins() {
        let mut index = CacheIndex::default();
        index.upsert(entry("alpha", "1.0", 300, 50));
        index.upsert(entry("beta", "1.0", 300, 40));
        index.upsert(entry("gamma", "1.0", 300, 30));
        index.upsert(entry("delta", "1.0", 300, 20));

        let plan = plan_eviction(
            &index,
            &EvictionLimits {
                max_size_bytes: 650,
                max_versions_per_plugin: 3,
            },
        );
        assert_eq!(
            keys(&plan),
            vec![
                ("alpha".into(), "1.0".into()),
                ("beta".into(), "1.0".into())
            ]
        );
        assert!(plan.projected_after <= 650);
    }

    #[test]
    fn version_pass_runs_regardless_of_size() {
        let mut index = CacheIndex::default();
        for (i, v) in ["1.0", "1.1", "1.2", "1.3", "1.4"].iter().enumerate() {
            index.upsert(entry("alpha", v, 1, 100 - i as i64));
        }
        index.upsert(entry("beta", "0.1", 1, 1000));

        let plan = plan_eviction(&index, &limits(500));
        assert_eq!(plan.reasons, vec![EvictionReason::VersionLimit]);
        assert_eq!(
            keys(&plan),
            vec![
                ("alpha".into(), "1.0".into()),
                ("alpha".into(), "1.1".into())
            ]
        );
        assert!(plan
            .removals
            .iter()
            .all(|r| r.reason == EvictionReason::VersionLimit));
    }

    #[test]
    fn version_pass_keeps_protected_versions() {
        let mut index = CacheIndex::default();
        for v in ["1.0", "1.1", "1.2", "1.3"] {
            let mut e = entry("alpha", v, 1, 10);
            e.pinned = true;
            index.upsert(e);
        }
        let plan = plan_eviction(&index, &limits(500));
        assert!(plan.removals.is_empty());
        assert_eq!(plan.protected.len(), 4);
    }

    #[test]
    fn nothing_to_do_under_limits() {
        let mut index = CacheIndex::default();
        index.upsert(entry("alpha", "1.0", 10, 10));
        let plan = plan_eviction(&index, &limits(500));
        assert!(!plan.triggered());
        assert!(plan.removals.is_empty());
        assert!(plan.protected.is_empty());
    }

    #[test]
    fn excluded_entries_are_skipped() {
        let mut index = CacheIndex::default();
        index.upsert(entry("alpha", "1.0", 100, 50));
        index.upsert(entry("alpha", "1.1", 100, 40));

        let exclude: HashSet<(String, String)> =
            [("alpha".to_string(), "1.0".to_string())].into_iter().collect();
        let plan = plan_eviction_excluding(
            &index,
            &EvictionLimits {
                max_size_bytes: 150,
                max_versions_per_plugin: 3,
            },
            &exclude,
        );
        assert_eq!(keys(&plan), vec![("alpha".into(), "1.1".into())]);
    }
}
