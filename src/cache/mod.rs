//! Versioned artifact cache
//!
//! Every installed version of a plugin lives in an immutable tree under
//! `<pluginDir>/cache/<pluginId>/<version>/`, described by `index.json`.
//!
//! # Eviction
//!
//! | Pass | Trigger | Removes |
//! |------|---------|---------|
//! | `SIZE_LIMIT` | total size over `max_size_mb` | LRU candidates until under the limit |
//! | `VERSION_LIMIT` | a plugin has more than 3 versions | that plugin's LRU candidates down to 3 |
//!
//! Pinned entries and the current version of each plugin are never
//! candidates, even if that leaves the cache over its limit.

pub mod eviction;
pub mod index;
mod service;

pub use eviction::{plan_eviction, EvictionLimits, EvictionPlan, PlannedRemoval};
pub use index::{
    format_bytes, CacheEntry, CacheIndex, CacheSizeStatus, EvictedEntry, EvictionLogEntry,
    EvictionReason, EvictionResult, ProtectedEntry,
};
pub use service::{
    CacheService, CacheSettings, CacheStats, EvictionOptions, IntegrityIssue, IntegrityProblem,
    PromoteOptions, PromoteOutcome, RebuildReport, StagedArtifacts,
};
