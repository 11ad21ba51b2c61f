//! Service wiring for a plugin directory
//!
//! [`Depot`] builds every service from a loaded [`Config`] so that command
//! handlers only deal with one handle.

use crate::cache::{CacheService, CacheSettings};
use crate::collaborators::{LocalDirectorySource, PolicyCompatibility, ShellLifecycleRunner};
use crate::config::{Config, ConfigManager};
use crate::layout::PluginLayout;
use crate::orchestrator::{InstallOrchestrator, OrchestratorDeps, OrchestratorSettings};
use crate::pin::PinService;
use crate::registry::RegistryService;
use crate::storage::{FsStorage, StorageAdapter};
use crate::telemetry::TelemetryLog;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Every service bound to one plugin directory
pub struct Depot {
    pub layout: PluginLayout,
    pub storage: Arc<dyn StorageAdapter>,
    pub cache: Arc<CacheService>,
    pub registry: Arc<RegistryService>,
    pub pins: PinService,
    pub orchestrator: InstallOrchestrator,
}

impl Depot {
    /// Wire services for `plugin_dir`, or for `general.plugin_dir` when no
    /// override is given. Nothing is created on disk until the first write.
    pub fn open(config: &Config, plugin_dir: Option<PathBuf>) -> Self {
        let root = plugin_dir
            .map(|dir| ConfigManager::resolve_home_relative(&dir))
            .unwrap_or_else(|| ConfigManager::resolve_home_relative(&config.general.plugin_dir));
        let source_root = ConfigManager::resolve_home_relative(&config.source.root);
        debug!(
            "Plugin directory {}, artifact source {}",
            root.display(),
            source_root.display()
        );

        let storage: Arc<dyn StorageAdapter> = Arc::new(FsStorage::new());
        let layout = PluginLayout::new(root);
        let cache = Arc::new(CacheService::new(
            storage.clone(),
            layout.clone(),
            CacheSettings::from(&config.cache),
        ));
        let registry = Arc::new(RegistryService::new(storage.clone(), layout.clone()));
        let pins = PinService::new(registry.clone(), cache.clone());

        let deps = OrchestratorDeps {
            storage: storage.clone(),
            layout: layout.clone(),
            cache: cache.clone(),
            registry: registry.clone(),
            compatibility: Arc::new(PolicyCompatibility::from_config(&config.compatibility)),
            source: Arc::new(LocalDirectorySource::new(source_root, storage.clone())),
            lifecycle: Arc::new(ShellLifecycleRunner::from_config(&config.lifecycle)),
            telemetry: Arc::new(TelemetryLog::new(
                layout.telemetry_path(),
                config.general.telemetry,
            )),
        };
        let orchestrator = InstallOrchestrator::new(deps, OrchestratorSettings::from(config));

        Self {
            layout,
            storage,
            cache,
            registry,
            pins,
            orchestrator,
        }
    }
}
