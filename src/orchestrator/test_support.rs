//! Fixtures shared by the orchestrator tests

use super::{InstallOrchestrator, OrchestratorDeps, OrchestratorSettings};
use crate::cache::{CacheService, CacheSettings};
use crate::collaborators::{
    HookOutput, LifecycleRunner, LocalDirectorySource, PolicyCompatibility,
};
use crate::error::{DepotError, DepotResult};
use crate::layout::PluginLayout;
use crate::manifest::HookKind;
use crate::registry::RegistryService;
use crate::storage::{FsStorage, StorageAdapter};
use crate::telemetry::TelemetryLog;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Lifecycle runner that records calls instead of spawning a shell
#[derive(Default)]
pub(crate) struct RecordingRunner {
    pub calls: Mutex<Vec<(HookKind, String, PathBuf)>>,
    pub fail: bool,
}

impl RecordingRunner {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl LifecycleRunner for RecordingRunner {
    async fn run(
        &self,
        hook: HookKind,
        command: &str,
        working_dir: &Path,
        _timeout: Duration,
    ) -> DepotResult<HookOutput> {
        self.calls
            .lock()
            .unwrap()
            .push((hook, command.to_string(), working_dir.to_path_buf()));
        if self.fail {
            return Err(DepotError::LifecycleFailed {
                hook: hook.to_string(),
                reason: "exit code 1".to_string(),
            });
        }
        Ok(HookOutput {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        })
    }
}

pub(crate) struct FixtureOptions {
    pub cache: CacheSettings,
    pub blocked: Vec<String>,
    pub warn: Vec<String>,
    pub runner: Arc<RecordingRunner>,
}

impl Default for FixtureOptions {
    fn default() -> Self {
        Self {
            cache: CacheSettings::default(),
            blocked: vec![],
            warn: vec![],
            runner: Arc::new(RecordingRunner::default()),
        }
    }
}

pub(crate) struct Fixture {
    pub temp: TempDir,
    pub layout: PluginLayout,
    pub cache: Arc<CacheService>,
    pub registry: Arc<RegistryService>,
    pub runner: Arc<RecordingRunner>,
    pub orchestrator: InstallOrchestrator,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_options(FixtureOptions::default())
    }

    pub fn with_options(options: FixtureOptions) -> Self {
        let temp = TempDir::new().unwrap();
        let storage: Arc<dyn StorageAdapter> = Arc::new(FsStorage::new());
        let layout = PluginLayout::new(temp.path().join("depot"));
        let cache = Arc::new(CacheService::new(
            storage.clone(),
            layout.clone(),
            options.cache,
        ));
        let registry = Arc::new(RegistryService::new(storage.clone(), layout.clone()));

        let deps = OrchestratorDeps {
            storage: storage.clone(),
            layout: layout.clone(),
            cache: cache.clone(),
            registry: registry.clone(),
            compatibility: Arc::new(PolicyCompatibility::new(options.blocked, options.warn)),
            source: Arc::new(LocalDirectorySource::new(temp.path().join("sources"), storage)),
            lifecycle: options.runner.clone(),
            telemetry: Arc::new(TelemetryLog::new(layout.telemetry_path(), true)),
        };
        let orchestrator = InstallOrchestrator::new(deps, OrchestratorSettings::default());

        Self {
            temp,
            layout,
            cache,
            registry,
            runner: options.runner,
            orchestrator,
        }
    }

    /// Publish a version into the local source
    pub fn publish(&self, plugin_id: &str, version: &str) -> PathBuf {
        self.publish_manifest(
            plugin_id,
            version,
            serde_json::json!({ "name": plugin_id, "version": version }),
        )
    }

    pub fn publish_manifest(
        &self,
        plugin_id: &str,
        version: &str,
        manifest: serde_json::Value,
    ) -> PathBuf {
        let dir = self.temp.path().join("sources").join(plugin_id).join(version);
        std::fs::create_dir_all(dir.join("commands")).unwrap();
        std::fs::write(dir.join("plugin.json"), manifest.to_string()).unwrap();
        std::fs::write(
            dir.join("commands/run.md"),
            format!("{} {}", plugin_id, version),
        )
        .unwrap();
        dir
    }

    pub fn tmp_entries(&self) -> usize {
        match std::fs::read_dir(self.layout.tmp_dir()) {
            Ok(entries) => entries.count(),
            Err(_) => 0,
        }
    }

    pub fn link_target(&self, plugin_id: &str) -> Option<PathBuf> {
        std::fs::read_link(self.layout.activation_link(plugin_id)).ok()
    }

    pub fn registry_bytes(&self) -> Option<Vec<u8>> {
        std::fs::read(self.layout.registry_path()).ok()
    }
}
