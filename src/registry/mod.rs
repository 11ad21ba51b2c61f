//! Installed plugin registry (`<pluginDir>/registry.json`)

pub mod model;
mod service;

pub use model::{
    ErrorDetails, InstallState, InstalledPlugin, InstalledPluginRegistry, RegistryMetadata,
    RegistryViolation, TelemetrySnapshot, ViolationKind, REGISTRY_SCHEMA_VERSION,
};
pub use service::{BackupInfo, RegistryService, WriteOptions};
