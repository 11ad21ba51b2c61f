//! Transaction telemetry
//!
//! Writes one JSON line per finished transaction to `<pluginDir>/telemetry.log`.
//! On by default; `general.telemetry = false` turns it off.

use chrono::Utc;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::warn;

/// File-based telemetry sink that appends JSON lines
pub struct TelemetryLog {
    enabled: bool,
    path: PathBuf,
}

impl TelemetryLog {
    pub fn new(path: impl Into<PathBuf>, enabled: bool) -> Self {
        Self {
            enabled,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append an event as a JSON line
    ///
    /// IO failures are logged and dropped; telemetry never fails the
    /// transaction it describes.
    pub async fn record<T: Serialize + ?Sized>(&self, event: &str, data: &T) {
        if !self.enabled {
            return;
        }

        let data = match serde_json::to_value(data) {
            Ok(v) => v,
            Err(e) => {
                warn!("Failed to serialize telemetry event: {}", e);
                return;
            }
        };
        let entry = serde_json::json!({
            "timestamp": Utc::now().to_rfc3339(),
            "event": event,
            "data": data,
        });

        let mut line = entry.to_string();
        line.push('\n');

        if let Err(e) = self.append(&line).await {
            warn!("Failed to write telemetry log: {}", e);
        }
    }

    async fn append(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;

        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
