//! Post-update health probes.

use async_trait::async_trait;
use std::path::PathBuf;
use tokio::fs;

#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// `Err` carries a human-readable reason.
    async fn check(&self) -> Result<(), String>;
}

/// Healthy when the agent can still write to its data directory.
pub struct DataDirProbe {
    dir: PathBuf,
}

impl DataDirProbe {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

#[async_trait]
impl HealthProbe for DataDirProbe {
    async fn check(&self) -> Result<(), String> {
        let probe = self.dir.join(".health_probe");
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| format!("cannot create {}: {}", self.dir.display(), e))?;
        fs::write(&probe, b"ok")
            .await
            .map_err(|e| format!("{} is not writable: {}", self.dir.display(), e))?;
        let _ = fs::remove_file(&probe).await;
        Ok(())
    }
}
