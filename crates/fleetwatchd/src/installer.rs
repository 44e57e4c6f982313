//! Binary installer.
//!
//! The new binary is staged next to the target so the final rename never
//! crosses a filesystem. If staging there is impossible we copy over the
//! target directly and restore the backup when that fails.

use crate::error::InstallError;
use crate::source::Artifact;
use async_trait::async_trait;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// What the caller must do after a successful install.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    /// Binary replaced; the process must be restarted to run it.
    RestartRequired,
    /// The installer already arranged the restart itself.
    RestartInitiated,
}

#[async_trait]
pub trait Installer: Send + Sync {
    async fn install(&self, artifact: &Artifact) -> Result<InstallOutcome, InstallError>;
}

/// Replaces the agent binary on disk.
#[derive(Debug, Clone)]
pub struct BinaryInstaller {
    binary_path: PathBuf,
    backup_dir: PathBuf,
    current_version: String,
}

impl BinaryInstaller {
    pub fn new(binary_path: PathBuf, backup_dir: PathBuf, current_version: &str) -> Self {
        Self {
            binary_path,
            backup_dir,
            current_version: current_version.to_string(),
        }
    }

    pub fn backup_path(&self) -> PathBuf {
        self.backup_dir
            .join(format!("fleetwatch-agent-{}.bak", self.current_version))
    }

    fn staging_path(&self) -> PathBuf {
        let mut name = self
            .binary_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "fleetwatch-agent".into());
        name.push(".staging");
        self.binary_path.with_file_name(name)
    }

    fn install_blocking(&self, artifact: &Artifact) -> Result<InstallOutcome, InstallError> {
        if !artifact.path.is_file() {
            return Err(InstallError::MissingArtifact(artifact.path.display().to_string()));
        }
        if self.binary_path.as_os_str().is_empty() {
            return Err(InstallError::BinaryPath("not configured".to_string()));
        }

        let backup = match self.backup_current() {
            Ok(backup) => backup,
            Err(e) => {
                warn!("Failed to back up current binary: {}", e);
                None
            }
        };

        let staging = self.staging_path();
        match stage(&artifact.path, &staging) {
            Ok(()) => {
                if let Err(e) = fs::rename(&staging, &self.binary_path) {
                    let _ = fs::remove_file(&staging);
                    return Err(InstallError::Failed(format!(
                        "failed to replace {}: {}",
                        self.binary_path.display(),
                        e
                    )));
                }
            }
            Err(e) => {
                let _ = fs::remove_file(&staging);
                info!(
                    "Cannot stage next to {} ({}), copying in place",
                    self.binary_path.display(),
                    e
                );
                if let Err(e) = copy_in_place(&artifact.path, &self.binary_path) {
                    if let Some(backup) = &backup {
                        restore(backup, &self.binary_path);
                    }
                    return Err(read_only_hint(e, &self.binary_path));
                }
            }
        }

        let _ = fs::remove_file(&artifact.path);
        info!(
            "Installed {} over {}",
            artifact.version,
            self.binary_path.display()
        );
        Ok(InstallOutcome::RestartRequired)
    }

    fn backup_current(&self) -> io::Result<Option<PathBuf>> {
        if !self.binary_path.is_file() {
            return Ok(None);
        }
        fs::create_dir_all(&self.backup_dir)?;
        let backup = self.backup_path();
        fs::copy(&self.binary_path, &backup)?;
        Ok(Some(backup))
    }
}

#[async_trait]
impl Installer for BinaryInstaller {
    async fn install(&self, artifact: &Artifact) -> Result<InstallOutcome, InstallError> {
        let installer = self.clone();
        let artifact = artifact.clone();
        tokio::task::spawn_blocking(move || installer.install_blocking(&artifact))
            .await
            .map_err(|e| InstallError::Failed(format!("install task failed: {}", e)))?
    }
}

fn stage(src: &Path, staging: &Path) -> io::Result<()> {
    fs::copy(src, staging)?;
    set_executable(staging)?;
    fs::File::open(staging)?.sync_all()
}

fn copy_in_place(src: &Path, target: &Path) -> io::Result<()> {
    fs::copy(src, target)?;
    set_executable(target)
}

fn restore(backup: &Path, target: &Path) {
    match fs::copy(backup, target).and_then(|_| set_executable(target)) {
        Ok(()) => info!("Restored {} from backup", target.display()),
        Err(e) => warn!("Failed to restore {} from backup: {}", target.display(), e),
    }
}

fn read_only_hint(e: io::Error, target: &Path) -> InstallError {
    if e.to_string().contains("Read-only file system") {
        InstallError::Failed(format!(
            "{} is on a read-only filesystem; update the package or image instead",
            target.display()
        ))
    } else {
        InstallError::Io(e)
    }
}

#[cfg(unix)]
fn set_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn artifact(dir: &Path, contents: &[u8]) -> Artifact {
        let path = dir.join("download").join("fleetwatch-agent-1.3.0-linux-amd64");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, contents).unwrap();
        Artifact {
            version: "1.3.0".to_string(),
            path,
            sha256: String::new(),
            size_bytes: contents.len() as u64,
        }
    }

    #[tokio::test]
    async fn test_install_replaces_binary_and_keeps_backup() {
        let temp = TempDir::new().unwrap();
        let binary = temp.path().join("bin").join("fleetwatchd");
        fs::create_dir_all(binary.parent().unwrap()).unwrap();
        fs::write(&binary, b"old").unwrap();

        let installer = BinaryInstaller::new(binary.clone(), temp.path().join("backups"), "1.2.3");
        let outcome = installer.install(&artifact(temp.path(), b"new")).await.unwrap();

        assert_eq!(outcome, InstallOutcome::RestartRequired);
        assert_eq!(fs::read(&binary).unwrap(), b"new");
        assert_eq!(fs::read(installer.backup_path()).unwrap(), b"old");
        assert!(!installer.staging_path().exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&binary).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }
    }

    #[tokio::test]
    async fn test_missing_artifact_fails() {
        let temp = TempDir::new().unwrap();
        let installer = BinaryInstaller::new(
            temp.path().join("fleetwatchd"),
            temp.path().join("backups"),
            "1.2.3",
        );
        let missing = Artifact {
            version: "1.3.0".to_string(),
            path: temp.path().join("nope"),
            sha256: String::new(),
            size_bytes: 0,
        };

        let err = installer.install(&missing).await.unwrap_err();
        assert!(matches!(err, InstallError::MissingArtifact(_)));
    }
}
