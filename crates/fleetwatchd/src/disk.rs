//! Free-space pre-flight before a download.

use crate::error::UpdateError;
use std::path::PathBuf;
use sysinfo::Disks;
use tracing::{debug, warn};

const MB: u64 = 1024 * 1024;

/// Floor for the space required by any download, in MB.
pub const DEFAULT_MIN_DISK_SPACE_MB: u64 = 200;

/// Download, backup and the replaced binary can all sit on disk at once.
const SIZE_MULTIPLIER: u64 = 3;

pub trait DiskSpace: Send + Sync {
    /// Free bytes on the filesystem that receives downloads. `Err` carries
    /// a human-readable reason.
    fn available_bytes(&self) -> Result<u64, String>;
}

/// Reads free space from the mounted filesystem holding `dir`.
pub struct SystemDiskSpace {
    dir: PathBuf,
}

impl SystemDiskSpace {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

impl DiskSpace for SystemDiskSpace {
    fn available_bytes(&self) -> Result<u64, String> {
        let disks = Disks::new_with_refreshed_list();
        let dir = self.dir.canonicalize().unwrap_or_else(|_| self.dir.clone());

        // Longest mount point that prefixes the directory wins.
        disks
            .list()
            .iter()
            .filter(|disk| dir.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space())
            .ok_or_else(|| format!("no mounted filesystem holds {}", dir.display()))
    }
}

/// Space needed for an artifact of `size_bytes`, in MB.
pub fn required_mb(size_bytes: u64, min_mb: u64) -> u64 {
    (size_bytes.saturating_mul(SIZE_MULTIPLIER) / MB).max(min_mb)
}

/// Refuse the download when free space is short. A failed lookup does not
/// block the update.
pub fn ensure_space(disk: &dyn DiskSpace, size_bytes: u64, min_mb: u64) -> Result<(), UpdateError> {
    let required = required_mb(size_bytes, min_mb);
    let available = match disk.available_bytes() {
        Ok(bytes) => bytes / MB,
        Err(e) => {
            warn!("Could not check free disk space, continuing: {}", e);
            return Ok(());
        }
    };

    debug!("Disk space: need {} MB, have {} MB", required, available);
    if available < required {
        return Err(UpdateError::DiskSpace { required, available });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Result<u64, String>);

    impl DiskSpace for Fixed {
        fn available_bytes(&self) -> Result<u64, String> {
            self.0.clone()
        }
    }

    #[test]
    fn test_required_space_has_floor() {
        assert_eq!(required_mb(10, DEFAULT_MIN_DISK_SPACE_MB), 200);
        assert_eq!(required_mb(100 * MB, DEFAULT_MIN_DISK_SPACE_MB), 300);
        assert_eq!(required_mb(u64::MAX, 0), u64::MAX / MB);
    }

    #[test]
    fn test_short_space_is_refused() {
        let err = ensure_space(&Fixed(Ok(150 * MB)), 10, DEFAULT_MIN_DISK_SPACE_MB).unwrap_err();
        assert!(matches!(
            err,
            UpdateError::DiskSpace {
                required: 200,
                available: 150
            }
        ));
        assert_eq!(err.code(), "DISK_SPACE");

        assert!(ensure_space(&Fixed(Ok(200 * MB)), 10, DEFAULT_MIN_DISK_SPACE_MB).is_ok());
    }

    #[test]
    fn test_lookup_failure_does_not_block() {
        let disk = Fixed(Err("statfs failed".to_string()));
        assert!(ensure_space(&disk, 10 * 1024 * MB, DEFAULT_MIN_DISK_SPACE_MB).is_ok());
    }
}
