//! Shared backing disk image.
//!
//! The guest needs a `/dev/vda`, but nothing on it is ever persisted: every
//! domain runs with QEMU `-snapshot`, so writes land in a throw-away overlay.
//! One 512 MB qcow2 file is created on first use and made read-only.

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::Command;
use tracing::info;

use crate::config::Config;
use crate::error::{AppvmError, Result};
use crate::paths::AppvmPaths;
use crate::vm::lock::FileLock;

pub const DISK_FORMAT: &str = "qcow2";
pub const DISK_SIZE: &str = "512M";

/// Return the disk image path, creating it if it does not exist yet.
pub async fn ensure_disk_image(config: &Config, paths: &AppvmPaths) -> Result<PathBuf> {
    let disk = paths.disk_image();
    let _lock = FileLock::acquire(&paths.disk_lock()).await?;

    if tokio::fs::try_exists(&disk)
        .await
        .map_err(|e| AppvmError::io(format!("stat {}", disk.display()), e))?
    {
        return Ok(disk);
    }

    let output = Command::new(&config.disk_tool)
        .arg("create")
        .args(["-f", DISK_FORMAT])
        .arg(&disk)
        .arg(DISK_SIZE)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| AppvmError::io(format!("spawn `{}`", config.disk_tool), e))?;

    if !output.status.success() {
        return Err(AppvmError::Build {
            status: format!("`{} create` {}", config.disk_tool, output.status),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    tokio::fs::set_permissions(&disk, std::fs::Permissions::from_mode(0o400))
        .await
        .map_err(|e| AppvmError::io(format!("chmod {}", disk.display()), e))?;

    info!(path = %disk.display(), size = DISK_SIZE, "created backing disk image");
    Ok(disk)
}
