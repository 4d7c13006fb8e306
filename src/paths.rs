//! Directory layout for appvm.
//!
//! - State:  `~/appvm/`            (one shared directory per application)
//! - Config: `~/.config/appvm/`    (Nix templates, `appvm.toml`)
//! - Locks:  `~/appvm/.locks/`     (outside application directories so `drop`
//!   never removes a held lock)

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{AppvmError, Result};
use crate::vm::AppName;

const APP_NAME: &str = "appvm";

/// Shared Nix module imported by every application specification.
/// Rewritten on every run so upgrades take effect.
pub const BASE_NIX: &str = include_str!("../templates/base.nix");

/// Per-user overrides. Seeded once, never overwritten.
pub const LOCAL_NIX: &str = include_str!("../templates/local.nix");

/// All resolved appvm paths.
#[derive(Debug, Clone)]
pub struct AppvmPaths {
    /// Per-application state root: `~/appvm/`
    pub base: PathBuf,
    /// Configuration root, also passed to the builder as an include path.
    pub config: PathBuf,
    /// Advisory lock files.
    pub locks: PathBuf,
}

impl AppvmPaths {
    /// Resolve from `$HOME`. Does not touch the filesystem.
    pub fn resolve() -> Result<Self> {
        let home = std::env::var("HOME")
            .map(PathBuf::from)
            .map_err(|_| AppvmError::Config("HOME is not set".into()))?;
        Ok(Self::with_home(&home))
    }

    pub fn with_home(home: &Path) -> Self {
        let config = if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            PathBuf::from(xdg).join(APP_NAME)
        } else {
            home.join(".config").join(APP_NAME)
        };
        Self::from_roots(home.join(APP_NAME), config)
    }

    pub fn from_roots(base: PathBuf, config: PathBuf) -> Self {
        Self {
            locks: base.join(".locks"),
            base,
            config,
        }
    }

    pub fn nix_dir(&self) -> PathBuf {
        self.config.join("nix")
    }

    pub fn config_file(&self) -> PathBuf {
        self.config.join("appvm.toml")
    }

    /// Shared directory handed to the domain for `name`. Always a direct
    /// child of `base`.
    pub fn app_dir(&self, name: &AppName) -> PathBuf {
        self.base.join(name.file_stem())
    }

    /// Memory telemetry written by the in-guest agent, in MiB.
    pub fn memory_used_file(&self, name: &AppName) -> PathBuf {
        self.app_dir(name).join(".memory_used")
    }

    /// Backing disk image shared by all domains (only ever used with `-snapshot`).
    pub fn disk_image(&self) -> PathBuf {
        self.base.join(".fake.qcow2")
    }

    pub fn app_lock(&self, name: &AppName) -> PathBuf {
        self.locks.join(format!("{}.lock", name.file_stem()))
    }

    pub fn disk_lock(&self) -> PathBuf {
        self.locks.join(".fake.qcow2.lock")
    }

    /// Create the state and config directories (mode 0700) that don't exist yet.
    pub fn ensure(&self) -> Result<()> {
        for dir in [&self.base, &self.locks, &self.config, &self.nix_dir()] {
            create_private_dir(dir)?;
            debug!("ensured directory: {}", dir.display());
        }
        Ok(())
    }

    /// Write `base.nix` unconditionally and seed `local.nix` if absent.
    pub fn write_templates(&self) -> Result<()> {
        let nix = self.nix_dir();

        let base = nix.join("base.nix");
        std::fs::write(&base, BASE_NIX)
            .map_err(|e| AppvmError::io(format!("write {}", base.display()), e))?;

        let local = nix.join("local.nix");
        if !local.exists() {
            std::fs::write(&local, LOCAL_NIX)
                .map_err(|e| AppvmError::io(format!("write {}", local.display()), e))?;
            info!("seeded {}", local.display());
        }
        Ok(())
    }
}

fn create_private_dir(dir: &Path) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt;

    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
        .map_err(|e| AppvmError::io(format!("create directory {}", dir.display()), e))
}
