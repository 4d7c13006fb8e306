//! Runtime configuration.
//!
//! Built once in `main` from the environment and the optional
//! `~/.config/appvm/appvm.toml`, then passed by reference to every component.
//!
//! ```toml
//! search_paths = ["/home/user/src/appvm-configs"]
//! socket_path = "/var/run/libvirt/libvirt-sock"
//! default_owner = "jollheef"
//! default_repo = "appvm"
//! ```
//!
//! Search roots from `APPVM_CONFIGS` come first, then those from the file.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use crate::error::{AppvmError, Result};

/// Environment variable holding colon-separated specification search roots.
pub const CONFIGS_ENV: &str = "APPVM_CONFIGS";

pub const DEFAULT_SOCKET: &str = "/var/run/libvirt/libvirt-sock";
pub const DEFAULT_URI: &str = "qemu:///system";

/// On-disk representation. Every field is optional.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub search_paths: Vec<PathBuf>,
    pub socket_path: PathBuf,
    pub connect_uri: String,
    pub builder: String,
    pub evaluator: String,
    pub disk_tool: String,
    pub viewer: String,
    pub default_owner: String,
    pub default_repo: String,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            search_paths: Vec::new(),
            socket_path: PathBuf::from(DEFAULT_SOCKET),
            connect_uri: DEFAULT_URI.to_string(),
            builder: "nix-build".to_string(),
            evaluator: "nix".to_string(),
            disk_tool: "qemu-img".to_string(),
            viewer: "virt-viewer".to_string(),
            default_owner: "jollheef".to_string(),
            default_repo: "appvm".to_string(),
        }
    }
}

/// Effective configuration for one invocation.
#[derive(Debug, Clone)]
pub struct Config {
    /// Ordered local specification roots; each is searched as `<root>/nix/<name>.nix`.
    pub search_paths: Vec<PathBuf>,
    /// libvirt management socket.
    pub socket_path: PathBuf,
    /// Connection URI passed to libvirt and to the display client.
    pub connect_uri: String,
    /// Program used to build a specification (`nix-build`).
    pub builder: String,
    /// Program used to fetch remote specifications (`nix`).
    pub evaluator: String,
    /// Disk image utility (`qemu-img`).
    pub disk_tool: String,
    /// Interactive display client (`virt-viewer`).
    pub viewer: String,
    pub default_owner: String,
    pub default_repo: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(None, FileConfig::default())
    }
}

impl Config {
    /// Load from `$APPVM_CONFIGS` and `file` (if it exists).
    pub fn load(file: &Path) -> Result<Self> {
        let env_roots = std::env::var(CONFIGS_ENV).ok();
        let file_config = match std::fs::read_to_string(file) {
            Ok(text) => Self::parse_file(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %file.display(), "no config file, using defaults");
                FileConfig::default()
            }
            Err(e) => {
                return Err(AppvmError::io(format!("read {}", file.display()), e));
            }
        };
        Ok(Self::merge(env_roots.as_deref(), file_config))
    }

    pub fn parse_file(text: &str) -> Result<FileConfig> {
        toml::from_str(text).map_err(|e| AppvmError::Config(e.to_string()))
    }

    /// Combine the colon-separated environment roots with a parsed file.
    pub fn merge(env_roots: Option<&str>, file: FileConfig) -> Self {
        let mut search_paths = split_search_paths(env_roots.unwrap_or(""));
        for p in file.search_paths {
            if !search_paths.contains(&p) {
                search_paths.push(p);
            }
        }

        Self {
            search_paths,
            socket_path: file.socket_path,
            connect_uri: file.connect_uri,
            builder: file.builder,
            evaluator: file.evaluator,
            disk_tool: file.disk_tool,
            viewer: file.viewer,
            default_owner: file.default_owner,
            default_repo: file.default_repo,
        }
    }
}

/// Split a `PATH`-style list, dropping empty entries.
pub fn split_search_paths(raw: &str) -> Vec<PathBuf> {
    raw.split(':')
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .collect()
}
