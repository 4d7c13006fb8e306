//! Application VM management.
//!
//! Builds a NixOS system for one application, describes it as a libvirt
//! domain, and drives start/stop/drop/list through a [`Hypervisor`] session.
//!
//! [`Hypervisor`]: crate::hypervisor::Hypervisor

use std::fmt;
use std::path::PathBuf;

use crate::error::{AppvmError, Result};

pub mod build;
pub mod descriptor;
pub mod disk;
pub mod lifecycle;
pub mod lock;

// ---------------------------------------------------------------------------
// Shared types used across submodules
// ---------------------------------------------------------------------------

/// Every appvm domain name starts with this.
pub const DOMAIN_PREFIX: &str = "appvm_";

/// A validated application name.
///
/// Names may take the `owner/repo/name` form used for remote specifications,
/// so they can contain `/`. They can never escape the state directory: no
/// absolute paths, no empty components and no component starting with `.`
/// (which also keeps names off `.locks` and the shared disk image).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AppName(String);

impl AppName {
    pub fn new(name: &str) -> Result<Self> {
        let invalid = |reason| AppvmError::InvalidName {
            name: name.to_string(),
            reason,
        };

        if name.is_empty() {
            return Err(invalid("name is empty"));
        }
        if name.contains('\0') {
            return Err(invalid("name contains NUL"));
        }
        if name.starts_with('/') {
            return Err(invalid("name must be relative"));
        }
        for component in name.split('/') {
            match component {
                "" => return Err(invalid("empty path component")),
                c if c.starts_with('.') => {
                    return Err(invalid("path components must not start with `.`"));
                }
                _ => {}
            }
        }
        Ok(Self(name.to_string()))
    }

    /// Recover the application name from a domain name, if it carries the prefix.
    pub fn from_domain_name(domain: &str) -> Option<Self> {
        domain
            .strip_prefix(DOMAIN_PREFIX)
            .and_then(|rest| Self::new(rest).ok())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn domain_name(&self) -> String {
        format!("{DOMAIN_PREFIX}{}", self.0)
    }

    /// Single path component naming this application's state directory,
    /// lock file and build out-link. `%` and `/` are percent-encoded, so the
    /// mapping is injective and no application's directory nests in another's.
    pub fn file_stem(&self) -> String {
        self.0.replace('%', "%25").replace('/', "%2F")
    }
}

impl fmt::Display for AppName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Output of one successful build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildArtifact {
    /// Canonical path of the built system closure.
    pub system_image: PathBuf,
    /// `regInfo=/nix/store/…/registration`, passed on the kernel command line.
    pub reg_info: String,
    /// Read-only backing disk (see [`disk::ensure_disk_image`]).
    pub disk_image: PathBuf,
}

/// Everything needed to create one domain. Built fresh for every start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainDescriptor {
    pub name: String,
    pub system_image: PathBuf,
    pub reg_info: String,
    pub disk_image: PathBuf,
    pub shared_dir: PathBuf,
}

impl DomainDescriptor {
    pub fn new(app: &AppName, artifact: BuildArtifact, shared_dir: PathBuf) -> Self {
        Self {
            name: app.domain_name(),
            system_image: artifact.system_image,
            reg_info: artifact.reg_info,
            disk_image: artifact.disk_image,
            shared_dir,
        }
    }
}

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use lifecycle::{drop_app, is_running, list, start, stop};
