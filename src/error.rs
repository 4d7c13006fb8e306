//! Error taxonomy for appvm operations.
//!
//! Every failure except a domain lookup miss is fatal for the operation in
//! progress. A lookup miss is modelled as `Ok(None)` by the hypervisor layer
//! and never reaches this type.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = AppvmError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum AppvmError {
    #[error("cannot resolve specification for {name}: {reason}")]
    Resolution { name: String, reason: String },

    #[error("build failed ({status})\n--- stdout ---\n{stdout}\n--- stderr ---\n{stderr}")]
    Build {
        status: String,
        stdout: String,
        stderr: String,
    },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("hypervisor {operation} failed (code {code}): {message}")]
    Hypervisor {
        operation: &'static str,
        code: i32,
        message: String,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid application name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("{name} is running; refusing to remove {} (pass --force to override)", path.display())]
    DropRefused { name: String, path: PathBuf },

    #[error("config error: {0}")]
    Config(String),
}

/// libvirt `VIR_ERR_NO_DOMAIN`.
pub const VIR_ERR_NO_DOMAIN: i32 = 42;

impl AppvmError {
    /// Wrap an I/O error with a human-readable description of what was attempted.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        AppvmError::Io {
            context: context.into(),
            source,
        }
    }

    /// `true` for a hypervisor error that only says the domain does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, AppvmError::Hypervisor { code, .. } if *code == VIR_ERR_NO_DOMAIN)
    }
}
