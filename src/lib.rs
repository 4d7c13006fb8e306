//! appvm: single-application NixOS virtual machines on libvirt.
//!
//! Resolves an application name to a Nix expression, builds it into a
//! bootable system, runs it as a transient libvirt domain, and balloons the
//! memory of running domains from in-guest usage reports.

pub mod balloon;
pub mod config;
pub mod error;
pub mod hypervisor;
pub mod logging;
pub mod paths;
pub mod resolver;
pub mod ui;
pub mod vm;

pub use error::{AppvmError, Result};
