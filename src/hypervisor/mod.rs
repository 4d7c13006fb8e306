//! Hypervisor session.
//!
//! [`Hypervisor`] is the narrow operation set the lifecycle manager and the
//! autoballoon controller need. [`RemoteHypervisor`] implements it over the
//! libvirt management socket; tests substitute an in-memory implementation.

use crate::error::Result;
use crate::vm::{AppName, DomainDescriptor};

pub mod remote;
pub mod xdr;

pub use remote::RemoteHypervisor;

/// A domain as identified by libvirt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainHandle {
    pub name: String,
    pub uuid: [u8; 16],
    pub id: i32,
}

/// `virDomainGetInfo`, with memory converted from KiB to bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryInfo {
    pub state: u8,
    pub max_bytes: u64,
    pub current_bytes: u64,
    pub vcpus: u16,
    pub cpu_time_ns: u64,
}

/// Operations against one open hypervisor session.
///
/// Every method except `lookup` treats any failure as fatal; `lookup`
/// reports a missing domain as `Ok(None)`, which callers read as "stopped".
#[allow(async_fn_in_trait)]
pub trait Hypervisor {
    /// All running domains.
    async fn list_domains(&mut self) -> Result<Vec<DomainHandle>>;

    async fn lookup(&mut self, name: &str) -> Result<Option<DomainHandle>>;

    /// Create and start a transient domain. The hypervisor validates the
    /// descriptor before starting it.
    async fn create(&mut self, descriptor: &DomainDescriptor) -> Result<DomainHandle>;

    /// Ask the guest to shut down. Returns without waiting for it to stop.
    async fn shutdown(&mut self, domain: &DomainHandle) -> Result<()>;

    async fn memory_info(&mut self, domain: &DomainHandle) -> Result<MemoryInfo>;

    /// Set the balloon target of a running domain.
    async fn set_memory(&mut self, domain: &DomainHandle, bytes: u64) -> Result<()>;
}

/// Running domains that belong to appvm, paired with their application names.
pub async fn app_domains<H: Hypervisor>(hv: &mut H) -> Result<Vec<(AppName, DomainHandle)>> {
    let domains = hv.list_domains().await?;
    Ok(domains
        .into_iter()
        .filter_map(|d| AppName::from_domain_name(&d.name).map(|name| (name, d)))
        .collect())
}
