//! Autoballoon: right-size the memory of every running application VM.
//!
//! For each `appvm_*` domain the in-guest agent reports used memory (MiB) in
//! `<base>/<name>/.memory_used`. The new target is the usage plus a headroom
//! percentage, clamped below the domain's maximum and then raised to the
//! configured floor. When the two bounds conflict the floor wins.
//!
//! Any failure aborts the whole pass; there is no partial report.

use std::path::Path;

use tracing::info;

use crate::error::{AppvmError, Result};
use crate::hypervisor::{self, Hypervisor};
use crate::paths::AppvmPaths;

pub const MIB: u64 = 1024 * 1024;

/// One audited decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemorySample {
    pub name: String,
    pub used_bytes: u64,
    pub current_bytes: u64,
    pub max_bytes: u64,
    pub new_bytes: u64,
}

/// Target allocation for a domain using `used` bytes.
///
/// Ceiling first (`max - 1`), floor second (`min`).
pub fn target_memory(used: u64, adjust_percent: u64, min: u64, max: u64) -> u64 {
    let scaled = u128::from(used) * (100 + u128::from(adjust_percent)) / 100;
    let mut new = u64::try_from(scaled).unwrap_or(u64::MAX);

    if new > max {
        new = max.saturating_sub(1);
    }
    if new < min {
        new = min;
    }
    new
}

/// Parse the telemetry file contents: a MiB integer, newline-terminated.
pub fn parse_memory_used(raw: &str) -> Result<u64> {
    let mib: u64 = raw
        .trim_end()
        .parse()
        .map_err(|e| AppvmError::Parse(format!("memory usage {raw:?}: {e}")))?;
    Ok(mib.saturating_mul(MIB))
}

async fn read_memory_used(path: &Path) -> Result<u64> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| AppvmError::io(format!("read {}", path.display()), e))?;
    parse_memory_used(&raw)
}

/// Run one pass over all running application VMs.
pub async fn autoballoon<H: Hypervisor>(
    hv: &mut H,
    paths: &AppvmPaths,
    min_bytes: u64,
    adjust_percent: u64,
) -> Result<Vec<MemorySample>> {
    let mut samples = Vec::new();

    for (name, domain) in hypervisor::app_domains(hv).await? {
        let used_bytes = read_memory_used(&paths.memory_used_file(&name)).await?;
        let mem = hv.memory_info(&domain).await?;
        let new_bytes = target_memory(used_bytes, adjust_percent, min_bytes, mem.max_bytes);

        hv.set_memory(&domain, new_bytes).await?;

        info!(
            %name,
            used = used_bytes,
            current = mem.current_bytes,
            max = mem.max_bytes,
            new = new_bytes,
            "balloon adjusted"
        );
        samples.push(MemorySample {
            name: name.to_string(),
            used_bytes,
            current_bytes: mem.current_bytes,
            max_bytes: mem.max_bytes,
            new_bytes,
        });
    }

    Ok(samples)
}
