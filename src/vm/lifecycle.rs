//! Application VM lifecycle: start, stop, drop, list.
//!
//! There is no stored state. An application is RUNNING iff the hypervisor
//! can look up `appvm_<name>`; a lookup miss means STOPPED.
//!
//! ```text
//! start(name)
//!     ├─► lock <base>/.locks/<name>.lock
//!     ├─► lookup ── found ───────────────────────────┐
//!     │       └─ missing ─► resolve ─► build ─► create│
//!     ├─► unlock                                      │
//!     └─► virt-viewer (detached) ◄────────────────────┘
//! ```

use std::process::Stdio;

use tokio::process::Command;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{AppvmError, Result};
use crate::hypervisor::{self, Hypervisor};
use crate::paths::AppvmPaths;
use crate::resolver;
use crate::ui;
use crate::vm::lock::FileLock;
use crate::vm::{AppName, DomainDescriptor, build};

/// What `start` did before handing over to the viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Created,
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    ShutdownRequested,
    AlreadyStopped,
}

/// Result of `list`: running applications and every known specification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Listing {
    pub started: Vec<AppName>,
    pub available: Vec<String>,
}

pub async fn is_running<H: Hypervisor>(hv: &mut H, name: &AppName) -> Result<bool> {
    Ok(hv.lookup(&name.domain_name()).await?.is_some())
}

/// Build and boot `name` unless it is already running, then open the viewer.
pub async fn start<H: Hypervisor>(
    hv: &mut H,
    config: &Config,
    paths: &AppvmPaths,
    name: &AppName,
    verbose: bool,
) -> Result<StartOutcome> {
    let outcome = {
        let _lock = FileLock::acquire(&paths.app_lock(name)).await?;

        if is_running(hv, name).await? {
            info!(%name, "already running");
            StartOutcome::AlreadyRunning
        } else {
            let spinner = (!verbose).then(|| ui::create_spinner(&format!("Building {name}")));
            let created = build_and_create(hv, config, paths, name, verbose).await;
            if let Some(spinner) = spinner {
                spinner.finish_and_clear();
            }
            created?;
            StartOutcome::Created
        }
    };

    launch_viewer(config, name);
    Ok(outcome)
}

async fn build_and_create<H: Hypervisor>(
    hv: &mut H,
    config: &Config,
    paths: &AppvmPaths,
    name: &AppName,
    verbose: bool,
) -> Result<()> {
    let location = resolver::resolve(config, name);
    let artifact = build::build(config, paths, name, &location, verbose).await?;

    let shared_dir = paths.app_dir(name);
    tokio::fs::create_dir_all(&shared_dir)
        .await
        .map_err(|e| AppvmError::io(format!("create {}", shared_dir.display()), e))?;

    let descriptor = DomainDescriptor::new(name, artifact, shared_dir);
    let domain = hv.create(&descriptor).await?;
    info!(%name, domain = %domain.name, id = domain.id, "domain created");
    Ok(())
}

/// Spawn the display client and forget about it.
fn launch_viewer(config: &Config, name: &AppName) {
    let spawned = Command::new(&config.viewer)
        .args(["-c", &config.connect_uri])
        .arg(name.domain_name())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn();

    match spawned {
        Ok(child) => info!(%name, pid = ?child.id(), viewer = %config.viewer, "viewer launched"),
        Err(e) => warn!(%name, viewer = %config.viewer, error = %e, "failed to launch viewer"),
    }
}

/// Request a graceful shutdown. Stopping a stopped application succeeds.
pub async fn stop<H: Hypervisor>(hv: &mut H, name: &AppName) -> Result<StopOutcome> {
    let Some(domain) = hv.lookup(&name.domain_name()).await? else {
        info!(%name, "appvm not found or already stopped");
        return Ok(StopOutcome::AlreadyStopped);
    };

    match hv.shutdown(&domain).await {
        Ok(()) => {
            info!(%name, "shutdown requested");
            Ok(StopOutcome::ShutdownRequested)
        }
        Err(e) if e.is_not_found() => {
            info!(%name, "domain disappeared before shutdown");
            Ok(StopOutcome::AlreadyStopped)
        }
        Err(e) => Err(e),
    }
}

/// Remove the application's state directory.
///
/// Refuses while the application is running unless `force` is set, since the
/// live domain still has the directory mounted.
pub async fn drop_app<H: Hypervisor>(
    hv: &mut H,
    paths: &AppvmPaths,
    name: &AppName,
    force: bool,
) -> Result<()> {
    let dir = paths.app_dir(name);

    if is_running(hv, name).await? {
        if !force {
            return Err(AppvmError::DropRefused {
                name: name.to_string(),
                path: dir,
            });
        }
        warn!(%name, dir = %dir.display(), "removing state of a running application");
    }

    match tokio::fs::remove_dir_all(&dir).await {
        Ok(()) => {
            info!(%name, dir = %dir.display(), "application data removed");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(%name, "no application data to remove");
            Ok(())
        }
        Err(e) => Err(AppvmError::io(format!("remove {}", dir.display()), e)),
    }
}

pub async fn list<H: Hypervisor>(hv: &mut H, config: &Config) -> Result<Listing> {
    let mut started: Vec<AppName> = hypervisor::app_domains(hv)
        .await?
        .into_iter()
        .map(|(name, _)| name)
        .collect();
    started.sort_by(|a, b| a.as_str().cmp(b.as_str()));

    Ok(Listing {
        started,
        available: resolver::available(config),
    })
}
