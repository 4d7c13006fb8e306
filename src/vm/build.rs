//! Build pipeline: Nix expression → bootable system closure.
//!
//! ## Flow
//!
//! ```text
//! SpecLocation ─► materialize (nix eval for remote specs)
//!              ─► nix-build '<nixpkgs/nixos>' -A config.system.build.vm
//!                   -I nixos-config=<spec> -I <config root> -o <out-link>
//!              ─► canonicalize <out-link>/system, read <out-link>/bin/run-nixos-vm
//!              ─► remove <out-link>
//!              ─► extract regInfo, ensure backing disk
//! ```
//!
//! The registration-info scrape is the only place that knows the layout of
//! the generated run-script; see [`extract_reg_info`].

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{AppvmError, Result};
use crate::paths::AppvmPaths;
use crate::resolver::{self, SpecLocation};
use crate::vm::{AppName, BuildArtifact, disk};

/// Attribute of `<nixpkgs/nixos>` producing the QEMU VM wrapper.
const VM_ATTRIBUTE: &str = "config.system.build.vm";

/// Script inside the build result that embeds the registration path.
const RUN_SCRIPT: &str = "bin/run-nixos-vm";

static REG_INFO: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"regInfo=[^\s"']*/registration"#).expect("static regex is valid")
});

/// Build the system for `name` and return everything needed to describe its domain.
pub async fn build(
    config: &Config,
    paths: &AppvmPaths,
    name: &AppName,
    location: &SpecLocation,
    verbose: bool,
) -> Result<BuildArtifact> {
    let spec = materialize(config, name, location).await?;
    info!(%name, spec = %spec.display(), "building application VM");

    let out_link = paths.config.join(format!("result-{}", name.file_stem()));

    let mut cmd = Command::new(&config.builder);
    cmd.arg("<nixpkgs/nixos>")
        .args(["-A", VM_ATTRIBUTE])
        .arg("-I")
        .arg(format!("nixos-config={}", spec.display()))
        .arg("-I")
        .arg(&paths.config)
        .arg("-o")
        .arg(&out_link)
        .current_dir(&paths.config);

    run_captured(cmd, &config.builder, verbose).await?;

    let (system_image, script) = read_result(&out_link).await;
    if let Err(e) = tokio::fs::remove_file(&out_link).await {
        warn!(link = %out_link.display(), error = %e, "failed to remove build out-link");
    }
    let system_image = system_image?;
    let reg_info = extract_reg_info(&script?)?;

    let disk_image = disk::ensure_disk_image(config, paths).await?;

    debug!(system = %system_image.display(), %reg_info, "build complete");
    Ok(BuildArtifact {
        system_image,
        reg_info,
        disk_image,
    })
}

/// Pull the `regInfo=…/registration` kernel argument out of the run-script.
///
/// Exactly one occurrence is required; anything else means the builder's
/// output format changed under us.
pub fn extract_reg_info(script: &str) -> Result<String> {
    let mut matches = REG_INFO.find_iter(script);
    match (matches.next(), matches.next()) {
        (Some(m), None) => Ok(m.as_str().to_string()),
        _ => Err(AppvmError::Parse("should be one reginfo".into())),
    }
}

/// Turn a spec location into a path the builder can consume.
async fn materialize(config: &Config, name: &AppName, location: &SpecLocation) -> Result<PathBuf> {
    let expr = match location {
        SpecLocation::Local(path) => return Ok(path.clone()),
        SpecLocation::Remote {
            owner,
            repo,
            name: spec,
        } => resolver::fetch_expr(owner, repo, spec),
    };

    let output = Command::new(&config.evaluator)
        .args(["eval", "--raw", "--impure", "--expr", &expr])
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| AppvmError::Resolution {
            name: name.to_string(),
            reason: format!("failed to spawn `{}`: {e}", config.evaluator),
        })?;

    let fetched = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if !output.status.success() || fetched.is_empty() {
        return Err(AppvmError::Resolution {
            name: name.to_string(),
            reason: format!(
                "no local expression and {location} could not be fetched: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    Ok(PathBuf::from(fetched))
}

async fn read_result(out_link: &Path) -> (Result<PathBuf>, Result<String>) {
    let system = out_link.join("system");
    let system_image = tokio::fs::canonicalize(&system)
        .await
        .map_err(|e| AppvmError::io(format!("resolve {}", system.display()), e));

    let script_path = out_link.join(RUN_SCRIPT);
    let script = tokio::fs::read(&script_path)
        .await
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .map_err(|e| AppvmError::io(format!("read {}", script_path.display()), e));

    (system_image, script)
}

/// Run a command to completion, capturing stdout/stderr and optionally echoing
/// them live. A launch failure or non-zero exit becomes [`AppvmError::Build`].
async fn run_captured(mut cmd: Command, program: &str, verbose: bool) -> Result<()> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|e| AppvmError::Build {
        status: format!("failed to launch `{program}`: {e}"),
        stdout: String::new(),
        stderr: String::new(),
    })?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let (out, err) = tokio::join!(
        collect(stdout, verbose.then_some(echo_stdout as fn(&str))),
        collect(stderr, verbose.then_some(echo_stderr as fn(&str))),
    );

    let status = child
        .wait()
        .await
        .map_err(|e| AppvmError::io(format!("wait for `{program}`"), e))?;

    if !status.success() {
        let (stdout, stderr) = (out.unwrap_or_default(), err.unwrap_or_default());
        warn!(%program, %status, "build command failed");
        return Err(AppvmError::Build {
            status: status.to_string(),
            stdout,
            stderr,
        });
    }
    Ok(())
}

fn echo_stdout(line: &str) {
    println!("{line}");
}

fn echo_stderr(line: &str) {
    eprintln!("{line}");
}

async fn collect<R>(reader: Option<R>, echo: Option<fn(&str)>) -> std::io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return Ok(String::new());
    };
    let mut reader = BufReader::new(reader);
    let mut captured = String::new();
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            break;
        }
        let text = String::from_utf8_lossy(&line);
        if let Some(echo) = echo {
            echo(text.trim_end_matches('\n'));
        }
        captured.push_str(&text);
    }
    Ok(captured)
}
