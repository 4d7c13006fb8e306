//! appvm: Nix application VMs
//!
//! Each invocation opens one libvirt session, runs one operation to
//! completion, and exits. Errors are fatal: they are printed once with their
//! full cause chain and the process exits with status 1.

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::style;
use tracing::warn;

use appvm::balloon::{self, MIB};
use appvm::config::Config;
use appvm::hypervisor::RemoteHypervisor;
use appvm::paths::AppvmPaths;
use appvm::vm::{self, AppName};
use appvm::{logging, ui};

/// Nix application VMs
#[derive(Parser, Debug)]
#[command(name = "appvm", version, about = "Nix application VMs")]
struct Args {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// List applications
    List,

    /// Start application
    Start {
        /// Application name
        name: String,

        /// Increase verbosity
        #[arg(long)]
        verbose: bool,
    },

    /// Stop application
    Stop {
        /// Application name
        name: String,
    },

    /// Remove application data
    Drop {
        /// Application name
        name: String,

        /// Remove the data even if the application is running
        #[arg(long)]
        force: bool,
    },

    /// Automatically adjust/reduce app vm memory
    Autoballoon {
        /// Set minimal memory (megabytes)
        #[arg(long, default_value_t = 1024)]
        min_memory: u64,

        /// Adjust memory amount (percents)
        #[arg(long, default_value_t = 20)]
        adj_memory: u64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let verbose = matches!(args.command, Cmd::Start { verbose: true, .. });
    let _log = logging::init(verbose);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", fatal_message(&e));
            ExitCode::FAILURE
        }
    }
}

/// The single stderr line for a fatal error, with its cause chain.
fn fatal_message(e: &anyhow::Error) -> String {
    format!("{} {e:#}", style("error:").red().bold())
}

async fn run(args: Args) -> Result<()> {
    let paths = AppvmPaths::resolve()?;
    paths.ensure()?;
    paths.write_templates().context("write nix templates")?;
    let config = Config::load(&paths.config_file()).context("load appvm.toml")?;

    let mut hv = RemoteHypervisor::connect(&config.socket_path, &config.connect_uri)
        .await
        .context("open hypervisor session")?;

    let result = dispatch(&mut hv, &config, &paths, args.command).await;

    if let Err(e) = hv.close().await {
        warn!(error = %e, "failed to close hypervisor session");
    }
    result
}

async fn dispatch(
    hv: &mut RemoteHypervisor,
    config: &Config,
    paths: &AppvmPaths,
    command: Cmd,
) -> Result<()> {
    match command {
        Cmd::List => {
            let listing = vm::list(hv, config).await?;
            ui::print_listing(&listing);
        }
        Cmd::Start { name, verbose } => {
            let name = AppName::new(&name)?;
            vm::start(hv, config, paths, &name, verbose)
                .await
                .with_context(|| format!("start {name}"))?;
        }
        Cmd::Stop { name } => {
            let name = AppName::new(&name)?;
            vm::stop(hv, &name).await.with_context(|| format!("stop {name}"))?;
        }
        Cmd::Drop { name, force } => {
            let name = AppName::new(&name)?;
            vm::drop_app(hv, paths, &name, force).await?;
        }
        Cmd::Autoballoon {
            min_memory,
            adj_memory,
        } => {
            let samples =
                balloon::autoballoon(hv, paths, min_memory.saturating_mul(MIB), adj_memory)
                    .await
                    .context("autoballoon")?;
            println!("{}", ui::balloon_table(&samples));
        }
    }
    Ok(())
}
