//! Specification resolver: application name → Nix expression location.
//!
//! Local search roots are tried in order (`<root>/nix/<name>.nix`). Only when
//! every root misses is a remote location synthesised; fetching it is the
//! build pipeline's job.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use tracing::{debug, info};

use crate::config::Config;
use crate::vm::AppName;

/// Template files living next to application specs that are not applications.
const TEMPLATE_STEMS: &[&str] = &["base", "local"];

/// Where the Nix expression for an application lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpecLocation {
    Local(PathBuf),
    Remote {
        owner: String,
        repo: String,
        name: String,
    },
}

/// Nix expression that downloads `<owner>/<repo>:nix/<name>.nix` into the store.
pub fn fetch_expr(owner: &str, repo: &str, name: &str) -> String {
    format!(
        "(builtins.fetchurl \"https://raw.githubusercontent.com/{owner}/{repo}/master/nix/{name}.nix\")"
    )
}

impl fmt::Display for SpecLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpecLocation::Local(path) => write!(f, "{}", path.display()),
            SpecLocation::Remote { owner, repo, name } => {
                write!(f, "github:{owner}/{repo}/nix/{name}.nix")
            }
        }
    }
}

pub fn resolve(config: &Config, name: &AppName) -> SpecLocation {
    for root in &config.search_paths {
        let candidate = root.join("nix").join(format!("{name}.nix"));
        if candidate.is_file() {
            debug!(spec = %candidate.display(), "found local expression");
            return SpecLocation::Local(candidate);
        }
        info!(
            root = %root.display(),
            "local repo {}/nix doesn't have a nix expression for {name}",
            root.display()
        );
    }

    info!(%name, "trying remote repo config");
    remote_location(config, name.as_str())
}

fn remote_location(config: &Config, name: &str) -> SpecLocation {
    let parts: Vec<&str> = name.split('/').collect();
    match parts.as_slice() {
        [owner, repo, name] => SpecLocation::Remote {
            owner: (*owner).to_string(),
            repo: (*repo).to_string(),
            name: (*name).to_string(),
        },
        _ => SpecLocation::Remote {
            owner: config.default_owner.clone(),
            repo: config.default_repo.clone(),
            name: name.to_string(),
        },
    }
}

/// Every application spec found under the search roots, sorted and de-duplicated.
pub fn available(config: &Config) -> Vec<String> {
    let mut names = BTreeSet::new();
    for root in &config.search_paths {
        let dir = root.join("nix");
        let Ok(entries) = std::fs::read_dir(&dir) else {
            debug!(dir = %dir.display(), "skipping unreadable search root");
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("nix") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if !TEMPLATE_STEMS.contains(&stem) {
                    names.insert(stem.to_string());
                }
            }
        }
    }
    names.into_iter().collect()
}
