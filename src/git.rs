//! Shallow git clone of the application source before the process starts.

use std::path::Path;

use tokio::process::Command;
use tracing::{info, warn};

use crate::error::ProxyError;

#[derive(Debug, Clone)]
pub struct CloneConfig {
    pub repo_url: String,
    pub branch: String,
    pub dest_path: Option<String>,
}

/// Clones the repository with depth 1 on a single branch. A destination that
/// already exists and is non-empty is left alone with a warning so restarts
/// of the same server don't fail.
pub async fn clone_repo(cfg: &CloneConfig) -> Result<(), ProxyError> {
    if let Some(dest) = cfg.dest_path.as_deref() {
        let dest = Path::new(dest);
        if dest.exists() && dest.read_dir().map(|mut d| d.next().is_some()).unwrap_or(false) {
            warn!(dest = %dest.display(), "clone destination exists and is not empty, skipping clone");
            return Ok(());
        }
    }

    let mut command = Command::new("git");
    command.args([
        "clone",
        "--depth",
        "1",
        "--single-branch",
        "--branch",
        &cfg.branch,
        &cfg.repo_url,
    ]);
    if let Some(dest) = cfg.dest_path.as_deref() {
        command.arg(dest);
    }

    info!(repo = %cfg.repo_url, branch = %cfg.branch, "cloning repository");
    let output = command
        .output()
        .await
        .map_err(|err| ProxyError::Git(format!("failed to run git: {err}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ProxyError::Git(format!(
            "git clone exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    info!(repo = %cfg.repo_url, "repository cloned");
    Ok(())
}
