//! Conda environment resolution.
//!
//! The spawner may ask for the application to run inside a named conda
//! environment. Resolution prefers an absolute path, then the environment
//! list reported by `conda info --json` matched by basename, then the
//! standard `<base>/envs/<name>` location.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::ProxyError;

#[derive(Debug, Deserialize)]
struct CondaInfo {
    #[serde(default)]
    conda_prefix: String,
    #[serde(default)]
    envs: Vec<String>,
}

async fn conda_base_prefix() -> Result<String, ProxyError> {
    if let Ok(prefix) = std::env::var("CONDA_PREFIX") {
        if !prefix.is_empty() {
            return Ok(prefix);
        }
    }

    let output = Command::new("conda")
        .args(["info", "--base"])
        .output()
        .await
        .map_err(|err| ProxyError::CondaEnvNotFound(format!("conda not found in PATH: {err}")))?;
    if !output.status.success() {
        return Err(ProxyError::CondaEnvNotFound(
            "failed to get conda base prefix".into(),
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

async fn conda_info() -> Result<CondaInfo, ProxyError> {
    let conda_exe = std::env::var("CONDA_EXE").unwrap_or_else(|_| "conda".to_string());

    debug!(conda_exe = %conda_exe, "calling conda info");
    let output = Command::new(&conda_exe)
        .args(["info", "--json"])
        .output()
        .await
        .map_err(|err| ProxyError::CondaEnvNotFound(format!("failed to run conda info: {err}")))?;
    if !output.status.success() {
        return Err(ProxyError::CondaEnvNotFound("conda info failed".into()));
    }

    serde_json::from_slice(&output.stdout)
        .map_err(|err| ProxyError::CondaEnvNotFound(format!("failed to parse conda info: {err}")))
}

/// Resolves a conda environment name (or absolute path) to the environment
/// prefix directory.
pub async fn env_path(env_name: &str) -> Result<PathBuf, ProxyError> {
    let as_path = Path::new(env_name);
    if as_path.is_absolute() && as_path.exists() {
        info!(env_path = %env_name, "using absolute path for conda environment");
        return Ok(as_path.to_path_buf());
    }

    let info = match conda_info().await {
        Ok(info) => info,
        Err(err) => {
            warn!(env_name, error = %err, "conda info unavailable, falling back to standard location");
            let base = conda_base_prefix().await?;
            let candidate = Path::new(&base).join("envs").join(env_name);
            if candidate.exists() {
                return Ok(candidate);
            }
            return Err(ProxyError::CondaEnvNotFound(env_name.to_string()));
        }
    };

    let mut candidate = Path::new(&info.conda_prefix).join("envs").join(env_name);
    for env in &info.envs {
        let env = Path::new(env);
        if env.file_name().map(|name| name == env_name).unwrap_or(false) {
            candidate = env.to_path_buf();
            break;
        }
    }

    if !candidate.exists() {
        return Err(ProxyError::CondaEnvNotFound(env_name.to_string()));
    }

    info!(env_name, env_path = %candidate.display(), "found conda environment");
    Ok(candidate)
}

/// Builds `conda run -p <env> --no-capture-output <command...>` for the
/// resolved environment.
pub async fn activation_command(
    env_name: &str,
    command: &[String],
) -> Result<Vec<String>, ProxyError> {
    let resolved = env_path(env_name).await?;

    let base = conda_base_prefix().await.unwrap_or_default();
    let mut conda_exec = Path::new(&base).join("bin").join("conda");
    if !conda_exec.exists() {
        conda_exec = PathBuf::from("conda");
    }

    let mut wrapped = vec![
        conda_exec.to_string_lossy().into_owned(),
        "run".to_string(),
        "-p".to_string(),
        resolved.to_string_lossy().into_owned(),
        "--no-capture-output".to_string(),
    ];
    wrapped.extend(command.iter().cloned());

    debug!(env_name, command = ?wrapped, "conda activation command built");
    Ok(wrapped)
}
