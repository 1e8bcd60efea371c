//! Application command construction.
//!
//! Rewrites jhsingle-native-proxy style placeholders in the user-supplied
//! argv, wraps the command in a conda activation when requested, and
//! composes the child environment from the Hub contract variables.

use std::collections::HashMap;

use tracing::warn;

use crate::conda;
use crate::error::ProxyError;

/// Environment variables passed through to the application process.
const HUB_ENV_PASSTHROUGH: &[&str] = &[
    "JUPYTERHUB_API_TOKEN",
    "JUPYTERHUB_API_URL",
    "JUPYTERHUB_BASE_URL",
    "JUPYTERHUB_USER",
    "JUPYTERHUB_SERVER_NAME",
    "JUPYTERHUB_SERVICE_PREFIX",
    "JUPYTERHUB_GROUP",
];

/// Derives the `{root_path}` substitution value from the service prefix:
/// `/hub` + prefix without its trailing slash, or empty when no prefix is
/// configured. A prefix missing its leading slash gets one.
pub fn root_path(service_prefix: &str) -> String {
    if service_prefix.is_empty() {
        return String::new();
    }
    let trimmed = service_prefix.trim_end_matches('/');
    if trimmed.starts_with('/') {
        format!("/hub{trimmed}")
    } else {
        format!("/hub/{trimmed}")
    }
}

/// Rewrites placeholders in each argument, left to right: `{port}` to the
/// allocated application port, `{-}` to `-`, `{--}` to `--`, `{root_path}`
/// to the Hub-visible root path. Afterwards one pair of surrounding single
/// or double quotes is stripped if present.
pub fn substitute_placeholders(command: &[String], port: u16, service_prefix: &str) -> Vec<String> {
    let port_str = port.to_string();
    let root = root_path(service_prefix);

    command
        .iter()
        .map(|arg| {
            let mut processed = arg.replace("{port}", &port_str);
            processed = processed.replace("{-}", "-");
            processed = processed.replace("{--}", "--");
            processed = processed.replace("{root_path}", &root);

            if processed.len() >= 2 && processed.starts_with('\'') && processed.ends_with('\'') {
                processed = processed[1..processed.len() - 1].to_string();
            }
            if processed.len() >= 2 && processed.starts_with('"') && processed.ends_with('"') {
                processed = processed[1..processed.len() - 1].to_string();
            }

            processed
        })
        .collect()
}

/// Hub contract variables from the parent environment, to be layered on top
/// of the inherited environment for the child.
pub fn build_child_env() -> HashMap<String, String> {
    let mut env = HashMap::new();
    for key in HUB_ENV_PASSTHROUGH {
        if let Ok(value) = std::env::var(key) {
            if !value.is_empty() {
                env.insert((*key).to_string(), value);
            }
        }
    }
    env
}

/// Wraps the command in a conda activation when an environment name is
/// given. Resolution failure is not fatal: the original command runs
/// unwrapped and the warning is returned so the caller can surface it in
/// the log viewer.
pub async fn build(
    command: &[String],
    conda_env: Option<&str>,
) -> Result<(Vec<String>, Option<String>), ProxyError> {
    if command.is_empty() {
        return Err(ProxyError::Config("no command specified".into()));
    }

    let Some(env_name) = conda_env.filter(|name| !name.is_empty()) else {
        return Ok((command.to_vec(), None));
    };

    match conda::activation_command(env_name, command).await {
        Ok(wrapped) => Ok((wrapped, None)),
        Err(err) => {
            warn!(
                conda_env = env_name,
                error = %err,
                "conda environment activation failed, running command without activation"
            );
            let warning = format!(
                "WARNING: Conda environment activation failed: {err}. \
                 Running command without conda activation."
            );
            Ok((command.to_vec(), Some(warning)))
        }
    }
}
