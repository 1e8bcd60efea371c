//! Error taxonomy for the proxy.
//!
//! Request-scoped failures are turned into HTTP responses where they occur;
//! the variants here cover startup and background-loop failures that cross
//! component boundaries.

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to allocate port: {0}")]
    PortAllocation(#[source] io::Error),

    #[error("failed to spawn process: {0}")]
    Spawn(#[source] io::Error),

    #[error("process already running")]
    AlreadyRunning,

    #[error("no process to stop")]
    NotStarted,

    #[error("readiness check failed after {attempts} attempts: deadline of {deadline_secs}s elapsed")]
    ReadinessTimeout { attempts: u32, deadline_secs: u64 },

    #[error("hub API call failed: {0}")]
    Hub(String),

    #[error("git clone failed: {0}")]
    Git(String),

    #[error("conda environment not found: {0}")]
    CondaEnvNotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProxyError {
    /// True when the error is a startup-time configuration problem that
    /// should abort the process with a non-zero exit code.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProxyError::Config(_) | ProxyError::PortAllocation(_) | ProxyError::Git(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_errors_are_fatal() {
        assert!(ProxyError::Config("missing command".into()).is_fatal());
        assert!(ProxyError::Git("clone failed".into()).is_fatal());
    }

    #[test]
    fn runtime_errors_are_not_fatal() {
        assert!(!ProxyError::AlreadyRunning.is_fatal());
        assert!(!ProxyError::ReadinessTimeout {
            attempts: 3,
            deadline_secs: 1
        }
        .is_fatal());
        assert!(!ProxyError::Hub("503".into()).is_fatal());
    }
}
