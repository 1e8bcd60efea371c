//! Command line surface.
//!
//! Usage: `hubproxy [flags] -- command [args...]`. Everything after `--` is
//! the application command; placeholders like `{port}` and `{root_path}` in
//! it are rewritten before spawn (see [`crate::command`]).

use clap::{ArgAction, Parser, ValueEnum};

#[derive(Parser, Debug)]
#[command(
    name = "hubproxy",
    version,
    about = "Process spawner with OAuth2 authentication for JupyterHub apps",
    long_about = "Spawns and manages a web application process with OAuth2 authentication,\n\
        health monitoring, log capture, and JupyterHub integration.\n\n\
        Framework-agnostic: works with any web application (Streamlit, Voila, Panel, etc)."
)]
pub struct Cli {
    /// Authentication type for the proxied application
    #[arg(long = "authtype", value_enum, default_value_t = AuthType::OAuth)]
    pub auth_type: AuthType,

    /// Port for the proxy server to listen on (what JupyterHub expects)
    #[arg(long)]
    pub port: Option<u16>,

    /// Deprecated: use --port instead
    #[arg(long = "listen-port")]
    pub listen_port: Option<u16>,

    /// Internal application port (0 = random)
    #[arg(long = "destport", default_value_t = 0)]
    pub dest_port: u16,

    /// Conda environment to activate around the application command
    #[arg(long = "conda-env")]
    pub conda_env: Option<String>,

    /// Working directory for the application process
    #[arg(long)]
    pub workdir: Option<String>,

    /// Keep reporting activity to the Hub on a timer (prevents idle culling).
    /// This is the default; the flag exists as an explicit affirmation.
    #[arg(long = "keep-alive", conflicts_with = "no_force_alive")]
    pub keep_alive: bool,

    /// Report only real request activity instead of a steady heartbeat
    #[arg(long = "no-force-alive")]
    pub no_force_alive: bool,

    /// Strip the service prefix before forwarding to the application
    /// (use --strip-prefix false for apps like JupyterLab that handle
    /// their own base URL)
    #[arg(
        long = "strip-prefix",
        default_value_t = true,
        action = ArgAction::Set,
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    pub strip_prefix: bool,

    /// Git repository URL to clone before starting
    #[arg(long)]
    pub repo: Option<String>,

    /// Destination folder for the git clone
    #[arg(long = "repofolder")]
    pub repo_folder: Option<String>,

    /// Git branch to check out
    #[arg(long = "repobranch", default_value = "main")]
    pub repo_branch: String,

    /// Readiness probe path on the application (e.g. /, /health)
    #[arg(long = "ready-check-path", default_value = "/")]
    pub ready_check_path: String,

    /// Readiness deadline in seconds
    #[arg(long = "ready-timeout", default_value_t = 300)]
    pub ready_timeout: u64,

    /// Log level
    #[arg(long = "log-level", value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    /// Log output format
    #[arg(long = "log-format", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,

    /// Number of application log lines to keep in memory
    #[arg(long = "log-buffer-size", default_value_t = 1000)]
    pub log_buffer_size: usize,

    /// Include file:line in logs
    #[arg(long = "log-caller")]
    pub log_caller: bool,

    /// Flush the client response after every upstream write (for apps that
    /// render incrementally, e.g. Voila)
    #[arg(long)]
    pub progressive: bool,

    /// Protect the interim page and logs API with OAuth even when the
    /// application itself is public (--authtype none)
    #[arg(long = "interim-page-auth")]
    pub interim_page_auth: bool,

    /// Application command and arguments (after --)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthType {
    #[value(name = "oauth")]
    OAuth,
    None,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl Cli {
    /// Resolves the proxy listen port: --port, then the deprecated
    /// --listen-port, then the spawner environment variable, then 8888.
    pub fn effective_port(&self) -> u16 {
        if let Some(port) = self.port {
            return port;
        }
        if let Some(port) = self.listen_port {
            return port;
        }
        if let Ok(value) = std::env::var("JHUB_APPS_SPAWNER_PORT") {
            if let Ok(port) = value.trim().parse() {
                return port;
            }
        }
        8888
    }

    /// Single keep-alive boolean: on unless --no-force-alive was given.
    pub fn effective_keep_alive(&self) -> bool {
        !self.no_force_alive
    }
}
