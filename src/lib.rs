//! hubproxy - sidecar proxy for JupyterHub-spawned web applications.
//!
//! One proxy instance fronts exactly one application. It supervises the
//! application process, serves a live log viewer while the app is starting,
//! and once a health check passes it transparently reverse-proxies HTTP and
//! WebSocket traffic, participating in the Hub's OAuth flow and idle-activity
//! protocol along the way.

pub mod activity;
pub mod api;
pub mod auth;
pub mod cli;
pub mod command;
pub mod conda;
pub mod error;
pub mod git;
pub mod health;
pub mod hub;
pub mod interim;
pub mod logs;
pub mod ports;
pub mod process;
pub mod proxy;
pub mod router;
pub mod server;
pub mod sync;
pub mod telemetry;
pub mod ui;

/// Crate version, injected into API responses and outbound user agents.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name segment used for the interim subtree (`<prefix>/_temp/hubproxy`)
/// and for identifying this proxy in headers and logs.
pub const PROXY_NAME: &str = "hubproxy";
