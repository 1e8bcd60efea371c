//! Embedded interim page assets.

pub const LOGS_HTML: &str = include_str!("../assets/logs.html");
pub const LOGS_CSS: &str = include_str!("../assets/logs.css");
pub const LOGS_JS: &str = include_str!("../assets/logs.js");
pub const LOGO_PNG: &[u8] = include_bytes!("../assets/logo.png");
