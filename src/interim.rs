//! Interim page state: the "deploying" HTML shell and the grace window.
//!
//! The interim page lives at `<prefix>/_temp/hubproxy` while the app starts.
//! Once the app becomes ready the page (and the logs API under it) stays
//! reachable for a short grace window so the viewer can fetch final logs,
//! then everything under the subtree redirects to the app.

use std::sync::RwLock;

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::Response;
use chrono::{DateTime, Duration, Utc};
use tracing::info;

use crate::process::Supervisor;
use crate::sync::{read_or_recover, write_or_recover};
use crate::ui;

/// How long the interim subtree stays reachable after the app becomes ready.
pub const GRACE_PERIOD_SECS: i64 = 10;

fn grace_period() -> Duration {
    Duration::seconds(GRACE_PERIOD_SECS)
}

pub struct InterimState {
    /// Path the page redirects to once the app is up, e.g. "/user/alice/".
    app_url_path: String,
    deployed_at: RwLock<Option<DateTime<Utc>>>,
}

impl InterimState {
    pub fn new(app_url_path: String) -> Self {
        Self {
            app_url_path,
            deployed_at: RwLock::new(None),
        }
    }

    pub fn app_url_path(&self) -> &str {
        &self.app_url_path
    }

    /// Records the deployment time. Idempotent: only the first call sets it,
    /// so the grace window never resets.
    pub fn mark_app_deployed(&self) {
        let mut deployed = write_or_recover(&self.deployed_at);
        if deployed.is_none() {
            let now = Utc::now();
            *deployed = Some(now);
            info!(
                grace_secs = GRACE_PERIOD_SECS,
                expires_at = %(now + grace_period()),
                "app deployed, starting grace period"
            );
        }
    }

    #[cfg(test)]
    pub(crate) fn set_deployed_at(&self, deployed_at: DateTime<Utc>) {
        *write_or_recover(&self.deployed_at) = Some(deployed_at);
    }

    pub fn in_grace_period(&self) -> bool {
        match *read_or_recover(&self.deployed_at) {
            Some(deployed) => Utc::now() - deployed < grace_period(),
            None => false,
        }
    }

    /// The logs API (and the rest of the interim subtree) stays reachable
    /// while the app is not running, or within the grace window after it
    /// came up.
    pub fn should_serve_logs_api(&self, supervisor: &Supervisor) -> bool {
        !supervisor.is_running() || self.in_grace_period()
    }

    /// 307 to the app for interim-subtree requests arriving after the grace
    /// window expired; `None` while the subtree should still be served.
    pub fn redirect_if_expired(&self, supervisor: &Supervisor) -> Option<Response> {
        if self.should_serve_logs_api(supervisor) {
            None
        } else {
            Some(self.redirect_to_app())
        }
    }

    pub fn redirect_to_app(&self) -> Response {
        Response::builder()
            .status(StatusCode::TEMPORARY_REDIRECT)
            .header(header::LOCATION, &self.app_url_path)
            .body(Body::empty())
            .unwrap_or_default()
    }

    /// The interim HTML shell, or a redirect once the app is up and the
    /// grace window has passed.
    pub fn respond(&self, supervisor: &Supervisor) -> Response {
        if !self.in_grace_period() && supervisor.is_running() {
            return self.redirect_to_app();
        }
        self.serve_html()
    }

    fn serve_html(&self) -> Response {
        // The page's JavaScript reads the redirect target from this meta tag.
        let meta = format!(
            "<meta name=\"app-redirect-url\" content=\"{}\">\n    <title>",
            self.app_url_path
        );
        let html = ui::LOGS_HTML.replacen("<title>", &meta, 1);

        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
            .header(header::CACHE_CONTROL, "no-cache, no-store, must-revalidate")
            .body(Body::from(html))
            .unwrap_or_default()
    }
}
