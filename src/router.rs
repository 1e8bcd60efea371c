//! Request dispatch.
//!
//! Every inbound path resolves to exactly one of: the local OAuth callback,
//! the interim subtree, the application route, or 404, in that order. The
//! interim subtree has explicit routes; everything else lands in the
//! fallback which applies the service-prefix guard and picks between the
//! interim page and the reverse proxy based on the supervisor state.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::{HeaderValue, Request, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, delete, get};
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::activity::Tracker;
use crate::api;
use crate::auth::{OAuth, USER_DATA_HEADER};
use crate::hub::HubUser;
use crate::interim::InterimState;
use crate::logs::LogBuffer;
use crate::process::Supervisor;
use crate::proxy::ProxyHandler;

/// Precomputed route anchors. The service prefix has no trailing slash and
/// may be empty; the others always start with "/".
#[derive(Debug, Clone)]
pub struct RoutePaths {
    pub service_prefix: String,
    pub interim_base: String,
    pub app_root: String,
    /// Present only when an OAuth component exists.
    pub oauth_callback: Option<String>,
}

impl RoutePaths {
    pub fn new(service_prefix: &str, oauth_enabled: bool) -> Self {
        let mut service_prefix = service_prefix.trim_end_matches('/').to_string();
        if !service_prefix.is_empty() && !service_prefix.starts_with('/') {
            service_prefix.insert(0, '/');
        }
        Self {
            interim_base: format!("{service_prefix}/_temp/{}", crate::PROXY_NAME),
            app_root: format!("{service_prefix}/"),
            oauth_callback: oauth_enabled
                .then(|| format!("{service_prefix}/{}", crate::auth::CALLBACK_SUFFIX)),
            service_prefix,
        }
    }
}

/// Shared state behind every handler.
pub struct AppContext {
    pub supervisor: Arc<Supervisor>,
    pub logs: Arc<LogBuffer>,
    pub interim: Arc<InterimState>,
    pub activity: Arc<Tracker>,
    pub oauth: Option<Arc<OAuth>>,
    pub proxy: ProxyHandler,
    pub paths: RoutePaths,
    /// OAuth on the application route (--authtype oauth).
    pub protect_app: bool,
    /// OAuth on the interim page and logs API (--authtype oauth or
    /// --interim-page-auth).
    pub protect_interim: bool,
}

impl AppContext {
    /// Auth gate for the interim page and logs API. `Ok(None)` when no
    /// protection applies.
    pub async fn gate_interim(
        &self,
        headers: &axum::http::HeaderMap,
        uri: &Uri,
    ) -> Result<Option<HubUser>, Response> {
        if !self.protect_interim {
            return Ok(None);
        }
        let Some(oauth) = &self.oauth else {
            return Ok(None);
        };
        oauth.gate(headers, &request_uri(uri)).await.map(Some)
    }
}

/// Path plus query, the value stashed in the oauth-next cookie.
pub fn request_uri(uri: &Uri) -> String {
    match uri.query() {
        Some(query) => format!("{}?{}", uri.path(), query),
        None => uri.path().to_string(),
    }
}

pub fn build_router(ctx: Arc<AppContext>) -> Router {
    let base = ctx.paths.interim_base.clone();

    let mut router = Router::new()
        .route(&base, get(api::interim_page))
        .route(&format!("{base}/api/logs"), get(api::get_logs))
        .route(&format!("{base}/api/logs/all"), get(api::get_all_logs))
        .route(&format!("{base}/api/logs/since"), get(api::get_logs_since))
        .route(&format!("{base}/api/logs/stats"), get(api::get_stats))
        .route(&format!("{base}/api/logs/clear"), delete(api::clear_logs))
        .route(&format!("{base}/api/logo"), get(api::get_logo))
        .route(&format!("{base}/static/logs.css"), get(api::get_css))
        .route(&format!("{base}/static/logs.js"), get(api::get_js));

    if let Some(callback) = ctx.paths.oauth_callback.clone() {
        router = router.route(&callback, any(oauth_callback));
    }

    router
        .fallback(dispatch)
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

/// The local callback completes the proxy's own OAuth flow only while the
/// application is down. Once the app runs, the callback path belongs to the
/// application (it may implement its own OAuth) and is forwarded untouched.
async fn oauth_callback(
    State(ctx): State<Arc<AppContext>>,
    ws: Option<WebSocketUpgrade>,
    req: Request<Body>,
) -> Response {
    let Some(oauth) = ctx.oauth.clone() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if !ctx.supervisor.is_running() {
        debug!("handling OAuth callback locally (app not running)");
        return oauth.handle_callback(req.headers(), req.uri().query()).await;
    }
    debug!("forwarding OAuth callback to application");
    ctx.proxy.forward(req, ws).await
}

async fn dispatch(
    State(ctx): State<Arc<AppContext>>,
    ws: Option<WebSocketUpgrade>,
    req: Request<Body>,
) -> Response {
    let path = req.uri().path().to_string();

    // Unknown paths under the interim subtree: follow the subtree's
    // lifecycle (404 while it is being served, redirect after the grace
    // window expires).
    if path.starts_with(&ctx.paths.interim_base) {
        if let Some(redirect) = ctx.interim.redirect_if_expired(&ctx.supervisor) {
            return redirect;
        }
        return StatusCode::NOT_FOUND.into_response();
    }

    // Service prefix guard.
    let prefix = &ctx.paths.service_prefix;
    if !prefix.is_empty() && !path.starts_with(&format!("{prefix}/")) {
        debug!(path = %path, expected_prefix = %prefix, "path outside service prefix");
        return StatusCode::NOT_FOUND.into_response();
    }

    // Application route: authenticate first, then pick interim vs proxy.
    let mut user_header = None;
    if ctx.protect_app {
        if let Some(oauth) = &ctx.oauth {
            match oauth.gate(req.headers(), &request_uri(req.uri())).await {
                Ok(user) => user_header = serde_json::to_string(&user).ok(),
                Err(redirect) => return redirect,
            }
        }
    }

    if !ctx.supervisor.is_running() {
        debug!(path = %path, "serving interim page (app not running)");
        return ctx.interim.respond(&ctx.supervisor);
    }

    let mut req = req;
    if let Some(user_json) = user_header {
        if let Ok(value) = HeaderValue::from_str(&user_json) {
            req.headers_mut().insert(USER_DATA_HEADER, value);
        }
    }
    ctx.proxy.forward(req, ws).await
}
