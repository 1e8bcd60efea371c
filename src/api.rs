//! JSON API over the log buffer, plus the interim page and its static
//! assets. Everything here lives under `<prefix>/_temp/hubproxy` and obeys
//! the interim lifecycle: reachable while the app is down or within the
//! grace window, redirecting to the app afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, error, info};

use crate::logs::Stream;
use crate::router::AppContext;
use crate::ui;

const DEFAULT_LINES: usize = 100;
const MAX_LINES: usize = 10_000;

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

/// The interim HTML shell.
pub async fn interim_page(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    uri: Uri,
) -> Response {
    if let Some(redirect) = ctx.interim.redirect_if_expired(&ctx.supervisor) {
        return redirect;
    }
    if let Err(denied) = ctx.gate_interim(&headers, &uri).await {
        return denied;
    }
    ctx.interim.respond(&ctx.supervisor)
}

/// GET /api/logs?lines=100&stream=stdout
pub async fn get_logs(
    State(ctx): State<Arc<AppContext>>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    uri: Uri,
) -> Response {
    if let Some(redirect) = ctx.interim.redirect_if_expired(&ctx.supervisor) {
        return redirect;
    }
    if let Err(denied) = ctx.gate_interim(&headers, &uri).await {
        return denied;
    }

    let lines = params
        .get("lines")
        .and_then(|value| value.parse::<i64>().ok())
        .filter(|n| *n > 0)
        .map(|n| (n as usize).min(MAX_LINES))
        .unwrap_or(DEFAULT_LINES);

    let stream = params.get("stream").map(String::as_str).unwrap_or("");
    let entries = match stream {
        "stdout" => ctx.logs.by_stream(Stream::Stdout, lines),
        "stderr" => ctx.logs.by_stream(Stream::Stderr, lines),
        _ => ctx.logs.recent(lines),
    };

    debug!(
        lines_requested = lines,
        lines_returned = entries.len(),
        stream,
        "logs retrieved"
    );

    Json(json!({
        "logs": entries,
        "stats": ctx.logs.stats(),
        "query": { "lines": lines, "stream": stream }
    }))
    .into_response()
}

/// GET /api/logs/all - everything from the file mirror, including lines that
/// fell out of the in-memory ring.
pub async fn get_all_logs(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    uri: Uri,
) -> Response {
    if let Some(redirect) = ctx.interim.redirect_if_expired(&ctx.supervisor) {
        return redirect;
    }
    if let Err(denied) = ctx.gate_interim(&headers, &uri).await {
        return denied;
    }

    match ctx.logs.all_from_file() {
        Ok(lines) => Json(json!({
            "logs": lines,
            "count": lines.len(),
            "source": "file",
            "log_file": ctx.logs.file_path().map(|p| p.display().to_string()),
        }))
        .into_response(),
        Err(err) => {
            error!(error = %err, "failed to read logs from file");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to read logs")
        }
    }
}

/// GET /api/logs/since?timestamp=2025-01-15T10:30:00Z
pub async fn get_logs_since(
    State(ctx): State<Arc<AppContext>>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    uri: Uri,
) -> Response {
    if let Some(redirect) = ctx.interim.redirect_if_expired(&ctx.supervisor) {
        return redirect;
    }
    if let Err(denied) = ctx.gate_interim(&headers, &uri).await {
        return denied;
    }

    let Some(raw) = params.get("timestamp") else {
        return error_response(StatusCode::BAD_REQUEST, "timestamp parameter required");
    };
    let since = match DateTime::parse_from_rfc3339(raw) {
        Ok(parsed) => parsed.with_timezone(&Utc),
        Err(_) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid timestamp format (use RFC3339)",
            )
        }
    };

    let entries = ctx.logs.since(since);
    Json(json!({
        "logs": entries,
        "since": since,
        "count": entries.len(),
    }))
    .into_response()
}

/// GET /api/logs/stats
pub async fn get_stats(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    uri: Uri,
) -> Response {
    if let Some(redirect) = ctx.interim.redirect_if_expired(&ctx.supervisor) {
        return redirect;
    }
    if let Err(denied) = ctx.gate_interim(&headers, &uri).await {
        return denied;
    }

    Json(json!({
        "logs_stats": ctx.logs.stats(),
        "process_state": {
            "state": ctx.supervisor.state().as_str(),
            "pid": ctx.supervisor.pid(),
            "uptime": ctx.supervisor.uptime_secs(),
            "running": ctx.supervisor.is_running(),
        },
        "process_info": {
            "command": ctx.supervisor.command(),
            "workdir": ctx.supervisor.workdir(),
        },
        "version": crate::VERSION,
    }))
    .into_response()
}

/// DELETE /api/logs/clear
pub async fn clear_logs(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    uri: Uri,
) -> Response {
    if let Some(redirect) = ctx.interim.redirect_if_expired(&ctx.supervisor) {
        return redirect;
    }
    if let Err(denied) = ctx.gate_interim(&headers, &uri).await {
        return denied;
    }

    ctx.logs.clear();
    info!("logs cleared via API");
    Json(json!({ "status": "logs cleared" })).into_response()
}

/// GET /api/logo
pub async fn get_logo(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    uri: Uri,
) -> Response {
    if let Some(redirect) = ctx.interim.redirect_if_expired(&ctx.supervisor) {
        return redirect;
    }
    if let Err(denied) = ctx.gate_interim(&headers, &uri).await {
        return denied;
    }

    Json(json!({
        "logo": STANDARD.encode(ui::LOGO_PNG),
        "type": "image/png",
    }))
    .into_response()
}

/// GET /static/logs.css - never auth-gated; plain asset for the page shell.
pub async fn get_css(State(ctx): State<Arc<AppContext>>) -> Response {
    if let Some(redirect) = ctx.interim.redirect_if_expired(&ctx.supervisor) {
        return redirect;
    }
    static_asset("text/css; charset=utf-8", ui::LOGS_CSS)
}

/// GET /static/logs.js
pub async fn get_js(State(ctx): State<Arc<AppContext>>) -> Response {
    if let Some(redirect) = ctx.interim.redirect_if_expired(&ctx.supervisor) {
        return redirect;
    }
    static_asset("application/javascript; charset=utf-8", ui::LOGS_JS)
}

fn static_asset(content_type: &'static str, body: &'static str) -> Response {
    (
        [
            (header::CONTENT_TYPE, content_type),
            (header::CACHE_CONTROL, "public, max-age=3600"),
        ],
        body,
    )
        .into_response()
}
