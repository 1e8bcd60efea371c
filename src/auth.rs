//! Hub OAuth2 middleware.
//!
//! One instance serves both the login redirect and the callback so the state
//! cookies set by the former are the ones the latter validates. Token
//! extraction prefers the `X-Jupyterhub-Api-Token` header (programmatic
//! clients, WebSocket tests) over the session cookie.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::Deserialize;
use tracing::{debug, error, info};

use crate::hub::{HubClient, HubContext, HubUser};

pub const API_TOKEN_HEADER: &str = "x-jupyterhub-api-token";
pub const USER_DATA_HEADER: &str = "x-forwarded-user-data";

/// Default callback path suffix; JupyterHub only accepts this one for
/// spawned services.
pub const CALLBACK_SUFFIX: &str = "oauth_callback";

/// Lifetime of the transient state/next cookies.
const TRANSIENT_COOKIE_MAX_AGE: i64 = 600;

pub struct OAuth {
    ctx: HubContext,
    hub: Arc<HubClient>,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

impl OAuth {
    pub fn new(ctx: HubContext, hub: Arc<HubClient>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { ctx, hub, http }
    }

    fn cookie_name(&self) -> &str {
        &self.ctx.client_id
    }

    fn state_cookie_name(&self) -> String {
        format!("{}-oauth-state", self.ctx.client_id)
    }

    fn next_cookie_name(&self) -> String {
        format!("{}-oauth-next", self.ctx.client_id)
    }

    fn redirect_uri(&self) -> String {
        format!("{}{}", self.ctx.cookie_path(), CALLBACK_SUFFIX)
    }

    /// Resolves the request's token (header first, then cookie) against the
    /// Hub. `None` means the request must go through the login flow.
    pub async fn authenticate(&self, headers: &HeaderMap) -> Option<HubUser> {
        let token = headers
            .get(API_TOKEN_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .or_else(|| cookie_value(headers, self.cookie_name()));

        let token = token.filter(|token| !token.is_empty())?;
        match self.hub.get_user(&token).await {
            Ok(user) => Some(user),
            Err(err) => {
                debug!(error = %err, "token validation failed, falling through to login");
                None
            }
        }
    }

    /// Auth gate for protected handlers: the user on success, a ready-made
    /// login redirect on failure.
    pub async fn gate(&self, headers: &HeaderMap, request_uri: &str) -> Result<HubUser, Response> {
        match self.authenticate(headers).await {
            Some(user) => Ok(user),
            None => Err(self.login_redirect(request_uri)),
        }
    }

    /// 302 to the Hub's authorize endpoint, stashing the CSRF state and the
    /// original URL in transient cookies.
    pub fn login_redirect(&self, request_uri: &str) -> Response {
        let state_bytes: [u8; 16] = rand::random();
        let state = URL_SAFE_NO_PAD.encode(state_bytes);

        let cookie_path = self.ctx.cookie_path();
        let state_cookie = build_cookie(
            &self.state_cookie_name(),
            &state,
            &cookie_path,
            Some(TRANSIENT_COOKIE_MAX_AGE),
        );
        let next_cookie = build_cookie(
            &self.next_cookie_name(),
            request_uri,
            &cookie_path,
            Some(TRANSIENT_COOKIE_MAX_AGE),
        );

        let authorize_url = format!(
            "{}{}api/oauth2/authorize?client_id={}&redirect_uri={}&response_type=code&state={}",
            self.ctx.hub_host,
            self.ctx.hub_prefix,
            urlencoding::encode(&self.ctx.client_id),
            urlencoding::encode(&self.redirect_uri()),
            urlencoding::encode(&state),
        );

        debug!(redirect = %authorize_url, "redirecting to hub login");
        Response::builder()
            .status(StatusCode::FOUND)
            .header(header::LOCATION, authorize_url)
            .header(header::SET_COOKIE, state_cookie)
            .header(header::SET_COOKIE, next_cookie)
            .body(Body::empty())
            .unwrap_or_default()
    }

    /// OAuth callback: validates the state, exchanges the code for a token,
    /// sets the session cookie, and returns to the stashed original URL.
    pub async fn handle_callback(&self, headers: &HeaderMap, query: Option<&str>) -> Response {
        let params = parse_query(query.unwrap_or(""));
        let code = params
            .iter()
            .find(|(key, _)| key.as_str() == "code")
            .map(|(_, value)| value.clone());
        let state = params
            .iter()
            .find(|(key, _)| key.as_str() == "state")
            .map(|(_, value)| value.clone())
            .unwrap_or_default();

        let Some(code) = code.filter(|code| !code.is_empty()) else {
            return plain_error(StatusCode::BAD_REQUEST, "No code provided");
        };

        let state_cookie = cookie_value(headers, &self.state_cookie_name());
        if state_cookie.as_deref() != Some(state.as_str()) {
            return plain_error(StatusCode::FORBIDDEN, "Invalid state");
        }

        let token_endpoint = format!("{}/oauth2/token", self.ctx.api_url);
        let redirect_uri = self.redirect_uri();
        let form = [
            ("client_id", self.ctx.client_id.as_str()),
            ("client_secret", self.ctx.api_token.as_str()),
            ("grant_type", "authorization_code"),
            ("code", code.as_str()),
            ("redirect_uri", redirect_uri.as_str()),
        ];

        let response = match self.http.post(&token_endpoint).form(&form).send().await {
            Ok(response) => response,
            Err(err) => {
                error!(error = %err, "token exchange request failed");
                return plain_error(StatusCode::INTERNAL_SERVER_ERROR, "Token exchange failed");
            }
        };

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            error!(status = status.as_u16(), body = %body, "token exchange failed");
            return plain_error(StatusCode::INTERNAL_SERVER_ERROR, "Token exchange failed");
        }

        let token: TokenResponse = match response.json().await {
            Ok(token) => token,
            Err(err) => {
                error!(error = %err, "failed to parse token response");
                return plain_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to parse token");
            }
        };

        let cookie_path = self.ctx.cookie_path();
        let mut builder = Response::builder()
            .status(StatusCode::FOUND)
            .header(
                header::SET_COOKIE,
                clear_cookie(&self.state_cookie_name(), &cookie_path),
            )
            // Session cookie: no Max-Age.
            .header(
                header::SET_COOKIE,
                build_cookie(self.cookie_name(), &token.access_token, &cookie_path, None),
            );

        let mut redirect_to = cookie_path.clone();
        if let Some(next) = cookie_value(headers, &self.next_cookie_name()).filter(|v| !v.is_empty())
        {
            redirect_to = next;
            builder = builder.header(
                header::SET_COOKIE,
                clear_cookie(&self.next_cookie_name(), &cookie_path),
            );
        }

        info!(redirect = %redirect_to, "oauth callback completed");
        builder
            .header(header::LOCATION, redirect_to)
            .body(Body::empty())
            .unwrap_or_default()
    }
}

/// Extracts one cookie by exact name from any number of Cookie headers.
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    for value in headers.get_all(header::COOKIE) {
        let Ok(text) = value.to_str() else { continue };
        for pair in text.split(';') {
            if let Some((key, value)) = pair.trim().split_once('=') {
                if key == name {
                    return Some(value.to_string());
                }
            }
        }
    }
    None
}

fn build_cookie(name: &str, value: &str, path: &str, max_age: Option<i64>) -> String {
    let mut cookie = format!("{name}={value}; Path={path}; HttpOnly; SameSite=Lax");
    if let Some(age) = max_age {
        cookie.push_str(&format!("; Max-Age={age}"));
    }
    cookie
}

fn clear_cookie(name: &str, path: &str) -> String {
    format!("{name}=; Path={path}; Max-Age=0")
}

fn plain_error(status: StatusCode, message: &str) -> Response {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from(message.to_string()))
        .unwrap_or_default()
}

fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            let key = urlencoding::decode(key).ok()?.into_owned();
            let value = urlencoding::decode(value).ok()?.into_owned();
            Some((key, value))
        })
        .collect()
}
