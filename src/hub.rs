//! JupyterHub API client: activity reporting, token validation, and the
//! environment contract shared with the Hub.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info};

use crate::activity::Tracker;
use crate::error::ProxyError;

/// How often the activity reporter ticks.
pub const ACTIVITY_REPORT_INTERVAL: Duration = Duration::from_secs(5 * 60);

const HUB_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Hub-related state derived from the process environment at startup.
#[derive(Debug, Clone, Default)]
pub struct HubContext {
    /// Hub API base, e.g. `http://hub:8081/hub/api`.
    pub api_url: String,
    pub api_token: String,
    pub user: String,
    pub server_name: String,
    /// Service prefix with any trailing slash removed; may be empty.
    pub service_prefix: String,
    /// External host of the Hub; may be empty for same-host deployments.
    pub hub_host: String,
    /// Hub base path: deployment base + `hub/`.
    pub hub_prefix: String,
    /// OAuth client id; falls back to the raw service prefix.
    pub client_id: String,
}

impl HubContext {
    pub fn from_env() -> Self {
        let mut api_url = std::env::var("JUPYTERHUB_API_URL").unwrap_or_default();
        if api_url.is_empty() {
            if let Ok(base) = std::env::var("JUPYTERHUB_BASE_URL") {
                if !base.is_empty() {
                    api_url = format!("{base}/hub/api");
                }
            }
        }

        let raw_prefix = std::env::var("JUPYTERHUB_SERVICE_PREFIX").unwrap_or_default();
        let service_prefix = raw_prefix.trim_end_matches('/').to_string();

        let mut client_id = std::env::var("JUPYTERHUB_CLIENT_ID").unwrap_or_default();
        if client_id.is_empty() {
            client_id = raw_prefix.clone();
        }

        // JUPYTERHUB_BASE_URL is the deployment base ("/" or "/jupyter/"),
        // not the Hub's own path; the Hub lives under "<base>hub/".
        let mut deployment_base = std::env::var("JUPYTERHUB_BASE_URL").unwrap_or_default();
        if deployment_base.is_empty() {
            deployment_base = "/".to_string();
        }
        if !deployment_base.ends_with('/') {
            deployment_base.push('/');
        }
        let hub_prefix = format!("{deployment_base}hub/");

        Self {
            api_url,
            api_token: std::env::var("JUPYTERHUB_API_TOKEN").unwrap_or_default(),
            user: std::env::var("JUPYTERHUB_USER").unwrap_or_default(),
            server_name: std::env::var("JUPYTERHUB_SERVER_NAME").unwrap_or_default(),
            service_prefix,
            hub_host: std::env::var("JUPYTERHUB_HOST").unwrap_or_default(),
            hub_prefix,
            client_id,
        }
    }

    /// OAuth mode requires the full Hub contract; anything missing is a
    /// startup configuration error.
    pub fn validate_for_oauth(&self) -> Result<(), ProxyError> {
        let mut missing = Vec::new();
        if self.api_url.is_empty() {
            missing.push("JUPYTERHUB_API_URL (or JUPYTERHUB_BASE_URL)");
        }
        if self.api_token.is_empty() {
            missing.push("JUPYTERHUB_API_TOKEN");
        }
        if self.user.is_empty() {
            missing.push("JUPYTERHUB_USER");
        }
        if self.client_id.is_empty() {
            missing.push("JUPYTERHUB_CLIENT_ID (or JUPYTERHUB_SERVICE_PREFIX)");
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ProxyError::Config(format!(
                "oauth mode requires: {}",
                missing.join(", ")
            )))
        }
    }

    /// Cookie scope: the service prefix with a trailing slash, or "/".
    pub fn cookie_path(&self) -> String {
        if self.service_prefix.is_empty() {
            "/".to_string()
        } else {
            format!("{}/", self.service_prefix)
        }
    }
}

/// Hub-reported user record, forwarded to the application as
/// `X-Forwarded-User-Data`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubUser {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub admin: bool,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

pub struct HubClient {
    ctx: HubContext,
    http: reqwest::Client,
}

impl HubClient {
    pub fn new(ctx: HubContext) -> Result<Self, ProxyError> {
        if ctx.api_url.is_empty() {
            return Err(ProxyError::Config(
                "JUPYTERHUB_API_URL or JUPYTERHUB_BASE_URL must be set".into(),
            ));
        }
        if ctx.api_token.is_empty() {
            return Err(ProxyError::Config("JUPYTERHUB_API_TOKEN must be set".into()));
        }
        if ctx.user.is_empty() {
            return Err(ProxyError::Config("JUPYTERHUB_USER must be set".into()));
        }

        let http = reqwest::Client::builder()
            .timeout(HUB_CALL_TIMEOUT)
            .build()
            .map_err(|err| ProxyError::Hub(format!("failed to build hub client: {err}")))?;

        Ok(Self { ctx, http })
    }

    /// Reports activity to the Hub to prevent idle culling.
    pub async fn notify_activity(&self, timestamp: DateTime<Utc>) -> Result<(), ProxyError> {
        let endpoint = format!("{}/users/{}/activity", self.ctx.api_url, self.ctx.user);

        let mut payload = json!({ "last_activity": timestamp });
        if !self.ctx.server_name.is_empty() {
            let mut servers = serde_json::Map::new();
            servers.insert(
                self.ctx.server_name.clone(),
                json!({ "last_activity": timestamp }),
            );
            payload["servers"] = serde_json::Value::Object(servers);
        }

        let response = self
            .http
            .post(&endpoint)
            .header("Authorization", format!("token {}", self.ctx.api_token))
            .json(&payload)
            .send()
            .await
            .map_err(|err| ProxyError::Hub(format!("failed to notify activity: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProxyError::Hub(format!(
                "activity notification failed with status {}: {}",
                status.as_u16(),
                body
            )));
        }

        debug!(%timestamp, "activity notification sent");
        Ok(())
    }

    /// Validates a user token against the Hub. This is the presented token,
    /// not the proxy's own api token.
    pub async fn get_user(&self, token: &str) -> Result<HubUser, ProxyError> {
        let endpoint = format!("{}/user", self.ctx.api_url);

        let response = self
            .http
            .get(&endpoint)
            .header("Authorization", format!("token {token}"))
            .send()
            .await
            .map_err(|err| ProxyError::Hub(format!("failed to get user: {err}")))?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(ProxyError::Hub(format!(
                "request to {endpoint} returned status {}",
                status.as_u16()
            )));
        }

        response
            .json()
            .await
            .map_err(|err| ProxyError::Hub(format!("failed to decode user response: {err}")))
    }

    /// Checks the Hub API is reachable.
    pub async fn ping(&self) -> Result<(), ProxyError> {
        let endpoint = format!("{}/", self.ctx.api_url);

        let response = self
            .http
            .get(&endpoint)
            .header("Authorization", format!("token {}", self.ctx.api_token))
            .send()
            .await
            .map_err(|err| ProxyError::Hub(format!("failed to ping hub: {err}")))?;

        if response.status() != reqwest::StatusCode::OK {
            return Err(ProxyError::Hub(format!(
                "ping failed with status {}",
                response.status().as_u16()
            )));
        }

        debug!("hub ping successful");
        Ok(())
    }

    /// Spawns the periodic activity reporter.
    ///
    /// With `keep_alive` the current time is reported immediately and then
    /// on every tick, keeping the server alive forever. Without it, a tick
    /// only reports when the tracker has seen a request since startup.
    /// The loop ends when `shutdown` flips to true.
    pub fn spawn_activity_reporter(
        self: Arc<Self>,
        interval: Duration,
        keep_alive: bool,
        tracker: Arc<Tracker>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                interval_secs = interval.as_secs(),
                keep_alive,
                user = %self.ctx.user,
                server_name = %self.ctx.server_name,
                "activity reporter started"
            );

            if keep_alive {
                if let Err(err) = self.notify_activity(Utc::now()).await {
                    error!(error = %err, "failed to notify activity on start");
                }
            }

            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // completes immediately

            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("activity reporter stopped");
                            return;
                        }
                    }
                    _ = ticker.tick() => {
                        let report = if keep_alive {
                            Some(Utc::now())
                        } else {
                            self.tracker_timestamp(&tracker)
                        };
                        match report {
                            Some(timestamp) => {
                                if let Err(err) = self.notify_activity(timestamp).await {
                                    error!(error = %err, "failed to notify activity");
                                }
                            }
                            None => debug!("no activity to report yet"),
                        }
                    }
                }
            }
        })
    }

    fn tracker_timestamp(&self, tracker: &Tracker) -> Option<DateTime<Utc>> {
        tracker.last_activity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::Mutex;

    /// One-shot HTTP stub that records the request head and answers with the
    /// given status and body.
    fn stub_hub(status: u16, body: &'static str) -> (String, Arc<Mutex<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let captured = Arc::new(Mutex::new(String::new()));
        let captured_thread = Arc::clone(&captured);

        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { break };
                let mut data = Vec::new();
                let mut buf = [0u8; 4096];
                // Read the full request: headers, then content-length bytes.
                loop {
                    let Ok(n) = stream.read(&mut buf) else { break };
                    if n == 0 {
                        break;
                    }
                    data.extend_from_slice(&buf[..n]);
                    let text = String::from_utf8_lossy(&data).into_owned();
                    if let Some(header_end) = text.find("\r\n\r\n") {
                        let content_length = text
                            .to_ascii_lowercase()
                            .lines()
                            .find_map(|line| line.strip_prefix("content-length:").map(str::trim).and_then(|v| v.parse::<usize>().ok()))
                            .unwrap_or(0);
                        if data.len() >= header_end + 4 + content_length {
                            break;
                        }
                    }
                }
                *captured_thread.lock().unwrap() = String::from_utf8_lossy(&data).into_owned();
                let _ = write!(
                    stream,
                    "HTTP/1.1 {status} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
            }
        });

        (format!("http://127.0.0.1:{port}"), captured)
    }

    fn client_for(api_url: String) -> HubClient {
        HubClient::new(HubContext {
            api_url,
            api_token: "proxy-token".into(),
            user: "alice".into(),
            server_name: "myapp".into(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn context_requires_hub_contract_for_oauth() {
        let ctx = HubContext::default();
        assert!(ctx.validate_for_oauth().is_err());

        let ctx = HubContext {
            api_url: "http://hub/api".into(),
            api_token: "t".into(),
            user: "alice".into(),
            client_id: "/user/alice/".into(),
            ..Default::default()
        };
        ctx.validate_for_oauth().unwrap();
    }

    #[test]
    fn cookie_path_defaults_to_root() {
        assert_eq!(HubContext::default().cookie_path(), "/");
        let ctx = HubContext {
            service_prefix: "/user/alice".into(),
            ..Default::default()
        };
        assert_eq!(ctx.cookie_path(), "/user/alice/");
    }

    #[tokio::test]
    async fn notify_activity_posts_payload_with_server_name() {
        let (url, captured) = stub_hub(200, "{}");
        let client = client_for(url);
        client.notify_activity(Utc::now()).await.unwrap();

        let request = captured.lock().unwrap().clone();
        assert!(request.starts_with("POST /users/alice/activity"));
        assert!(request.contains("Authorization: token proxy-token") || request.contains("authorization: token proxy-token"));
        assert!(request.contains("last_activity"));
        assert!(request.contains("myapp"));
    }

    #[tokio::test]
    async fn notify_activity_surfaces_hub_error_body() {
        let (url, _) = stub_hub(503, "overloaded");
        let client = client_for(url);
        let err = client.notify_activity(Utc::now()).await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("503"));
        assert!(message.contains("overloaded"));
    }

    #[tokio::test]
    async fn get_user_uses_presented_token() {
        let (url, captured) = stub_hub(
            200,
            r#"{"name":"alice","admin":false,"roles":["user"],"groups":[],"scopes":["self"]}"#,
        );
        let client = client_for(url);
        let user = client.get_user("visitor-token").await.unwrap();
        assert_eq!(user.name, "alice");
        assert_eq!(user.roles, vec!["user"]);

        let request = captured.lock().unwrap().clone();
        assert!(request.starts_with("GET /user"));
        assert!(request.to_lowercase().contains("authorization: token visitor-token"));
    }

    #[tokio::test]
    async fn get_user_rejects_non_200() {
        let (url, _) = stub_hub(403, "{}");
        let client = client_for(url);
        assert!(client.get_user("bad").await.is_err());
    }

    #[tokio::test]
    async fn keep_alive_reporter_posts_on_its_own_clock() {
        let (url, captured) = stub_hub(200, "{}");
        let client = Arc::new(client_for(url));
        let tracker = Arc::new(Tracker::new());
        let (tx, rx) = tokio::sync::watch::channel(false);

        let handle = client.spawn_activity_reporter(
            Duration::from_millis(50),
            true,
            tracker,
            rx,
        );

        // The immediate report lands without any tracked request.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let request = captured.lock().unwrap().clone();
        assert!(
            request.starts_with("POST /users/alice/activity"),
            "no activity reported: {request:?}"
        );

        let _ = tx.send(true);
        let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
    }

    #[tokio::test]
    async fn tracker_driven_reporter_skips_idle_ticks() {
        let (url, captured) = stub_hub(200, "{}");
        let client = Arc::new(client_for(url));
        let tracker = Arc::new(Tracker::new());
        let (tx, rx) = tokio::sync::watch::channel(false);

        let handle = client.spawn_activity_reporter(
            Duration::from_millis(50),
            false,
            Arc::clone(&tracker),
            rx,
        );

        // No requests were forwarded, so nothing is reported.
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(captured.lock().unwrap().is_empty());

        // Once a request lands, the next tick reports its timestamp.
        tracker.record();
        tokio::time::sleep(Duration::from_millis(300)).await;
        let request = captured.lock().unwrap().clone();
        assert!(
            request.starts_with("POST /users/alice/activity"),
            "tracked activity not reported: {request:?}"
        );

        let _ = tx.send(true);
        let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
    }
}
