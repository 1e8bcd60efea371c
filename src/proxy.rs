//! Reverse proxy to the supervised application.
//!
//! Plain HTTP is forwarded through a pooled hyper client with streaming
//! bodies: every upstream frame is written through to the client as it
//! arrives, which is what makes progressive rendering (Voila and friends)
//! work without any flush plumbing. WebSocket upgrades are bridged by
//! completing the upgrade on our side and dialing the application with a
//! second WebSocket connection, pumping frames in both directions.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::http::{header, HeaderMap, HeaderValue, Request, StatusCode, Uri, Version};
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tracing::{debug, error, info, warn};

use crate::activity::Tracker;

/// End-to-end headers only cross the proxy; these are connection-scoped.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Request headers carried over to the upstream WebSocket handshake.
const WS_FORWARD_HEADERS: &[&str] = &[
    "cookie",
    "authorization",
    "sec-websocket-protocol",
    crate::auth::USER_DATA_HEADER,
];

pub struct ProxyHandler {
    client: Client<HttpConnector, Body>,
    upstream_port: u16,
    service_prefix: String,
    strip_prefix: bool,
    activity: Arc<Tracker>,
}

impl ProxyHandler {
    pub fn new(
        upstream_port: u16,
        service_prefix: String,
        strip_prefix: bool,
        progressive: bool,
        activity: Arc<Tracker>,
    ) -> Self {
        if progressive {
            // Streaming forward is unbuffered either way; the flag is kept
            // on the CLI for spawner compatibility.
            info!("progressive streaming requested (responses are streamed unbuffered)");
        }
        Self {
            client: Client::builder(TokioExecutor::new()).build(HttpConnector::new()),
            upstream_port,
            service_prefix,
            strip_prefix,
            activity,
        }
    }

    /// The path sent upstream: the service prefix is dropped when stripping
    /// is enabled (apps like JupyterLab that honor their own base_url run
    /// with stripping disabled).
    pub fn forward_path(&self, original: &str) -> String {
        if self.strip_prefix
            && !self.service_prefix.is_empty()
            && original.starts_with(self.service_prefix.as_str())
        {
            if original.len() > self.service_prefix.len() {
                return original[self.service_prefix.len()..].to_string();
            }
            return "/".to_string();
        }
        original.to_string()
    }

    /// Forwards one request to the application, upgrading to a WebSocket
    /// bridge when the request asked for one.
    pub async fn forward(&self, req: Request<Body>, ws: Option<WebSocketUpgrade>) -> Response {
        self.activity.record();

        let original_path = req.uri().path().to_string();
        let forward_path = self.forward_path(&original_path);
        let query = req
            .uri()
            .query()
            .map(|q| format!("?{q}"))
            .unwrap_or_default();

        if let Some(ws) = ws {
            let target = format!(
                "ws://127.0.0.1:{}{}{}",
                self.upstream_port, forward_path, query
            );
            info!(path = %original_path, target = %target, "WebSocket upgrade request");
            let request_headers = req.headers().clone();
            return ws
                .on_upgrade(move |socket| async move {
                    if let Err(err) = bridge_websocket(socket, target, request_headers).await {
                        warn!(error = %err, "websocket bridge closed with error");
                    }
                })
                .into_response();
        }

        let target = format!(
            "http://127.0.0.1:{}{}{}",
            self.upstream_port, forward_path, query
        );
        debug!(
            original_path = %original_path,
            forwarded_path = %forward_path,
            "proxying request to application"
        );

        let uri: Uri = match target.parse() {
            Ok(uri) => uri,
            Err(err) => {
                error!(target = %target, error = %err, "invalid upstream URI");
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, "invalid upstream URI");
            }
        };

        let (mut parts, body) = req.into_parts();
        parts.uri = uri;
        // The pooled client speaks HTTP/1.1 to the loopback upstream
        // regardless of what the inbound connection negotiated.
        parts.version = Version::HTTP_11;
        strip_hop_headers(&mut parts.headers);
        if let Ok(host) = HeaderValue::from_str(&format!("127.0.0.1:{}", self.upstream_port)) {
            parts.headers.insert(header::HOST, host);
        }

        match self.client.request(Request::from_parts(parts, body)).await {
            Ok(response) => {
                let mut response = response.map(Body::new);
                strip_hop_headers(response.headers_mut());
                response
            }
            Err(err) => {
                warn!(error = %err, "upstream request failed");
                error_response(StatusCode::BAD_GATEWAY, "application unavailable")
            }
        }
    }
}

fn strip_hop_headers(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, message.to_string()).into_response()
}

/// Pumps frames between the accepted client socket and a fresh upstream
/// connection until either side closes.
async fn bridge_websocket(
    client_socket: WebSocket,
    target: String,
    request_headers: HeaderMap,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut upstream_request = target.as_str().into_client_request()?;
    for name in WS_FORWARD_HEADERS {
        if let Some(value) = request_headers.get(*name) {
            upstream_request.headers_mut().insert(*name, value.clone());
        }
    }

    let (upstream, _response) = connect_async(upstream_request).await?;

    let (mut client_tx, mut client_rx) = client_socket.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    let client_to_upstream = async {
        while let Some(message) = client_rx.next().await {
            let forward = match message? {
                WsMessage::Text(text) => UpstreamMessage::Text(text),
                WsMessage::Binary(data) => UpstreamMessage::Binary(data),
                WsMessage::Ping(data) => UpstreamMessage::Ping(data),
                WsMessage::Pong(data) => UpstreamMessage::Pong(data),
                WsMessage::Close(_) => UpstreamMessage::Close(None),
            };
            let closing = matches!(forward, UpstreamMessage::Close(_));
            upstream_tx.send(forward).await?;
            if closing {
                break;
            }
        }
        Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
    };

    let upstream_to_client = async {
        while let Some(message) = upstream_rx.next().await {
            let forward = match message? {
                UpstreamMessage::Text(text) => WsMessage::Text(text),
                UpstreamMessage::Binary(data) => WsMessage::Binary(data),
                UpstreamMessage::Ping(data) => WsMessage::Ping(data),
                UpstreamMessage::Pong(data) => WsMessage::Pong(data),
                UpstreamMessage::Close(_) => WsMessage::Close(None),
                UpstreamMessage::Frame(_) => continue,
            };
            let closing = matches!(forward, WsMessage::Close(_));
            client_tx.send(forward).await?;
            if closing {
                break;
            }
        }
        Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
    };

    tokio::select! {
        result = client_to_upstream => result?,
        result = upstream_to_client => result?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler(prefix: &str, strip: bool) -> ProxyHandler {
        ProxyHandler::new(
            3000,
            prefix.to_string(),
            strip,
            false,
            Arc::new(Tracker::new()),
        )
    }

    #[test]
    fn strips_prefix_for_app_paths() {
        let proxy = handler("/user/admin/custom-py", true);
        assert_eq!(
            proxy.forward_path("/user/admin/custom-py/index.html"),
            "/index.html"
        );
    }

    #[test]
    fn exact_prefix_becomes_root() {
        let proxy = handler("/user/admin/custom-py", true);
        assert_eq!(proxy.forward_path("/user/admin/custom-py"), "/");
    }

    #[test]
    fn no_stripping_when_disabled() {
        let proxy = handler("/user/admin/lab", false);
        assert_eq!(
            proxy.forward_path("/user/admin/lab/api/kernels"),
            "/user/admin/lab/api/kernels"
        );
    }

    #[test]
    fn empty_prefix_forwards_as_is() {
        let proxy = handler("", true);
        assert_eq!(proxy.forward_path("/index.html"), "/index.html");
    }

    #[test]
    fn unrelated_path_is_untouched() {
        let proxy = handler("/user/admin/app", true);
        assert_eq!(proxy.forward_path("/other/path"), "/other/path");
    }

    #[tokio::test]
    async fn forward_records_activity_and_maps_dial_failure_to_502() {
        let dead_port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let activity = Arc::new(Tracker::new());
        let proxy = ProxyHandler::new(dead_port, String::new(), true, false, Arc::clone(&activity));

        let req = Request::builder()
            .uri("/anything")
            .body(Body::empty())
            .unwrap();
        let response = proxy.forward(req, None).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(activity.last_activity().is_some());
    }

    #[tokio::test]
    async fn forward_proxies_to_live_upstream() {
        use std::io::{Read, Write};
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0u8; 2048];
                let _ = stream.read(&mut buf);
                let body = "upstream says hi";
                let _ = write!(
                    stream,
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
            }
        });

        let proxy = ProxyHandler::new(
            port,
            "/user/alice".into(),
            true,
            false,
            Arc::new(Tracker::new()),
        );
        let req = Request::builder()
            .uri("/user/alice/hello?x=1")
            .body(Body::empty())
            .unwrap();
        let response = proxy.forward(req, None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&bytes[..], b"upstream says hi");
    }
}
