//! Readiness probing of the application process.
//!
//! The prober GETs the configured URL until it answers 2xx/3xx a threshold
//! number of times in a row, or the overall deadline elapses. Redirects are
//! not followed: a 302 from an app's login page still proves it is serving.

use std::time::Duration;

use tracing::{debug, error, info};

use crate::error::ProxyError;

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub url: String,
    /// Overall deadline for the app to become ready.
    pub deadline: Duration,
    pub interval: Duration,
    pub initial_delay: Duration,
    pub success_threshold: u32,
    pub request_timeout: Duration,
}

impl ProbeConfig {
    pub fn new(url: String) -> Self {
        Self {
            url,
            deadline: Duration::from_secs(300),
            interval: Duration::from_secs(1),
            initial_delay: Duration::from_secs(2),
            success_threshold: 1,
            request_timeout: Duration::from_secs(2),
        }
    }
}

pub struct Prober {
    config: ProbeConfig,
    client: reqwest::Client,
}

/// Log a failed attempt at info level roughly this often (in attempts, so
/// ~every 15 s at the default 1 s interval).
const LOG_EVERY_N_ATTEMPTS: u32 = 15;

impl Prober {
    pub fn new(config: ProbeConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(format!("{}-health-check/{}", crate::PROXY_NAME, crate::VERSION))
            .build()
            .unwrap_or_default();
        Self { config, client }
    }

    /// Blocks until the probe succeeds `success_threshold` consecutive times
    /// or the deadline elapses.
    pub async fn wait_until_ready(&self) -> Result<(), ProxyError> {
        info!(
            url = %self.config.url,
            deadline_secs = self.config.deadline.as_secs(),
            interval_ms = self.config.interval.as_millis() as u64,
            "starting readiness check"
        );

        if !self.config.initial_delay.is_zero() {
            tokio::time::sleep(self.config.initial_delay).await;
        }

        let deadline = tokio::time::Instant::now() + self.config.deadline;
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // first tick completes immediately

        let mut attempt: u32 = 0;
        let mut consecutive = 0;

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    error!(
                        attempts = attempt,
                        url = %self.config.url,
                        deadline_secs = self.config.deadline.as_secs(),
                        "readiness check deadline elapsed"
                    );
                    return Err(ProxyError::ReadinessTimeout {
                        attempts: attempt,
                        deadline_secs: self.config.deadline.as_secs(),
                    });
                }
                _ = ticker.tick() => {
                    attempt += 1;
                    let start = std::time::Instant::now();
                    let result = self.check_once().await;
                    let latency = start.elapsed();

                    match result {
                        Ok(status) => {
                            consecutive += 1;
                            debug!(attempt, status, latency_ms = latency.as_millis() as u64, "readiness check passed");
                            if consecutive >= self.config.success_threshold {
                                info!(
                                    attempts = attempt,
                                    url = %self.config.url,
                                    "application is ready"
                                );
                                return Ok(());
                            }
                        }
                        Err(reason) => {
                            consecutive = 0;
                            debug!(attempt, latency_ms = latency.as_millis() as u64, %reason, "readiness check failed");
                            if attempt == 1 || attempt % LOG_EVERY_N_ATTEMPTS == 0 {
                                info!(attempt, url = %self.config.url, %reason, "still waiting for application");
                            }
                        }
                    }
                }
            }
        }
    }

    /// One probe. 2xx and 3xx are healthy; everything else, including
    /// transport errors, is not.
    async fn check_once(&self) -> Result<u16, String> {
        let response = self
            .client
            .get(&self.config.url)
            .send()
            .await
            .map_err(|err| format!("request failed: {err}"))?;

        let status = response.status();
        if status.is_success() || status.is_redirection() {
            Ok(status.as_u16())
        } else {
            Err(format!("unhealthy status code: {}", status.as_u16()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Minimal HTTP responder: answers each connection with the status line
    /// chosen by the closure, counting requests.
    fn stub_server(status_for_attempt: impl Fn(u32) -> u16 + Send + 'static) -> (String, Arc<AtomicU32>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let hits = Arc::new(AtomicU32::new(0));
        let hits_thread = Arc::clone(&hits);

        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { break };
                let attempt = hits_thread.fetch_add(1, Ordering::SeqCst) + 1;
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf);
                let status = status_for_attempt(attempt);
                let reason = if status == 200 { "OK" } else { "NO" };
                let _ = write!(stream, "HTTP/1.1 {status} {reason}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
            }
        });

        (format!("http://127.0.0.1:{port}/"), hits)
    }

    fn fast_config(url: String) -> ProbeConfig {
        ProbeConfig {
            url,
            deadline: Duration::from_secs(5),
            interval: Duration::from_millis(20),
            initial_delay: Duration::ZERO,
            success_threshold: 1,
            request_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn succeeds_on_2xx() {
        let (url, _) = stub_server(|_| 200);
        Prober::new(fast_config(url)).wait_until_ready().await.unwrap();
    }

    #[tokio::test]
    async fn redirect_counts_as_ready() {
        let (url, _) = stub_server(|_| 302);
        Prober::new(fast_config(url)).wait_until_ready().await.unwrap();
    }

    #[tokio::test]
    async fn failures_reset_consecutive_count() {
        // 500, 200, 500, 200, 200 with threshold 2: ready on attempt 5.
        let (url, hits) = stub_server(|n| match n {
            2 | 4 | 5 => 200,
            _ => 500,
        });
        let mut config = fast_config(url);
        config.success_threshold = 2;
        Prober::new(config).wait_until_ready().await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn deadline_reports_attempt_count() {
        let (url, _) = stub_server(|_| 503);
        let mut config = fast_config(url);
        config.deadline = Duration::from_millis(150);
        let err = Prober::new(config).wait_until_ready().await.unwrap_err();
        match err {
            ProxyError::ReadinessTimeout { attempts, .. } => assert!(attempts > 0),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn connection_refused_is_a_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut config = fast_config(format!("http://127.0.0.1:{port}/"));
        config.deadline = Duration::from_millis(100);
        let err = Prober::new(config).wait_until_ready().await.unwrap_err();
        assert!(matches!(err, ProxyError::ReadinessTimeout { .. }));
    }
}
