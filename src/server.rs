//! Server lifecycle: wires the components together, runs the HTTP listener,
//! and drives signal-based graceful shutdown.
//!
//! The first SIGINT/SIGTERM starts a graceful shutdown (drain HTTP within a
//! deadline, then SIGTERM the application's process group with its own
//! grace); a second signal exits immediately.

use std::sync::Arc;
use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::activity::Tracker;
use crate::auth::OAuth;
use crate::cli::{AuthType, Cli};
use crate::command;
use crate::error::ProxyError;
use crate::git::{self, CloneConfig};
use crate::health::ProbeConfig;
use crate::hub::{HubClient, HubContext, ACTIVITY_REPORT_INTERVAL};
use crate::interim::InterimState;
use crate::logs::LogBuffer;
use crate::ports;
use crate::process::{ProcessState, Supervisor, SupervisorConfig};
use crate::proxy::ProxyHandler;
use crate::router::{build_router, AppContext, RoutePaths};

/// How long open HTTP connections get to drain on shutdown.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

pub async fn run(cli: Cli) -> Result<(), ProxyError> {
    if cli.command.is_empty() {
        return Err(ProxyError::Config(
            "no command specified; usage: hubproxy [flags] -- command [args...]".into(),
        ));
    }

    let hub_ctx = HubContext::from_env();
    let needs_oauth = cli.auth_type == AuthType::OAuth || cli.interim_page_auth;
    if needs_oauth {
        hub_ctx.validate_for_oauth()?;
    }

    let proxy_port = cli.effective_port();
    info!(
        version = crate::VERSION,
        auth_type = ?cli.auth_type,
        port = proxy_port,
        dest_port = cli.dest_port,
        conda_env = cli.conda_env.as_deref().unwrap_or(""),
        ready_check_path = %cli.ready_check_path,
        ready_timeout_secs = cli.ready_timeout,
        log_buffer_size = cli.log_buffer_size,
        strip_prefix = cli.strip_prefix,
        progressive = cli.progressive,
        interim_page_auth = cli.interim_page_auth,
        "starting hubproxy"
    );

    if let Some(repo) = cli.repo.as_deref() {
        git::clone_repo(&CloneConfig {
            repo_url: repo.to_string(),
            branch: cli.repo_branch.clone(),
            dest_path: cli.repo_folder.clone(),
        })
        .await?;
    }

    let (command, conda_warning) = command::build(&cli.command, cli.conda_env.as_deref()).await?;

    let child_port = ports::allocate(cli.dest_port)?;
    info!(port = child_port, "allocated internal port for application");

    let command = command::substitute_placeholders(&command, child_port, &hub_ctx.service_prefix);
    let child_env = command::build_child_env();

    let logs = Arc::new(LogBuffer::new(cli.log_buffer_size));

    let mut probe = ProbeConfig::new(format!(
        "http://127.0.0.1:{child_port}{}",
        cli.ready_check_path
    ));
    probe.deadline = Duration::from_secs(cli.ready_timeout);

    let supervisor = Supervisor::new(
        SupervisorConfig {
            command: command.clone(),
            env: child_env,
            workdir: cli.workdir.clone(),
            ready_probe: Some(probe),
        },
        Arc::clone(&logs),
    )?;

    if let Some(warning) = conda_warning {
        supervisor.add_error_log(warning);
    }

    let activity = Arc::new(Tracker::new());

    let (oauth, hub_client) = if needs_oauth {
        let client = Arc::new(HubClient::new(hub_ctx.clone())?);
        let oauth = Arc::new(OAuth::new(hub_ctx.clone(), Arc::clone(&client)));
        (Some(oauth), Some(client))
    } else {
        (None, None)
    };

    let paths = RoutePaths::new(&hub_ctx.service_prefix, oauth.is_some());
    let interim = Arc::new(InterimState::new(paths.app_root.clone()));
    let proxy = ProxyHandler::new(
        child_port,
        paths.service_prefix.clone(),
        cli.strip_prefix,
        cli.progressive,
        Arc::clone(&activity),
    );

    let ctx = Arc::new(AppContext {
        supervisor: Arc::clone(&supervisor),
        logs: Arc::clone(&logs),
        interim: Arc::clone(&interim),
        activity: Arc::clone(&activity),
        oauth,
        proxy,
        paths: paths.clone(),
        protect_app: cli.auth_type == AuthType::OAuth,
        protect_interim: needs_oauth,
    });
    let router = build_router(Arc::clone(&ctx));

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", proxy_port))
        .await
        .map_err(|err| {
            ProxyError::Config(format!("failed to bind proxy port {proxy_port}: {err}"))
        })?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_handler(shutdown_tx.clone())?;

    // The application starts regardless of the HTTP server's fate so its
    // startup failures land in the log buffer for the interim page.
    match supervisor.start() {
        Ok(()) => {
            info!(
                pid = supervisor.pid(),
                internal_port = child_port,
                "application process started"
            );
            if cli.auth_type == AuthType::OAuth {
                if let Some(client) = hub_client {
                    start_activity_reporter(
                        client,
                        cli.effective_keep_alive(),
                        Arc::clone(&activity),
                        shutdown_rx.clone(),
                    );
                }
            }
        }
        Err(err) => {
            error!(error = %err, "failed to start application process");
            supervisor.add_error_log(format!("ERROR: Failed to start process: {err}"));
            supervisor.add_error_log(format!("Command: {command:?}"));
        }
    }

    spawn_deployment_watcher(
        Arc::clone(&supervisor),
        Arc::clone(&interim),
        paths.interim_base.clone(),
    );

    info!(
        port = proxy_port,
        internal_port = child_port,
        interim_page = %paths.interim_base,
        "proxy server listening"
    );

    let mut graceful_rx = shutdown_rx.clone();
    let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
        while !*graceful_rx.borrow_and_update() {
            if graceful_rx.changed().await.is_err() {
                return;
            }
        }
    });

    let mut deadline_rx = shutdown_rx.clone();
    let drain_deadline = async move {
        loop {
            if *deadline_rx.borrow_and_update() {
                break;
            }
            if deadline_rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
        tokio::time::sleep(SHUTDOWN_DEADLINE).await;
    };

    tokio::select! {
        result = serve => {
            if let Err(err) = result {
                error!(error = %err, "proxy server failed");
            }
        }
        _ = drain_deadline => {
            warn!("shutdown deadline elapsed, dropping open connections");
        }
    }

    info!("shutting down");
    if supervisor.pid() != 0
        && matches!(
            supervisor.state(),
            ProcessState::Running | ProcessState::Starting
        )
    {
        info!("stopping application process");
        if let Err(err) = supervisor.stop().await {
            error!(error = %err, "failed to stop application process");
        }
    }
    logs.close();
    info!("shutdown complete");
    Ok(())
}

fn spawn_signal_handler(shutdown_tx: watch::Sender<bool>) -> Result<(), ProxyError> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
        info!("received signal, initiating graceful shutdown (press Ctrl+C again to force quit)");
        let _ = shutdown_tx.send(true);

        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
        warn!("received second signal, forcing immediate exit");
        std::process::exit(1);
    });

    Ok(())
}

/// Pings the Hub once, then reports activity on a fixed interval. A dead Hub
/// only costs the reporter; the proxy keeps serving.
fn start_activity_reporter(
    client: Arc<HubClient>,
    keep_alive: bool,
    tracker: Arc<Tracker>,
    shutdown_rx: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        if let Err(err) = client.ping().await {
            warn!(error = %err, "failed to start activity reporter (continuing anyway)");
            return;
        }
        let _ = client.spawn_activity_reporter(
            ACTIVITY_REPORT_INTERVAL,
            keep_alive,
            tracker,
            shutdown_rx,
        );
    });
}

/// Marks the interim deployment timestamp the first time the supervisor
/// reports Running; the grace window starts from there.
fn spawn_deployment_watcher(
    supervisor: Arc<Supervisor>,
    interim: Arc<InterimState>,
    interim_base: String,
) {
    let mut state_rx = supervisor.subscribe_state();
    tokio::spawn(async move {
        loop {
            if *state_rx.borrow_and_update() == ProcessState::Running {
                interim.mark_app_deployed();
                info!(
                    pid = supervisor.pid(),
                    interim_page = %interim_base,
                    "application ready"
                );
                return;
            }
            if state_rx.changed().await.is_err() {
                return;
            }
        }
    });
}
