use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use subtle::ConstantTimeEq;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;

use tether_core::{BackupName, Config};
use tether_sync::{
    GitCloner, Notifier, RepoCloner, SyncError, SyncOrchestrator, Trigger, WebhookDecision,
    WebhookVerifier,
};

use crate::error::{io_err, DaemonError};
use crate::notify::notifier_for;
use crate::paths::{logs_dir, run_dir, socket_path};
use crate::protocol::{DaemonRequest, DaemonResponse};
use crate::restart::RestartScheduler;
use crate::service::{restarter_for, ServiceRestarter};

/// Error returned for any webhook that fails authentication. Nothing more
/// specific ever leaves the daemon.
pub const UNAUTHORIZED: &str = "unauthorized";

/// History entries still running when the daemon starts are closed with
/// this error.
pub const INTERRUPTED: &str = "interrupted";

/// Everything a request handler needs.
pub struct DaemonState {
    config: Arc<Config>,
    orchestrator: Arc<SyncOrchestrator>,
    restart: RestartScheduler,
    verifier: WebhookVerifier,
    shutdown: broadcast::Sender<()>,
    started_at: DateTime<Utc>,
}

impl DaemonState {
    /// Wire the engine to its collaborators. Must be called inside a tokio
    /// runtime: the restart scheduler captures the current handle.
    pub fn new(
        config: Config,
        cloner: Arc<dyn RepoCloner>,
        notifier: Arc<dyn Notifier>,
        restarter: Arc<dyn ServiceRestarter>,
        shutdown: broadcast::Sender<()>,
    ) -> Self {
        let config = Arc::new(config);
        let restart = RestartScheduler::new(
            config.restart.enabled,
            tokio::runtime::Handle::current(),
            restarter,
            notifier.clone(),
            config.notify.title_prefix.clone(),
        );
        let orchestrator = SyncOrchestrator::new(config.clone(), cloner, notifier)
            .with_restart_hook(Arc::new(restart.clone()));
        DaemonState {
            verifier: WebhookVerifier::from_config(&config),
            orchestrator: Arc::new(orchestrator),
            restart,
            shutdown,
            started_at: Utc::now(),
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn orchestrator(&self) -> &Arc<SyncOrchestrator> {
        &self.orchestrator
    }

    pub fn restart(&self) -> &RestartScheduler {
        &self.restart
    }
}

/// Start the daemon runtime and block the current thread until it exits.
pub fn start_blocking(config: Config) -> Result<(), DaemonError> {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(config))
}

/// Run the daemon with the production collaborators.
pub async fn run(config: Config) -> Result<(), DaemonError> {
    config.validate()?;
    let (shutdown_tx, _) = broadcast::channel::<()>(16);
    let notifier = notifier_for(&config.notify);
    let restarter = restarter_for(config.restart.method.as_ref());
    let state = DaemonState::new(
        config,
        Arc::new(GitCloner::default()),
        notifier,
        restarter,
        shutdown_tx,
    );
    serve(Arc::new(state)).await
}

/// Run the socket server and signal handler until a `stop` request or a
/// signal arrives.
pub async fn serve(state: Arc<DaemonState>) -> Result<(), DaemonError> {
    let state_dir = state.config.state_dir();
    ensure_runtime_dirs(&state_dir)?;
    recover_interrupted(&state).await;

    tracing::info!(
        target_dir = %state.config.target_dir.display(),
        branch = %state.config.repository.branch,
        mode = ?state.config.sync.mode,
        "tether daemon starting",
    );

    let socket_handle = {
        let state = state.clone();
        let shutdown = state.shutdown.clone();
        let shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            let result = socket_server_task(state, shutdown_rx).await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = state.shutdown.clone();
        let mut shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = shutdown_signal() => {
                    match signal {
                        Ok(name) => {
                            tracing::info!(signal = name, "received signal, shutting down daemon");
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(DaemonError::Protocol(format!("signal handler failed: {err}"))),
                    }
                }
            }
        })
    };

    let (socket_result, signal_result) = tokio::join!(socket_handle, signal_handle);
    handle_join("socket_server", socket_result)?;
    handle_join("signal_handler", signal_result)?;
    tracing::info!("tether daemon stopped");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.map(|()| "SIGINT"),
        _ = term.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await.map(|()| "ctrl-c")
}

async fn recover_interrupted(state: &DaemonState) {
    let orchestrator = state.orchestrator.clone();
    let result =
        tokio::task::spawn_blocking(move || orchestrator.history().fail_interrupted(INTERRUPTED))
            .await;
    match result {
        Ok(Ok(0)) => {}
        Ok(Ok(count)) => tracing::warn!(count, "closed interrupted sync entries"),
        Ok(Err(err)) => tracing::warn!(error = %err, "could not close interrupted sync entries"),
        Err(err) => tracing::warn!(error = %err, "interrupted-entry recovery task failed"),
    }
}

async fn socket_server_task(
    state: Arc<DaemonState>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let socket = socket_path(&state.config.state_dir());
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;
    tracing::info!(socket = %socket.display(), "listening");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, state).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(
    stream: UnixStream,
    state: Arc<DaemonState>,
) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request = match serde_json::from_str::<DaemonRequest>(&line) {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &DaemonResponse::error(format!("invalid request: {err}")),
                )
                .await?;
                continue;
            }
        };

        let is_stop = request == DaemonRequest::Stop;
        let response = dispatch(&state, request).await;
        write_response(&mut writer, &response).await?;
        if is_stop {
            break;
        }
    }

    Ok(())
}

/// Handle one request. Every failure becomes an error response; nothing
/// here can take the daemon down.
pub async fn dispatch(state: &Arc<DaemonState>, request: DaemonRequest) -> DaemonResponse {
    let name = request.name();
    tracing::debug!(cmd = name, "request");

    match request {
        DaemonRequest::Health => DaemonResponse::ok(json!({
            "status": "ok",
            "time": Utc::now(),
        })),
        DaemonRequest::Status => DaemonResponse::ok(build_status_payload(state).await),
        DaemonRequest::Config => to_response(Ok(state.config.redacted())),
        DaemonRequest::Sync { token } => {
            if !manual_token_ok(&state.config, token.as_deref()) {
                tracing::warn!("rejected manual sync with bad token");
                return DaemonResponse::error(UNAUTHORIZED);
            }
            start_run(state, Trigger::Manual).await
        }
        DaemonRequest::Webhook {
            event,
            signature,
            body,
        } => {
            let decision =
                state
                    .verifier
                    .evaluate(event.as_deref(), signature.as_deref(), body.as_bytes());
            match decision {
                Ok(WebhookDecision::Accepted(push)) => start_run(state, Trigger::Webhook(push)).await,
                Ok(WebhookDecision::Ignored { reason }) => DaemonResponse::ok(json!({
                    "result": "ignored",
                    "reason": reason,
                })),
                Err(_) => DaemonResponse::error(UNAUTHORIZED),
            }
        }
        DaemonRequest::History { limit } => {
            blocking(state, move |o| o.history().list(limit)).await
        }
        DaemonRequest::Stats => blocking(state, |o| o.history().stats()).await,
        DaemonRequest::ClearHistory => {
            blocking(state, |o| o.history().clear().map(|()| json!({ "cleared": true }))).await
        }
        DaemonRequest::Backups => blocking(state, |o| o.backups().list()).await,
        DaemonRequest::Rollback { backup } => {
            let backup = backup.map(BackupName::from);
            blocking(state, move |o| o.rollback(backup.as_ref())).await
        }
        DaemonRequest::ProtectBackup { name } => {
            let name = BackupName::from(name);
            blocking(state, move |o| {
                o.backups()
                    .protect(&name)
                    .map(|()| json!({ "name": name, "protected": true }))
            })
            .await
        }
        DaemonRequest::UnprotectBackup { name } => {
            let name = BackupName::from(name);
            blocking(state, move |o| {
                o.backups()
                    .unprotect(&name)
                    .map(|()| json!({ "name": name, "protected": false }))
            })
            .await
        }
        DaemonRequest::DeleteBackup { name } => {
            let name = BackupName::from(name);
            blocking(state, move |o| {
                o.backups()
                    .delete(&name)
                    .map(|()| json!({ "name": name, "deleted": true }))
            })
            .await
        }
        DaemonRequest::ScheduleRestart { delay_secs } => {
            let delay = delay_secs.unwrap_or(state.config.restart.delay_secs);
            let outcome = state.restart.schedule(Duration::from_secs(delay));
            to_response(Ok(outcome))
        }
        DaemonRequest::CancelRestart => to_response(Ok(state.restart.cancel())),
        DaemonRequest::RestartStatus => to_response(Ok(state.restart.status())),
        DaemonRequest::Stop => {
            let _ = state.shutdown.send(());
            DaemonResponse::ok(json!({ "stopping": true }))
        }
    }
}

/// Claim the pipeline and run it in the background. The caller learns only
/// that the run was accepted (and its id) or that another run is active.
async fn start_run(state: &Arc<DaemonState>, trigger: Trigger) -> DaemonResponse {
    let orchestrator = state.orchestrator.clone();
    let pending = match tokio::task::spawn_blocking(move || orchestrator.begin(trigger)).await {
        Ok(Ok(pending)) => pending,
        Ok(Err(err)) => return DaemonResponse::error(err.to_string()),
        Err(err) => return DaemonResponse::error(format!("sync task join error: {err}")),
    };

    let sync_id = pending.sync_id().cloned();
    let orchestrator = state.orchestrator.clone();
    tokio::task::spawn_blocking(move || {
        if let Err(err) = orchestrator.execute(pending) {
            tracing::warn!(error = %err, "background sync failed");
        }
    });
    DaemonResponse::ok(json!({
        "result": "accepted",
        "sync_id": sync_id,
    }))
}

/// Run a blocking engine call off the async workers and serialize its result.
async fn blocking<T, F>(state: &Arc<DaemonState>, f: F) -> DaemonResponse
where
    T: serde::Serialize,
    F: FnOnce(&SyncOrchestrator) -> Result<T, SyncError> + Send + 'static,
    T: Send + 'static,
{
    let orchestrator = state.orchestrator.clone();
    match tokio::task::spawn_blocking(move || f(&orchestrator)).await {
        Ok(result) => to_response(result),
        Err(err) => DaemonResponse::error(format!("task join error: {err}")),
    }
}

fn to_response<T: serde::Serialize>(result: Result<T, SyncError>) -> DaemonResponse {
    match result.map(|value| serde_json::to_value(value)) {
        Ok(Ok(value)) => DaemonResponse::ok(value),
        Ok(Err(err)) => DaemonResponse::error(format!("encode error: {err}")),
        Err(err) => DaemonResponse::error(err.to_string()),
    }
}

/// No token configured means manual syncs are open to anyone who can reach
/// the socket (which is 0600).
fn manual_token_ok(config: &Config, presented: Option<&str>) -> bool {
    match config.manual_trigger.token.as_deref().filter(|t| !t.is_empty()) {
        None => true,
        Some(expected) => presented
            .map(|p| bool::from(p.as_bytes().ct_eq(expected.as_bytes())))
            .unwrap_or(false),
    }
}

async fn build_status_payload(state: &Arc<DaemonState>) -> Value {
    let orchestrator = state.orchestrator.clone();
    let last_sync = tokio::task::spawn_blocking(move || orchestrator.history().list(Some(1)))
        .await
        .ok()
        .and_then(Result::ok)
        .and_then(|mut entries| entries.pop());

    json!({
        "running": true,
        "started_at": state.started_at,
        "started_at_unix": unix_seconds(state.started_at),
        "busy": state.orchestrator.is_busy(),
        "stage": state.orchestrator.current_stage(),
        "last_sync": last_sync,
        "restart": state.restart.status(),
        "branch": state.config.repository.branch,
        "mode": state.config.sync.mode,
        "target_dir": state.config.target_dir.display().to_string(),
        "socket": socket_path(&state.config.state_dir()).display().to_string(),
    })
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "daemon socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

fn ensure_runtime_dirs(state_dir: &Path) -> Result<(), DaemonError> {
    for dir in [run_dir(state_dir), logs_dir(state_dir)] {
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        }
    }
    Ok(())
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(response)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))?;
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

fn unix_seconds(at: DateTime<Utc>) -> u64 {
    SystemTime::from(at)
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Install the global subscriber. `TETHER_LOG_FORMAT=json` switches to JSON
/// lines; `RUST_LOG` filters (default `info`).
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("TETHER_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json {
        let _ = fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .try_init();
    } else {
        let _ = fmt().with_env_filter(filter).with_target(false).try_init();
    }
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}
