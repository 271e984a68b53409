//! Daemon request handling end to end: webhook intake through the pipeline,
//! plus one real socket round trip.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use tempfile::TempDir;
use tokio::sync::broadcast;

use tether_core::{Config, NewSyncEntry, SyncType};
use tether_daemon::{
    dispatch, request, request_status, request_stop, serve, DaemonRequest, DaemonResponse,
    DaemonState, NoopRestarter, UNAUTHORIZED,
};
use tether_sync::{CloneRequest, MemoryNotifier, RepoCloner};

const SECRET: &str = "daemon-secret";

/// Serves a fixed tree; `hold` parks the clone until released.
#[derive(Default)]
struct GatedRemote {
    files: Mutex<BTreeMap<String, String>>,
    hold: AtomicBool,
}

impl GatedRemote {
    fn publish(&self, files: &[(&str, &str)]) {
        let mut tree = self.files.lock().unwrap();
        tree.clear();
        for (relative, content) in files {
            tree.insert(relative.to_string(), content.to_string());
        }
    }
}

impl RepoCloner for GatedRemote {
    fn clone_branch(&self, request: &CloneRequest<'_>) -> Result<(), String> {
        while self.hold.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(10));
        }
        for (relative, content) in self.files.lock().unwrap().iter() {
            let path = request.dest.join(relative);
            fs::create_dir_all(path.parent().unwrap()).map_err(|e| e.to_string())?;
            fs::write(path, content).map_err(|e| e.to_string())?;
        }
        Ok(())
    }
}

struct Daemon {
    root: TempDir,
    remote: Arc<GatedRemote>,
    notifier: Arc<MemoryNotifier>,
    state: Arc<DaemonState>,
}

impl Daemon {
    fn start(configure: impl FnOnce(&mut Config)) -> Self {
        let root = TempDir::new().expect("root");
        let mut config = Config::new("https://example.test/cfg.git", root.path().join("target"));
        config.state_dir = Some(root.path().join("state"));
        config.webhook.secret = Some(SECRET.to_string());
        config.sync.required_files = vec!["app.toml".to_string()];
        configure(&mut config);
        fs::create_dir_all(&config.target_dir).expect("target");

        let remote = Arc::new(GatedRemote::default());
        remote.publish(&[("app.toml", "port = 8080\n")]);
        let notifier = Arc::new(MemoryNotifier::default());
        let (shutdown, _) = broadcast::channel(4);
        let state = DaemonState::new(
            config,
            remote.clone(),
            notifier.clone(),
            Arc::new(NoopRestarter),
            shutdown,
        );
        Daemon {
            root,
            remote,
            notifier,
            state: Arc::new(state),
        }
    }

    fn target(&self) -> PathBuf {
        self.root.path().join("target")
    }

    fn state_dir(&self) -> PathBuf {
        self.root.path().join("state")
    }

    async fn send(&self, request: DaemonRequest) -> DaemonResponse {
        dispatch(&self.state, request).await
    }

    async fn webhook(&self, branch: &str, signature: Option<String>) -> DaemonResponse {
        let body = push_body(branch);
        let signature = signature.or_else(|| Some(sign(&body)));
        self.send(DaemonRequest::Webhook {
            event: Some("push".to_string()),
            signature,
            body,
        })
        .await
    }

    /// Poll the ledger until the newest entry has finished.
    async fn wait_for_finished(&self) -> Value {
        for _ in 0..250 {
            let response = self.send(DaemonRequest::History { limit: Some(1) }).await;
            let entry = response.data.unwrap_or(Value::Null)[0].clone();
            if !self.state.orchestrator().is_busy()
                && entry["status"].as_str().is_some_and(|s| s != "in_progress")
            {
                return entry;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("sync did not finish");
    }
}

fn push_body(branch: &str) -> String {
    json!({
        "ref": format!("refs/heads/{branch}"),
        "after": "c0ffee",
        "commits": [{ "id": "c0ffee" }],
        "head_commit": { "message": "bump port\n\nlonger description" },
    })
    .to_string()
}

fn sign(body: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(SECRET.as_bytes()).expect("hmac key");
    mac.update(body.as_bytes());
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

fn read(path: &Path) -> String {
    fs::read_to_string(path).expect("read")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn signed_push_is_accepted_and_applied() {
    let daemon = Daemon::start(|_| {});

    let response = daemon.webhook("main", None).await;
    assert!(response.ok, "{response:?}");
    let data = response.data.expect("data");
    assert_eq!(data["result"], "accepted");
    let sync_id = data["sync_id"].as_str().expect("sync id").to_string();

    let entry = daemon.wait_for_finished().await;
    assert_eq!(entry["id"], sync_id.as_str());
    assert_eq!(entry["status"], "success");
    assert_eq!(entry["type"], "webhook");
    assert_eq!(entry["message"], "bump port");
    assert_eq!(entry["commits"], 1);
    assert_eq!(read(&daemon.target().join("app.toml")), "port = 8080\n");

    let titles: Vec<String> = daemon
        .notifier
        .sent()
        .into_iter()
        .map(|n| n.title)
        .collect();
    assert!(titles.iter().any(|t| t == "tether: sync succeeded"), "{titles:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bad_or_missing_signature_is_unauthorized() {
    let daemon = Daemon::start(|_| {});

    let response = daemon
        .webhook("main", Some("sha256=0000".to_string()))
        .await;
    assert_eq!(response.error.as_deref(), Some(UNAUTHORIZED));

    let response = daemon
        .send(DaemonRequest::Webhook {
            event: Some("push".to_string()),
            signature: None,
            body: push_body("main"),
        })
        .await;
    assert_eq!(response.error.as_deref(), Some(UNAUTHORIZED));

    let history = daemon.send(DaemonRequest::History { limit: None }).await;
    assert_eq!(history.data, Some(json!([])));
    assert!(!daemon.target().join("app.toml").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn push_to_other_branch_is_ignored() {
    let daemon = Daemon::start(|_| {});

    let response = daemon.webhook("feature/x", None).await;
    assert!(response.ok);
    assert_eq!(response.data.expect("data")["result"], "ignored");
    assert!(!daemon.state.orchestrator().is_busy());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_trigger_while_running_is_rejected() {
    let daemon = Daemon::start(|_| {});
    daemon.remote.hold.store(true, Ordering::SeqCst);

    let first = daemon.webhook("main", None).await;
    assert!(first.ok, "{first:?}");

    let second = daemon.send(DaemonRequest::Sync { token: None }).await;
    assert!(!second.ok);
    assert_eq!(second.error.as_deref(), Some("a sync is already in progress"));

    let status = daemon.send(DaemonRequest::Status).await.data.expect("status");
    assert_eq!(status["busy"], true);

    daemon.remote.hold.store(false, Ordering::SeqCst);
    let entry = daemon.wait_for_finished().await;
    assert_eq!(entry["status"], "success");

    let history = daemon.send(DaemonRequest::History { limit: None }).await;
    assert_eq!(history.data.expect("history").as_array().map(Vec::len), Some(1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn manual_sync_requires_configured_token() {
    let daemon = Daemon::start(|config| {
        config.manual_trigger.token = Some("operator".to_string());
    });

    let denied = daemon
        .send(DaemonRequest::Sync {
            token: Some("guess".to_string()),
        })
        .await;
    assert_eq!(denied.error.as_deref(), Some(UNAUTHORIZED));

    let accepted = daemon
        .send(DaemonRequest::Sync {
            token: Some("operator".to_string()),
        })
        .await;
    assert!(accepted.ok, "{accepted:?}");
    let entry = daemon.wait_for_finished().await;
    assert_eq!(entry["type"], "manual");
    assert_eq!(entry["message"], "manual sync");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn backups_and_rollback_over_dispatch() {
    let daemon = Daemon::start(|_| {});
    fs::write(daemon.target().join("app.toml"), "port = 1\n").expect("seed");

    assert!(daemon.webhook("main", None).await.ok);
    daemon.wait_for_finished().await;
    assert_eq!(read(&daemon.target().join("app.toml")), "port = 8080\n");

    let backups = daemon.send(DaemonRequest::Backups).await.data.expect("backups");
    let name = backups[0]["name"].as_str().expect("name").to_string();

    let protect = daemon
        .send(DaemonRequest::ProtectBackup { name: name.clone() })
        .await;
    assert!(protect.ok, "{protect:?}");
    let delete = daemon
        .send(DaemonRequest::DeleteBackup { name: name.clone() })
        .await;
    assert!(!delete.ok);

    let rollback = daemon
        .send(DaemonRequest::Rollback {
            backup: Some(name.clone()),
        })
        .await;
    assert!(rollback.ok, "{rollback:?}");
    assert_eq!(rollback.data.expect("report")["restored"], name.as_str());
    assert_eq!(read(&daemon.target().join("app.toml")), "port = 1\n");

    let missing = daemon
        .send(DaemonRequest::Rollback {
            backup: Some("backup-nope.tar.gz".to_string()),
        })
        .await;
    assert!(!missing.ok);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restart_requests_follow_the_scheduler() {
    let daemon = Daemon::start(|config| config.restart.enabled = true);

    let scheduled = daemon
        .send(DaemonRequest::ScheduleRestart {
            delay_secs: Some(3600),
        })
        .await
        .data
        .expect("schedule");
    assert_eq!(scheduled["scheduled"], true);

    let status = daemon.send(DaemonRequest::RestartStatus).await.data.expect("status");
    assert_eq!(status["scheduled"], true);

    let cancelled = daemon.send(DaemonRequest::CancelRestart).await.data.expect("cancel");
    assert_eq!(cancelled["cancelled"], true);
    let status = daemon.send(DaemonRequest::RestartStatus).await.data.expect("status");
    assert_eq!(status["scheduled"], false);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn config_request_redacts_secrets() {
    let daemon = Daemon::start(|config| {
        config.repository.token = Some("ghp_secret".to_string());
    });
    let config = daemon.send(DaemonRequest::Config).await.data.expect("config");
    let text = config.to_string();
    assert!(!text.contains("ghp_secret"));
    assert!(!text.contains(SECRET));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn socket_round_trip_and_interrupted_recovery() {
    let daemon = Daemon::start(|_| {});
    let stale = daemon
        .state
        .orchestrator()
        .history()
        .add(NewSyncEntry {
            sync_type: SyncType::Webhook,
            branch: "main".to_string(),
            commits: 1,
            message: None,
        })
        .expect("seed entry");

    let server = tokio::spawn(serve(daemon.state.clone()));
    let state_dir = daemon.state_dir();

    let status = tokio::task::spawn_blocking({
        let state_dir = state_dir.clone();
        move || {
            // The socket may take a moment to appear.
            for _ in 0..50 {
                if let Ok(status) = request_status(&state_dir) {
                    return Some(status);
                }
                std::thread::sleep(Duration::from_millis(20));
            }
            None
        }
    })
    .await
    .expect("join")
    .expect("daemon answered");
    assert_eq!(status["running"], true);
    assert_eq!(status["last_sync"]["id"], stale.id.as_str());
    assert_eq!(status["last_sync"]["status"], "failed");
    assert_eq!(status["last_sync"]["error"], "interrupted");

    let health = tokio::task::spawn_blocking({
        let state_dir = state_dir.clone();
        move || request(&state_dir, &DaemonRequest::Health)
    })
    .await
    .expect("join")
    .expect("health");
    assert_eq!(health["status"], "ok");

    tokio::task::spawn_blocking(move || request_stop(&state_dir))
        .await
        .expect("join")
        .expect("stop");
    tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("server exits")
        .expect("join")
        .expect("clean shutdown");
}
