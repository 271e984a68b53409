use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

use assert_cmd::prelude::*;
use predicates::prelude::*;
use predicates::str::contains;
use tempfile::TempDir;

use tether_core::{paths, Config, NewSyncEntry, SyncType};
use tether_sync::{BackupStore, HistoryStore};

struct Fixture {
    root: TempDir,
    config: Config,
}

impl Fixture {
    fn new() -> Self {
        let root = TempDir::new().expect("root");
        let target = root.path().join("target");
        fs::create_dir_all(&target).expect("target");
        let mut config = Config::new("file:///nonexistent/tether-test.git", &target);
        config.state_dir = Some(root.path().join("state"));
        config.repository.token = Some("ghp_cli_secret".to_string());
        tether_core::config::save_at(&root.path().join("config.yaml"), &config).expect("save");
        Fixture { root, config }
    }

    fn config_path(&self) -> PathBuf {
        self.root.path().join("config.yaml")
    }

    fn target(&self) -> PathBuf {
        self.config.target_dir.clone()
    }

    fn cmd(&self) -> Command {
        let mut cmd = Command::cargo_bin("tether").expect("tether binary");
        cmd.env("HOME", self.root.path())
            .env_remove("TETHER_REPO_TOKEN")
            .env_remove("TETHER_WEBHOOK_SECRET")
            .env_remove("TETHER_MANUAL_TOKEN")
            .env_remove("TETHER_REPO_BRANCH")
            .arg("--config")
            .arg(self.config_path());
        cmd
    }

    fn history(&self) -> HistoryStore {
        HistoryStore::new(paths::history_path(&self.config.state_dir()), 100)
    }

    fn backups(&self) -> BackupStore {
        BackupStore::new(self.config.backup_dir())
    }
}

#[test]
fn missing_config_is_reported() {
    let fixture = Fixture::new();
    Command::cargo_bin("tether")
        .expect("tether binary")
        .env("HOME", fixture.root.path())
        .args(["--config"])
        .arg(fixture.root.path().join("nope.yaml"))
        .arg("history")
        .assert()
        .failure()
        .stderr(contains("failed to load config"));
}

#[test]
fn empty_history_says_so() {
    let fixture = Fixture::new();
    fixture
        .cmd()
        .arg("history")
        .assert()
        .success()
        .stdout(contains("No syncs recorded."));
}

#[test]
fn history_json_and_stats_reflect_the_ledger() {
    let fixture = Fixture::new();
    fixture
        .history()
        .add(NewSyncEntry {
            sync_type: SyncType::Webhook,
            branch: "main".to_string(),
            commits: 3,
            message: Some("tune lights".to_string()),
        })
        .expect("seed");

    fixture
        .cmd()
        .args(["history", "--json"])
        .assert()
        .success()
        .stdout(contains("\"status\": \"in_progress\"").and(contains("tune lights")));

    fixture
        .cmd()
        .arg("stats")
        .assert()
        .success()
        .stdout(contains("1").and(contains("running")));

    fixture
        .cmd()
        .args(["history", "--clear"])
        .assert()
        .success();
    assert!(fixture.history().list(None).expect("list").is_empty());
}

#[test]
fn protected_backup_cannot_be_deleted_offline() {
    let fixture = Fixture::new();
    fs::write(fixture.target().join("configuration.yaml"), "a: 1\n").expect("seed");
    let backup = fixture.backups().create(&fixture.target()).expect("backup");
    let name = backup.name.to_string();

    fixture
        .cmd()
        .args(["backup", "list"])
        .assert()
        .success()
        .stdout(contains(name.as_str()));

    fixture
        .cmd()
        .args(["backup", "protect", &name])
        .assert()
        .success();

    fixture
        .cmd()
        .args(["backup", "delete", &name])
        .assert()
        .failure()
        .stderr(contains("failed to delete"));

    fixture
        .cmd()
        .args(["backup", "list", "--json"])
        .assert()
        .success()
        .stdout(contains("\"protected\": true"));

    fixture
        .cmd()
        .args(["backup", "unprotect", &name])
        .assert()
        .success();
    fixture
        .cmd()
        .args(["backup", "delete", &name])
        .assert()
        .success();
    assert!(fixture.backups().list().expect("list").is_empty());
}

#[test]
fn offline_rollback_restores_newest_backup() {
    let fixture = Fixture::new();
    let file = fixture.target().join("configuration.yaml");
    fs::write(&file, "version: 1\n").expect("seed");
    fixture.backups().create(&fixture.target()).expect("backup");
    fs::write(&file, "version: 2\n").expect("edit");

    fixture
        .cmd()
        .args(["backup", "rollback"])
        .assert()
        .success()
        .stdout(contains("restored backup-"));

    assert_eq!(fs::read_to_string(&file).expect("read"), "version: 1\n");
    assert_eq!(fixture.backups().list().expect("list").len(), 2);
}

#[test]
fn local_sync_with_unreachable_repo_fails_and_is_recorded() {
    let fixture = Fixture::new();
    let file = fixture.target().join("configuration.yaml");
    fs::write(&file, "keep: me\n").expect("seed");

    fixture
        .cmd()
        .args(["sync", "--local"])
        .assert()
        .failure()
        .stderr(contains("sync failed"));

    assert_eq!(fs::read_to_string(&file).expect("read"), "keep: me\n");
    let entries = fixture.history().list(None).expect("history");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status.to_string(), "failed");
}

#[test]
fn daemon_commands_without_daemon() {
    let fixture = Fixture::new();

    fixture
        .cmd()
        .args(["daemon", "status"])
        .assert()
        .success()
        .stdout(contains("\"running\": false"));

    fixture
        .cmd()
        .args(["daemon", "stop"])
        .assert()
        .success()
        .stdout(contains("daemon is not running"));

    fixture
        .cmd()
        .args(["restart", "status"])
        .assert()
        .failure()
        .stderr(contains("daemon is not running"));

    fixture
        .cmd()
        .arg("sync")
        .assert()
        .failure()
        .stderr(contains("daemon is not running"));
}

#[test]
fn config_show_masks_secrets() {
    let fixture = Fixture::new();
    fixture
        .cmd()
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(contains("***").and(contains("ghp_cli_secret").not()));
}

// ---------------------------------------------------------------------------
// Real daemon process
// ---------------------------------------------------------------------------

struct DaemonProcess {
    child: Child,
}

impl DaemonProcess {
    fn start(fixture: &Fixture) -> Self {
        let child = fixture
            .cmd()
            .args(["daemon", "start"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn daemon");
        DaemonProcess { child }
    }

    fn wait_ready(fixture: &Fixture) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if fixture.cmd().arg("health").output().expect("health").status.success() {
                return;
            }
            sleep(Duration::from_millis(50));
        }
        panic!("daemon did not become healthy");
    }

    fn wait_exit(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if matches!(self.child.try_wait(), Ok(Some(_))) {
                return true;
            }
            sleep(Duration::from_millis(50));
        }
        false
    }
}

impl Drop for DaemonProcess {
    fn drop(&mut self) {
        if matches!(self.child.try_wait(), Ok(None)) {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

fn socket_exists(state: &Path) -> bool {
    tether_daemon::paths::socket_path(state).exists()
}

#[test]
fn daemon_lifecycle_over_socket() {
    let fixture = Fixture::new();
    let mut daemon = DaemonProcess::start(&fixture);
    DaemonProcess::wait_ready(&fixture);

    fixture
        .cmd()
        .args(["daemon", "status"])
        .assert()
        .success()
        .stdout(contains("\"running\": true").and(contains("\"busy\": false")));

    fixture
        .cmd()
        .args(["restart", "schedule", "--delay", "600"])
        .assert()
        .success()
        .stdout(contains("auto-restart is disabled"));

    fixture
        .cmd()
        .args(["daemon", "stop"])
        .assert()
        .success()
        .stdout(contains("daemon stop requested"));

    assert!(daemon.wait_exit(Duration::from_secs(10)), "daemon did not exit");
    assert!(!socket_exists(&fixture.config.state_dir()));
}
