//! Config load error messages, atomic-write safety, and layered loading.

use assert_fs::prelude::*;
use predicates::prelude::predicate;
use rstest::rstest;
use std::fs;
use tether_core::{
    config::{self, Config},
    paths, ApplyMode, ConfigError,
};

fn sample() -> Config {
    Config::new("https://github.com/acme/ha-config.git", "/srv/config")
}

// ---------------------------------------------------------------------------
// 1. Load error messages
// ---------------------------------------------------------------------------

#[test]
fn load_missing_config_returns_not_found() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let err = config::load_at(&paths::config_path(home.path())).unwrap_err();
    assert!(matches!(err, ConfigError::NotFound { .. }), "got: {err}");
    assert!(err.to_string().contains("config not found"));
    assert!(err.to_string().contains("config.yaml"));
}

#[test]
fn load_corrupt_yaml_returns_parse_error_with_path() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    home.child(".tether/config.yaml")
        .write_str(": : corrupt : yaml : !!!\n  - broken: [unclosed")
        .expect("write");

    let err = config::load_at(&paths::config_path(home.path())).unwrap_err();
    assert!(matches!(err, ConfigError::Parse { .. }), "got: {err}");
    assert!(err.to_string().contains("config.yaml"));
}

#[test]
fn load_without_target_dir_is_a_parse_error() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    home.child(".tether/config.yaml")
        .write_str("repository:\n  url: https://example.test/r.git\n")
        .expect("write");

    let err = config::load_at(&paths::config_path(home.path())).unwrap_err();
    assert!(matches!(err, ConfigError::Parse { .. }), "got: {err}");
}

// ---------------------------------------------------------------------------
// 2. Atomic write safety
// ---------------------------------------------------------------------------

#[test]
fn save_writes_private_file_and_no_tmp() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let path = paths::config_path(home.path());
    config::save_at(&path, &sample()).expect("save");

    home.child(".tether/config.yaml")
        .assert(predicate::path::exists());
    home.child(".tether/config.yaml.tmp")
        .assert(predicate::path::missing());

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(&path).expect("meta").permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "expected 0600, got {mode:o}");
    }
}

#[test]
fn mid_write_crash_leaves_original_intact() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let path = paths::config_path(home.path());
    config::save_at(&path, &sample()).expect("save");
    let original = fs::read(&path).expect("read original");

    // Simulate crash: .tmp written but process died before rename
    fs::write(path.with_extension("yaml.tmp"), b"CRASH - INCOMPLETE WRITE").expect("tmp");

    assert_eq!(fs::read(&path).expect("read"), original);
    let loaded = config::load_at(&path).expect("load after crash");
    assert_eq!(loaded.repository.url, sample().repository.url);
}

// ---------------------------------------------------------------------------
// 3. Layered loading
// ---------------------------------------------------------------------------

#[test]
fn load_from_home_applies_env_and_validates() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    config::save_at(&paths::config_path(home.path()), &sample()).expect("save");

    let loaded = config::load_from_home_at(home.path(), |key| match key {
        "TETHER_WEBHOOK_SECRET" => Some("from-env".to_string()),
        _ => None,
    })
    .expect("load");
    assert_eq!(loaded.webhook.secret.as_deref(), Some("from-env"));
    assert_eq!(loaded.state_dir(), paths::state_dir(home.path()));
}

#[test]
fn load_from_home_rejects_invalid_deployment() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let mut bad = sample();
    bad.backup.dir = Some(bad.target_dir.clone());
    config::save_at(&paths::config_path(home.path()), &bad).expect("save");

    let err = config::load_from_home_at(home.path(), |_| None).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(_)), "got: {err}");
}

#[rstest]
#[case("overlay", ApplyMode::Overlay)]
#[case("tracked", ApplyMode::Tracked)]
#[case("mirror", ApplyMode::Mirror)]
fn apply_mode_parses(#[case] raw: &str, #[case] expected: ApplyMode) {
    let yaml = format!(
        "repository:\n  url: https://example.test/r.git\ntarget_dir: /srv/config\nsync:\n  mode: {raw}\n"
    );
    let config: Config = serde_yaml::from_str(&yaml).expect("parse");
    assert_eq!(config.sync.mode, expected);
}
