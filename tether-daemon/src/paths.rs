use std::path::{Path, PathBuf};

pub const DAEMON_SOCKET: &str = "daemon.sock";
pub const DAEMON_LOG: &str = "daemon.log";

pub fn run_dir(state: &Path) -> PathBuf {
    state.join("run")
}

pub fn socket_path(state: &Path) -> PathBuf {
    run_dir(state).join(DAEMON_SOCKET)
}

pub fn logs_dir(state: &Path) -> PathBuf {
    state.join("logs")
}

pub fn log_path(state: &Path) -> PathBuf {
    logs_dir(state).join(DAEMON_LOG)
}
