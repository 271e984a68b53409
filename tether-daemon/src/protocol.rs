use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::thread::sleep;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{io_err, DaemonError};
use crate::paths::socket_path;

/// JSON newline-delimited request, tagged by `cmd`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum DaemonRequest {
    Health,
    Status,
    Config,
    Sync {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    /// A webhook delivery forwarded verbatim; `body` is the raw request body.
    Webhook {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
        body: String,
    },
    History {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<usize>,
    },
    Stats,
    ClearHistory,
    Backups,
    Rollback {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        backup: Option<String>,
    },
    ProtectBackup {
        name: String,
    },
    UnprotectBackup {
        name: String,
    },
    DeleteBackup {
        name: String,
    },
    ScheduleRestart {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delay_secs: Option<u64>,
    },
    CancelRestart,
    RestartStatus,
    Stop,
}

impl DaemonRequest {
    /// Wire name of the command, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            DaemonRequest::Health => "health",
            DaemonRequest::Status => "status",
            DaemonRequest::Config => "config",
            DaemonRequest::Sync { .. } => "sync",
            DaemonRequest::Webhook { .. } => "webhook",
            DaemonRequest::History { .. } => "history",
            DaemonRequest::Stats => "stats",
            DaemonRequest::ClearHistory => "clear_history",
            DaemonRequest::Backups => "backups",
            DaemonRequest::Rollback { .. } => "rollback",
            DaemonRequest::ProtectBackup { .. } => "protect_backup",
            DaemonRequest::UnprotectBackup { .. } => "unprotect_backup",
            DaemonRequest::DeleteBackup { .. } => "delete_backup",
            DaemonRequest::ScheduleRestart { .. } => "schedule_restart",
            DaemonRequest::CancelRestart => "cancel_restart",
            DaemonRequest::RestartStatus => "restart_status",
            DaemonRequest::Stop => "stop",
        }
    }
}

/// JSON newline-delimited response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DaemonResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Send one JSON request to the daemon socket under `state` and return one
/// response.
pub fn send_request(state: &Path, request: &DaemonRequest) -> Result<DaemonResponse, DaemonError> {
    let socket = socket_path(state);
    if !socket.exists() {
        return Err(DaemonError::DaemonNotRunning { socket });
    }

    let mut stream = UnixStream::connect(&socket).map_err(|err| {
        if matches!(
            err.kind(),
            std::io::ErrorKind::NotFound
                | std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
        ) {
            DaemonError::DaemonNotRunning {
                socket: socket.clone(),
            }
        } else {
            io_err(&socket, err)
        }
    })?;

    let payload = serde_json::to_string(request)?;
    stream
        .write_all(payload.as_bytes())
        .map_err(|e| io_err(&socket, e))?;
    stream.write_all(b"\n").map_err(|e| io_err(&socket, e))?;
    stream.flush().map_err(|e| io_err(&socket, e))?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    let read = reader
        .read_line(&mut line)
        .map_err(|e| io_err(&socket, e))?;
    if read == 0 {
        return Err(DaemonError::Protocol(
            "daemon closed connection before responding".to_string(),
        ));
    }

    let response: DaemonResponse = serde_json::from_str(line.trim_end())?;
    Ok(response)
}

/// Send `request` and unwrap the response payload.
pub fn request(state: &Path, request: &DaemonRequest) -> Result<Value, DaemonError> {
    response_into_data(send_request(state, request)?)
}

/// `status`, retried briefly while the daemon is still binding its socket.
pub fn request_status(state: &Path) -> Result<Value, DaemonError> {
    let mut last_not_running: Option<DaemonError> = None;
    for attempt in 0..5 {
        match send_request(state, &DaemonRequest::Status) {
            Ok(response) => return response_into_data(response),
            Err(err @ DaemonError::DaemonNotRunning { .. }) => {
                last_not_running = Some(err);
                if attempt < 4 {
                    sleep(Duration::from_millis(100));
                    continue;
                }
            }
            Err(err) => return Err(err),
        }
    }

    Err(last_not_running.unwrap_or_else(|| {
        DaemonError::Protocol("daemon status retry loop exited unexpectedly".to_string())
    }))
}

pub fn request_stop(state: &Path) -> Result<(), DaemonError> {
    request(state, &DaemonRequest::Stop).map(|_| ())
}

pub fn response_into_data(response: DaemonResponse) -> Result<Value, DaemonError> {
    if response.ok {
        Ok(response.data.unwrap_or(Value::Null))
    } else {
        Err(DaemonError::Protocol(
            response
                .error
                .unwrap_or_else(|| "unknown daemon error".to_string()),
        ))
    }
}
