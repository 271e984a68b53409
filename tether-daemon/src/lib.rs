//! Long-running tether daemon: socket server, webhook intake, restart timer.

mod error;
pub mod notify;
pub mod paths;
pub mod protocol;
pub mod restart;
mod runtime;
pub mod service;

pub use error::DaemonError;
pub use notify::{notifier_for, HttpNotifier};
pub use protocol::{
    request, request_status, request_stop, response_into_data, send_request, DaemonRequest,
    DaemonResponse,
};
pub use restart::{CancelOutcome, RestartScheduler, RestartStatus, ScheduleOutcome};
pub use runtime::{
    dispatch, init_tracing, run, serve, start_blocking, DaemonState, INTERRUPTED, UNAUTHORIZED,
};
pub use service::{restarter_for, CommandRestarter, HttpRestarter, NoopRestarter, ServiceRestarter};
