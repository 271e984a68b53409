//! Restart scheduler — a single-slot delayed restart of the managed service.
//!
//! `idle -> scheduled -> (executed | cancelled) -> idle`. A new `schedule`
//! supersedes the pending one. Timers are tokio tasks raced against a
//! cancellation oneshot, so tests can drive them with the paused clock.
//! State is in-memory only.
//!
//! Notifications go out in order on a dedicated thread; a slow webhook never
//! holds up a runtime worker or the caller of `schedule`/`cancel`.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::time::Instant;

use tether_sync::{Attributes, Notifier, RestartHook};

use crate::service::ServiceRestarter;

/// Outcome of a restart once its timer fires.
pub type RestartResult = Result<(), String>;

#[derive(Debug, Serialize)]
pub struct ScheduleOutcome {
    pub scheduled: bool,
    pub executed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fire_at: Option<DateTime<Utc>>,
    /// Resolves with the restart result when the timer fires. Dropped (never
    /// resolved) if the restart is cancelled or superseded.
    #[serde(skip)]
    pub completion: Option<oneshot::Receiver<RestartResult>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CancelOutcome {
    pub cancelled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestartStatus {
    pub scheduled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fire_at: Option<DateTime<Utc>>,
}

struct Pending {
    generation: u64,
    fire_at: Instant,
    fire_at_wall: DateTime<Utc>,
    cancel_tx: oneshot::Sender<()>,
}

struct Slot {
    next_generation: u64,
    pending: Option<Pending>,
}

struct Inner {
    enabled: bool,
    handle: Handle,
    restarter: Arc<dyn ServiceRestarter>,
    outbox: Option<mpsc::Sender<(String, String)>>,
    title_prefix: String,
    slot: Mutex<Slot>,
}

#[derive(Clone)]
pub struct RestartScheduler {
    inner: Arc<Inner>,
}

impl RestartScheduler {
    /// `handle` is the runtime timers are spawned on; `schedule` may then be
    /// called from any thread, including blocking pipeline workers.
    pub fn new(
        enabled: bool,
        handle: Handle,
        restarter: Arc<dyn ServiceRestarter>,
        notifier: Arc<dyn Notifier>,
        title_prefix: impl Into<String>,
    ) -> Self {
        RestartScheduler {
            inner: Arc::new(Inner {
                enabled,
                handle,
                restarter,
                outbox: spawn_outbox(notifier),
                title_prefix: title_prefix.into(),
                slot: Mutex::new(Slot {
                    next_generation: 0,
                    pending: None,
                }),
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled
    }

    /// Arm the restart timer for `delay`, superseding any pending one.
    pub fn schedule(&self, delay: Duration) -> ScheduleOutcome {
        if !self.inner.enabled {
            return ScheduleOutcome {
                scheduled: false,
                executed: false,
                fire_at: None,
                completion: None,
            };
        }

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();
        let fire_at = Instant::now() + delay;
        let fire_at_wall = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());

        let generation = {
            let mut slot = self.lock_slot();
            if let Some(previous) = slot.pending.take() {
                let _ = previous.cancel_tx.send(());
                tracing::info!("superseding pending restart");
            }
            slot.next_generation += 1;
            let generation = slot.next_generation;
            slot.pending = Some(Pending {
                generation,
                fire_at,
                fire_at_wall,
                cancel_tx,
            });
            generation
        };

        let scheduler = self.clone();
        self.inner.handle.spawn(async move {
            tokio::select! {
                _ = cancel_rx => {}
                _ = tokio::time::sleep_until(fire_at) => {
                    scheduler.fire(generation, done_tx).await;
                }
            }
        });

        tracing::info!(delay_secs = delay.as_secs(), "restart scheduled");
        self.notify(
            "restart pending",
            &format!("service restart in {}s", delay.as_secs()),
        );
        ScheduleOutcome {
            scheduled: true,
            executed: false,
            fire_at: Some(fire_at_wall),
            completion: Some(done_rx),
        }
    }

    /// Disarm the pending restart, if any.
    pub fn cancel(&self) -> CancelOutcome {
        let pending = self.lock_slot().pending.take();
        match pending {
            Some(pending) => {
                let _ = pending.cancel_tx.send(());
                tracing::info!("restart cancelled");
                self.notify("restart cancelled", "pending service restart was cancelled");
                CancelOutcome { cancelled: true }
            }
            None => CancelOutcome { cancelled: false },
        }
    }

    pub fn status(&self) -> RestartStatus {
        let slot = self.lock_slot();
        match &slot.pending {
            Some(pending) => {
                let remaining = pending.fire_at.saturating_duration_since(Instant::now());
                RestartStatus {
                    scheduled: true,
                    remaining_seconds: Some(remaining.as_secs_f64().ceil() as u64),
                    fire_at: Some(pending.fire_at_wall),
                }
            }
            None => RestartStatus {
                scheduled: false,
                remaining_seconds: None,
                fire_at: None,
            },
        }
    }

    async fn fire(&self, generation: u64, done_tx: oneshot::Sender<RestartResult>) {
        {
            let mut slot = self.lock_slot();
            // Cancelled or superseded between the timer firing and this lock.
            if slot.pending.as_ref().map(|p| p.generation) != Some(generation) {
                return;
            }
            slot.pending = None;
        }

        tracing::info!("restarting service");
        let restarter = self.inner.restarter.clone();
        let result = match tokio::task::spawn_blocking(move || restarter.restart_now()).await {
            Ok(result) => result,
            Err(err) => Err(format!("restart task failed: {err}")),
        };
        match &result {
            Ok(()) => {
                tracing::info!("service restarted");
                self.notify("service restarted", "the managed service was restarted");
            }
            Err(err) => {
                tracing::error!(error = %err, "service restart failed");
                self.notify("restart failed", err);
            }
        }
        let _ = done_tx.send(result);
    }

    fn notify(&self, title: &str, message: &str) {
        let Some(outbox) = &self.inner.outbox else {
            return;
        };
        let title = format!("{}: {title}", self.inner.title_prefix);
        if outbox.send((title, message.to_string())).is_err() {
            tracing::warn!("notification thread is gone; dropping notification");
        }
    }

    fn lock_slot(&self) -> std::sync::MutexGuard<'_, Slot> {
        self.inner
            .slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Drains notifications on its own thread until the scheduler is dropped.
fn spawn_outbox(notifier: Arc<dyn Notifier>) -> Option<mpsc::Sender<(String, String)>> {
    let (tx, rx) = mpsc::channel::<(String, String)>();
    let spawned = thread::Builder::new()
        .name("tether-restart-notify".to_string())
        .spawn(move || {
            for (title, message) in rx {
                notifier.send(&title, &message, &Attributes::new());
            }
        });
    match spawned {
        Ok(_) => Some(tx),
        Err(err) => {
            tracing::warn!(error = %err, "restart notifications disabled: no notify thread");
            None
        }
    }
}

impl RestartHook for RestartScheduler {
    fn schedule_restart(&self, delay: Duration) -> bool {
        self.schedule(delay).scheduled
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
