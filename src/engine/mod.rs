mod availability;
mod compact;
mod conflict;
mod error;
mod mutations;
mod queries;
mod store;
mod transition;
#[cfg(test)]
mod tests;

pub use availability::{device_qualifies, find_available};
pub use error::{EngineError, ErrorKind};
pub use transition::{
    check_transition, device_effect, notification_kind, paired_device_status, restored_status,
};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashSet;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock, RwLockReadGuard};
use ulid::Ulid;

use crate::clock::Clock;
use crate::model::*;
use crate::notify::{Notification, NotifyQueue};
use crate::policy::BookingPolicy;
use crate::wal::Wal;

use store::Store;

pub type SharedDeviceState = Arc<RwLock<DeviceState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit:
/// block for the first append, drain whatever else is already queued, then
/// one fsync for the lot and answer every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        for (_, tx) in batch {
            let r = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            let _ = tx.send(r);
        }

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even on append error so partially buffered bytes don't leak into
    // the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let _ = response.send(wal.compact(&events));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// Collaborators handed to the engine at construction.
#[derive(Clone)]
pub struct EngineDeps {
    pub clock: Arc<dyn Clock>,
    pub notify: NotifyQueue,
    pub policy: BookingPolicy,
    /// Recipient of overdue and maintenance alerts.
    pub admin_email: String,
}

/// Reservation & availability engine. All state lives in memory behind
/// per-device locks and is rebuilt from the journal on start.
pub struct Engine {
    pub(super) store: Store,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) notify: NotifyQueue,
    pub(super) policy: BookingPolicy,
    pub(super) admin_email: String,
    /// Held shared by every mutation and exclusively by compaction, so a
    /// snapshot never misses a record appended while it was taken.
    pub(super) commit_gate: RwLock<()>,
    /// Serialises device registration (serial-number uniqueness).
    pub(super) registry_lock: tokio::sync::Mutex<()>,
    /// Reservations that already received a return reminder.
    pub(super) reminded: DashSet<Ulid>,
}

impl Engine {
    /// Replay the journal at `wal_path` and start the writer task. Must be
    /// called inside a tokio runtime.
    pub fn new(wal_path: PathBuf, deps: EngineDeps) -> io::Result<Self> {
        let replay = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            store: Store::new(),
            wal_tx,
            clock: deps.clock,
            notify: deps.notify,
            policy: deps.policy,
            admin_email: deps.admin_email,
            commit_gate: RwLock::new(()),
            registry_lock: tokio::sync::Mutex::new(()),
            reminded: DashSet::new(),
        };
        for event in &replay.events {
            engine.store.replay(event);
        }
        tracing::info!(
            "journal {} replayed: {} events, {} devices",
            wal_path.display(),
            replay.events.len(),
            engine.store.device_count()
        );
        Ok(engine)
    }

    pub fn policy(&self) -> &BookingPolicy {
        &self.policy
    }

    pub fn now_ms(&self) -> Ms {
        self.clock.now_ms()
    }

    pub(crate) fn admin_email(&self) -> &str {
        &self.admin_email
    }

    pub(crate) fn enqueue(&self, notification: Notification) {
        self.notify.send(notification);
    }

    /// Record that a return reminder went out. `false` if one already had.
    pub(crate) fn mark_reminded(&self, reservation_id: Ulid) -> bool {
        self.reminded.insert(reservation_id)
    }

    /// Shared commit permit. Take it before any device lock.
    pub(super) async fn begin_commit(&self) -> RwLockReadGuard<'_, ()> {
        self.commit_gate.read().await
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append then apply to the locked device.
    pub(super) async fn persist_and_apply(
        &self,
        ds: &mut DeviceState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.store.apply_to_device(ds, event);
        Ok(())
    }

    pub(super) fn get_device_state(&self, id: &Ulid) -> Option<SharedDeviceState> {
        self.store.device(id)
    }

    /// Lookup reservation → device, acquire the device write lock.
    pub(super) async fn resolve_reservation_write(
        &self,
        reservation_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<DeviceState>, EngineError> {
        let device_id = self
            .store
            .device_for_reservation(reservation_id)
            .ok_or(EngineError::NotFound(*reservation_id))?;
        let ds = self
            .get_device_state(&device_id)
            .ok_or(EngineError::NotFound(device_id))?;
        Ok(ds.write_owned().await)
    }

    /// Whether `date` (lab-local) is closed for bookings.
    pub fn is_blocked(&self, date: chrono::NaiveDate) -> bool {
        self.store.is_blocked(&date)
    }

    /// Run the booking-window rules against the current clock.
    pub(super) fn validate_window(&self, span: &Span) -> Result<(), EngineError> {
        self.policy
            .validate(span, self.clock.now_ms(), |d| self.store.is_blocked(&d))
    }
}
