use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::engine::Engine;
use crate::model::{Ms, Reservation, ReservationStatus};
use crate::notify::{Notification, NotificationKind, Payload, Recipient};
use crate::observability;

/// Outcome of one overdue sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Reservations moved to `Overdue`.
    pub marked: Vec<Ulid>,
    /// Requesters newly sanctioned.
    pub sanctioned: Vec<Ulid>,
    /// Reservations whose handling failed; retried on the next sweep.
    pub failed: Vec<Ulid>,
}

/// Mark every `Active` reservation past its end as `Overdue` and sanction the
/// requester. Both land in one journal record, so a reservation returned
/// after collection fails the transition and sanctions no one. Failures stay
/// `Active` and are retried on the next sweep.
pub async fn reconcile_overdue(engine: &Engine) -> SweepReport {
    let started = Instant::now();
    let now = engine.now_ms();
    let mut report = SweepReport::default();

    for r in engine.collect_overdue(now).await {
        mark_one(engine, &r, &mut report).await;
    }

    metrics::histogram!(observability::SWEEP_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    if !report.marked.is_empty() || !report.failed.is_empty() {
        info!(
            "sweep: {} overdue, {} sanctioned, {} failed",
            report.marked.len(),
            report.sanctioned.len(),
            report.failed.len()
        );
    }
    report
}

/// Handle one collected reservation. Its status may have moved on since the
/// sweep read it.
async fn mark_one(engine: &Engine, r: &Reservation, report: &mut SweepReport) {
    match engine.mark_overdue(r.id).await {
        Ok((updated, newly_sanctioned)) => {
            metrics::counter!(observability::OVERDUE_MARKED_TOTAL).increment(1);
            if newly_sanctioned {
                report.sanctioned.push(updated.requester_id);
            }
            notify_overdue(engine, &updated).await;
            report.marked.push(r.id);
        }
        Err(e) => {
            warn!("sweep: marking {} overdue failed: {e}", r.id);
            metrics::counter!(observability::SWEEP_FAILURES_TOTAL).increment(1);
            report.failed.push(r.id);
        }
    }
}

/// The transition already told the requester it is overdue; add the sanction
/// notice and the admin copy.
async fn notify_overdue(engine: &Engine, r: &Reservation) {
    let Some(device) = engine.device_snapshot(&r.device_id).await else {
        return;
    };
    let requester = engine.get_requester(&r.requester_id);
    engine.enqueue(Notification {
        kind: NotificationKind::SanctionNotice,
        recipient: Recipient::requester(r.requester_id, requester.as_ref()),
        payload: Payload::reservation(r, &device, false),
    });
    engine.enqueue(Notification {
        kind: NotificationKind::OverdueAlert,
        recipient: Recipient::admin(engine.admin_email()),
        payload: Payload::reservation(r, &device, false),
    });
}

/// Remind requesters whose loan ends within `lead`. Each reservation is
/// reminded at most once per process. Returns the reservations reminded.
pub async fn send_return_reminders(engine: &Engine, lead: Ms) -> Vec<Ulid> {
    let now = engine.now_ms();
    let mut sent = Vec::new();
    for r in engine.collect_due_soon(now, lead).await {
        if !engine.mark_reminded(r.id) {
            continue;
        }
        let Some(device) = engine.device_snapshot(&r.device_id).await else {
            continue;
        };
        let requester = engine.get_requester(&r.requester_id);
        engine.enqueue(Notification {
            kind: NotificationKind::ReturnReminder,
            recipient: Recipient::requester(r.requester_id, requester.as_ref()),
            payload: Payload::reservation(&r, &device, false),
        });
        sent.push(r.id);
    }
    if !sent.is_empty() {
        debug!("sent {} return reminders", sent.len());
    }
    sent
}

/// Start offset in `[0, period)` so several instances don't sweep in lockstep.
fn start_jitter(period: Duration) -> Duration {
    let millis = period.as_millis().max(1);
    let random = Ulid::new().random();
    Duration::from_millis((random % millis) as u64)
}

/// Background task: overdue sweep and return reminders every `period`.
pub async fn run_reconciler(engine: Arc<Engine>, period: Duration, reminder_lead: Duration) {
    tokio::time::sleep(start_jitter(period)).await;
    let lead = reminder_lead.as_millis() as Ms;
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        reconcile_overdue(&engine).await;
        send_return_reminders(&engine, lead).await;
    }
}

/// Background task: compact the journal once enough records have piled up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        if let Err(e) = engine.compact_wal().await {
            warn!("journal compaction failed after {appends} appends: {e}");
        }
    }
}
