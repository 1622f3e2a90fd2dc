use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use tokio::sync::mpsc;
use tokio_test::{assert_err, assert_ok};
use ulid::Ulid;

use super::*;
use crate::clock::ManualClock;
use crate::limits::*;
use crate::notify::{Notification, NotificationKind, NotifyQueue, Payload};

const H: Ms = HOUR_MS;
const DAY: Ms = 24 * H;
/// Monday 2030-06-03 00:00 UTC.
const MONDAY: Ms = 1_906_675_200_000;

/// `hour:00` UTC on Monday + `day` days.
fn at(day: i64, hour: i64) -> Ms {
    MONDAY + day * DAY + hour * H
}

fn window(day: i64, from: i64, to: i64) -> Span {
    Span::new(at(day, from), at(day, to))
}

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("labres_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

struct Harness {
    engine: Arc<Engine>,
    clock: Arc<ManualClock>,
    rx: mpsc::Receiver<Notification>,
    path: PathBuf,
}

impl Harness {
    fn new(name: &str) -> Self {
        Self::open(test_wal_path(name), 256)
    }

    fn open(path: PathBuf, queue: usize) -> Self {
        // Sunday 2030-06-02 12:00 UTC.
        let clock = Arc::new(ManualClock::new(at(-1, 12)));
        let (notify, rx) = NotifyQueue::channel(queue);
        let deps = EngineDeps {
            clock: clock.clone(),
            notify,
            policy: BookingPolicy::default(),
            admin_email: "admin@lab.test".into(),
        };
        let engine = Arc::new(Engine::new(path.clone(), deps).unwrap());
        Self {
            engine,
            clock,
            rx,
            path,
        }
    }

    async fn device(&self, serial: &str, caps: &[&str]) -> Device {
        self.engine
            .register_device(serial, "Latitude 5440", caps, DeviceStatus::Available)
            .await
            .unwrap()
    }

    async fn reserve(&self, device: &Device, span: Span) -> Reservation {
        self.engine
            .create_single(Ulid::new(), device.id, span, Some("Networks".into()), None)
            .await
            .unwrap()
    }

    fn drain(&mut self) -> Vec<Notification> {
        let mut out = Vec::new();
        while let Ok(n) = self.rx.try_recv() {
            out.push(n);
        }
        out
    }
}

fn kinds(ns: &[Notification]) -> Vec<NotificationKind> {
    ns.iter().map(|n| n.kind).collect()
}

// ── Registration ─────────────────────────────────────────

#[tokio::test]
async fn register_device_normalises_capabilities() {
    let h = Harness::new("register_device.wal");
    let d = h.device(" SN-1 ", &["Python", " python", "", "Docker "]).await;
    assert_eq!(d.serial_number, "SN-1");
    assert_eq!(d.capabilities, vec!["Python".to_string(), "Docker".to_string()]);
    assert_eq!(h.engine.get_device(&d.id).await.unwrap(), d);
}

#[tokio::test]
async fn duplicate_serial_rejected_case_insensitively() {
    let h = Harness::new("duplicate_serial.wal");
    h.device("sn-42", &[]).await;
    let result = h
        .engine
        .register_device("SN-42", "Other", &[], DeviceStatus::Available)
        .await;
    assert!(matches!(result, Err(EngineError::AlreadyExists(_))));
    assert_eq!(h.engine.list_devices().await.len(), 1);
}

#[tokio::test]
async fn register_device_limits() {
    let h = Harness::new("register_limits.wal");
    let e = &h.engine;
    assert!(matches!(
        e.register_device("  ", "m", &[], DeviceStatus::Available).await,
        Err(EngineError::Validation(_))
    ));
    let long = "x".repeat(MAX_SERIAL_LEN + 1);
    assert!(matches!(
        e.register_device(&long, "m", &[], DeviceStatus::Available).await,
        Err(EngineError::LimitExceeded(_))
    ));
}

#[tokio::test]
async fn requester_registration_keeps_sanction() {
    let h = Harness::new("requester_upsert.wal");
    let id = Ulid::new();
    assert!(assert_ok!(h.engine.sanction_requester(id).await));
    assert!(!assert_ok!(h.engine.sanction_requester(id).await));

    let r = h
        .engine
        .register_requester(id, Some("Ana Lima".into()), Some("ana@uni.test".into()))
        .await
        .unwrap();
    assert!(r.sanctioned);
    assert_eq!(h.engine.get_requester(&id).unwrap().full_name.as_deref(), Some("Ana Lima"));
}

#[tokio::test]
async fn block_and_unblock_date() {
    let h = Harness::new("block_dates.wal");
    let d = h.device("SN-1", &[]).await;
    let tuesday = NaiveDate::from_ymd_opt(2030, 6, 4).unwrap();

    h.engine.block_date(tuesday, Some("Exams".into())).await.unwrap();
    assert!(matches!(
        h.engine.block_date(tuesday, None).await,
        Err(EngineError::AlreadyExists(_))
    ));
    assert!(h.engine.is_blocked(tuesday));
    assert_eq!(h.engine.blocked_dates().len(), 1);

    let result = h
        .engine
        .create_single(Ulid::new(), d.id, window(1, 9, 11), None, None)
        .await;
    assert!(matches!(result, Err(EngineError::Validation(_))));

    assert_ok!(h.engine.unblock_date(tuesday).await);
    assert!(h.engine.blocked_dates().is_empty());
    assert_err!(h.engine.unblock_date(tuesday).await);
    h.reserve(&d, window(1, 9, 11)).await;
}

// ── createSingle ─────────────────────────────────────────

#[tokio::test]
async fn create_single_starts_pending() {
    let h = Harness::new("create_single.wal");
    let d = h.device("SN-1", &[]).await;
    let r = h.reserve(&d, window(0, 9, 11)).await;
    assert_eq!(r.status, ReservationStatus::Pending);
    assert_eq!(r.device_id, d.id);
    assert_eq!(r.batch_id, None);
    assert_eq!(r.created_at, at(-1, 12));
    assert_eq!(h.engine.get_reservation(&r.id).await.unwrap(), r);
}

#[tokio::test]
async fn create_single_overlap_conflicts_adjacent_ok() {
    let h = Harness::new("single_overlap.wal");
    let d = h.device("SN-1", &[]).await;
    h.reserve(&d, window(0, 9, 11)).await;

    let overlap = h
        .engine
        .create_single(Ulid::new(), d.id, window(0, 10, 12), None, None)
        .await;
    assert!(matches!(overlap, Err(EngineError::Conflict(_))));

    h.reserve(&d, window(0, 11, 13)).await;
    h.reserve(&d, window(0, 7, 9)).await;
}

#[tokio::test]
async fn create_single_rejects_bad_windows() {
    let h = Harness::new("single_windows.wal");
    let d = h.device("SN-1", &[]).await;
    let e = &h.engine;
    let bad = [
        Span::unchecked(at(0, 11), at(0, 9)), // inverted
        window(-1, 13, 14),                   // Sunday
        window(5, 9, 10),                     // Saturday
        window(0, 6, 8),                      // before opening
        window(0, 20, 22),                    // after closing
        Span::new(at(0, 20), at(0, 21) + 60_000),
    ];
    for span in bad {
        let result = e.create_single(Ulid::new(), d.id, span, None, None).await;
        assert!(matches!(result, Err(EngineError::Validation(_))), "{span:?}");
    }
    // Ending exactly at closing time is fine.
    h.reserve(&d, window(0, 19, 21)).await;
}

#[tokio::test]
async fn create_single_unknown_device() {
    let h = Harness::new("single_unknown.wal");
    let result = h
        .engine
        .create_single(Ulid::new(), Ulid::new(), window(0, 9, 10), None, None)
        .await;
    assert!(matches!(result, Err(EngineError::NotFound(_))));
}

#[tokio::test]
async fn create_single_out_of_service_device() {
    let h = Harness::new("single_out_of_service.wal");
    for (i, status) in [
        DeviceStatus::Inactive,
        DeviceStatus::InRepair,
        DeviceStatus::MaintenanceRequired,
    ]
    .into_iter()
    .enumerate()
    {
        let d = h
            .engine
            .register_device(&format!("SN-{i}"), "Old", &[], status)
            .await
            .unwrap();
        let result = h
            .engine
            .create_single(Ulid::new(), d.id, window(0, 9, 10), None, None)
            .await;
        assert!(matches!(result, Err(EngineError::Conflict(_))), "{status}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_double_booking_exactly_one_wins() {
    let h = Harness::new("double_booking.wal");
    let d = h.device("SN-1", &[]).await;

    for round in 0..10 {
        let span = window(round % 5, 9, 11);
        let mut handles = Vec::new();
        for _ in 0..2 {
            let eng = h.engine.clone();
            let device_id = d.id;
            handles.push(tokio::spawn(async move {
                eng.create_single(Ulid::new(), device_id, span, None, None).await
            }));
        }
        let mut won = Vec::new();
        let mut conflicts = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(r) => won.push(r),
                Err(EngineError::Conflict(_)) => conflicts += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        let ok = won.len();
        // Free the slot for the next round on the same day.
        for r in won {
            h.engine
                .transition_status(r.id, ReservationStatus::Cancelled)
                .await
                .unwrap();
        }
        assert_eq!((ok, conflicts), (1, 1), "round {round}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_contenders_one_device() {
    let h = Harness::new("many_contenders.wal");
    let d = h.device("SN-1", &[]).await;
    let mut handles = Vec::new();
    for _ in 0..16 {
        let eng = h.engine.clone();
        let device_id = d.id;
        handles.push(tokio::spawn(async move {
            eng.create_single(Ulid::new(), device_id, window(2, 10, 12), None, None)
                .await
        }));
    }
    let wins = futures::future::join_all(handles)
        .await
        .into_iter()
        .filter(|r| matches!(r, Ok(Ok(_))))
        .count();
    assert_eq!(wins, 1);
    assert_eq!(
        h.engine
            .list_reservations(&ReservationFilter {
                device_id: Some(d.id),
                ..Default::default()
            })
            .await
            .len(),
        1
    );
}

// ── search_available ─────────────────────────────────────

#[tokio::test]
async fn search_excludes_held_devices_and_filters_capabilities() {
    let h = Harness::new("search.wal");
    let gpu = h.device("SN-GPU", &["CUDA", "Python"]).await;
    let plain = h.device("SN-PLAIN", &["Python"]).await;
    let e = &h.engine;

    let py = CapabilityQuery::parse("python");
    let found = e.search_available(&py, window(0, 9, 11)).await.unwrap();
    assert_eq!(found.len(), 2);

    let cuda = CapabilityQuery::parse("Python, cuda");
    let found = e.search_available(&cuda, window(0, 9, 11)).await.unwrap();
    assert_eq!(found.iter().map(|d| d.id).collect::<Vec<_>>(), vec![gpu.id]);

    let r = h.reserve(&plain, window(0, 10, 12)).await;
    let found = e.search_available(&py, window(0, 9, 11)).await.unwrap();
    assert_eq!(found.iter().map(|d| d.id).collect::<Vec<_>>(), vec![gpu.id]);

    // Released reservations no longer hold the device.
    e.transition_status(r.id, ReservationStatus::Rejected).await.unwrap();
    let found = e.search_available(&py, window(0, 9, 11)).await.unwrap();
    assert_eq!(found.len(), 2);
}

#[tokio::test]
async fn search_empty_result_is_ok() {
    let h = Harness::new("search_empty.wal");
    h.device("SN-1", &[]).await;
    let found = h
        .engine
        .search_available(&CapabilityQuery::parse("Matlab"), window(0, 9, 10))
        .await
        .unwrap();
    assert!(found.is_empty());
}

#[tokio::test]
async fn search_validates_window() {
    let h = Harness::new("search_window.wal");
    h.device("SN-1", &[]).await;
    let result = h
        .engine
        .search_available(&CapabilityQuery::Any, window(6, 9, 10))
        .await;
    assert!(matches!(result, Err(EngineError::Validation(_))));
}

// ── createBatch ──────────────────────────────────────────

#[tokio::test]
async fn batch_allocates_distinct_devices() {
    let h = Harness::new("batch_ok.wal");
    let requester = Ulid::new();
    h.engine
        .register_requester(requester, Some("Prof. Ruiz".into()), None)
        .await
        .unwrap();
    for i in 0..4 {
        h.device(&format!("SN-{i}"), &["Python"]).await;
    }

    let batch = h
        .engine
        .create_batch(
            requester,
            3,
            &CapabilityQuery::parse("python"),
            window(0, 9, 11),
            Some("Intro to ML".into()),
        )
        .await
        .unwrap();
    assert_eq!(batch.len(), 3);
    let batch_id = batch[0].batch_id.unwrap();
    let mut devices: Vec<_> = batch.iter().map(|r| r.device_id).collect();
    devices.sort();
    devices.dedup();
    assert_eq!(devices.len(), 3);
    for r in &batch {
        assert_eq!(r.batch_id, Some(batch_id));
        assert_eq!(r.status, ReservationStatus::Pending);
        assert_eq!(r.professor.as_deref(), Some("Prof. Ruiz"));
        assert_eq!(r.pickup_code(), format!("RES-{batch_id}"));
    }

    let left = h
        .engine
        .search_available(&CapabilityQuery::Any, window(0, 9, 11))
        .await
        .unwrap();
    assert_eq!(left.len(), 1);
}

#[tokio::test]
async fn batch_short_supply_persists_nothing() {
    let h = Harness::new("batch_short.wal");
    let a = h.device("SN-A", &["Python"]).await;
    h.device("SN-B", &["Python"]).await;
    h.device("SN-C", &[]).await;
    let taken = h.device("SN-D", &["Python"]).await;
    h.reserve(&taken, window(0, 10, 11)).await;
    let appends = h.engine.wal_appends_since_compact().await;

    let result = h
        .engine
        .create_batch(
            Ulid::new(),
            3,
            &CapabilityQuery::parse("Python"),
            window(0, 9, 11),
            None,
        )
        .await;
    assert!(matches!(result, Err(EngineError::Conflict(_))));
    assert_eq!(h.engine.wal_appends_since_compact().await, appends);
    let on_a = h
        .engine
        .list_reservations(&ReservationFilter {
            device_id: Some(a.id),
            ..Default::default()
        })
        .await;
    assert!(on_a.is_empty());
}

#[tokio::test]
async fn batch_quantity_bounds() {
    let h = Harness::new("batch_bounds.wal");
    h.device("SN-1", &[]).await;
    let e = &h.engine;
    assert!(matches!(
        e.create_batch(Ulid::new(), 0, &CapabilityQuery::Any, window(0, 9, 10), None)
            .await,
        Err(EngineError::Validation(_))
    ));
    assert!(matches!(
        e.create_batch(
            Ulid::new(),
            MAX_BATCH_SIZE + 1,
            &CapabilityQuery::Any,
            window(0, 9, 10),
            None
        )
        .await,
        Err(EngineError::LimitExceeded(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_batches_never_share_devices() {
    let h = Harness::new("batch_race.wal");
    for i in 0..5 {
        h.device(&format!("SN-{i}"), &[]).await;
    }
    let mut handles = Vec::new();
    for _ in 0..3 {
        let eng = h.engine.clone();
        handles.push(tokio::spawn(async move {
            eng.create_batch(Ulid::new(), 2, &CapabilityQuery::Any, window(1, 9, 12), None)
                .await
        }));
    }
    let mut granted = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            Ok(batch) => granted.extend(batch.into_iter().map(|r| r.device_id)),
            Err(EngineError::Conflict(_)) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    // Five devices, batches of two: at most two batches fit.
    assert_eq!(granted.len(), 4);
    granted.sort();
    granted.dedup();
    assert_eq!(granted.len(), 4);
}

// ── transitionStatus ─────────────────────────────────────

#[tokio::test]
async fn lifecycle_drives_device_status() {
    let mut h = Harness::new("lifecycle.wal");
    let d = h.device("SN-1", &[]).await;
    let r = h.reserve(&d, window(0, 9, 11)).await;
    let e = &h.engine;

    e.transition_status(r.id, ReservationStatus::Approved).await.unwrap();
    assert_eq!(e.get_device(&d.id).await.unwrap().status, DeviceStatus::Available);

    e.transition_status(r.id, ReservationStatus::Active).await.unwrap();
    assert_eq!(e.get_device(&d.id).await.unwrap().status, DeviceStatus::InUse);

    let done = e.transition_status(r.id, ReservationStatus::Completed).await.unwrap();
    assert_eq!(done.status, ReservationStatus::Completed);
    assert_eq!(e.get_device(&d.id).await.unwrap().status, DeviceStatus::Available);

    assert_eq!(
        kinds(&h.drain()),
        vec![NotificationKind::ReservationConfirmed, NotificationKind::ReturnConfirmed]
    );
}

#[tokio::test]
async fn approval_notification_carries_pickup_code() {
    let mut h = Harness::new("pickup_code.wal");
    let requester = Ulid::new();
    h.engine
        .register_requester(requester, Some("Ana".into()), Some("ana@uni.test".into()))
        .await
        .unwrap();
    let d = h.device("SN-1", &[]).await;
    let r = h
        .engine
        .create_single(requester, d.id, window(0, 9, 10), Some("OS".into()), None)
        .await
        .unwrap();
    h.engine
        .transition_status(r.id, ReservationStatus::Approved)
        .await
        .unwrap();

    let sent = h.drain();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].recipient.email.as_deref(), Some("ana@uni.test"));
    match &sent[0].payload {
        Payload::Reservation {
            pickup_code,
            device_serial,
            ..
        } => {
            assert_eq!(pickup_code.as_deref(), Some(r.pickup_code().as_str()));
            assert_eq!(device_serial, "SN-1");
        }
        other => panic!("unexpected payload {other:?}"),
    }
}

#[tokio::test]
async fn illegal_transitions_rejected() {
    let h = Harness::new("illegal_transitions.wal");
    let d = h.device("SN-1", &[]).await;
    let r = h.reserve(&d, window(0, 9, 11)).await;
    let e = &h.engine;

    assert!(matches!(
        e.transition_status(r.id, ReservationStatus::Active).await,
        Err(EngineError::State { .. })
    ));
    e.transition_status(r.id, ReservationStatus::Approved).await.unwrap();
    e.transition_status(r.id, ReservationStatus::Active).await.unwrap();
    e.transition_status(r.id, ReservationStatus::Completed).await.unwrap();
    let again = e.transition_status(r.id, ReservationStatus::Active).await;
    assert!(matches!(
        again,
        Err(EngineError::State {
            from: ReservationStatus::Completed,
            to: ReservationStatus::Active
        })
    ));
    assert!(matches!(
        e.transition_status(Ulid::new(), ReservationStatus::Approved).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn overdue_requires_ended_window() {
    let h = Harness::new("overdue_guard.wal");
    let d = h.device("SN-1", &[]).await;
    let r = h.reserve(&d, window(0, 9, 11)).await;
    let e = &h.engine;
    e.transition_status(r.id, ReservationStatus::Approved).await.unwrap();
    e.transition_status(r.id, ReservationStatus::Active).await.unwrap();

    h.clock.set(at(0, 10));
    assert!(matches!(
        e.transition_status(r.id, ReservationStatus::Overdue).await,
        Err(EngineError::InvalidState(_))
    ));
    h.clock.set(at(0, 11));
    let r = e.transition_status(r.id, ReservationStatus::Overdue).await.unwrap();
    assert_eq!(r.status, ReservationStatus::Overdue);
    assert_eq!(e.get_device(&d.id).await.unwrap().status, DeviceStatus::InUse);
}

#[tokio::test]
async fn cancelled_window_can_be_rebooked() {
    let h = Harness::new("cancel_rebook.wal");
    let d = h.device("SN-1", &[]).await;
    let r = h.reserve(&d, window(0, 9, 11)).await;
    h.engine
        .transition_status(r.id, ReservationStatus::Approved)
        .await
        .unwrap();
    h.engine
        .transition_status(r.id, ReservationStatus::Cancelled)
        .await
        .unwrap();
    h.reserve(&d, window(0, 9, 11)).await;
}

#[tokio::test]
async fn full_notification_queue_does_not_fail_transition() {
    let h = Harness::open(test_wal_path("full_queue.wal"), 1);
    let d = h.device("SN-1", &[]).await;
    let mut ids = Vec::new();
    for hour in [8, 10, 12] {
        ids.push(h.reserve(&d, window(0, hour, hour + 1)).await.id);
    }
    for id in ids {
        h.engine
            .transition_status(id, ReservationStatus::Approved)
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn return_keeps_device_in_use_while_another_loan_is_out() {
    let h = Harness::new("two_loans.wal");
    let d = h.device("SN-1", &[]).await;
    let e = &h.engine;
    let first = h.reserve(&d, window(0, 9, 10)).await;
    let second = h.reserve(&d, window(0, 11, 12)).await;
    for id in [first.id, second.id] {
        e.transition_status(id, ReservationStatus::Approved).await.unwrap();
        e.transition_status(id, ReservationStatus::Active).await.unwrap();
    }

    e.transition_status(first.id, ReservationStatus::Completed).await.unwrap();
    assert_eq!(e.get_device(&d.id).await.unwrap().status, DeviceStatus::InUse);
    let later = e
        .search_available(&CapabilityQuery::Any, window(1, 9, 10))
        .await
        .unwrap();
    assert!(later.is_empty());

    e.transition_status(second.id, ReservationStatus::Completed).await.unwrap();
    assert_eq!(e.get_device(&d.id).await.unwrap().status, DeviceStatus::Available);
}

// ── submitFeedback ───────────────────────────────────────

#[tokio::test]
async fn low_ratings_flag_maintenance() {
    let mut h = Harness::new("feedback_flag.wal");
    let d = h.device("SN-1", &[]).await;
    let mut ids = Vec::new();
    for hour in [8, 10, 12] {
        ids.push(h.reserve(&d, window(0, hour, hour + 1)).await.id);
    }
    for id in &ids {
        h.engine.submit_feedback(*id, 1, Some("screen flickers".into())).await.unwrap();
    }
    assert_eq!(
        h.engine.get_device(&d.id).await.unwrap().status,
        DeviceStatus::MaintenanceRequired
    );
    assert_eq!(h.engine.device_mean_rating(&d.id).await.unwrap(), Some(1.0));

    // Only the first rating changed the status; one alert goes out.
    let sent = h.drain();
    assert_eq!(kinds(&sent), vec![NotificationKind::MaintenanceAlert]);
    assert_eq!(sent[0].recipient.email.as_deref(), Some("admin@lab.test"));

    // Flagged devices are no longer bookable.
    let result = h
        .engine
        .create_single(Ulid::new(), d.id, window(1, 9, 10), None, None)
        .await;
    assert!(matches!(result, Err(EngineError::Conflict(_))));
}

#[tokio::test]
async fn mean_at_threshold_is_not_flagged() {
    let h = Harness::new("feedback_threshold.wal");
    let d = h.device("SN-1", &[]).await;
    let a = h.reserve(&d, window(0, 8, 9)).await;
    let b = h.reserve(&d, window(0, 10, 11)).await;
    h.engine.submit_feedback(a.id, 5, None).await.unwrap();
    h.engine.submit_feedback(b.id, 1, None).await.unwrap();
    assert_eq!(h.engine.device_mean_rating(&d.id).await.unwrap(), Some(3.0));
    assert_eq!(h.engine.get_device(&d.id).await.unwrap().status, DeviceStatus::Available);
}

#[tokio::test]
async fn out_of_range_rating_persists_nothing() {
    let h = Harness::new("feedback_range.wal");
    let d = h.device("SN-1", &[]).await;
    let r = h.reserve(&d, window(0, 9, 10)).await;
    let appends = h.engine.wal_appends_since_compact().await;
    for rating in [0, 6, -1, 300] {
        assert!(matches!(
            h.engine.submit_feedback(r.id, rating, None).await,
            Err(EngineError::Validation(_))
        ));
    }
    assert_eq!(h.engine.wal_appends_since_compact().await, appends);
    assert_eq!(h.engine.get_reservation(&r.id).await.unwrap().rating, None);
}

#[tokio::test]
async fn feedback_only_once() {
    let h = Harness::new("feedback_once.wal");
    let d = h.device("SN-1", &[]).await;
    let r = h.reserve(&d, window(0, 9, 10)).await;
    let rated = h.engine.submit_feedback(r.id, 4, Some("fine".into())).await.unwrap();
    assert_eq!(rated.rating, Some(4));
    assert_eq!(rated.feedback.as_deref(), Some("fine"));
    assert!(matches!(
        h.engine.submit_feedback(r.id, 5, None).await,
        Err(EngineError::InvalidState(_))
    ));
    assert!(matches!(
        h.engine.submit_feedback(Ulid::new(), 5, None).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn feedback_text_limit() {
    let h = Harness::new("feedback_text.wal");
    let d = h.device("SN-1", &[]).await;
    let r = h.reserve(&d, window(0, 9, 10)).await;
    let long = "a".repeat(MAX_FEEDBACK_LEN + 1);
    assert!(matches!(
        h.engine.submit_feedback(r.id, 3, Some(long)).await,
        Err(EngineError::LimitExceeded(_))
    ));
}

// ── Incidents ────────────────────────────────────────────

#[tokio::test]
async fn severe_incident_takes_device_out_until_resolved() {
    let mut h = Harness::new("incident_severe.wal");
    let d = h.device("SN-1", &[]).await;

    let incident = h
        .engine
        .report_incident(d.id, IncidentSeverity::High, " battery swollen ")
        .await
        .unwrap();
    assert_eq!(incident.description, "battery swollen");
    assert!(incident.is_open());
    assert_eq!(h.engine.get_device(&d.id).await.unwrap().status, DeviceStatus::InRepair);
    assert_eq!(kinds(&h.drain()), vec![NotificationKind::MaintenanceAlert]);
    assert!(matches!(
        h.engine.create_single(Ulid::new(), d.id, window(0, 9, 10), None, None).await,
        Err(EngineError::Conflict(_))
    ));
    assert_eq!(h.engine.open_incidents().await, vec![incident.clone()]);

    h.clock.set(at(-1, 13));
    let resolved = h.engine.resolve_incident(incident.id).await.unwrap();
    assert_eq!(resolved.resolved_at, Some(at(-1, 13)));
    assert_eq!(h.engine.get_device(&d.id).await.unwrap().status, DeviceStatus::Available);
    assert!(h.engine.open_incidents().await.is_empty());
    assert!(matches!(
        h.engine.resolve_incident(incident.id).await,
        Err(EngineError::InvalidState(_))
    ));
    h.reserve(&d, window(0, 9, 10)).await;
}

#[tokio::test]
async fn minor_incident_leaves_device_in_service() {
    let mut h = Harness::new("incident_minor.wal");
    let d = h.device("SN-1", &[]).await;
    for severity in [IncidentSeverity::Low, IncidentSeverity::Medium] {
        h.engine.report_incident(d.id, severity, "sticky key").await.unwrap();
    }
    assert_eq!(h.engine.get_device(&d.id).await.unwrap().status, DeviceStatus::Available);
    assert!(h.drain().is_empty());
    assert_eq!(h.engine.incidents_for_device(&d.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn resolving_clears_low_rating_flag() {
    let h = Harness::new("incident_clears_flag.wal");
    let d = h.device("SN-1", &[]).await;
    let first = h.reserve(&d, window(0, 8, 9)).await;
    let second = h.reserve(&d, window(0, 10, 11)).await;
    for r in [first, second] {
        h.engine.submit_feedback(r.id, 1, None).await.unwrap();
    }
    assert_eq!(
        h.engine.get_device(&d.id).await.unwrap().status,
        DeviceStatus::MaintenanceRequired
    );

    let incident = h
        .engine
        .report_incident(d.id, IncidentSeverity::Low, "keyboard replaced")
        .await
        .unwrap();
    h.engine.resolve_incident(incident.id).await.unwrap();
    assert_eq!(h.engine.get_device(&d.id).await.unwrap().status, DeviceStatus::Available);
}

#[tokio::test]
async fn resolving_with_loan_out_restores_in_use() {
    let h = Harness::new("incident_on_loan.wal");
    let d = h.device("SN-1", &[]).await;
    let e = &h.engine;
    let r = h.reserve(&d, window(0, 9, 11)).await;
    e.transition_status(r.id, ReservationStatus::Approved).await.unwrap();
    e.transition_status(r.id, ReservationStatus::Active).await.unwrap();

    let incident = e
        .report_incident(d.id, IncidentSeverity::High, "dropped on the floor")
        .await
        .unwrap();
    assert_eq!(e.get_device(&d.id).await.unwrap().status, DeviceStatus::InRepair);

    e.resolve_incident(incident.id).await.unwrap();
    assert_eq!(e.get_device(&d.id).await.unwrap().status, DeviceStatus::InUse);
    e.transition_status(r.id, ReservationStatus::Completed).await.unwrap();
    assert_eq!(e.get_device(&d.id).await.unwrap().status, DeviceStatus::Available);
}

#[tokio::test]
async fn second_severe_incident_keeps_device_out() {
    let h = Harness::new("incident_two_severe.wal");
    let d = h.device("SN-1", &[]).await;
    let e = &h.engine;
    let screen = e.report_incident(d.id, IncidentSeverity::High, "screen").await.unwrap();
    let hinge = e.report_incident(d.id, IncidentSeverity::High, "hinge").await.unwrap();

    e.resolve_incident(screen.id).await.unwrap();
    assert_eq!(e.get_device(&d.id).await.unwrap().status, DeviceStatus::InRepair);
    e.resolve_incident(hinge.id).await.unwrap();
    assert_eq!(e.get_device(&d.id).await.unwrap().status, DeviceStatus::Available);
}

#[tokio::test]
async fn resolving_after_overdue_frees_device() {
    let h = Harness::new("incident_after_overdue.wal");
    let d = h.device("SN-1", &[]).await;
    let e = &h.engine;
    let r = h.reserve(&d, window(0, 9, 10)).await;
    e.transition_status(r.id, ReservationStatus::Approved).await.unwrap();
    e.transition_status(r.id, ReservationStatus::Active).await.unwrap();
    h.clock.set(at(0, 11));
    e.transition_status(r.id, ReservationStatus::Overdue).await.unwrap();
    assert_eq!(e.get_device(&d.id).await.unwrap().status, DeviceStatus::InUse);

    let incident = e
        .report_incident(d.id, IncidentSeverity::Low, "returned late at the desk")
        .await
        .unwrap();
    e.resolve_incident(incident.id).await.unwrap();
    assert_eq!(e.get_device(&d.id).await.unwrap().status, DeviceStatus::Available);
}

#[tokio::test]
async fn incident_validation() {
    let h = Harness::new("incident_validation.wal");
    let d = h.device("SN-1", &[]).await;
    let e = &h.engine;
    assert!(matches!(
        e.report_incident(d.id, IncidentSeverity::Low, "   ").await,
        Err(EngineError::Validation(_))
    ));
    assert!(matches!(
        e.report_incident(d.id, IncidentSeverity::Low, &"x".repeat(MAX_INCIDENT_LEN + 1))
            .await,
        Err(EngineError::LimitExceeded(_))
    ));
    assert!(matches!(
        e.report_incident(Ulid::new(), IncidentSeverity::Low, "lost").await,
        Err(EngineError::NotFound(_))
    ));
    assert!(matches!(
        e.resolve_incident(Ulid::new()).await,
        Err(EngineError::NotFound(_))
    ));
    assert!(e.incidents_for_device(&d.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn incidents_survive_replay_and_compaction() {
    let h = Harness::new("incident_replay.wal");
    let d = h.device("SN-1", &[]).await;
    let open = h
        .engine
        .report_incident(d.id, IncidentSeverity::High, "fan noise")
        .await
        .unwrap();
    let closed = h
        .engine
        .report_incident(d.id, IncidentSeverity::Low, "smudged screen")
        .await
        .unwrap();
    h.engine.resolve_incident(closed.id).await.unwrap();
    let before = h.engine.incidents_for_device(&d.id).await.unwrap();
    let path = h.path.clone();
    drop(h);

    let h = Harness::open(path.clone(), 16);
    assert_eq!(h.engine.incidents_for_device(&d.id).await.unwrap(), before);
    assert_eq!(h.engine.get_device(&d.id).await.unwrap().status, DeviceStatus::InRepair);
    h.engine.compact_wal().await.unwrap();
    drop(h);

    let h = Harness::open(path, 16);
    assert_eq!(h.engine.incidents_for_device(&d.id).await.unwrap(), before);
    assert_eq!(h.engine.open_incidents().await.len(), 1);
    h.engine.resolve_incident(open.id).await.unwrap();
    assert_eq!(h.engine.get_device(&d.id).await.unwrap().status, DeviceStatus::Available);
}

// ── Queries ──────────────────────────────────────────────

#[tokio::test]
async fn list_reservations_filters() {
    let h = Harness::new("list_filters.wal");
    let d1 = h.device("SN-1", &[]).await;
    let d2 = h.device("SN-2", &[]).await;
    let alice = Ulid::new();
    let a = h
        .engine
        .create_single(alice, d1.id, window(0, 9, 10), None, Some("Dr. Ruiz".into()))
        .await
        .unwrap();
    let b = h
        .engine
        .create_single(alice, d2.id, window(1, 9, 10), None, Some("Dr. Chen".into()))
        .await
        .unwrap();
    let c = h.reserve(&d1, window(2, 9, 10)).await;
    h.engine
        .transition_status(c.id, ReservationStatus::Approved)
        .await
        .unwrap();

    let ids = |rs: Vec<Reservation>| rs.into_iter().map(|r| r.id).collect::<Vec<_>>();
    let e = &h.engine;
    assert_eq!(ids(e.list_reservations(&ReservationFilter::default()).await), vec![a.id, b.id, c.id]);
    assert_eq!(ids(e.reservations_for_requester(alice).await), vec![a.id, b.id]);
    assert_eq!(
        ids(e
            .list_reservations(&ReservationFilter {
                status: Some(ReservationStatus::Approved),
                ..Default::default()
            })
            .await),
        vec![c.id]
    );
    assert_eq!(
        ids(e
            .list_reservations(&ReservationFilter {
                professor: Some("ruiz".into()),
                ..Default::default()
            })
            .await),
        vec![a.id]
    );
    assert_eq!(
        ids(e
            .list_reservations(&ReservationFilter {
                start_from: Some(at(1, 0)),
                end_until: Some(at(1, 23)),
                ..Default::default()
            })
            .await),
        vec![b.id]
    );
}

#[tokio::test]
async fn overdue_and_due_soon_selection() {
    let h = Harness::new("collect_active.wal");
    let d = h.device("SN-1", &[]).await;
    let r = h.reserve(&d, window(0, 9, 11)).await;
    let e = &h.engine;
    e.transition_status(r.id, ReservationStatus::Approved).await.unwrap();
    assert!(e.collect_overdue(at(0, 12)).await.is_empty());

    e.transition_status(r.id, ReservationStatus::Active).await.unwrap();
    assert!(e.collect_overdue(at(0, 10)).await.is_empty());
    assert_eq!(e.collect_overdue(at(0, 11)).await.len(), 1);
    assert_eq!(e.collect_due_soon(at(0, 10), H).await.len(), 1);
    assert!(e.collect_due_soon(at(0, 9), H).await.is_empty());
    assert!(e.collect_due_soon(at(0, 11), H).await.is_empty());
}

// ── Journal ──────────────────────────────────────────────

#[tokio::test]
async fn replay_restores_state() {
    let h = Harness::new("replay.wal");
    let requester = Ulid::new();
    h.engine
        .register_requester(requester, Some("Ana".into()), None)
        .await
        .unwrap();
    let d = h.device("SN-1", &["Python"]).await;
    let r = h.reserve(&d, window(0, 9, 11)).await;
    h.engine
        .transition_status(r.id, ReservationStatus::Approved)
        .await
        .unwrap();
    h.engine
        .transition_status(r.id, ReservationStatus::Active)
        .await
        .unwrap();
    h.engine.submit_feedback(r.id, 2, None).await.unwrap();
    h.engine.sanction_requester(requester).await.unwrap();
    let exam = NaiveDate::from_ymd_opt(2030, 6, 5).unwrap();
    h.engine.block_date(exam, None).await.unwrap();
    let batch = h
        .engine
        .create_batch(requester, 1, &CapabilityQuery::Any, window(1, 9, 10), None)
        .await;
    // The only device is flagged after the low rating.
    assert!(matches!(batch, Err(EngineError::Conflict(_))));

    let before_device = h.engine.get_device(&d.id).await.unwrap();
    let before_reservation = h.engine.get_reservation(&r.id).await.unwrap();
    let path = h.path.clone();
    drop(h);

    let h2 = Harness::open(path, 16);
    assert_eq!(h2.engine.get_device(&d.id).await.unwrap(), before_device);
    assert_eq!(h2.engine.get_reservation(&r.id).await.unwrap(), before_reservation);
    assert_eq!(before_device.status, DeviceStatus::MaintenanceRequired);
    let ana = h2.engine.get_requester(&requester).unwrap();
    assert!(ana.sanctioned);
    assert_eq!(ana.full_name.as_deref(), Some("Ana"));
    assert!(h2.engine.is_blocked(exam));
}

#[tokio::test]
async fn replay_restores_batches() {
    let h = Harness::new("replay_batch.wal");
    for i in 0..3 {
        h.device(&format!("SN-{i}"), &[]).await;
    }
    let batch = h
        .engine
        .create_batch(Ulid::new(), 3, &CapabilityQuery::Any, window(0, 9, 10), None)
        .await
        .unwrap();
    let path = h.path.clone();
    drop(h);

    let h2 = Harness::open(path, 16);
    for r in &batch {
        assert_eq!(&h2.engine.get_reservation(&r.id).await.unwrap(), r);
    }
    // Replayed holds still block the window.
    let left = h2
        .engine
        .search_available(&CapabilityQuery::Any, window(0, 9, 10))
        .await
        .unwrap();
    assert!(left.is_empty());
}

#[tokio::test]
async fn compaction_preserves_state() {
    let h = Harness::new("compaction.wal");
    let requester = Ulid::new();
    h.engine.sanction_requester(requester).await.unwrap();
    let d = h.device("SN-1", &[]).await;
    let mut ids = Vec::new();
    for hour in [8, 10, 12] {
        let r = h.reserve(&d, window(0, hour, hour + 1)).await;
        h.engine
            .transition_status(r.id, ReservationStatus::Approved)
            .await
            .unwrap();
        ids.push(r.id);
    }
    h.engine
        .transition_status(ids[0], ReservationStatus::Cancelled)
        .await
        .unwrap();
    h.engine.submit_feedback(ids[1], 5, None).await.unwrap();
    assert!(h.engine.wal_appends_since_compact().await > 0);

    let before_len = std::fs::metadata(&h.path).unwrap().len();
    h.engine.compact_wal().await.unwrap();
    assert_eq!(h.engine.wal_appends_since_compact().await, 0);
    assert!(std::fs::metadata(&h.path).unwrap().len() < before_len);

    let before = h.engine.list_reservations(&ReservationFilter::default()).await;
    let path = h.path.clone();
    drop(h);

    let h2 = Harness::open(path, 16);
    assert_eq!(h2.engine.list_reservations(&ReservationFilter::default()).await, before);
    assert!(h2.engine.get_requester(&requester).unwrap().sanctioned);
    assert_eq!(h2.engine.list_devices().await.len(), 1);
}

#[tokio::test]
async fn group_commit_concurrent_registrations() {
    let h = Harness::new("group_commit.wal");
    let n = 20;
    let mut handles = Vec::new();
    for i in 0..n {
        let eng = h.engine.clone();
        handles.push(tokio::spawn(async move {
            eng.register_device(&format!("SN-{i}"), "Latitude", &[], DeviceStatus::Available)
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    assert_eq!(h.engine.list_devices().await.len(), n);
    assert_eq!(h.engine.wal_appends_since_compact().await, n as u64);

    let path = h.path.clone();
    drop(h);
    let h2 = Harness::open(path, 16);
    assert_eq!(h2.engine.list_devices().await.len(), n);
}
