use chrono::NaiveDate;
use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::{Notification, NotificationKind, Payload, Recipient};
use crate::observability::{self, severity_label, status_label};
use crate::quality;

use super::availability::device_qualifies;
use super::conflict::{check_no_conflict, validate_labels};
use super::transition::{
    check_transition, notification_kind, paired_device_status, restored_status,
};
use super::{Engine, EngineError};

impl Engine {
    // ── Inventory & calendar ─────────────────────────────────

    pub async fn register_device(
        &self,
        serial_number: &str,
        model: &str,
        capabilities: &[&str],
        status: DeviceStatus,
    ) -> Result<Device, EngineError> {
        let serial_number = serial_number.trim();
        if serial_number.is_empty() {
            return Err(EngineError::Validation("serial number is required".into()));
        }
        if serial_number.len() > MAX_SERIAL_LEN {
            return Err(EngineError::LimitExceeded("serial number too long"));
        }
        if model.len() > MAX_MODEL_LEN {
            return Err(EngineError::LimitExceeded("model name too long"));
        }
        let capabilities = normalize_capabilities(capabilities.iter().copied());
        if capabilities.len() > MAX_CAPABILITIES {
            return Err(EngineError::LimitExceeded("too many capabilities"));
        }
        if capabilities.iter().any(|c| c.len() > MAX_NAME_LEN) {
            return Err(EngineError::LimitExceeded("capability name too long"));
        }

        let _commit = self.begin_commit().await;
        let _registry = self.registry_lock.lock().await;
        if self.store.device_count() >= MAX_DEVICES {
            return Err(EngineError::LimitExceeded("too many devices"));
        }
        if self.store.serial_taken(serial_number) {
            return Err(EngineError::AlreadyExists(format!(
                "device with serial {serial_number}"
            )));
        }

        let device = Device {
            id: Ulid::new(),
            serial_number: serial_number.to_string(),
            model: model.trim().to_string(),
            capabilities,
            status,
        };
        let event = Event::DeviceRegistered {
            device: device.clone(),
        };
        self.wal_append(&event).await?;
        self.store.apply_global(&event);
        info!("registered device {} ({}) as {}", device.id, device.serial_number, device.status);
        Ok(device)
    }

    /// Create or update contact details. The sanction flag is preserved.
    pub async fn register_requester(
        &self,
        id: Ulid,
        full_name: Option<String>,
        email: Option<String>,
    ) -> Result<Requester, EngineError> {
        if full_name.as_ref().is_some_and(|n| n.len() > MAX_NAME_LEN)
            || email.as_ref().is_some_and(|e| e.len() > MAX_NAME_LEN)
        {
            return Err(EngineError::LimitExceeded("requester name or email too long"));
        }

        let _commit = self.begin_commit().await;
        let _registry = self.registry_lock.lock().await;
        let requester = Requester {
            id,
            full_name,
            email,
            sanctioned: self.store.requester(&id).is_some_and(|r| r.sanctioned),
        };
        let event = Event::RequesterRegistered {
            requester: requester.clone(),
        };
        self.wal_append(&event).await?;
        self.store.apply_global(&event);
        Ok(requester)
    }

    /// Mark a requester sanctioned. Returns `false` if they already were.
    pub async fn sanction_requester(&self, id: Ulid) -> Result<bool, EngineError> {
        let _commit = self.begin_commit().await;
        let _registry = self.registry_lock.lock().await;
        if self.store.requester(&id).is_some_and(|r| r.sanctioned) {
            return Ok(false);
        }
        let event = Event::RequesterSanctioned { id };
        self.wal_append(&event).await?;
        self.store.apply_global(&event);
        info!("requester {id} sanctioned");
        Ok(true)
    }

    /// Close a calendar day for new bookings. Existing reservations stay.
    pub async fn block_date(
        &self,
        date: NaiveDate,
        reason: Option<String>,
    ) -> Result<BlockedDate, EngineError> {
        if reason.as_ref().is_some_and(|r| r.len() > MAX_REASON_LEN) {
            return Err(EngineError::LimitExceeded("block reason too long"));
        }
        let _commit = self.begin_commit().await;
        let _registry = self.registry_lock.lock().await;
        if self.store.is_blocked(&date) {
            return Err(EngineError::AlreadyExists(format!("blocked date {date}")));
        }
        let blocked = BlockedDate { date, reason };
        let event = Event::DateBlocked {
            blocked: blocked.clone(),
        };
        self.wal_append(&event).await?;
        self.store.apply_global(&event);
        info!("blocked {date}");
        Ok(blocked)
    }

    pub async fn unblock_date(&self, date: NaiveDate) -> Result<(), EngineError> {
        let _commit = self.begin_commit().await;
        let _registry = self.registry_lock.lock().await;
        if !self.store.is_blocked(&date) {
            return Err(EngineError::Validation(format!("{date} is not blocked")));
        }
        let event = Event::DateUnblocked { date };
        self.wal_append(&event).await?;
        self.store.apply_global(&event);
        info!("unblocked {date}");
        Ok(())
    }

    // ── Reservations ─────────────────────────────────────────

    /// Reserve one specific device. The overlap check runs again under the
    /// device write lock, so of two racing requests exactly one commits.
    pub async fn create_single(
        &self,
        requester_id: Ulid,
        device_id: Ulid,
        span: Span,
        subject: Option<String>,
        professor: Option<String>,
    ) -> Result<Reservation, EngineError> {
        validate_labels(subject.as_deref(), professor.as_deref())?;
        self.validate_window(&span)?;

        let _commit = self.begin_commit().await;
        let ds = self
            .get_device_state(&device_id)
            .ok_or(EngineError::NotFound(device_id))?;
        let mut guard = ds.write().await;
        if let Err(e) = check_no_conflict(&guard, &span) {
            if matches!(e, EngineError::Conflict(_)) {
                metrics::counter!(observability::CONFLICTS_TOTAL).increment(1);
            }
            return Err(e);
        }

        let reservation = Reservation {
            id: Ulid::new(),
            requester_id,
            device_id,
            span,
            subject,
            professor,
            status: ReservationStatus::Pending,
            batch_id: None,
            rating: None,
            feedback: None,
            created_at: self.now_ms(),
        };
        let event = Event::ReservationCreated {
            reservation: reservation.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(observability::RESERVATIONS_CREATED_TOTAL, "mode" => "single").increment(1);
        info!("reservation {} on device {} for requester {requester_id}", reservation.id, device_id);
        Ok(reservation)
    }

    /// Reserve `quantity` distinct devices matching `query` for one window.
    /// All or nothing: either every reservation is journaled as one record or
    /// none is.
    pub async fn create_batch(
        &self,
        requester_id: Ulid,
        quantity: usize,
        query: &CapabilityQuery,
        span: Span,
        subject: Option<String>,
    ) -> Result<Vec<Reservation>, EngineError> {
        if quantity == 0 {
            return Err(EngineError::Validation("quantity must be at least 1".into()));
        }
        if quantity > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("batch too large"));
        }
        validate_labels(subject.as_deref(), None)?;
        self.validate_window(&span)?;

        let _commit = self.begin_commit().await;
        let candidates = self.resolve_available(query, &span).await;
        if candidates.len() < quantity {
            metrics::counter!(observability::CONFLICTS_TOTAL).increment(1);
            return Err(EngineError::Conflict(format!(
                "{quantity} devices requested, {} available",
                candidates.len()
            )));
        }

        // Candidates come back in id order, which is also the lock order.
        let mut guards = Vec::with_capacity(quantity);
        for device in &candidates {
            if guards.len() == quantity {
                break;
            }
            let Some(ds) = self.get_device_state(&device.id) else {
                continue;
            };
            let guard = ds.write_owned().await;
            if device_qualifies(&guard, query, &span) {
                guards.push(guard);
            }
        }
        if guards.len() < quantity {
            metrics::counter!(observability::CONFLICTS_TOTAL).increment(1);
            return Err(EngineError::Conflict(format!(
                "{quantity} devices requested, {} still available",
                guards.len()
            )));
        }

        let batch_id = Ulid::new();
        let now = self.now_ms();
        let professor = self.store.requester(&requester_id).and_then(|r| r.full_name);
        let reservations: Vec<Reservation> = guards
            .iter()
            .map(|g| Reservation {
                id: Ulid::new(),
                requester_id,
                device_id: g.device.id,
                span,
                subject: subject.clone(),
                professor: professor.clone(),
                status: ReservationStatus::Pending,
                batch_id: Some(batch_id),
                rating: None,
                feedback: None,
                created_at: now,
            })
            .collect();

        let event = Event::BatchCreated {
            batch_id,
            reservations: reservations.clone(),
        };
        self.wal_append(&event).await?;
        for guard in guards.iter_mut() {
            self.store.apply_to_device(guard, &event);
        }
        metrics::counter!(observability::RESERVATIONS_CREATED_TOTAL, "mode" => "batch")
            .increment(reservations.len() as u64);
        info!("batch {batch_id}: {quantity} devices for requester {requester_id}");
        Ok(reservations)
    }

    /// Move a reservation through the state machine, applying the paired
    /// device status in the same journal record.
    pub async fn transition_status(
        &self,
        id: Ulid,
        new_status: ReservationStatus,
    ) -> Result<Reservation, EngineError> {
        self.commit_transition(id, new_status, false)
            .await
            .map(|(updated, _)| updated)
    }

    /// Move an ended `Active` reservation to `Overdue` and sanction its
    /// requester in the same journal record. The flag is `true` when the
    /// sanction is new.
    pub async fn mark_overdue(&self, id: Ulid) -> Result<(Reservation, bool), EngineError> {
        self.commit_transition(id, ReservationStatus::Overdue, true)
            .await
    }

    async fn commit_transition(
        &self,
        id: Ulid,
        new_status: ReservationStatus,
        sanction: bool,
    ) -> Result<(Reservation, bool), EngineError> {
        let _commit = self.begin_commit().await;
        let mut guard = self.resolve_reservation_write(&id).await?;
        let current = guard
            .reservation(&id)
            .ok_or(EngineError::NotFound(id))?;
        check_transition(current.status, new_status)?;
        if new_status == ReservationStatus::Overdue && current.span.end > self.now_ms() {
            return Err(EngineError::InvalidState(format!(
                "reservation {id} has not ended yet"
            )));
        }
        let requester_id = current.requester_id;
        let sanction = (sanction
            && !self
                .store
                .requester(&requester_id)
                .is_some_and(|r| r.sanctioned))
        .then_some(requester_id);

        let event = Event::StatusChanged {
            id,
            device_id: guard.device.id,
            status: new_status,
            device_status: paired_device_status(&guard, &id, new_status),
            sanction,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        let updated = guard
            .reservation(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        let device = guard.device.clone();
        drop(guard);

        if new_status.is_terminal() {
            self.reminded.remove(&id);
        }
        metrics::counter!(observability::TRANSITIONS_TOTAL, "to" => status_label(new_status))
            .increment(1);
        info!("reservation {id} -> {new_status}");
        if sanction.is_some() {
            info!("requester {requester_id} sanctioned for {id}");
        }
        if let Some(kind) = notification_kind(new_status) {
            let requester = self.store.requester(&updated.requester_id);
            self.enqueue(Notification {
                kind,
                recipient: Recipient::requester(updated.requester_id, requester.as_ref()),
                payload: Payload::reservation(
                    &updated,
                    &device,
                    kind == NotificationKind::ReservationConfirmed,
                ),
            });
        }
        Ok((updated, sanction.is_some()))
    }

    /// Attach the one-time rating and comment, then re-evaluate the device's
    /// mean rating. A low mean pulls the device into maintenance.
    pub async fn submit_feedback(
        &self,
        id: Ulid,
        rating: i32,
        text: Option<String>,
    ) -> Result<Reservation, EngineError> {
        let rating = u8::try_from(rating)
            .ok()
            .filter(|r| quality::rating_in_range(*r))
            .ok_or_else(|| {
                EngineError::Validation(format!(
                    "rating {rating} outside {}..={}",
                    quality::MIN_RATING,
                    quality::MAX_RATING
                ))
            })?;
        if text.as_ref().is_some_and(|t| t.len() > MAX_FEEDBACK_LEN) {
            return Err(EngineError::LimitExceeded("feedback too long"));
        }

        let _commit = self.begin_commit().await;
        let mut guard = self.resolve_reservation_write(&id).await?;
        let current = guard
            .reservation(&id)
            .ok_or(EngineError::NotFound(id))?;
        if current.rating.is_some() {
            return Err(EngineError::InvalidState(format!(
                "feedback already submitted for {id}"
            )));
        }

        let mean = quality::mean_rating(guard.ratings().chain(std::iter::once(rating)));
        let device_status = quality::evaluate(mean, guard.device.status);
        let event = Event::FeedbackRecorded {
            id,
            device_id: guard.device.id,
            rating,
            feedback: text,
            device_status,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        let updated = guard
            .reservation(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;

        if device_status.is_some() {
            metrics::counter!(observability::MAINTENANCE_FLAGGED_TOTAL).increment(1);
            warn!(
                "device {} flagged for maintenance, mean rating {:.2}",
                guard.device.serial_number,
                mean.unwrap_or_default()
            );
            self.enqueue(Notification {
                kind: NotificationKind::MaintenanceAlert,
                recipient: Recipient::admin(self.admin_email()),
                payload: Payload::device(&guard.device, mean),
            });
        }
        Ok(updated)
    }

    // ── Incidents ────────────────────────────────────────────

    /// Record a fault on a device. A high-severity incident takes the device
    /// out of service until it is resolved.
    pub async fn report_incident(
        &self,
        device_id: Ulid,
        severity: IncidentSeverity,
        description: &str,
    ) -> Result<Incident, EngineError> {
        let description = description.trim();
        if description.is_empty() {
            return Err(EngineError::Validation("incident description is required".into()));
        }
        if description.len() > MAX_INCIDENT_LEN {
            return Err(EngineError::LimitExceeded("incident description too long"));
        }

        let _commit = self.begin_commit().await;
        let ds = self
            .get_device_state(&device_id)
            .ok_or(EngineError::NotFound(device_id))?;
        let mut guard = ds.write().await;
        if guard.incidents.len() >= MAX_INCIDENTS_PER_DEVICE {
            return Err(EngineError::LimitExceeded("too many incidents on device"));
        }
        let device_status = (severity == IncidentSeverity::High
            && !matches!(
                guard.device.status,
                DeviceStatus::InRepair | DeviceStatus::Inactive
            ))
        .then_some(DeviceStatus::InRepair);

        let incident = Incident {
            id: Ulid::new(),
            device_id,
            severity,
            description: description.to_string(),
            reported_at: self.now_ms(),
            resolved_at: None,
        };
        let event = Event::IncidentReported {
            incident: incident.clone(),
            device_status,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(observability::INCIDENTS_REPORTED_TOTAL, "severity" => severity_label(severity))
            .increment(1);
        info!("incident {} ({severity}) on device {}", incident.id, guard.device.serial_number);

        if device_status.is_some() {
            warn!("device {} taken out of service for repair", guard.device.serial_number);
            self.enqueue(Notification {
                kind: NotificationKind::MaintenanceAlert,
                recipient: Recipient::admin(self.admin_email()),
                payload: Payload::device(&guard.device, quality::mean_rating(guard.ratings())),
            });
        }
        Ok(incident)
    }

    /// Close an incident and put the device back into service, `InUse` if a
    /// reservation is still out on loan. A retired device, or one with
    /// another open high-severity incident, stays as it is.
    pub async fn resolve_incident(&self, id: Ulid) -> Result<Incident, EngineError> {
        let _commit = self.begin_commit().await;
        let device_id = self
            .store
            .device_for_incident(&id)
            .ok_or(EngineError::NotFound(id))?;
        let ds = self
            .get_device_state(&device_id)
            .ok_or(EngineError::NotFound(device_id))?;
        let mut guard = ds.write().await;
        let incident = guard.incident(&id).ok_or(EngineError::NotFound(id))?;
        if !incident.is_open() {
            return Err(EngineError::InvalidState(format!(
                "incident {id} already resolved"
            )));
        }

        let event = Event::IncidentResolved {
            id,
            device_id,
            resolved_at: self.now_ms(),
            device_status: restored_status(&guard, &id),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(observability::INCIDENTS_RESOLVED_TOTAL).increment(1);
        info!(
            "incident {id} resolved, device {} is {}",
            guard.device.serial_number, guard.device.status
        );
        guard.incident(&id).cloned().ok_or(EngineError::NotFound(id))
    }
}
