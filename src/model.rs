use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Build a span without the ordering assertion; the validator rejects
    /// inverted windows with a proper error instead of a panic.
    pub fn unchecked(start: Ms, end: Ms) -> Self {
        Self { start, end }
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

// ── Devices ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceStatus {
    Available,
    InUse,
    Inactive,
    InRepair,
    MaintenanceRequired,
}

impl DeviceStatus {
    /// Out-of-service devices cannot take new reservations.
    pub fn is_out_of_service(self) -> bool {
        matches!(
            self,
            DeviceStatus::Inactive | DeviceStatus::InRepair | DeviceStatus::MaintenanceRequired
        )
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceStatus::Available => "AVAILABLE",
            DeviceStatus::InUse => "IN_USE",
            DeviceStatus::Inactive => "INACTIVE",
            DeviceStatus::InRepair => "IN_REPAIR",
            DeviceStatus::MaintenanceRequired => "MAINTENANCE_REQUIRED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: Ulid,
    pub serial_number: String,
    pub model: String,
    /// Normalised capability names, see [`normalize_capabilities`].
    pub capabilities: Vec<String>,
    pub status: DeviceStatus,
}

impl Device {
    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.iter().any(|c| c.eq_ignore_ascii_case(name))
    }
}

/// Trim, drop blanks and de-duplicate case-insensitively, keeping the first spelling.
pub fn normalize_capabilities<I, S>(names: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = Vec::new();
    for name in names {
        let trimmed = name.as_ref().trim();
        if trimmed.is_empty() || out.iter().any(|c| c.eq_ignore_ascii_case(trimmed)) {
            continue;
        }
        out.push(trimmed.to_string());
    }
    out
}

/// Capability filter for availability search. Only unrestricted and match-all
/// are supported.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CapabilityQuery {
    #[default]
    Any,
    All(Vec<String>),
}

impl CapabilityQuery {
    /// Parse a comma-separated list. Blank input or `any` means unrestricted.
    pub fn parse(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("any") {
            return CapabilityQuery::Any;
        }
        Self::all(raw.split(','))
    }

    pub fn all<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let names = normalize_capabilities(names);
        if names.is_empty() {
            CapabilityQuery::Any
        } else {
            CapabilityQuery::All(names)
        }
    }

    pub fn matches(&self, device: &Device) -> bool {
        match self {
            CapabilityQuery::Any => true,
            CapabilityQuery::All(names) => names.iter().all(|n| device.has_capability(n)),
        }
    }
}

// ── Reservations ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    Pending,
    Approved,
    Active,
    Completed,
    Rejected,
    Cancelled,
    Overdue,
}

impl ReservationStatus {
    /// Statuses that hold the device for their window.
    pub fn holds_device(self) -> bool {
        matches!(
            self,
            ReservationStatus::Pending | ReservationStatus::Approved | ReservationStatus::Active
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ReservationStatus::Completed
                | ReservationStatus::Rejected
                | ReservationStatus::Cancelled
                | ReservationStatus::Overdue
        )
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReservationStatus::Pending => "PENDING",
            ReservationStatus::Approved => "APPROVED",
            ReservationStatus::Active => "ACTIVE",
            ReservationStatus::Completed => "COMPLETED",
            ReservationStatus::Rejected => "REJECTED",
            ReservationStatus::Cancelled => "CANCELLED",
            ReservationStatus::Overdue => "OVERDUE",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub requester_id: Ulid,
    pub device_id: Ulid,
    pub span: Span,
    pub subject: Option<String>,
    pub professor: Option<String>,
    pub status: ReservationStatus,
    pub batch_id: Option<Ulid>,
    pub rating: Option<u8>,
    pub feedback: Option<String>,
    pub created_at: Ms,
}

impl Reservation {
    /// Code shown at the pickup desk. Batch members share the batch code.
    pub fn pickup_code(&self) -> String {
        format!("RES-{}", self.batch_id.unwrap_or(self.id))
    }
}

// ── Requesters & calendar ────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requester {
    pub id: Ulid,
    pub full_name: Option<String>,
    pub email: Option<String>,
    pub sanctioned: bool,
}

impl Requester {
    pub fn bare(id: Ulid) -> Self {
        Self {
            id,
            full_name: None,
            email: None,
            sanctioned: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedDate {
    pub date: NaiveDate,
    pub reason: Option<String>,
}

// ── Incidents ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IncidentSeverity {
    Low,
    Medium,
    /// Takes the device out of service until resolved.
    High,
}

impl fmt::Display for IncidentSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IncidentSeverity::Low => "LOW",
            IncidentSeverity::Medium => "MEDIUM",
            IncidentSeverity::High => "HIGH",
        };
        f.write_str(s)
    }
}

/// A reported fault on a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Incident {
    pub id: Ulid,
    pub device_id: Ulid,
    pub severity: IncidentSeverity,
    pub description: String,
    pub reported_at: Ms,
    pub resolved_at: Option<Ms>,
}

impl Incident {
    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }
}

// ── Per-device state ─────────────────────────────────────────────

/// A device together with every reservation ever made against it.
#[derive(Debug, Clone)]
pub struct DeviceState {
    pub device: Device,
    /// Sorted by `span.start`.
    pub reservations: Vec<Reservation>,
    /// In report order.
    pub incidents: Vec<Incident>,
}

impl DeviceState {
    pub fn new(device: Device) -> Self {
        Self {
            device,
            reservations: Vec::new(),
            incidents: Vec::new(),
        }
    }

    /// Insert reservation maintaining sort order by span.start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .partition_point(|r| r.span.start <= reservation.span.start);
        self.reservations.insert(pos, reservation);
    }

    pub fn reservation(&self, id: &Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == *id)
    }

    pub fn reservation_mut(&mut self, id: &Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == *id)
    }

    /// Reservations whose span overlaps the query window.
    /// Uses binary search to skip reservations starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.span.end > query.start)
    }

    /// Reservations that currently hold the device and overlap `query`.
    pub fn holding(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        self.overlapping(query).filter(|r| r.status.holds_device())
    }

    pub fn ratings(&self) -> impl Iterator<Item = u8> + '_ {
        self.reservations.iter().filter_map(|r| r.rating)
    }

    /// Whether a reservation other than `except` is out on loan.
    pub fn has_active_besides(&self, except: &Ulid) -> bool {
        self.reservations
            .iter()
            .any(|r| r.id != *except && r.status == ReservationStatus::Active)
    }

    pub fn incident(&self, id: &Ulid) -> Option<&Incident> {
        self.incidents.iter().find(|i| i.id == *id)
    }

    pub fn incident_mut(&mut self, id: &Ulid) -> Option<&mut Incident> {
        self.incidents.iter_mut().find(|i| i.id == *id)
    }

    /// Whether an unresolved high-severity incident other than `except` is open.
    pub fn has_open_severe_besides(&self, except: &Ulid) -> bool {
        self.incidents
            .iter()
            .any(|i| i.id != *except && i.is_open() && i.severity == IncidentSeverity::High)
    }
}

/// Journal record format. One record is one atomic unit: everything a single
/// operation changes travels together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    DeviceRegistered {
        device: Device,
    },
    RequesterRegistered {
        requester: Requester,
    },
    RequesterSanctioned {
        id: Ulid,
    },
    DateBlocked {
        blocked: BlockedDate,
    },
    DateUnblocked {
        date: NaiveDate,
    },
    ReservationCreated {
        reservation: Reservation,
    },
    BatchCreated {
        batch_id: Ulid,
        reservations: Vec<Reservation>,
    },
    StatusChanged {
        id: Ulid,
        device_id: Ulid,
        status: ReservationStatus,
        device_status: Option<DeviceStatus>,
        /// Requester sanctioned in the same commit (overdue sweep).
        sanction: Option<Ulid>,
    },
    FeedbackRecorded {
        id: Ulid,
        device_id: Ulid,
        rating: u8,
        feedback: Option<String>,
        device_status: Option<DeviceStatus>,
    },
    IncidentReported {
        incident: Incident,
        device_status: Option<DeviceStatus>,
    },
    IncidentResolved {
        id: Ulid,
        device_id: Ulid,
        resolved_at: Ms,
        device_status: Option<DeviceStatus>,
    },
}

// ── Query types ──────────────────────────────────────────────────

/// Optional filters for [`crate::engine::Engine::list_reservations`]. Unset
/// fields match everything.
#[derive(Debug, Clone, Default)]
pub struct ReservationFilter {
    pub status: Option<ReservationStatus>,
    /// Reservation must start at or after this instant.
    pub start_from: Option<Ms>,
    /// Reservation must end at or before this instant.
    pub end_until: Option<Ms>,
    pub requester_id: Option<Ulid>,
    pub device_id: Option<Ulid>,
    /// Case-insensitive substring of the professor field.
    pub professor: Option<String>,
}

impl ReservationFilter {
    pub fn matches(&self, r: &Reservation) -> bool {
        if self.status.is_some_and(|s| s != r.status) {
            return false;
        }
        if self.start_from.is_some_and(|t| r.span.start < t) {
            return false;
        }
        if self.end_until.is_some_and(|t| r.span.end > t) {
            return false;
        }
        if self.requester_id.is_some_and(|id| id != r.requester_id) {
            return false;
        }
        if self.device_id.is_some_and(|id| id != r.device_id) {
            return false;
        }
        if let Some(ref needle) = self.professor {
            let needle = needle.to_lowercase();
            match &r.professor {
                Some(p) if p.to_lowercase().contains(&needle) => {}
                _ => return false,
            }
        }
        true
    }
}
