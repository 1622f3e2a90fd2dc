use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn validate_labels(subject: Option<&str>, professor: Option<&str>) -> Result<(), EngineError> {
    if subject.is_some_and(|s| s.len() > MAX_LABEL_LEN) {
        return Err(EngineError::LimitExceeded("subject too long"));
    }
    if professor.is_some_and(|p| p.len() > MAX_LABEL_LEN) {
        return Err(EngineError::LimitExceeded("professor too long"));
    }
    Ok(())
}

/// Write-time exclusivity check, run under the device write lock right before
/// the reservation is journaled.
pub(crate) fn check_no_conflict(ds: &DeviceState, span: &Span) -> Result<(), EngineError> {
    if ds.device.status.is_out_of_service() {
        return Err(EngineError::Conflict(format!(
            "device {} is {}",
            ds.device.serial_number, ds.device.status
        )));
    }
    if ds.reservations.len() >= MAX_RESERVATIONS_PER_DEVICE {
        return Err(EngineError::LimitExceeded("too many reservations on device"));
    }
    if let Some(existing) = ds.holding(span).next() {
        return Err(EngineError::Conflict(format!(
            "device {} already reserved by {} ({}) for [{}, {})",
            ds.device.serial_number,
            existing.id,
            existing.status,
            existing.span.start,
            existing.span.end
        )));
    }
    Ok(())
}
