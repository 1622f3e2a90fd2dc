use crate::model::Ms;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

pub const MAX_DEVICES: usize = 100_000;
pub const MAX_RESERVATIONS_PER_DEVICE: usize = 100_000;
pub const MAX_BATCH_SIZE: usize = 200;

pub const MAX_SERIAL_LEN: usize = 128;
pub const MAX_MODEL_LEN: usize = 256;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_CAPABILITIES: usize = 64;
pub const MAX_LABEL_LEN: usize = 512;
pub const MAX_FEEDBACK_LEN: usize = 1000;
pub const MAX_REASON_LEN: usize = 512;
pub const MAX_INCIDENT_LEN: usize = 1000;
pub const MAX_INCIDENTS_PER_DEVICE: usize = 10_000;
