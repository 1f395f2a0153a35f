//! Domain types for the notification service.
//!
//! Alarm records, device-type classification, display colors and
//! escalation events.

mod types;

pub use types::{
    AlarmRecord, DeviceKind, DeviceRole, EscalationEvent, EscalationStatus, GridPoint, LineColor,
    ThresholdId,
};
