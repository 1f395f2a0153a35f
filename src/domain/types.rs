use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Device-type classification of a monitored entity.
///
/// Resolved once when an alarm is ingested, from the entity directory's
/// device-type string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    /// Wearable panic button
    PanicButton,
    /// Location tracker
    Tracker,
    /// Anything the directory does not classify
    Unknown,
}

impl DeviceKind {
    /// Classify from the directory's device-type string by prefix.
    pub fn from_type_str(device_type: &str) -> Self {
        if device_type.starts_with("PB") {
            DeviceKind::PanicButton
        } else if device_type.starts_with("Tracker") {
            DeviceKind::Tracker
        } else {
            DeviceKind::Unknown
        }
    }

    /// Which escalation threshold/destination bucket applies.
    ///
    /// Panic buttons have their own bucket; everything else escalates on
    /// the tracker schedule.
    pub fn escalation_threshold(self) -> ThresholdId {
        match self {
            DeviceKind::PanicButton => ThresholdId::PanicButton,
            _ => ThresholdId::Tracker,
        }
    }
}

/// Capabilities of one roster device.
///
/// Current hardware combines an LCD and a buzzer in one unit, but the
/// roster model allows either half to stand alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRole {
    Display,
    Buzzer,
    Both,
}

impl DeviceRole {
    pub fn has_display(self) -> bool {
        matches!(self, DeviceRole::Display | DeviceRole::Both)
    }

    pub fn has_buzzer(self) -> bool {
        matches!(self, DeviceRole::Buzzer | DeviceRole::Both)
    }
}

/// Escalation threshold identifier, one per device-type bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThresholdId {
    PanicButton,
    Tracker,
}

/// Grid coordinates reported by the location model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridPoint {
    pub x: f64,
    pub y: f64,
}

impl GridPoint {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Beacon lookup key, coordinates normalized to two decimal places.
    pub fn beacon_key(&self) -> String {
        format!("({:.2}, {:.2})", self.x, self.y)
    }
}

/// One currently active alarm.
///
/// Presence of a record in the alarm set store is the sole source of
/// truth for "currently in alarm".
#[derive(Debug, Clone)]
pub struct AlarmRecord {
    /// Opaque identifier of the alarmed entity
    pub id: String,
    /// Device-type classification, resolved at ingestion
    pub kind: DeviceKind,
    /// Last reported grid location, absent for panic buttons
    pub location: Option<GridPoint>,
    /// When this alarm was first seen by the subscriber
    pub first_seen: Instant,
}

impl AlarmRecord {
    pub fn new(id: String, kind: DeviceKind, location: Option<GridPoint>) -> Self {
        Self {
            id,
            kind,
            location,
            first_seen: Instant::now(),
        }
    }
}

/// Annunciator line color codes as written to the color registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LineColor {
    Red,
    Green,
    Yellow,
}

impl LineColor {
    /// Register value for this color.
    pub fn code(self) -> u16 {
        match self {
            LineColor::Red => 1,
            LineColor::Green => 2,
            LineColor::Yellow => 3,
        }
    }

    /// Color for an alarm that has been active for `elapsed`.
    pub fn for_duration(elapsed: Duration, green_secs: f64, yellow_secs: f64) -> Self {
        let secs = elapsed.as_secs_f64();
        if secs < green_secs {
            LineColor::Green
        } else if secs < yellow_secs {
            LineColor::Yellow
        } else {
            LineColor::Red
        }
    }
}

/// Escalation lifecycle of one alarm episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EscalationStatus {
    Triggered,
    Cleared,
}

/// Outbound message for the SMS gateway topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationEvent {
    pub j_code: String,
    pub label: String,
    pub status: EscalationStatus,
    pub device_type: String,
    pub sms_destination_pb: Vec<String>,
    pub sms_destination_tracker: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_kind_classification() {
        assert_eq!(DeviceKind::from_type_str("PB"), DeviceKind::PanicButton);
        assert_eq!(DeviceKind::from_type_str("PB_v2"), DeviceKind::PanicButton);
        assert_eq!(DeviceKind::from_type_str("TrackerD"), DeviceKind::Tracker);
        assert_eq!(DeviceKind::from_type_str("annunciator"), DeviceKind::Unknown);
        assert_eq!(DeviceKind::from_type_str(""), DeviceKind::Unknown);
    }

    #[test]
    fn test_unknown_kind_escalates_as_tracker() {
        assert_eq!(
            DeviceKind::Unknown.escalation_threshold(),
            ThresholdId::Tracker
        );
        assert_eq!(
            DeviceKind::PanicButton.escalation_threshold(),
            ThresholdId::PanicButton
        );
    }

    #[test]
    fn test_color_thresholds() {
        let green = 30.0;
        let yellow = 60.0;
        assert_eq!(
            LineColor::for_duration(Duration::from_secs(0), green, yellow),
            LineColor::Green
        );
        assert_eq!(
            LineColor::for_duration(Duration::from_secs(29), green, yellow),
            LineColor::Green
        );
        assert_eq!(
            LineColor::for_duration(Duration::from_secs(30), green, yellow),
            LineColor::Yellow
        );
        assert_eq!(
            LineColor::for_duration(Duration::from_secs(61), green, yellow),
            LineColor::Red
        );
    }

    #[test]
    fn test_beacon_key_normalization() {
        let point = GridPoint::new(1.0, 2.345);
        assert_eq!(point.beacon_key(), "(1.00, 2.35)");
    }

    #[test]
    fn test_escalation_event_wire_format() {
        let event = EscalationEvent {
            j_code: "J001".to_string(),
            label: "cow1".to_string(),
            status: EscalationStatus::Cleared,
            device_type: "TrackerD".to_string(),
            sms_destination_pb: vec!["0456888156".to_string()],
            sms_destination_tracker: vec!["0456888156".to_string()],
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["j_code"], "J001");
        assert_eq!(json["status"], "cleared");
        assert!(json["sms_destination_pb"].is_array());
    }
}
