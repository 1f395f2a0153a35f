//! SMS escalation for alarms that stay active past their threshold.
//!
//! Each alarm escalates at most once per threshold; clearing the alarm
//! resets its state, so a re-raise starts a fresh countdown. Alarms from
//! devices sitting on a charging station are exempt.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::domain::{AlarmRecord, EscalationEvent, EscalationStatus, ThresholdId};
use crate::error::Result;
use crate::services::config_cache::ConfigSnapshot;

/// Sink for escalation events (the SMS gateway topic in production).
#[async_trait]
pub trait EscalationPublisher: Send + Sync {
    async fn publish(&self, event: &EscalationEvent) -> Result<()>;
}

struct EscalationState {
    started_at: Instant,
    fired: HashSet<ThresholdId>,
}

/// Tracks per-alarm escalation state across control-loop ticks.
#[derive(Default)]
pub struct EscalationTracker {
    states: HashMap<String, EscalationState>,
}

impl EscalationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconcile against the current alarm set and fire due escalations.
    pub async fn process(
        &mut self,
        snapshot: &[AlarmRecord],
        cfg: &ConfigSnapshot,
        now: Instant,
        publisher: &dyn EscalationPublisher,
    ) {
        // alarms that cleared since the last tick
        let gone: Vec<String> = self
            .states
            .keys()
            .filter(|id| snapshot.iter().all(|r| &r.id != *id))
            .cloned()
            .collect();
        for id in gone {
            if let Some(state) = self.states.remove(&id) {
                if !state.fired.is_empty() {
                    let event = build_event(&id, cfg, EscalationStatus::Cleared);
                    info!("alarm {} cleared after escalation, notifying", id);
                    if let Err(e) = publisher.publish(&event).await {
                        warn!("failed to publish clear notification for {}: {}", id, e);
                    }
                }
            }
        }

        for record in snapshot {
            let state = self
                .states
                .entry(record.id.clone())
                .or_insert_with(|| EscalationState {
                    started_at: record.first_seen,
                    fired: HashSet::new(),
                });

            let threshold = record.kind.escalation_threshold();
            if state.fired.contains(&threshold) {
                continue;
            }
            let limit = match threshold {
                ThresholdId::PanicButton => cfg.site.sms_pb_secs,
                ThresholdId::Tracker => cfg.site.sms_tracker_secs,
            };
            if now.duration_since(state.started_at).as_secs_f64() < limit {
                continue;
            }
            if on_charging_station(record, cfg) {
                continue;
            }

            let event = build_event(&record.id, cfg, EscalationStatus::Triggered);
            info!(
                "alarm {} active past {:?} threshold, escalating to SMS",
                record.id, threshold
            );
            if let Err(e) = publisher.publish(&event).await {
                warn!("failed to publish escalation for {}: {}", record.id, e);
            }
            // marked fired even on publish failure: one SMS per threshold
            state.fired.insert(threshold);
        }
    }
}

/// Tracker alarms raised from a charging station do not escalate.
fn on_charging_station(record: &AlarmRecord, cfg: &ConfigSnapshot) -> bool {
    let point = match &record.location {
        Some(point) => point,
        None => return false,
    };
    match cfg.area_for(point) {
        Some(area) => {
            let normalized: String = area
                .chars()
                .filter(|c| !c.is_whitespace())
                .collect::<String>()
                .to_ascii_lowercase();
            normalized == "chargingstation"
        }
        None => false,
    }
}

fn build_event(id: &str, cfg: &ConfigSnapshot, status: EscalationStatus) -> EscalationEvent {
    let entity = cfg.entity(id);
    EscalationEvent {
        j_code: id.to_string(),
        label: entity.label,
        status,
        device_type: entity.device_type,
        sms_destination_pb: cfg.site.sms_destination_pb.clone(),
        sms_destination_tracker: cfg.site.sms_destination_tracker.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DeviceKind, GridPoint};
    use crate::services::config_cache::{EntityInfo, RosterEntry, SiteConfig};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingPublisher {
        events: Mutex<Vec<EscalationEvent>>,
        fail: Mutex<bool>,
    }

    #[async_trait]
    impl EscalationPublisher for RecordingPublisher {
        async fn publish(&self, event: &EscalationEvent) -> Result<()> {
            if *self.fail.lock().unwrap() {
                return Err(crate::error::NotifError::Bus("down".to_string()));
            }
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    fn snapshot_with(beacons: &[((f64, f64), &str)]) -> ConfigSnapshot {
        let mut entities = HashMap::new();
        entities.insert(
            "J001".to_string(),
            EntityInfo {
                label: "cow1".to_string(),
                holder: "Daisy".to_string(),
                device_type: "TrackerD".to_string(),
            },
        );
        entities.insert(
            "J002".to_string(),
            EntityInfo {
                label: "nurse call 2".to_string(),
                holder: "Ward 2".to_string(),
                device_type: "PB".to_string(),
            },
        );
        let beacon_areas: HashMap<String, String> = beacons
            .iter()
            .map(|((x, y), area)| (GridPoint::new(*x, *y).beacon_key(), area.to_string()))
            .collect();
        ConfigSnapshot {
            site: Arc::new(SiteConfig {
                sms_pb_secs: 900.0,
                sms_tracker_secs: 300.0,
                ..SiteConfig::default()
            }),
            roster: Arc::new(Vec::<RosterEntry>::new()),
            entities: Arc::new(entities),
            beacon_areas: Arc::new(beacon_areas),
            version: 1,
        }
    }

    fn aged(id: &str, kind: DeviceKind, location: Option<GridPoint>, age: Duration, now: Instant) -> AlarmRecord {
        let mut record = AlarmRecord::new(id.to_string(), kind, location);
        record.first_seen = now - age;
        record
    }

    #[tokio::test]
    async fn test_escalates_once_past_threshold() {
        let cfg = snapshot_with(&[]);
        let publisher = RecordingPublisher::default();
        let mut tracker = EscalationTracker::new();
        let now = Instant::now() + Duration::from_secs(3600);

        let fresh = vec![aged(
            "J001",
            DeviceKind::Tracker,
            Some(GridPoint::new(1.0, 1.0)),
            Duration::from_secs(10),
            now,
        )];
        tracker.process(&fresh, &cfg, now, &publisher).await;
        assert!(publisher.events.lock().unwrap().is_empty());

        let stale = vec![aged(
            "J001",
            DeviceKind::Tracker,
            Some(GridPoint::new(1.0, 1.0)),
            Duration::from_secs(301),
            now,
        )];
        tracker.process(&stale, &cfg, now, &publisher).await;
        tracker.process(&stale, &cfg, now, &publisher).await;

        let events = publisher.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].j_code, "J001");
        assert_eq!(events[0].label, "cow1");
        assert_eq!(events[0].status, EscalationStatus::Triggered);
    }

    #[tokio::test]
    async fn test_panic_button_uses_its_own_threshold() {
        let cfg = snapshot_with(&[]);
        let publisher = RecordingPublisher::default();
        let mut tracker = EscalationTracker::new();
        let now = Instant::now() + Duration::from_secs(3600);

        // past tracker threshold but not the PB one
        let records = vec![aged(
            "J002",
            DeviceKind::PanicButton,
            None,
            Duration::from_secs(400),
            now,
        )];
        tracker.process(&records, &cfg, now, &publisher).await;
        assert!(publisher.events.lock().unwrap().is_empty());

        let records = vec![aged(
            "J002",
            DeviceKind::PanicButton,
            None,
            Duration::from_secs(901),
            now,
        )];
        tracker.process(&records, &cfg, now, &publisher).await;
        assert_eq!(publisher.events.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_charging_station_is_exempt() {
        let cfg = snapshot_with(&[((1.0, 1.0), "Charging Station"), ((2.0, 2.0), "Paddock A")]);
        let publisher = RecordingPublisher::default();
        let mut tracker = EscalationTracker::new();
        let now = Instant::now() + Duration::from_secs(3600);

        let records = vec![
            aged(
                "J001",
                DeviceKind::Tracker,
                Some(GridPoint::new(1.0, 1.0)),
                Duration::from_secs(400),
                now,
            ),
            aged(
                "J002",
                DeviceKind::Tracker,
                Some(GridPoint::new(2.0, 2.0)),
                Duration::from_secs(400),
                now,
            ),
        ];
        tracker.process(&records, &cfg, now, &publisher).await;

        let events = publisher.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].j_code, "J002");
    }

    #[tokio::test]
    async fn test_clear_after_escalation_publishes_and_resets() {
        let cfg = snapshot_with(&[]);
        let publisher = RecordingPublisher::default();
        let mut tracker = EscalationTracker::new();
        let now = Instant::now() + Duration::from_secs(3600);

        let stale = vec![aged(
            "J001",
            DeviceKind::Tracker,
            None,
            Duration::from_secs(301),
            now,
        )];
        tracker.process(&stale, &cfg, now, &publisher).await;
        tracker.process(&[], &cfg, now, &publisher).await;

        {
            let events = publisher.events.lock().unwrap();
            assert_eq!(events.len(), 2);
            assert_eq!(events[1].status, EscalationStatus::Cleared);
        }

        // re-raise: fresh countdown, escalates again once due
        let fresh = vec![aged(
            "J001",
            DeviceKind::Tracker,
            None,
            Duration::from_secs(1),
            now,
        )];
        tracker.process(&fresh, &cfg, now, &publisher).await;
        assert_eq!(publisher.events.lock().unwrap().len(), 2);

        tracker.process(&stale, &cfg, now, &publisher).await;
        assert_eq!(publisher.events.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_clear_without_escalation_is_silent() {
        let cfg = snapshot_with(&[]);
        let publisher = RecordingPublisher::default();
        let mut tracker = EscalationTracker::new();
        let now = Instant::now() + Duration::from_secs(3600);

        let fresh = vec![aged(
            "J001",
            DeviceKind::Tracker,
            None,
            Duration::from_secs(5),
            now,
        )];
        tracker.process(&fresh, &cfg, now, &publisher).await;
        tracker.process(&[], &cfg, now, &publisher).await;
        assert!(publisher.events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_publish_failure_still_marks_fired() {
        let cfg = snapshot_with(&[]);
        let publisher = RecordingPublisher::default();
        *publisher.fail.lock().unwrap() = true;
        let mut tracker = EscalationTracker::new();
        let now = Instant::now() + Duration::from_secs(3600);

        let stale = vec![aged(
            "J001",
            DeviceKind::Tracker,
            None,
            Duration::from_secs(301),
            now,
        )];
        tracker.process(&stale, &cfg, now, &publisher).await;

        *publisher.fail.lock().unwrap() = false;
        tracker.process(&stale, &cfg, now, &publisher).await;
        assert!(publisher.events.lock().unwrap().is_empty());
    }
}
