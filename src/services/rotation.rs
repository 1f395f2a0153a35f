//! Display state machine: idle page vs round-robin alarm rotation.
//!
//! Driven once per control-loop tick with the current alarm snapshot.
//! With several alarms active, one is shown at a time and the view
//! advances every scroll interval; a change in the alarm set repaints
//! immediately instead of waiting the interval out.

use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::domain::{AlarmRecord, DeviceKind, LineColor};
use crate::services::config_cache::ConfigSnapshot;
use crate::services::fleet::DeviceFleetController;

/// How often the idle page (wall clock) is re-asserted.
const IDLE_REFRESH: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DisplayState {
    Idle,
    Alarm,
}

/// Per-tick scheduler for the fleet's display content.
pub struct DisplayRotationScheduler {
    state: DisplayState,
    rotation_index: usize,
    /// Labels of the last rendered alarm set, for change detection
    last_labels: Vec<String>,
    last_page_push: Option<Instant>,
    last_idle_refresh: Option<Instant>,
}

impl Default for DisplayRotationScheduler {
    fn default() -> Self {
        Self {
            state: DisplayState::Idle,
            rotation_index: 0,
            last_labels: Vec::new(),
            last_page_push: None,
            last_idle_refresh: None,
        }
    }
}

impl DisplayRotationScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn tick(
        &mut self,
        snapshot: &[AlarmRecord],
        cfg: &ConfigSnapshot,
        now: Instant,
        fleet: &DeviceFleetController,
    ) {
        if snapshot.is_empty() {
            self.tick_idle(cfg, now, fleet).await;
        } else {
            self.tick_alarm(snapshot, cfg, now, fleet).await;
        }
    }

    async fn tick_idle(&mut self, cfg: &ConfigSnapshot, now: Instant, fleet: &DeviceFleetController) {
        if self.state == DisplayState::Alarm {
            info!("alarm set empty, returning fleet to idle page");
            self.state = DisplayState::Idle;
            self.rotation_index = 0;
            self.last_labels.clear();
            self.last_page_push = None;
            self.last_idle_refresh = None;
            fleet.set_buzzer_all(false).await;
            fleet.clear_alarm_page_all().await;
            fleet.show_idle_page_all(&cfg.site.static_title).await;
            self.last_idle_refresh = Some(now);
            return;
        }

        // periodic re-assert keeps the clock current and repaints
        // devices that came back online
        let due = match self.last_idle_refresh {
            Some(last) => now.duration_since(last) >= IDLE_REFRESH,
            None => true,
        };
        if due {
            fleet.set_buzzer_all(false).await;
            fleet.show_idle_page_all(&cfg.site.static_title).await;
            self.last_idle_refresh = Some(now);
        }
    }

    async fn tick_alarm(
        &mut self,
        snapshot: &[AlarmRecord],
        cfg: &ConfigSnapshot,
        now: Instant,
        fleet: &DeviceFleetController,
    ) {
        if self.state == DisplayState::Idle {
            info!("alarm set non-empty, switching fleet to alarm page");
            self.state = DisplayState::Alarm;
            self.rotation_index = 0;
            self.last_page_push = None;
            fleet.set_buzzer_all(true).await;
        }

        // alarms without a directory entry are not displayable
        let entries: Vec<(&AlarmRecord, String)> = snapshot
            .iter()
            .filter_map(|record| {
                if cfg.entities.contains_key(&record.id) {
                    Some((record, cfg.entity(&record.id).label))
                } else {
                    debug!("alarm {} has no directory entry, not displayed", record.id);
                    None
                }
            })
            .collect();

        let labels: Vec<String> = entries.iter().map(|(_, label)| label.clone()).collect();
        let set_changed = labels != self.last_labels;
        // the cache rejects bad intervals, but never trust a float
        let interval = Duration::try_from_secs_f64(cfg.site.scroll_interval_secs)
            .unwrap_or_else(|_| Duration::from_secs(1));
        let rotation_due = match self.last_page_push {
            Some(last) => now.duration_since(last) >= interval,
            None => true,
        };
        if !set_changed && !rotation_due {
            return;
        }

        if entries.is_empty() {
            // active alarms exist but none are displayable
            fleet.clear_alarm_page_all().await;
            self.last_labels = labels;
            self.last_page_push = Some(now);
            return;
        }

        if self.rotation_index >= entries.len() {
            self.rotation_index = 0;
        }
        let (record, label) = &entries[self.rotation_index];
        let ordinal = self.rotation_index + 1;

        let (line1, line2) = match record.kind {
            DeviceKind::PanicButton => (format!("{}. {}", ordinal, label), String::new()),
            _ => {
                let entity = cfg.entity(&record.id);
                let area = record
                    .location
                    .as_ref()
                    .and_then(|point| cfg.area_for(point))
                    .unwrap_or("locating..");
                (format!("{}. {}", ordinal, entity.holder), area.to_string())
            }
        };
        let color = LineColor::for_duration(
            now.duration_since(record.first_seen),
            cfg.site.display_green_secs,
            cfg.site.display_yellow_secs,
        );

        fleet.show_alarm_page_all(&line1, &line2, color).await;
        self.rotation_index = (self.rotation_index + 1) % entries.len();
        self.last_labels = labels;
        self.last_page_push = Some(now);
    }
}
