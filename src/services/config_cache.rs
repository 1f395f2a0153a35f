//! Periodically refreshed snapshot of site tunables, the annunciator
//! roster, the entity directory and the beacon map.
//!
//! Readers get an immutable [`ConfigSnapshot`]; the refresh task replaces
//! it wholesale and never blocks readers. A failed refresh keeps the
//! previous snapshot; before the first successful refresh hard-coded
//! defaults are served so the control loop can make progress.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use sqlx::{Row, SqlitePool};
use tracing::{error, info, warn};

use crate::domain::{DeviceRole, GridPoint};
use crate::error::Result;

/// Site tunables read from `system_config`.
#[derive(Debug, Clone, PartialEq)]
pub struct SiteConfig {
    /// Below this many seconds an alarm renders green
    pub display_green_secs: f64,
    /// Below this many seconds an alarm renders yellow, above it red
    pub display_yellow_secs: f64,
    /// SMS escalation threshold for panic buttons
    pub sms_pb_secs: f64,
    /// SMS escalation threshold for trackers
    pub sms_tracker_secs: f64,
    /// Rotation interval between simultaneous alarms
    pub scroll_interval_secs: f64,
    pub sms_destination_pb: Vec<String>,
    pub sms_destination_tracker: Vec<String>,
    /// Idle page title
    pub static_title: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            display_green_secs: 30.0,
            display_yellow_secs: 60.0,
            sms_pb_secs: 900.0,
            sms_tracker_secs: 300.0,
            scroll_interval_secs: 1.0,
            sms_destination_pb: vec!["0456888156".to_string()],
            sms_destination_tracker: vec!["0456888156".to_string()],
            static_title: "Ramsay Health".to_string(),
        }
    }
}

/// One annunciator row from `network_infrastructure_list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterEntry {
    pub ip: String,
    pub port: u16,
    pub role: DeviceRole,
    /// Whether the site has opted this device's buzzer into control
    /// (`mute = 0` in the store).
    pub buzzer_enabled: bool,
}

impl RosterEntry {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// Directory entry for a monitored entity.
#[derive(Debug, Clone)]
pub struct EntityInfo {
    pub label: String,
    pub holder: String,
    pub device_type: String,
}

impl Default for EntityInfo {
    fn default() -> Self {
        Self {
            label: "Unknown".to_string(),
            holder: "Unknown".to_string(),
            device_type: String::new(),
        }
    }
}

/// Immutable snapshot served to readers.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub site: Arc<SiteConfig>,
    pub roster: Arc<Vec<RosterEntry>>,
    pub entities: Arc<HashMap<String, EntityInfo>>,
    /// Beacon key (normalized coordinates) to area name
    pub beacon_areas: Arc<HashMap<String, String>>,
    pub version: u64,
}

impl ConfigSnapshot {
    fn defaults() -> Self {
        Self {
            site: Arc::new(SiteConfig::default()),
            roster: Arc::new(Vec::new()),
            entities: Arc::new(HashMap::new()),
            beacon_areas: Arc::new(HashMap::new()),
            version: 0,
        }
    }

    /// Directory entry for an alarm-id, "Unknown" placeholders if absent.
    pub fn entity(&self, id: &str) -> EntityInfo {
        self.entities.get(id).cloned().unwrap_or_default()
    }

    /// Area name for a grid point, if it matches a known beacon.
    pub fn area_for(&self, point: &GridPoint) -> Option<&str> {
        self.beacon_areas
            .get(&point.beacon_key())
            .map(String::as_str)
    }
}

/// Cached view of the external configuration store.
pub struct ConfigCache {
    pool: SqlitePool,
    current: RwLock<ConfigSnapshot>,
    roster_changed: AtomicBool,
    version: AtomicU64,
    refresh_interval: Duration,
}

impl ConfigCache {
    pub fn new(pool: SqlitePool, refresh_interval: Duration) -> Self {
        Self {
            pool,
            current: RwLock::new(ConfigSnapshot::defaults()),
            roster_changed: AtomicBool::new(false),
            version: AtomicU64::new(0),
            refresh_interval,
        }
    }

    /// Clone of the current snapshot. Cheap: the payload is shared.
    pub fn snapshot(&self) -> ConfigSnapshot {
        self.current.read().unwrap().clone()
    }

    /// Consume the roster-changed signal set by a refresh.
    pub fn take_roster_changed(&self) -> bool {
        self.roster_changed.swap(false, Ordering::AcqRel)
    }

    /// Reload everything from the store and swap the snapshot in.
    ///
    /// On any error the previous snapshot stays in place.
    pub async fn refresh(&self) -> Result<()> {
        let site = self.load_site_config().await?;
        let roster = self.load_roster().await?;
        let entities = self.load_entities().await?;
        let beacon_areas = self.load_beacons().await?;

        let version = self.version.fetch_add(1, Ordering::Relaxed) + 1;
        let mut current = self.current.write().unwrap();
        if *current.roster != roster {
            info!("annunciator roster changed: {} device(s)", roster.len());
            self.roster_changed.store(true, Ordering::Release);
        }
        if *current.site != site {
            info!("site config updated: {:?}", site);
        }
        *current = ConfigSnapshot {
            site: Arc::new(site),
            roster: Arc::new(roster),
            entities: Arc::new(entities),
            beacon_areas: Arc::new(beacon_areas),
            version,
        };
        Ok(())
    }

    /// Spawn the background refresh task (first refresh runs immediately).
    pub fn spawn_refresh_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(cache.refresh_interval);
            loop {
                interval.tick().await;
                if let Err(e) = cache.refresh().await {
                    error!("config refresh failed, serving previous snapshot: {}", e);
                }
            }
        })
    }

    async fn load_site_config(&self) -> Result<SiteConfig> {
        let rows = sqlx::query("SELECT config_name, value FROM system_config")
            .fetch_all(&self.pool)
            .await?;

        let mut values: HashMap<String, String> = HashMap::with_capacity(rows.len());
        for row in &rows {
            let name: String = row.try_get("config_name")?;
            let value: String = row.try_get("value")?;
            values.insert(name, value);
        }

        let defaults = SiteConfig::default();
        Ok(SiteConfig {
            display_green_secs: parse_secs(
                &values,
                "lcd_display_in_green_time",
                defaults.display_green_secs,
            ),
            display_yellow_secs: parse_secs(
                &values,
                "lcd_display_in_yellow_time",
                defaults.display_yellow_secs,
            ),
            sms_pb_secs: parse_secs(&values, "sms_alarm_pb_time", defaults.sms_pb_secs),
            sms_tracker_secs: parse_secs(
                &values,
                "sms_alarm_tracker_time",
                defaults.sms_tracker_secs,
            ),
            scroll_interval_secs: parse_secs(
                &values,
                "lcd_scrolling_alarm_interval",
                defaults.scroll_interval_secs,
            ),
            sms_destination_pb: parse_destinations(values.get("sms_destination_pb"))
                .unwrap_or(defaults.sms_destination_pb),
            sms_destination_tracker: parse_destinations(values.get("sms_destination_tracker"))
                .unwrap_or(defaults.sms_destination_tracker),
            static_title: values
                .get("lcd_static_title")
                .cloned()
                .unwrap_or(defaults.static_title),
        })
    }

    async fn load_roster(&self) -> Result<Vec<RosterEntry>> {
        let rows = sqlx::query(
            "SELECT ip, modbus_tcp_port, mute FROM network_infrastructure_list \
             WHERE device_type = 'annunciator'",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut roster = Vec::with_capacity(rows.len());
        for row in &rows {
            let ip: String = row.try_get("ip")?;
            let port: i64 = row.try_get("modbus_tcp_port")?;
            let mute: i64 = row.try_get("mute")?;
            // annunciator units carry both an LCD and a buzzer
            roster.push(RosterEntry {
                ip,
                port: port as u16,
                role: DeviceRole::Both,
                buzzer_enabled: mute == 0,
            });
        }
        Ok(roster)
    }

    async fn load_entities(&self) -> Result<HashMap<String, EntityInfo>> {
        let rows = sqlx::query(
            "SELECT j_code, label, holder, device_type FROM device_list \
             WHERE j_code IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut entities = HashMap::with_capacity(rows.len());
        for row in &rows {
            let j_code: String = row.try_get("j_code")?;
            let label: Option<String> = row.try_get("label")?;
            let holder: Option<String> = row.try_get("holder")?;
            let device_type: Option<String> = row.try_get("device_type")?;
            entities.insert(
                j_code,
                EntityInfo {
                    label: label.unwrap_or_else(|| "Unknown".to_string()),
                    holder: holder.unwrap_or_else(|| "Unknown".to_string()),
                    device_type: device_type.unwrap_or_default(),
                },
            );
        }
        Ok(entities)
    }

    async fn load_beacons(&self) -> Result<HashMap<String, String>> {
        let rows = sqlx::query("SELECT X, Y, area FROM beacon_list")
            .fetch_all(&self.pool)
            .await?;

        let mut areas = HashMap::with_capacity(rows.len());
        for row in &rows {
            let x: f64 = row.try_get("X")?;
            let y: f64 = row.try_get("Y")?;
            let area: String = row.try_get("area")?;
            areas.insert(GridPoint::new(x, y).beacon_key(), area);
        }
        Ok(areas)
    }
}

/// Durations must be finite and non-negative; anything else keeps the
/// default so one bad store row cannot take down a consumer.
fn parse_secs(values: &HashMap<String, String>, key: &str, default: f64) -> f64 {
    match values.get(key) {
        Some(raw) => match raw.trim().parse::<f64>() {
            Ok(value) if value.is_finite() && value >= 0.0 => value,
            Ok(value) => {
                warn!("out-of-range value for {}: {}, keeping default", key, value);
                default
            }
            Err(_) => {
                warn!("unparseable value for {}: {:?}, keeping default", key, raw);
                default
            }
        },
        None => default,
    }
}

/// Destination lists are stored as `-`-separated strings.
fn parse_destinations(raw: Option<&String>) -> Option<Vec<String>> {
    let raw = raw?;
    let numbers: Vec<String> = raw
        .split('-')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if numbers.is_empty() {
        None
    } else {
        Some(numbers)
    }
}
