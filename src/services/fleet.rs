//! Fan-out controller for the annunciator fleet.
//!
//! One [`DeviceHandle`] per roster entry, each with its own bus
//! connection and failure counter. A device that fails
//! [`OFFLINE_THRESHOLD`] writes in a row is marked inactive and skipped
//! until a background recovery probe brings it back, so one unreachable
//! unit never stalls the rest of the fleet.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use futures::future::join_all;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::bus::modbus::{
    Annunciator, BusConnector, BusError, DisplayLine, RegisterBus, PAGE_ALARM, PAGE_IDLE,
};
use crate::domain::{DeviceRole, LineColor};
use crate::services::config_cache::RosterEntry;

/// Consecutive failures before a device is marked inactive.
pub const OFFLINE_THRESHOLD: u32 = 3;

struct DeviceState {
    bus: Box<dyn RegisterBus>,
    active: bool,
    fail_count: u32,
    /// Hash of the last content successfully pushed; identical pushes
    /// are suppressed.
    last_content: Option<u64>,
}

/// One annunciator on the roster.
pub struct DeviceHandle {
    ip: String,
    port: u16,
    role: DeviceRole,
    buzzer_enabled: AtomicBool,
    state: Mutex<DeviceState>,
}

impl DeviceHandle {
    fn new(entry: &RosterEntry, bus: Box<dyn RegisterBus>) -> Self {
        Self {
            ip: entry.ip.clone(),
            port: entry.port,
            role: entry.role,
            buzzer_enabled: AtomicBool::new(entry.buzzer_enabled),
            state: Mutex::new(DeviceState {
                bus,
                active: true,
                fail_count: 0,
                last_content: None,
            }),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    pub async fn is_active(&self) -> bool {
        self.state.lock().await.active
    }

    fn matches(&self, entry: &RosterEntry) -> bool {
        self.ip == entry.ip && self.port == entry.port
    }

    /// Book-keeping after a write attempt. Returns whether it succeeded.
    fn finish_op(&self, state: &mut DeviceState, what: &str, result: Result<(), BusError>) -> bool {
        match result {
            Ok(()) => {
                if state.fail_count > 0 {
                    debug!("{} to {} recovered", what, self.addr());
                }
                state.fail_count = 0;
                true
            }
            Err(e) => {
                state.fail_count += 1;
                state.last_content = None;
                warn!(
                    "{} to {} failed ({}/{}): {}",
                    what,
                    self.addr(),
                    state.fail_count,
                    OFFLINE_THRESHOLD,
                    e
                );
                if state.fail_count >= OFFLINE_THRESHOLD {
                    state.active = false;
                    info!("marking annunciator {} inactive", self.addr());
                }
                false
            }
        }
    }

    /// Drive the buzzer, honoring the per-device enable flag.
    pub async fn set_buzzer(&self, on: bool) -> bool {
        if !self.role.has_buzzer() || !self.buzzer_enabled.load(Ordering::Acquire) {
            return true;
        }
        let mut state = self.state.lock().await;
        if !state.active {
            debug!("skipping buzzer write to inactive device {}", self.addr());
            return false;
        }
        let hash = content_hash(&("buzzer", on));
        if state.last_content == Some(hash) {
            return true;
        }
        let result = Annunciator::new(state.bus.as_mut()).set_buzzer(on).await;
        if self.finish_op(&mut state, "buzzer write", result) {
            state.last_content = Some(hash);
            true
        } else {
            false
        }
    }

    /// Push the alarm page: both lines, their color, the page select.
    pub async fn show_alarm_page(&self, line1: &str, line2: &str, color: LineColor) -> bool {
        if !self.role.has_display() {
            return true;
        }
        let mut state = self.state.lock().await;
        if !state.active {
            debug!("skipping alarm page push to inactive device {}", self.addr());
            return false;
        }
        let hash = content_hash(&("alarm", line1, line2, color.code()));
        if state.last_content == Some(hash) {
            return true;
        }
        let result = {
            let mut dev = Annunciator::new(state.bus.as_mut());
            async {
                dev.write_line(DisplayLine::Line1, line1, color).await?;
                dev.write_line(DisplayLine::Line2, line2, color).await?;
                dev.switch_page(PAGE_ALARM).await
            }
            .await
        };
        if self.finish_op(&mut state, "alarm page push", result) {
            state.last_content = Some(hash);
            true
        } else {
            false
        }
    }

    /// Push the idle page: title, wall clock, page select.
    pub async fn show_idle_page(&self, title: &str) -> bool {
        if !self.role.has_display() {
            return true;
        }
        let mut state = self.state.lock().await;
        if !state.active {
            debug!("skipping idle page push to inactive device {}", self.addr());
            return false;
        }
        let now = Local::now();
        // clock resolution on the panel is one minute
        let hash = content_hash(&("idle", title, now.format("%Y-%m-%d %H:%M").to_string()));
        if state.last_content == Some(hash) {
            return true;
        }
        let result = {
            let mut dev = Annunciator::new(state.bus.as_mut());
            async {
                dev.set_title(title).await?;
                dev.set_clock(now).await?;
                dev.switch_page(PAGE_IDLE).await
            }
            .await
        };
        if self.finish_op(&mut state, "idle page push", result) {
            state.last_content = Some(hash);
            true
        } else {
            false
        }
    }

    /// Blank the alarm lines and return to the idle page.
    pub async fn clear_alarm_page(&self) -> bool {
        if !self.role.has_display() {
            return true;
        }
        let mut state = self.state.lock().await;
        if !state.active {
            debug!("skipping page clear on inactive device {}", self.addr());
            return false;
        }
        let result = {
            let mut dev = Annunciator::new(state.bus.as_mut());
            async {
                dev.write_line(DisplayLine::Line1, "", LineColor::Green).await?;
                dev.write_line(DisplayLine::Line2, "", LineColor::Green).await?;
                dev.switch_page(PAGE_IDLE).await
            }
            .await
        };
        let ok = self.finish_op(&mut state, "page clear", result);
        state.last_content = None;
        ok
    }

    /// Reconnect and issue a harmless write to test an inactive device.
    pub async fn probe(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.active {
            return true;
        }
        let result = {
            let bus = state.bus.as_mut();
            async {
                bus.reconnect().await?;
                Annunciator::new(bus).switch_page(PAGE_IDLE).await
            }
            .await
        };
        match result {
            Ok(()) => {
                info!("annunciator {} is back online", self.addr());
                state.active = true;
                state.fail_count = 0;
                state.last_content = None;
                true
            }
            Err(e) => {
                debug!("probe of {} failed: {}", self.addr(), e);
                false
            }
        }
    }

    async fn close(&self) {
        self.state.lock().await.bus.close().await;
    }
}

fn content_hash<T: Hash>(content: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    content.hash(&mut hasher);
    hasher.finish()
}

/// Owns the fleet and fans every display/buzzer operation out to it.
pub struct DeviceFleetController {
    connector: Arc<dyn BusConnector>,
    devices: RwLock<Vec<Arc<DeviceHandle>>>,
}

impl DeviceFleetController {
    pub fn new(connector: Arc<dyn BusConnector>) -> Self {
        Self {
            connector,
            devices: RwLock::new(Vec::new()),
        }
    }

    /// Reconcile the fleet with a fresh roster.
    ///
    /// Handles for devices still on the roster are kept, so failure
    /// counters and open connections survive a config refresh.
    pub async fn apply_roster(&self, roster: &[RosterEntry]) {
        let mut devices = self.devices.write().await;
        let mut next = Vec::with_capacity(roster.len());
        for entry in roster {
            match devices.iter().position(|d| d.matches(entry)) {
                Some(i) => {
                    let handle = devices.remove(i);
                    handle
                        .buzzer_enabled
                        .store(entry.buzzer_enabled, Ordering::Release);
                    next.push(handle);
                }
                None => {
                    info!("adding annunciator {}", entry.addr());
                    let bus = self.connector.open(&entry.ip, entry.port).await;
                    next.push(Arc::new(DeviceHandle::new(entry, bus)));
                }
            }
        }
        for removed in devices.iter() {
            info!("removing annunciator {}", removed.addr());
            removed.close().await;
        }
        *devices = next;
    }

    pub async fn devices(&self) -> Vec<Arc<DeviceHandle>> {
        self.devices.read().await.clone()
    }

    pub async fn set_buzzer_all(&self, on: bool) {
        let devices = self.devices().await;
        join_all(devices.iter().map(|d| d.set_buzzer(on))).await;
    }

    pub async fn show_alarm_page_all(&self, line1: &str, line2: &str, color: LineColor) {
        let devices = self.devices().await;
        join_all(
            devices
                .iter()
                .map(|d| d.show_alarm_page(line1, line2, color)),
        )
        .await;
    }

    pub async fn show_idle_page_all(&self, title: &str) {
        let devices = self.devices().await;
        join_all(devices.iter().map(|d| d.show_idle_page(title))).await;
    }

    pub async fn clear_alarm_page_all(&self) {
        let devices = self.devices().await;
        join_all(devices.iter().map(|d| d.clear_alarm_page())).await;
    }

    /// Probe every inactive device once.
    pub async fn recover_inactive(&self) {
        let devices = self.devices().await;
        join_all(devices.iter().map(|d| d.probe())).await;
    }

    pub async fn shutdown(&self) {
        let devices = self.devices().await;
        for device in &devices {
            device.close().await;
        }
    }

    /// Spawn the periodic recovery probe for inactive devices.
    pub fn spawn_recovery_task(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let fleet = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // the fleet was just built, skip the immediate tick
            ticker.tick().await;
            loop {
                ticker.tick().await;
                fleet.recover_inactive().await;
            }
        })
    }
}
