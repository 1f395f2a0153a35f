//! The periodic control loop.
//!
//! Every tick: pick up roster changes, reconcile escalation state and
//! drive the display scheduler. All tick work is bounded; slow devices
//! only delay their own fan-out future, and missed ticks are delayed
//! rather than bursted.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::time::MissedTickBehavior;
use tracing::error;

use crate::services::config_cache::ConfigCache;
use crate::services::escalation::{EscalationPublisher, EscalationTracker};
use crate::services::fleet::DeviceFleetController;
use crate::services::rotation::DisplayRotationScheduler;
use crate::store::AlarmSetStore;

pub struct ControlLoop {
    store: Arc<AlarmSetStore>,
    config: Arc<ConfigCache>,
    fleet: Arc<DeviceFleetController>,
    publisher: Arc<dyn EscalationPublisher>,
    tracker: EscalationTracker,
    scheduler: DisplayRotationScheduler,
    tick_interval: Duration,
}

impl ControlLoop {
    pub fn new(
        store: Arc<AlarmSetStore>,
        config: Arc<ConfigCache>,
        fleet: Arc<DeviceFleetController>,
        publisher: Arc<dyn EscalationPublisher>,
        tick_interval: Duration,
    ) -> Self {
        Self {
            store,
            config,
            fleet,
            publisher,
            tracker: EscalationTracker::new(),
            scheduler: DisplayRotationScheduler::new(),
            tick_interval,
        }
    }

    pub async fn run(mut self) {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            self.guarded_tick(Instant::now()).await;
        }
    }

    /// One tick with panic containment: a panicking tick is logged and
    /// the next tick still runs.
    async fn guarded_tick(&mut self, now: Instant) {
        if let Err(panic) = AssertUnwindSafe(self.run_tick(now)).catch_unwind().await {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            error!("control tick panicked, continuing: {}", reason);
        }
    }

    /// One control-loop iteration at the given instant.
    pub async fn run_tick(&mut self, now: Instant) {
        let cfg = self.config.snapshot();
        if self.config.take_roster_changed() {
            self.fleet.apply_roster(&cfg.roster).await;
        }

        let alarms = self.store.snapshot();
        self.tracker
            .process(&alarms, &cfg, now, self.publisher.as_ref())
            .await;
        self.scheduler.tick(&alarms, &cfg, now, &self.fleet).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AlarmRecord, DeviceKind, EscalationEvent};
    use crate::services::fleet::mock::MockConnector;
    use async_trait::async_trait;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    struct FlakyPublisher {
        panic_once: AtomicBool,
        published: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EscalationPublisher for FlakyPublisher {
        async fn publish(&self, event: &EscalationEvent) -> crate::error::Result<()> {
            if self.panic_once.swap(false, Ordering::AcqRel) {
                panic!("publisher exploded");
            }
            self.published.lock().unwrap().push(event.j_code.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_panicking_tick_does_not_stop_the_loop() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::query(
            "CREATE TABLE system_config (config_name TEXT, value TEXT);
             CREATE TABLE network_infrastructure_list
                 (ip TEXT, modbus_tcp_port INTEGER, mute INTEGER, device_type TEXT);
             CREATE TABLE device_list (j_code TEXT, label TEXT, holder TEXT, device_type TEXT);
             CREATE TABLE beacon_list (X REAL, Y REAL, Z REAL, area TEXT);
             INSERT INTO system_config VALUES ('sms_alarm_tracker_time', '0');",
        )
        .execute(&pool)
        .await
        .unwrap();
        let cache = Arc::new(ConfigCache::new(pool, Duration::from_secs(10)));
        cache.refresh().await.unwrap();

        let fleet = Arc::new(DeviceFleetController::new(Arc::new(MockConnector::new())));
        let store = Arc::new(AlarmSetStore::new());
        store.upsert(AlarmRecord::new("J001".to_string(), DeviceKind::Tracker, None));

        let publisher = Arc::new(FlakyPublisher {
            panic_once: AtomicBool::new(true),
            published: Mutex::new(Vec::new()),
        });
        let mut control = ControlLoop::new(
            store,
            cache,
            fleet,
            publisher.clone(),
            Duration::from_millis(100),
        );

        // the first escalation publish panics inside the tick and is
        // contained at the tick boundary
        let now = Instant::now();
        control.guarded_tick(now).await;
        assert!(publisher.published.lock().unwrap().is_empty());

        // the next tick runs normally and the escalation goes out
        control.guarded_tick(now + Duration::from_secs(1)).await;
        assert_eq!(
            *publisher.published.lock().unwrap(),
            vec!["J001".to_string()]
        );
    }
}
