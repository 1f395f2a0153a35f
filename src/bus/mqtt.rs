//! MQTT client: alarm feed subscriber and SMS gateway publisher.
//!
//! Inbound payloads on the alarm topic are JSON objects keyed by
//! alarm-id, each value an array of grid coordinates ending in a 1
//! (raise) or 0 (clear). Malformed entries are logged and skipped, one
//! bad entry never poisons the rest of the payload.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::config::MqttConfig;
use crate::domain::{AlarmRecord, DeviceKind, EscalationEvent, GridPoint};
use crate::error::Result;
use crate::services::config_cache::ConfigCache;
use crate::services::escalation::EscalationPublisher;
use crate::store::AlarmSetStore;

/// Connected MQTT client plus the topic it publishes escalations on.
pub struct MqttBus {
    client: AsyncClient,
    sms_topic: String,
}

impl MqttBus {
    /// Connect, subscribe to the alarm feed and spawn the event loop.
    ///
    /// The event loop owns reconnection: on any poll error it logs,
    /// backs off and polls again; on reconnect it resubscribes.
    pub fn start(
        cfg: &MqttConfig,
        store: Arc<AlarmSetStore>,
        directory: Arc<ConfigCache>,
    ) -> Arc<Self> {
        let mut options = MqttOptions::new(&cfg.client_id, &cfg.host, cfg.port);
        options.set_keep_alive(Duration::from_secs(30));
        let (client, mut eventloop) = AsyncClient::new(options, 64);

        let bus = Arc::new(Self {
            client: client.clone(),
            sms_topic: cfg.sms_topic.clone(),
        });

        let alarm_topic = cfg.alarm_topic.clone();
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt connected, subscribing to {}", alarm_topic);
                        if let Err(e) = client.subscribe(&alarm_topic, QoS::AtLeastOnce).await {
                            error!("subscribe to {} failed: {}", alarm_topic, e);
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        if publish.topic == alarm_topic {
                            apply_alarm_payload(&publish.payload, &store, &directory);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("mqtt connection error, retrying in 5s: {}", e);
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        });

        bus
    }
}

#[async_trait]
impl EscalationPublisher for MqttBus {
    async fn publish(&self, event: &EscalationEvent) -> Result<()> {
        let payload = serde_json::to_vec(event)?;
        self.client
            .publish(&self.sms_topic, QoS::AtLeastOnce, false, payload)
            .await?;
        Ok(())
    }
}

/// Apply one alarm-feed payload to the store.
pub fn apply_alarm_payload(payload: &[u8], store: &AlarmSetStore, directory: &ConfigCache) {
    let parsed: Value = match serde_json::from_slice(payload) {
        Ok(value) => value,
        Err(e) => {
            warn!("discarding unparseable alarm payload: {}", e);
            return;
        }
    };
    let entries = match parsed.as_object() {
        Some(map) => map,
        None => {
            warn!("discarding alarm payload that is not a JSON object");
            return;
        }
    };

    let snapshot = directory.snapshot();
    for (id, value) in entries {
        let fields = match value.as_array() {
            Some(fields) if fields.len() >= 3 => fields,
            _ => {
                warn!("alarm entry {} malformed, skipping: {}", id, value);
                continue;
            }
        };
        let flag = fields[fields.len() - 1].as_f64();
        match flag {
            Some(flag) if flag == 1.0 => {
                let kind = DeviceKind::from_type_str(&snapshot.entity(id).device_type);
                let location = match kind {
                    // panic buttons are fixed, the model's coordinates
                    // for them are meaningless
                    DeviceKind::PanicButton => None,
                    _ => match (fields[0].as_f64(), fields[1].as_f64()) {
                        (Some(x), Some(y)) => Some(GridPoint::new(x, y)),
                        _ => {
                            warn!("alarm entry {} has non-numeric coordinates", id);
                            None
                        }
                    },
                };
                debug!("alarm raised for {}", id);
                store.upsert(AlarmRecord::new(id.clone(), kind, location));
            }
            Some(flag) if flag == 0.0 => {
                if store.remove(id) {
                    debug!("alarm cleared for {}", id);
                }
            }
            _ => {
                warn!("alarm entry {} has invalid state flag, skipping", id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn directory() -> Arc<ConfigCache> {
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
             INSERT INTO device_list VALUES
                 ('J001', 'cow1', 'Daisy', 'TrackerD'),
                 ('J002', 'nurse call 2', 'Ward 2', 'PB');",
        )
        .execute(&pool)
        .await
        .unwrap();
        let cache = Arc::new(ConfigCache::new(pool, Duration::from_secs(10)));
        cache.refresh().await.unwrap();
        cache
    }

    #[tokio::test]
    async fn test_raise_and_clear() {
        let store = AlarmSetStore::new();
        let directory = directory().await;

        apply_alarm_payload(br#"{"J001": [1.5, 2.5, 1]}"#, &store, &directory);
        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, "J001");
        assert_eq!(snapshot[0].kind, DeviceKind::Tracker);
        assert_eq!(snapshot[0].location, Some(GridPoint::new(1.5, 2.5)));

        apply_alarm_payload(br#"{"J001": [1.5, 2.5, 0]}"#, &store, &directory);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_panic_button_has_no_location() {
        let store = AlarmSetStore::new();
        let directory = directory().await;

        apply_alarm_payload(br#"{"J002": [7.0, 8.0, 1]}"#, &store, &directory);
        let snapshot = store.snapshot();
        assert_eq!(snapshot[0].kind, DeviceKind::PanicButton);
        assert_eq!(snapshot[0].location, None);
    }

    #[tokio::test]
    async fn test_unknown_id_still_tracked() {
        let store = AlarmSetStore::new();
        let directory = directory().await;

        apply_alarm_payload(br#"{"ghost": [0.0, 0.0, 1]}"#, &store, &directory);
        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].kind, DeviceKind::Unknown);
    }

    #[tokio::test]
    async fn test_malformed_entries_do_not_poison_payload() {
        let store = AlarmSetStore::new();
        let directory = directory().await;

        let payload = br#"{
            "bad1": [1.0],
            "bad2": "nope",
            "bad3": [1.0, 2.0, 7],
            "J001": [1.0, 2.0, 1]
        }"#;
        apply_alarm_payload(payload, &store, &directory);
        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, "J001");

        apply_alarm_payload(b"not json at all", &store, &directory);
        assert_eq!(store.len(), 1);
    }
}
