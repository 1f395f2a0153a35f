//! Alarm annunciation service.
//!
//! Subscribes to the location model's alarm feed over MQTT, mirrors the
//! active alarm set onto a fleet of Modbus TCP LCD/buzzer annunciators,
//! and escalates long-standing alarms to an SMS gateway topic.

pub mod bus;
pub mod config;
pub mod domain;
pub mod error;
pub mod services;
pub mod store;

pub use config::ServiceConfig;
pub use error::{NotifError, Result};
pub use store::AlarmSetStore;
