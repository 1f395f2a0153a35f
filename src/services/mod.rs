//! Services module for the notification service.
//!
//! Config cache, device fleet controller, escalation tracker, display
//! rotation scheduler and the control loop tying them together.

pub mod config_cache;
pub mod control_loop;
pub mod escalation;
pub mod fleet;
pub mod rotation;

pub use config_cache::ConfigCache;
pub use control_loop::ControlLoop;
pub use escalation::{EscalationPublisher, EscalationTracker};
pub use fleet::DeviceFleetController;
pub use rotation::DisplayRotationScheduler;
