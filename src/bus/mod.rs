//! Bus clients: Modbus TCP toward the device fleet, MQTT toward the
//! alarm feed and the SMS gateway.

pub mod modbus;
pub mod mqtt;
