//! MQTT-side half of the gateway: broker connection settings and the
//! Gateway that turns PCI events into Home Assistant discovery/state
//! publishes and turns `.../set` commands into PCI calls.
//!
//! ```text
//! mqtt/
//! ├── config.rs   - broker connection settings, MqttOptions/Transport building
//! └── gateway.rs  - discovery, state publishing, command dispatch
//! ```

pub mod config;
pub mod gateway;
