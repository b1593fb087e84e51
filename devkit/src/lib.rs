/*!
# NEMO DevKit - test doubles for the bridge

- Mock MQTT client recording publishes, with switchable failures
- Builders for backend tool events in both payload shapes
*/

pub mod events;
pub mod mqtt_stub;

pub use events::BackendEventBuilder;
pub use mqtt_stub::{MockMessage, MockMqttClient};
