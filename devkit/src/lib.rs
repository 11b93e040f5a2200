/*!
# Gateway DevKit - stubs and utilities for agent development

Drives the gateway agent without an MQTT broker or a NATS server:
- `MockPublisher` standing in for either transport
- `RequestBuilder` for control-channel measurement packs
- `TestHarness` wiring an `AgentService` to mocks and a temporary config file
*/

pub mod mqtt_stub;
pub mod test_utils;

pub use mqtt_stub::{MockMessage, MockPublisher, RequestBuilder};
pub use test_utils::TestHarness;
