/*!
# GGD DevKit - Stubs and helpers for heartbeat agent tests

Lets the heartbeat lifecycle run without a discovery service or a broker:
- Recording MQTT channel/connector stubs
- Scripted discovery provider
- Test harness writing group config and credentials to a temp dir
*/

pub mod discovery_stub;
pub mod mqtt_stub;
pub mod test_utils;

pub use discovery_stub::{ScriptedProvider, Step};
pub use mqtt_stub::{ChannelEvent, MockChannel, MockConnector};
pub use test_utils::TestHarness;
