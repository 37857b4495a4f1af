//! MQTT control-packet decoding.
//!
//! The parser reads the fixed header (packet type, flags, remaining length)
//! and extracts the packet identifier where the protocol carries one
//! (PUBLISH above QoS 0, PUBACK). It is a sniffer, not a compliance checker:
//! payloads that do not plausibly start an MQTT control packet yield
//! `Ok(None)` so the caller can fall back to plain-TCP handling. Byte
//! offsets live in `layout`; port conventions and the client/broker/cloud
//! role heuristic live in `reader`.

pub mod error;
pub mod layout;
pub mod parser;
pub mod reader;

pub use parser::{MqttFrame, MqttPacketType, parse_mqtt_frame};
