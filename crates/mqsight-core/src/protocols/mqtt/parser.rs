use super::error::MqttError;
use super::layout;
use super::reader::MqttReader;

/// Control-packet types the correlator reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MqttPacketType {
    Connect,
    ConnAck,
    Publish,
    PubAck,
    /// Any other valid control-packet type (SUBSCRIBE, PINGREQ, ...).
    Other(u8),
}

/// Decoded MQTT fixed header plus the packet identifier when present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MqttFrame {
    pub packet_type: MqttPacketType,
    /// QoS level for PUBLISH packets, 0 otherwise.
    pub qos: u8,
    /// Packet identifier for PUBLISH (QoS > 0) and PUBACK.
    pub packet_id: Option<u16>,
}

/// Try to decode the first MQTT control packet in a TCP payload.
///
/// Returns `Ok(None)` when the bytes do not plausibly start an MQTT control
/// packet (reserved type, flag bits that the type forbids, or a declared
/// length exceeding the payload). A TCP segment may coalesce several control
/// packets; only the first is decoded.
///
/// # Errors
/// Returns `MqttError` for payloads below the fixed-header minimum and for
/// an overlong remaining-length encoding.
pub fn parse_mqtt_frame(payload: &[u8]) -> Result<Option<MqttFrame>, MqttError> {
    let reader = MqttReader::new(payload);
    reader.require_len(layout::FIXED_HEADER_MIN_LEN)?;

    let control = reader.read_u8(0)?;
    let type_code = control >> 4;
    let flags = control & 0x0f;
    if type_code == 0 {
        return Ok(None);
    }

    let (remaining, length_bytes) = reader.read_remaining_length(1)?;
    let body = 1 + length_bytes;
    if body + remaining > reader.len() {
        // Declared more bytes than the segment carries: either a split
        // control packet or not MQTT at all. Treat as foreign.
        return Ok(None);
    }

    let frame = match type_code {
        layout::PACKET_TYPE_CONNECT if flags == 0 => MqttFrame {
            packet_type: MqttPacketType::Connect,
            qos: 0,
            packet_id: None,
        },
        layout::PACKET_TYPE_CONNACK if flags == 0 => MqttFrame {
            packet_type: MqttPacketType::ConnAck,
            qos: 0,
            packet_id: None,
        },
        layout::PACKET_TYPE_PUBLISH => {
            let qos = (flags & layout::PUBLISH_QOS_MASK) >> layout::PUBLISH_QOS_SHIFT;
            if qos == 3 {
                return Ok(None);
            }
            let packet_id = publish_packet_id(&reader, body, remaining, qos)?;
            if qos > 0 && packet_id.is_none() {
                return Ok(None);
            }
            MqttFrame {
                packet_type: MqttPacketType::Publish,
                qos,
                packet_id,
            }
        }
        layout::PACKET_TYPE_PUBACK if flags == 0 => {
            if remaining < layout::PACKET_ID_LEN {
                return Ok(None);
            }
            MqttFrame {
                packet_type: MqttPacketType::PubAck,
                qos: 0,
                packet_id: Some(reader.read_u16_be(body)?),
            }
        }
        layout::PACKET_TYPE_CONNECT | layout::PACKET_TYPE_CONNACK | layout::PACKET_TYPE_PUBACK => {
            // Known type with forbidden flag bits: not a control packet.
            return Ok(None);
        }
        other => MqttFrame {
            packet_type: MqttPacketType::Other(other),
            qos: 0,
            packet_id: None,
        },
    };

    Ok(Some(frame))
}

fn publish_packet_id(
    reader: &MqttReader<'_>,
    body: usize,
    remaining: usize,
    qos: u8,
) -> Result<Option<u16>, MqttError> {
    if qos == 0 {
        return Ok(None);
    }
    if remaining < layout::TOPIC_LENGTH_LEN {
        return Ok(None);
    }
    let topic_len = reader.read_u16_be(body)? as usize;
    let id_offset = body + layout::TOPIC_LENGTH_LEN + topic_len;
    if layout::TOPIC_LENGTH_LEN + topic_len + layout::PACKET_ID_LEN > remaining {
        return Ok(None);
    }
    Ok(Some(reader.read_u16_be(id_offset)?))
}
