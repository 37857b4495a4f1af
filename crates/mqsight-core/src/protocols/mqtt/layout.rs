/// Minimum bytes for any control packet: control byte plus one length byte.
pub const FIXED_HEADER_MIN_LEN: usize = 2;

/// Maximum encoded length of the remaining-length varint.
pub const REMAINING_LENGTH_MAX_BYTES: usize = 4;

/// Continuation bit of a remaining-length byte.
pub const REMAINING_LENGTH_CONTINUATION: u8 = 0x80;

pub const PACKET_TYPE_CONNECT: u8 = 1;
pub const PACKET_TYPE_CONNACK: u8 = 2;
pub const PACKET_TYPE_PUBLISH: u8 = 3;
pub const PACKET_TYPE_PUBACK: u8 = 4;

/// QoS bits inside the PUBLISH flags nibble.
pub const PUBLISH_QOS_MASK: u8 = 0b0000_0110;
pub const PUBLISH_QOS_SHIFT: u8 = 1;

/// Length of an encoded packet identifier.
pub const PACKET_ID_LEN: usize = 2;
/// Length of the topic-length prefix in a PUBLISH variable header.
pub const TOPIC_LENGTH_LEN: usize = 2;
