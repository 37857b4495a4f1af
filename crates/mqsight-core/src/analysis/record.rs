use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

use etherparse::{NetSlice, SlicedPacket, TransportSlice};
use pcap_parser::Linktype;

use crate::protocols::mqtt::reader::RoleHeuristic;
use crate::protocols::mqtt::{MqttFrame, parse_mqtt_frame};
use crate::source::RawFrame;

/// Transport classification of a retained packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) enum Transport {
    Tcp,
    Udp,
    Other,
}

impl Transport {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Udp => "udp",
            Transport::Other => "other",
        }
    }
}

/// TCP header fields needed by the metric calculator.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TcpMeta {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
    pub seq: u32,
    pub ack_num: u32,
}

/// One normalized capture frame.
///
/// Records are immutable once built; every derived metric lives in a
/// separate structure keyed by `index`.
#[derive(Debug, Clone)]
pub(crate) struct PacketRecord {
    /// Capture order, unique across the trace; ties on timestamp break here.
    pub index: usize,
    /// Epoch seconds.
    pub timestamp: f64,
    pub src_ip: Option<IpAddr>,
    pub dst_ip: Option<IpAddr>,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
    pub transport: Transport,
    /// Transport payload length in bytes (0 for non-TCP/UDP frames).
    pub payload_len: usize,
    pub tcp: Option<TcpMeta>,
    /// RTP-style sequence number sniffed from a UDP payload, when plausible.
    pub udp_seq: Option<u16>,
    /// Decoded MQTT marker, when the payload parses as a control packet.
    pub mqtt: Option<MqttFrame>,
    /// Set when this packet repeats an already-seen sequence number with
    /// payload, in the same direction.
    pub is_retransmission: bool,
}

impl PacketRecord {
    /// Label used in the packet table and protocol distribution.
    pub(crate) fn protocol_label(&self) -> &'static str {
        if self.mqtt.is_some() {
            return "MQTT";
        }
        match self.transport {
            Transport::Tcp => "TCP",
            Transport::Udp => "UDP",
            Transport::Other => "OTHER",
        }
    }
}

/// Outcome of normalizing one raw frame.
pub(crate) enum Extraction {
    Record(PacketRecord),
    Skipped,
}

/// Stateful frame normalizer.
///
/// The only cross-frame state is the per-direction set of seen TCP sequence
/// numbers used to derive the retransmission flag; everything else is a pure
/// projection of the frame.
pub(crate) struct RecordExtractor<H: RoleHeuristic> {
    roles: H,
    seen_seq: HashMap<(IpAddr, u16, IpAddr, u16), HashSet<u32>>,
    next_index: usize,
}

impl<H: RoleHeuristic> RecordExtractor<H> {
    pub(crate) fn new(roles: H) -> Self {
        Self {
            roles,
            seen_seq: HashMap::new(),
            next_index: 0,
        }
    }

    pub(crate) fn extract(&mut self, frame: &RawFrame) -> Extraction {
        let timestamp = match frame.ts {
            Some(ts) => ts,
            None => return Extraction::Skipped,
        };

        let sliced = match frame.linktype {
            Linktype::ETHERNET => SlicedPacket::from_ethernet(&frame.data).ok(),
            Linktype::RAW => SlicedPacket::from_ip(&frame.data).ok(),
            _ => None,
        };
        let sliced = match sliced {
            Some(sliced) => sliced,
            None => return Extraction::Skipped,
        };

        let (src_ip, dst_ip) = match &sliced.net {
            Some(NetSlice::Ipv4(ipv4)) => (
                Some(IpAddr::V4(ipv4.header().source_addr())),
                Some(IpAddr::V4(ipv4.header().destination_addr())),
            ),
            Some(NetSlice::Ipv6(ipv6)) => (
                Some(IpAddr::V6(ipv6.header().source_addr())),
                Some(IpAddr::V6(ipv6.header().destination_addr())),
            ),
            _ => (None, None),
        };

        let index = self.next_index;
        self.next_index += 1;

        let mut record = PacketRecord {
            index,
            timestamp,
            src_ip,
            dst_ip,
            src_port: None,
            dst_port: None,
            transport: Transport::Other,
            payload_len: 0,
            tcp: None,
            udp_seq: None,
            mqtt: None,
            is_retransmission: false,
        };

        match sliced.transport {
            Some(TransportSlice::Tcp(tcp)) => {
                record.transport = Transport::Tcp;
                record.src_port = Some(tcp.source_port());
                record.dst_port = Some(tcp.destination_port());
                record.payload_len = tcp.payload().len();
                record.tcp = Some(TcpMeta {
                    syn: tcp.syn(),
                    ack: tcp.ack(),
                    fin: tcp.fin(),
                    rst: tcp.rst(),
                    seq: tcp.sequence_number(),
                    ack_num: tcp.acknowledgment_number(),
                });
                record.mqtt = self.try_mqtt(&record, tcp.payload());
                record.is_retransmission = self.note_sequence(&record);
            }
            Some(TransportSlice::Udp(udp)) => {
                record.transport = Transport::Udp;
                record.src_port = Some(udp.source_port());
                record.dst_port = Some(udp.destination_port());
                record.payload_len = udp.payload().len();
                record.udp_seq = sniff_rtp_sequence(udp.payload());
            }
            _ => {}
        }

        Extraction::Record(record)
    }

    fn try_mqtt(&self, record: &PacketRecord, payload: &[u8]) -> Option<MqttFrame> {
        if payload.is_empty() {
            return None;
        }
        let (src, dst) = (record.src_port?, record.dst_port?);
        if !self.roles.should_attempt_decode(src, dst) {
            return None;
        }
        parse_mqtt_frame(payload).ok().flatten()
    }

    fn note_sequence(&mut self, record: &PacketRecord) -> bool {
        let meta = match record.tcp {
            Some(meta) => meta,
            None => return false,
        };
        if record.payload_len == 0 || meta.seq == 0 {
            return false;
        }
        let key = match (record.src_ip, record.src_port, record.dst_ip, record.dst_port) {
            (Some(si), Some(sp), Some(di), Some(dp)) => (si, sp, di, dp),
            _ => return false,
        };
        !self.seen_seq.entry(key).or_default().insert(meta.seq)
    }
}

/// Sniff an RTP-like sequence number from a UDP payload.
///
/// Requires a 12-byte minimum header and version bits `10`; the 16-bit
/// big-endian field at bytes 2..4 is taken as the sequence number. This is
/// a plausibility check, not an RTP parser.
fn sniff_rtp_sequence(payload: &[u8]) -> Option<u16> {
    if payload.len() < 12 || payload[0] >> 6 != 2 {
        return None;
    }
    Some(u16::from_be_bytes([payload[2], payload[3]]))
}

#[cfg(test)]
mod tests {
    use etherparse::PacketBuilder;
    use pcap_parser::Linktype;

    use super::{Extraction, RecordExtractor, Transport};
    use crate::protocols::mqtt::MqttPacketType;
    use crate::protocols::mqtt::reader::PortRoles;
    use crate::source::RawFrame;

    fn frame(ts: Option<f64>, data: Vec<u8>) -> RawFrame {
        RawFrame {
            ts,
            linktype: Linktype::ETHERNET,
            data,
        }
    }

    fn tcp_packet(src_port: u16, dst_port: u16, seq: u32, payload: &[u8]) -> Vec<u8> {
        let builder = PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [7, 8, 9, 10, 11, 12])
            .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
            .tcp(src_port, dst_port, seq, 4096);
        let mut packet = Vec::with_capacity(builder.size(payload.len()));
        builder.write(&mut packet, payload).unwrap();
        packet
    }

    #[test]
    fn extracts_tcp_fields() {
        let mut extractor = RecordExtractor::new(PortRoles::default());
        let data = tcp_packet(40000, 1883, 100, b"x");
        let record = match extractor.extract(&frame(Some(1.5), data)) {
            Extraction::Record(record) => record,
            Extraction::Skipped => panic!("expected a record"),
        };

        assert_eq!(record.transport, Transport::Tcp);
        assert_eq!(record.src_port, Some(40000));
        assert_eq!(record.dst_port, Some(1883));
        assert_eq!(record.payload_len, 1);
        let meta = record.tcp.unwrap();
        assert_eq!(meta.seq, 100);
        assert!(!record.is_retransmission);
    }

    #[test]
    fn flags_repeated_sequence_numbers() {
        let mut extractor = RecordExtractor::new(PortRoles::default());
        let data = tcp_packet(40000, 9000, 100, b"x");
        for (i, expect_retrans) in [(0, false), (1, true)] {
            let record = match extractor.extract(&frame(Some(1.0 + i as f64), data.clone())) {
                Extraction::Record(record) => record,
                Extraction::Skipped => panic!("expected a record"),
            };
            assert_eq!(record.is_retransmission, expect_retrans);
        }
    }

    #[test]
    fn decodes_mqtt_marker_on_broker_port() {
        let mut extractor = RecordExtractor::new(PortRoles::default());
        let puback = [0x40, 0x02, 0x00, 0x07];
        let data = tcp_packet(1883, 40000, 5, &puback);
        let record = match extractor.extract(&frame(Some(2.0), data)) {
            Extraction::Record(record) => record,
            Extraction::Skipped => panic!("expected a record"),
        };

        let mqtt = record.mqtt.expect("mqtt marker");
        assert_eq!(mqtt.packet_type, MqttPacketType::PubAck);
        assert_eq!(mqtt.packet_id, Some(7));
        assert_eq!(record.protocol_label(), "MQTT");
    }

    #[test]
    fn udp_rtp_sequence_sniffing() {
        let mut rtp = vec![0u8; 16];
        rtp[0] = 0x80;
        rtp[2] = 0x01;
        rtp[3] = 0x02;
        let builder = PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [7, 8, 9, 10, 11, 12])
            .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
            .udp(5004, 5004);
        let mut packet = Vec::with_capacity(builder.size(rtp.len()));
        builder.write(&mut packet, &rtp).unwrap();

        let mut extractor = RecordExtractor::new(PortRoles::default());
        let record = match extractor.extract(&frame(Some(1.0), packet)) {
            Extraction::Record(record) => record,
            Extraction::Skipped => panic!("expected a record"),
        };
        assert_eq!(record.transport, Transport::Udp);
        assert_eq!(record.udp_seq, Some(0x0102));
    }

    #[test]
    fn skips_frames_without_timestamp() {
        let mut extractor = RecordExtractor::new(PortRoles::default());
        let data = tcp_packet(1, 2, 3, b"");
        assert!(matches!(
            extractor.extract(&frame(None, data)),
            Extraction::Skipped
        ));
    }

    #[test]
    fn skips_undecodable_frames() {
        let mut extractor = RecordExtractor::new(PortRoles::default());
        assert!(matches!(
            extractor.extract(&frame(Some(1.0), vec![0u8; 3])),
            Extraction::Skipped
        ));
    }
}
