use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;

use crate::protocols::mqtt::MqttPacketType;
use crate::protocols::mqtt::reader::RoleHeuristic;

use super::connections::ConnectionKey;
use super::record::{PacketRecord, Transport};

/// Stage timestamps accumulated for one message identifier.
///
/// Entries are only ever added; the first observation of a stage wins.
/// Identifier reuse across unrelated messages is legal at the protocol
/// level and is not disambiguated here.
#[derive(Debug, Clone, Default)]
pub(crate) struct MessageTimes {
    pub connect_time: Option<f64>,
    pub connack_time: Option<f64>,
    pub client_publish_time: Option<f64>,
    pub broker_forward_time: Option<f64>,
    pub broker_ack_time: Option<f64>,
    pub cloud_ack_time: Option<f64>,
    /// True when the id was synthesized from a stream rather than parsed.
    pub synthetic: bool,
    /// Client-publish observation kept for the root-cause join.
    pub publish: Option<PublishMeta>,
}

impl MessageTimes {
    /// A message is completable once the device→broker delay is computable.
    pub(crate) fn is_completable(&self) -> bool {
        self.client_publish_time.is_some() && self.broker_ack_time.is_some()
    }
}

/// Packet-level context of the client publish, for factor correlation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PublishMeta {
    pub payload_bytes: u64,
    pub src_ip: Option<IpAddr>,
    pub dst_ip: Option<IpAddr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Direction {
    TowardBroker,
    FromBroker,
}

/// Cross-connection MQTT message lifecycle tracker.
///
/// Two traffic sources feed it: packets with a decoded MQTT marker, and
/// payload-bearing TCP packets on the secure broker port, where message
/// boundaries are not observable and stages are approximated per stream.
/// Messages are retained for the life of the analysis pass.
pub(crate) struct MessageCorrelator<H: RoleHeuristic> {
    roles: H,
    messages: BTreeMap<String, MessageTimes>,
    clients: BTreeSet<IpAddr>,
    brokers: BTreeSet<IpAddr>,
    stream_counts: HashMap<(ConnectionKey, Direction), u32>,
}

impl<H: RoleHeuristic> MessageCorrelator<H> {
    pub(crate) fn new(roles: H) -> Self {
        Self {
            roles,
            messages: BTreeMap::new(),
            clients: BTreeSet::new(),
            brokers: BTreeSet::new(),
            stream_counts: HashMap::new(),
        }
    }

    pub(crate) fn observe(&mut self, record: &PacketRecord) {
        match record.mqtt {
            Some(frame) => self.observe_marked(record, frame.packet_type, frame.packet_id),
            None => self.observe_secure_stream(record),
        }
    }

    pub(crate) fn into_parts(
        self,
    ) -> (
        BTreeMap<String, MessageTimes>,
        BTreeSet<IpAddr>,
        BTreeSet<IpAddr>,
    ) {
        (self.messages, self.clients, self.brokers)
    }

    fn observe_marked(
        &mut self,
        record: &PacketRecord,
        packet_type: MqttPacketType,
        packet_id: Option<u16>,
    ) {
        if matches!(packet_type, MqttPacketType::Other(_)) {
            return;
        }
        let msg_id = match packet_id {
            Some(id) => id.to_string(),
            None => match ConnectionKey::from_record(record) {
                Some(key) => format!("stream:{}", key.label()),
                None => return,
            },
        };
        let synthetic = packet_id.is_none();
        let ts = record.timestamp;

        match packet_type {
            MqttPacketType::Connect => {
                if let Some(src) = record.src_ip {
                    self.clients.insert(src);
                }
                if let Some(dst) = record.dst_ip {
                    self.brokers.insert(dst);
                }
                let times = self.message(&msg_id, synthetic);
                times.connect_time.get_or_insert(ts);
            }
            MqttPacketType::ConnAck => {
                if let Some(src) = record.src_ip {
                    self.brokers.insert(src);
                }
                let times = self.message(&msg_id, synthetic);
                times.connack_time.get_or_insert(ts);
            }
            MqttPacketType::Publish => {
                let to_broker = record.dst_port.is_some_and(|p| self.roles.is_broker_port(p));
                let from_broker = record.src_port.is_some_and(|p| self.roles.is_broker_port(p));
                let meta = publish_meta(record);
                let times = self.message(&msg_id, synthetic);
                if to_broker {
                    if times.client_publish_time.is_none() {
                        times.client_publish_time = Some(ts);
                        times.publish = Some(meta);
                    }
                } else if from_broker {
                    times.broker_forward_time.get_or_insert(ts);
                }
            }
            MqttPacketType::PubAck => {
                let from_broker = record.src_port.is_some_and(|p| self.roles.is_broker_port(p));
                let times = self.message(&msg_id, synthetic);
                if from_broker {
                    times.broker_ack_time.get_or_insert(ts);
                } else {
                    times.cloud_ack_time.get_or_insert(ts);
                }
            }
            MqttPacketType::Other(_) => {}
        }
    }

    /// Best-effort stage reconstruction for encrypted broker traffic.
    ///
    /// True message boundaries are not observable, so the stream id stands
    /// in for the message id and the first/second payload packet in each
    /// direction stands in for the four stages. This is an approximation,
    /// not exact parsing.
    fn observe_secure_stream(&mut self, record: &PacketRecord) {
        if record.transport != Transport::Tcp || record.payload_len == 0 {
            return;
        }
        let toward = record
            .dst_port
            .is_some_and(|p| self.roles.is_secure_broker_port(p));
        let from = record
            .src_port
            .is_some_and(|p| self.roles.is_secure_broker_port(p));
        if !toward && !from {
            return;
        }
        let Some(key) = ConnectionKey::from_record(record) else {
            return;
        };

        let direction = if toward {
            Direction::TowardBroker
        } else {
            Direction::FromBroker
        };
        let count = self
            .stream_counts
            .entry((key.clone(), direction))
            .or_insert(0);
        *count += 1;
        let occurrence = *count;

        let msg_id = format!("tls:{}", key.label());
        let ts = record.timestamp;
        let meta = publish_meta(record);
        let times = self.message(&msg_id, true);
        match (direction, occurrence) {
            (Direction::TowardBroker, 1) => {
                if times.client_publish_time.is_none() {
                    times.client_publish_time = Some(ts);
                    times.publish = Some(meta);
                }
            }
            (Direction::TowardBroker, 2) => {
                times.broker_forward_time.get_or_insert(ts);
            }
            (Direction::FromBroker, 1) => {
                times.broker_ack_time.get_or_insert(ts);
            }
            (Direction::FromBroker, 2) => {
                times.cloud_ack_time.get_or_insert(ts);
            }
            _ => {}
        }
    }

    fn message(&mut self, msg_id: &str, synthetic: bool) -> &mut MessageTimes {
        let times = self
            .messages
            .entry(msg_id.to_string())
            .or_insert_with(MessageTimes::default);
        times.synthetic |= synthetic;
        times
    }
}

fn publish_meta(record: &PacketRecord) -> PublishMeta {
    PublishMeta {
        payload_bytes: record.payload_len as u64,
        src_ip: record.src_ip,
        dst_ip: record.dst_ip,
    }
}
