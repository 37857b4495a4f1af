use std::path::Path;

use etherparse::PacketBuilder;
use pcap_parser::Linktype;

use mqsight_core::{Bottleneck, PacketSource, RawFrame, Report, SourceError, analyze_source};

struct VecSource {
    frames: std::vec::IntoIter<RawFrame>,
}

impl VecSource {
    fn new(frames: Vec<RawFrame>) -> Self {
        Self {
            frames: frames.into_iter(),
        }
    }
}

impl PacketSource for VecSource {
    fn next_frame(&mut self) -> Result<Option<RawFrame>, SourceError> {
        Ok(self.frames.next())
    }
}

const DEVICE_IP: [u8; 4] = [10, 0, 0, 10];
const BROKER_IP: [u8; 4] = [10, 0, 0, 1];
const CLOUD_IP: [u8; 4] = [203, 0, 113, 5];

fn tcp_frame(
    ts: f64,
    src: ([u8; 4], u16),
    dst: ([u8; 4], u16),
    seq: u32,
    syn: bool,
    ack: Option<u32>,
    payload: &[u8],
) -> RawFrame {
    let mut builder = PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [7, 8, 9, 10, 11, 12])
        .ipv4(src.0, dst.0, 64)
        .tcp(src.1, dst.1, seq, 4096);
    if syn {
        builder = builder.syn();
    }
    if let Some(ack_num) = ack {
        builder = builder.ack(ack_num);
    }
    let mut data = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut data, payload).unwrap();
    RawFrame {
        ts: Some(ts),
        linktype: Linktype::ETHERNET,
        data,
    }
}

fn udp_frame(ts: f64, src: ([u8; 4], u16), dst: ([u8; 4], u16), payload: &[u8]) -> RawFrame {
    let builder = PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [7, 8, 9, 10, 11, 12])
        .ipv4(src.0, dst.0, 64)
        .udp(src.1, dst.1);
    let mut data = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut data, payload).unwrap();
    RawFrame {
        ts: Some(ts),
        linktype: Linktype::ETHERNET,
        data,
    }
}

fn mqtt_publish_qos1(topic: &[u8], packet_id: u16, body: &[u8]) -> Vec<u8> {
    let remaining = 2 + topic.len() + 2 + body.len();
    let mut bytes = vec![0x32, remaining as u8];
    bytes.extend_from_slice(&(topic.len() as u16).to_be_bytes());
    bytes.extend_from_slice(topic);
    bytes.extend_from_slice(&packet_id.to_be_bytes());
    bytes.extend_from_slice(body);
    bytes
}

fn mqtt_puback(packet_id: u16) -> Vec<u8> {
    let mut bytes = vec![0x40, 0x02];
    bytes.extend_from_slice(&packet_id.to_be_bytes());
    bytes
}

fn sample_trace() -> Vec<RawFrame> {
    let device = (DEVICE_IP, 40001u16);
    let broker = (BROKER_IP, 1883u16);
    let cloud = (CLOUD_IP, 40999u16);
    let publish = mqtt_publish_qos1(b"sensors/temp", 7, b"21.5");

    vec![
        // Handshake between device and broker.
        tcp_frame(0.000, device, broker, 100, true, None, &[]),
        tcp_frame(0.050, broker, device, 200, true, Some(101), &[]),
        // MQTT session setup.
        tcp_frame(1.000, device, broker, 101, false, Some(201), &[0x10, 0x00]),
        tcp_frame(1.100, broker, device, 201, false, Some(103), &[0x20, 0x02, 0x00, 0x00]),
        // Message 7 across all four stages.
        tcp_frame(10.000, device, broker, 103, false, Some(205), &publish),
        tcp_frame(10.020, broker, device, 205, false, Some(125), &mqtt_puback(7)),
        tcp_frame(10.025, broker, cloud, 300, false, None, &publish),
        tcp_frame(10.200, cloud, broker, 400, false, Some(322), &mqtt_puback(7)),
        // A plain TCP exchange with one retransmission.
        tcp_frame(3.000, (DEVICE_IP, 40002), ([10, 0, 0, 9], 9000), 500, false, None, b"abc"),
        tcp_frame(3.500, (DEVICE_IP, 40002), ([10, 0, 0, 9], 9000), 500, false, None, b"abc"),
        // A UDP flow with one large timing gap.
        udp_frame(0.0, ([10, 0, 0, 20], 5001), ([10, 0, 0, 2], 6001), b"pkt"),
        udp_frame(1.0, ([10, 0, 0, 20], 5001), ([10, 0, 0, 2], 6001), b"pkt"),
        udp_frame(2.0, ([10, 0, 0, 20], 5001), ([10, 0, 0, 2], 6001), b"pkt"),
        udp_frame(3.0, ([10, 0, 0, 20], 5001), ([10, 0, 0, 2], 6001), b"pkt"),
        udp_frame(100.0, ([10, 0, 0, 20], 5001), ([10, 0, 0, 2], 6001), b"pkt"),
    ]
}

fn analyze(frames: Vec<RawFrame>) -> Report {
    analyze_source(Path::new("synthetic.pcap"), VecSource::new(frames)).expect("analysis")
}

#[test]
fn full_pipeline_reconstructs_message_delays() {
    let report = analyze(sample_trace());

    let row = report
        .delays
        .messages
        .iter()
        .find(|m| m.msg_id == "7")
        .expect("delay row for message 7");
    assert!((row.device_to_broker_delay - 0.020).abs() < 1e-9);
    assert!((row.broker_processing_delay - 0.005).abs() < 1e-9);
    assert!((row.cloud_upload_delay - 0.175).abs() < 1e-9);
    assert!((row.total_delay - 0.200).abs() < 1e-9);
    assert_eq!(row.bottleneck, Bottleneck::CloudUpload);
    assert!(!row.synthetic_id);
    assert!(report.delays.thresholds.is_some());
}

#[test]
fn endpoint_inventory_comes_from_connect_exchange() {
    let report = analyze(sample_trace());
    assert_eq!(report.clients, vec!["10.0.0.10"]);
    assert_eq!(report.brokers, vec!["10.0.0.1"]);
}

#[test]
fn retransmission_is_flagged_and_listed() {
    let report = analyze(sample_trace());

    assert_eq!(report.retransmissions.len(), 1);
    assert!((report.retransmissions[0].time - 3.5).abs() < 1e-9);
    assert_eq!(report.retransmissions[0].event, "TCP Retransmission");

    let retrans_conn = report
        .tcp
        .connections
        .iter()
        .find(|c| c.conn_id.contains("40002"))
        .expect("retransmitting connection");
    assert_eq!(retrans_conn.retransmissions, Some(1));
    assert!((retrans_conn.packet_loss_pct.unwrap() - 50.0).abs() < 1e-9);

    let retrans_row = report
        .tcp
        .rows
        .iter()
        .find(|r| r.retrans_delay.is_some())
        .expect("retransmission delay row");
    assert!((retrans_row.retrans_delay.unwrap() - 0.5).abs() < 1e-9);
}

#[test]
fn handshake_rtt_lands_on_the_syn_row() {
    let report = analyze(sample_trace());
    let syn_row = report
        .tcp
        .rows
        .iter()
        .find(|r| r.rtt.is_some())
        .expect("rtt row");
    assert!((syn_row.rtt.unwrap() - 0.050).abs() < 1e-9);
    assert!((syn_row.timestamp - 0.0).abs() < 1e-9);
}

#[test]
fn udp_gap_produces_loss_estimate() {
    let report = analyze(sample_trace());
    let udp_conn = &report.udp.connections[0];
    assert_eq!(udp_conn.packets, 5);
    assert_eq!(udp_conn.estimated_loss, Some(3));

    let flagged = report
        .udp
        .rows
        .iter()
        .find(|r| r.possible_loss.is_some_and(|loss| loss > 0))
        .expect("flagged udp row");
    assert_eq!(flagged.possible_loss, Some(3));
    assert!((flagged.timestamp - 100.0).abs() < 1e-9);
}

#[test]
fn capture_summary_counts_protocols() {
    let report = analyze(sample_trace());
    let summary = report.capture_summary.expect("capture summary");

    assert_eq!(summary.packets_total, 15);
    assert_eq!(summary.skipped_frames, 0);
    assert_eq!(summary.protocol_counts.get("MQTT"), Some(&6));
    assert_eq!(summary.protocol_counts.get("TCP"), Some(&4));
    assert_eq!(summary.protocol_counts.get("UDP"), Some(&5));
    // One retransmission over ten TCP-transport packets.
    assert!((summary.tcp_packet_loss_pct.unwrap() - 10.0).abs() < 1e-9);
}

#[test]
fn packet_table_is_time_ordered() {
    let report = analyze(sample_trace());
    assert_eq!(report.packets.len(), 15);
    for pair in report.packets.windows(2) {
        assert!(pair[0].timestamp <= pair[1].timestamp);
    }

    // The handshake SYN sorts first and both handshake rows carry flags.
    assert_eq!(report.packets[0].tcp_flags.as_deref(), Some("S"));
    assert!(
        report
            .packets
            .iter()
            .any(|p| p.tcp_flags.as_deref() == Some("SA"))
    );
}

#[test]
fn root_cause_joins_publish_context() {
    let report = analyze(sample_trace());
    let publish_len = mqtt_publish_qos1(b"sensors/temp", 7, b"21.5").len() as u64;

    assert!((report.root_cause.by_protocol["MQTT"] - 0.200).abs() < 1e-9);
    assert!((report.root_cause.by_source_ip["10.0.0.10"] - 0.200).abs() < 1e-9);
    assert!(report.root_cause.by_packet_size.contains_key(&publish_len));
    let text = report.root_cause.render();
    assert!(text.contains("Root Cause Analysis Report"));
}

#[test]
fn analysis_is_deterministic() {
    let first = serde_json::to_value(analyze(sample_trace())).unwrap();
    let second = serde_json::to_value(analyze(sample_trace())).unwrap();
    assert_eq!(first, second);
}

#[test]
fn empty_source_yields_empty_report() {
    let report = analyze(Vec::new());
    assert!(report.packets.is_empty());
    assert!(report.delays.messages.is_empty());
    assert!(report.delays.thresholds.is_none());
    assert!(report.tcp.connections.is_empty());
    assert_eq!(report.root_cause.stats.min_delay, 0.0);
    assert_eq!(report.generated_at, mqsight_core::DEFAULT_GENERATED_AT);
}
