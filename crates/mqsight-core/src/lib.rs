//! MQSight core library for post-mortem analysis of MQTT/IoT captures.
//!
//! This crate implements the offline analysis pipeline used by the CLI:
//! packet sources feed the analysis layer, which normalizes frames into
//! packet records, groups them into connections, derives transport metrics
//! (inter-packet delay, jitter, RTT, retransmission delay, loss estimates),
//! correlates MQTT message lifecycles across hops, and decomposes per-message
//! delay into device→broker, broker-processing and cloud-upload stages.
//! Parsing is byte-oriented and side-effect free; all I/O is isolated in
//! `source` modules. Protocol conventions (ports, role heuristics) are
//! captured in readers so parsers stay minimal.
//!
//! Invariants:
//! - Report outputs are deterministic and stable across runs.
//! - Base packet records are immutable; every derived metric lives in its
//!   own structure keyed by record identity and is recomputable from the
//!   records alone.
//! - Missing inputs leave derived fields absent; they are never substituted
//!   with fabricated values.
//!
//! # Examples
//! ```no_run
//! use std::path::Path;
//!
//! use mqsight_core::analyze_pcap_file;
//!
//! let report = analyze_pcap_file(Path::new("capture.pcapng"))?;
//! println!("packets: {}", report.packets.len());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

mod analysis;
mod protocols;
mod source;

pub use analysis::rootcause::{DelayStatistics, FactorSample, RootCauseAnalysis};
pub use analysis::{AnalysisError, analyze_pcap_file, analyze_source};
pub use protocols::mqtt::reader::{PortRoles, RoleHeuristic};
pub use source::{PacketSource, PcapFileSource, RawFrame, SourceError};

/// Current report schema version.
pub const REPORT_VERSION: u32 = 1;
/// Default timestamp used when no capture time is available.
pub const DEFAULT_GENERATED_AT: &str = "1970-01-01T00:00:00Z";

/// Aggregated analysis report with deterministic ordering.
///
/// # Examples
/// ```
/// use mqsight_core::make_base_report;
///
/// let report = make_base_report("capture.pcapng", 123);
/// assert_eq!(report.report_version, mqsight_core::REPORT_VERSION);
/// assert!(report.packets.is_empty());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    /// Report schema version (not the binary version).
    pub report_version: u32,
    /// Tool identification metadata.
    pub tool: ToolInfo,
    /// RFC3339 timestamp representing the report generation time.
    pub generated_at: String,

    /// Input capture metadata.
    pub input: InputInfo,

    /// Optional capture summary (may be empty when unavailable).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capture_summary: Option<CaptureSummary>,
    /// IPs observed initiating MQTT CONNECT, in stable order.
    pub clients: Vec<String>,
    /// IPs observed answering with CONNACK or addressed by CONNECT.
    pub brokers: Vec<String>,
    /// One row per retained packet, ordered by timestamp then capture order.
    pub packets: Vec<PacketRow>,
    /// TCP retransmission events in time order.
    pub retransmissions: Vec<RetransEvent>,
    /// Per-connection TCP metrics.
    pub tcp: TransportSection,
    /// Per-connection UDP metrics.
    pub udp: TransportSection,
    /// MQTT message delay decomposition and classification.
    pub delays: DelaySection,
    /// Univariate delay-vs-factor breakdowns.
    pub root_cause: RootCauseReport,
}

/// Tool metadata embedded in reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInfo {
    /// Tool name (e.g., "mqsight").
    pub name: String,
    /// Tool version (semver).
    pub version: String,
}

/// Input capture metadata embedded in reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputInfo {
    /// Input path as provided to the analyzer.
    pub path: String,
    /// Input size in bytes.
    pub bytes: u64,
}

/// Basic capture summary (timestamps may be absent).
///
/// # Examples
/// ```
/// use mqsight_core::CaptureSummary;
///
/// let summary = CaptureSummary {
///     packets_total: 10,
///     skipped_frames: 0,
///     time_start: None,
///     time_end: None,
///     protocol_counts: Default::default(),
///     tcp_packet_loss_pct: None,
/// };
/// assert_eq!(summary.packets_total, 10);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureSummary {
    /// Total packet count retained from the capture.
    pub packets_total: u64,
    /// Frames skipped for lack of a usable timestamp or link layer.
    pub skipped_frames: u64,
    /// RFC3339 timestamp of the first packet (if known).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_start: Option<String>,
    /// RFC3339 timestamp of the last packet (if known).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_end: Option<String>,
    /// Packet counts per protocol label (MQTT/TCP/UDP/OTHER).
    pub protocol_counts: BTreeMap<String, u64>,
    /// Trace-wide retransmissions over TCP packets, as a percentage.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_packet_loss_pct: Option<f64>,
}

/// One retained packet, as presented in the packet table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacketRow {
    /// Capture timestamp in epoch seconds.
    pub timestamp: f64,
    /// Source IP, when the frame carried a network layer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub src_ip: Option<String>,
    /// Destination IP, when the frame carried a network layer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dst_ip: Option<String>,
    /// Source port, when the frame carried TCP or UDP.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub src_port: Option<u16>,
    /// Destination port, when the frame carried TCP or UDP.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dst_port: Option<u16>,
    /// Protocol label: "MQTT", "TCP", "UDP" or "OTHER".
    pub protocol: String,
    /// Set TCP flags as a compact string (e.g. "S", "SA"), TCP only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_flags: Option<String>,
    /// Transport payload length in bytes.
    pub payload_bytes: u64,
    /// Set when the packet repeats an already-seen sequence number.
    pub retransmission: bool,
}

/// Single retransmission event for the events table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetransEvent {
    /// Event timestamp in epoch seconds.
    pub time: f64,
    /// Event label (currently always "TCP Retransmission").
    pub event: String,
}

/// Per-transport metrics output: connection aggregates plus per-packet rows.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportSection {
    /// One aggregate per connection, ordered by connection id.
    pub connections: Vec<ConnectionSummary>,
    /// One row per packet with its connection-scoped derived metrics.
    pub rows: Vec<MetricsRow>,
}

/// Aggregate statistics for one connection.
///
/// TCP-only aggregates (RTT, ACK delay, retransmissions) and UDP-only
/// aggregates (estimated loss, congestion) are absent on the other
/// transport's summaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSummary {
    /// Canonical connection id, e.g. `10.0.0.1:1000<->10.0.0.2:1883/tcp`.
    pub conn_id: String,
    /// Packets observed on the connection (both directions).
    pub packets: u64,
    /// Mean inter-packet delay in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipd_mean: Option<f64>,
    /// Sample standard deviation of the inter-packet delay.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipd_std: Option<f64>,
    /// Mean jitter in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jitter_mean: Option<f64>,
    /// Maximum jitter in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jitter_max: Option<f64>,
    /// Retransmitted packets observed (TCP).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retransmissions: Option<u64>,
    /// Retransmissions over total packets, as a percentage (TCP).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packet_loss_pct: Option<f64>,
    /// Mean handshake RTT in seconds (TCP).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rtt_mean: Option<f64>,
    /// Maximum handshake RTT in seconds (TCP).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rtt_max: Option<f64>,
    /// Mean payload-to-ACK delay in seconds (TCP).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ack_delay_mean: Option<f64>,
    /// Mean retransmission delay in seconds (TCP).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retrans_delay_mean: Option<f64>,
    /// Estimated lost packets from timing gaps (UDP).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_loss: Option<u64>,
    /// Estimated loss over observed-plus-lost packets, as a percentage (UDP).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_loss_pct: Option<f64>,
    /// Mean congestion score (UDP, heuristic index).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub congestion_mean: Option<f64>,
    /// Maximum congestion score (UDP, heuristic index).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub congestion_max: Option<f64>,
}

/// One packet augmented with its connection-scoped derived metrics.
///
/// Absent fields mean the metric is undefined for that packet (insufficient
/// history, no matching handshake, wrong transport), never zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsRow {
    /// Canonical connection id this packet belongs to.
    pub conn_id: String,
    /// Capture timestamp in epoch seconds.
    pub timestamp: f64,
    /// Gap from the previous packet in the same connection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipd: Option<f64>,
    /// Absolute difference between consecutive IPD values.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jitter: Option<f64>,
    /// SYN to SYN-ACK span, attached to the SYN packet.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rtt: Option<f64>,
    /// Payload-send to cumulative-ACK span.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ack_delay: Option<f64>,
    /// Gap between a retransmission and the first send of its sequence number.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retrans_delay: Option<f64>,
    /// Estimated packets lost in the gap preceding this packet (UDP).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub possible_loss: Option<u64>,
    /// Sequence-number gap to the previous packet (UDP, sequence-tracked).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq_loss: Option<u64>,
    /// Heuristic congestion index (UDP); not a calibrated metric.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub congestion_score: Option<f64>,
}

/// Delay decomposition output for completable MQTT messages.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DelaySection {
    /// Anomaly cutoffs per delay column, absent when no message completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thresholds: Option<DelayThresholds>,
    /// Distribution statistics per delay column, in stable order.
    pub stats: Vec<DelayColumnStats>,
    /// One row per completable message, ordered by publish time then id.
    pub messages: Vec<DelayRow>,
}

/// Anomaly cutoffs (`mean + k·std`) per delay column.
///
/// Computed once per analysis pass over the whole result set and passed
/// explicitly; consumers must not recompute or cache them elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DelayThresholds {
    /// Cutoff for the device→broker stage (k = 2.0).
    pub device_to_broker: f64,
    /// Cutoff for the broker-processing stage (k = 2.5).
    pub broker_processing: f64,
    /// Cutoff for the cloud-upload stage (k = 3.0).
    pub cloud_upload: f64,
    /// Cutoff for the total delay (k = 2.0).
    pub total: f64,
}

/// Distribution statistics for one delay column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelayColumnStats {
    /// Column name, e.g. "device_to_broker_delay".
    pub column: String,
    /// Arithmetic mean in seconds.
    pub mean: f64,
    /// Median in seconds.
    pub median: f64,
    /// Maximum in seconds.
    pub max: f64,
    /// Sample standard deviation in seconds.
    pub std: f64,
}

/// One completed MQTT message with its delay decomposition.
///
/// # Examples
/// ```
/// use mqsight_core::{Bottleneck, DelayCategory, DelayRow};
///
/// let row = DelayRow {
///     msg_id: "7".to_string(),
///     synthetic_id: false,
///     device_publish_time: 10.0,
///     device_to_broker_delay: 0.020,
///     broker_processing_delay: 0.005,
///     cloud_upload_delay: 0.175,
///     total_delay: 0.200,
///     device_to_broker_category: DelayCategory::Normal,
///     broker_processing_category: DelayCategory::Normal,
///     cloud_upload_category: DelayCategory::Normal,
///     is_anomaly: false,
///     bottleneck: Bottleneck::CloudUpload,
/// };
/// assert_eq!(row.bottleneck.to_string(), "Cloud Upload");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelayRow {
    /// Message identifier; synthesized for heuristic traffic.
    pub msg_id: String,
    /// True when the id was synthesized from a stream rather than parsed.
    pub synthetic_id: bool,
    /// Timestamp of the client publish observation, epoch seconds.
    pub device_publish_time: f64,
    /// Broker ACK minus client publish, seconds.
    pub device_to_broker_delay: f64,
    /// Broker forward minus broker ACK, seconds (0 when unobserved).
    pub broker_processing_delay: f64,
    /// Cloud ACK minus broker forward, seconds (0 when unobserved).
    pub cloud_upload_delay: f64,
    /// End-to-end delay, falling back to the two-stage sum.
    pub total_delay: f64,
    /// Ordinal category of the device→broker stage.
    pub device_to_broker_category: DelayCategory,
    /// Ordinal category of the broker-processing stage.
    pub broker_processing_category: DelayCategory,
    /// Ordinal category of the cloud-upload stage.
    pub cloud_upload_category: DelayCategory,
    /// True when any per-column anomaly flag fired for this message.
    pub is_anomaly: bool,
    /// Stage with the largest delay for this message.
    pub bottleneck: Bottleneck,
}

/// Ordinal delay bucket relative to the column distribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayCategory {
    Low,
    Normal,
    High,
    VeryHigh,
}

impl std::fmt::Display for DelayCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DelayCategory::Low => "Low",
            DelayCategory::Normal => "Normal",
            DelayCategory::High => "High",
            DelayCategory::VeryHigh => "Very High",
        };
        write!(f, "{label}")
    }
}

/// Pipeline stage dominating a message's delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bottleneck {
    DeviceToBroker,
    BrokerProcessing,
    CloudUpload,
}

impl std::fmt::Display for Bottleneck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Bottleneck::DeviceToBroker => "Device->Broker",
            Bottleneck::BrokerProcessing => "Broker Processing",
            Bottleneck::CloudUpload => "Cloud Upload",
        };
        write!(f, "{label}")
    }
}

/// Univariate delay-vs-factor breakdown.
///
/// Each map holds the arithmetic mean delay per distinct factor value. This
/// is a grouping utility, not a statistical model; no cross-factor
/// correlation is performed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RootCauseReport {
    /// Overall delay statistics (zeros when no samples were recorded).
    pub stats: DelayStatistics,
    /// Mean delay per packet size in bytes.
    pub by_packet_size: BTreeMap<u64, f64>,
    /// Mean delay per protocol label.
    pub by_protocol: BTreeMap<String, f64>,
    /// Mean delay per source IP.
    pub by_source_ip: BTreeMap<String, f64>,
    /// Mean delay per destination IP.
    pub by_destination_ip: BTreeMap<String, f64>,
}

impl RootCauseReport {
    /// Render the plain-text report consumed by the CLI.
    pub fn render(&self) -> String {
        let mut lines = Vec::new();
        lines.push("=== Root Cause Analysis Report ===".to_string());
        lines.push(format!("Min Delay: {:.4} s", self.stats.min_delay));
        lines.push(format!("Max Delay: {:.4} s", self.stats.max_delay));
        lines.push(format!("Avg Delay: {:.4} s", self.stats.avg_delay));
        lines.push(format!("Median Delay: {:.4} s", self.stats.median_delay));
        lines.push(String::new());

        lines.push("--- Mean Delay by Packet Size ---".to_string());
        for (size, delay) in &self.by_packet_size {
            lines.push(format!("  {size} bytes -> {delay:.4} s"));
        }
        lines.push(String::new());

        lines.push("--- Mean Delay by Protocol ---".to_string());
        for (proto, delay) in &self.by_protocol {
            lines.push(format!("  {proto} -> {delay:.4} s"));
        }
        lines.push(String::new());

        lines.push("--- Mean Delay by Source IP ---".to_string());
        for (ip, delay) in &self.by_source_ip {
            lines.push(format!("  {ip} -> {delay:.4} s"));
        }
        lines.push(String::new());

        lines.push("--- Mean Delay by Destination IP ---".to_string());
        for (ip, delay) in &self.by_destination_ip {
            lines.push(format!("  {ip} -> {delay:.4} s"));
        }

        lines.join("\n")
    }
}

/// Build a report with base fields filled and empty aggregates.
///
/// # Examples
/// ```
/// use mqsight_core::make_base_report;
///
/// let report = make_base_report("capture.pcapng", 123);
/// assert_eq!(report.input.bytes, 123);
/// assert!(report.delays.messages.is_empty());
/// ```
pub fn make_base_report(input_path: &str, input_bytes: u64) -> Report {
    Report {
        report_version: REPORT_VERSION,
        tool: ToolInfo {
            name: "mqsight".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
        generated_at: DEFAULT_GENERATED_AT.to_string(),
        input: InputInfo {
            path: input_path.to_string(),
            bytes: input_bytes,
        },
        capture_summary: None,
        clients: vec![],
        brokers: vec![],
        packets: vec![],
        retransmissions: vec![],
        tcp: TransportSection::default(),
        udp: TransportSection::default(),
        delays: DelaySection::default(),
        root_cause: RootCauseReport::default(),
    }
}
