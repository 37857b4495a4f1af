use std::collections::BTreeMap;
use std::path::Path;

use log::debug;
use thiserror::Error;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};

use crate::protocols::mqtt::reader::PortRoles;
use crate::source::{PacketSource, PcapFileSource, SourceError};
use crate::{
    CaptureSummary, ConnectionSummary, DEFAULT_GENERATED_AT, MetricsRow, PacketRow, Report,
    RetransEvent, TransportSection, make_base_report,
};

pub(crate) mod connections;
pub(crate) mod correlate;
pub(crate) mod delays;
pub(crate) mod record;
pub mod rootcause;
pub(crate) mod transport;

use connections::group_connections;
use correlate::MessageCorrelator;
use delays::{classify_delays, decompose_messages};
use record::{Extraction, PacketRecord, RecordExtractor, Transport};
use rootcause::{FactorSample, RootCauseAnalysis};
use transport::compute_connection_metrics;

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Source error: {0}")]
    Source(#[from] SourceError),
}

/// Analyse a capture file and assemble the full report.
pub fn analyze_pcap_file(path: &Path) -> Result<Report, AnalysisError> {
    let source = PcapFileSource::open(path)?;
    analyze_source(path, source)
}

/// Analyse frames from any [`PacketSource`].
///
/// One pass owns all state; nothing is shared across invocations. Frames
/// that cannot be normalized are counted and skipped, never fatal, so a
/// partially readable capture still yields a report.
pub fn analyze_source<S: PacketSource>(
    path: &Path,
    mut source: S,
) -> Result<Report, AnalysisError> {
    let mut extractor = RecordExtractor::new(PortRoles::default());
    let mut correlator = MessageCorrelator::new(PortRoles::default());
    let mut records: Vec<PacketRecord> = Vec::new();
    let mut skipped = 0u64;
    let mut first_ts = None;
    let mut last_ts = None;

    while let Some(frame) = source.next_frame()? {
        match extractor.extract(&frame) {
            Extraction::Record(packet) => {
                update_ts_bounds(&mut first_ts, &mut last_ts, packet.timestamp);
                correlator.observe(&packet);
                records.push(packet);
            }
            Extraction::Skipped => skipped += 1,
        }
    }
    if skipped > 0 {
        debug!("skipped {skipped} frames without a usable timestamp or link layer");
    }

    let mut protocol_counts: BTreeMap<String, u64> = BTreeMap::new();
    for packet in &records {
        *protocol_counts
            .entry(packet.protocol_label().to_string())
            .or_default() += 1;
    }
    let tcp_total = records
        .iter()
        .filter(|r| r.transport == Transport::Tcp)
        .count() as u64;
    let retrans_total = records.iter().filter(|r| r.is_retransmission).count() as u64;
    let tcp_packet_loss_pct =
        (tcp_total > 0).then(|| retrans_total as f64 / tcp_total as f64 * 100.0);

    let (messages, clients, brokers) = correlator.into_parts();
    debug!("detected clients: {clients:?}");
    debug!("detected brokers: {brokers:?}");

    let decomposed = decompose_messages(&messages);
    let delays = classify_delays(&decomposed);

    let mut rootcause = RootCauseAnalysis::new();
    for message in &decomposed {
        let Some(publish) = message.publish else {
            continue;
        };
        rootcause.add_sample(FactorSample {
            delay: message.total,
            packet_size: publish.payload_bytes,
            protocol: "MQTT".to_string(),
            source_ip: format_ip(publish.src_ip),
            destination_ip: format_ip(publish.dst_ip),
        });
    }

    let input_bytes = path.metadata().map(|meta| meta.len()).unwrap_or(0);
    let mut report = make_base_report(&path.display().to_string(), input_bytes);
    report.capture_summary = Some(CaptureSummary {
        packets_total: records.len() as u64,
        skipped_frames: skipped,
        time_start: ts_to_rfc3339(first_ts),
        time_end: ts_to_rfc3339(last_ts),
        protocol_counts,
        tcp_packet_loss_pct,
    });
    report.generated_at = report
        .capture_summary
        .as_ref()
        .and_then(|summary| summary.time_end.clone().or(summary.time_start.clone()))
        .unwrap_or_else(|| DEFAULT_GENERATED_AT.to_string());

    report.clients = clients.iter().map(|ip| ip.to_string()).collect();
    report.brokers = brokers.iter().map(|ip| ip.to_string()).collect();

    let mut ordered: Vec<&PacketRecord> = records.iter().collect();
    ordered.sort_by(|a, b| {
        a.timestamp
            .partial_cmp(&b.timestamp)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.index.cmp(&b.index))
    });
    report.packets = ordered.iter().map(|packet| packet_row(packet)).collect();
    report.retransmissions = ordered
        .iter()
        .filter(|packet| packet.is_retransmission)
        .map(|packet| RetransEvent {
            time: packet.timestamp,
            event: "TCP Retransmission".to_string(),
        })
        .collect();

    report.tcp = build_transport_section(&records, Transport::Tcp);
    report.udp = build_transport_section(&records, Transport::Udp);
    report.delays = delays;
    report.root_cause = rootcause.correlate();
    Ok(report)
}

fn packet_row(packet: &PacketRecord) -> PacketRow {
    PacketRow {
        timestamp: packet.timestamp,
        src_ip: packet.src_ip.map(|ip| ip.to_string()),
        dst_ip: packet.dst_ip.map(|ip| ip.to_string()),
        src_port: packet.src_port,
        dst_port: packet.dst_port,
        protocol: packet.protocol_label().to_string(),
        tcp_flags: packet.tcp.map(|meta| {
            let mut flags = String::new();
            for (set, letter) in [
                (meta.syn, 'S'),
                (meta.ack, 'A'),
                (meta.fin, 'F'),
                (meta.rst, 'R'),
            ] {
                if set {
                    flags.push(letter);
                }
            }
            flags
        }),
        payload_bytes: packet.payload_len as u64,
        retransmission: packet.is_retransmission,
    }
}

fn build_transport_section(records: &[PacketRecord], transport: Transport) -> TransportSection {
    let mut section = TransportSection::default();
    for (key, order) in group_connections(records, transport) {
        let (metrics, agg) = compute_connection_metrics(records, &order);
        let conn_id = key.label();

        section.connections.push(ConnectionSummary {
            conn_id: conn_id.clone(),
            packets: agg.packets,
            ipd_mean: agg.ipd_mean,
            ipd_std: agg.ipd_std,
            jitter_mean: agg.jitter_mean,
            jitter_max: agg.jitter_max,
            retransmissions: agg.retransmissions,
            packet_loss_pct: agg.packet_loss_pct,
            rtt_mean: agg.rtt_mean,
            rtt_max: agg.rtt_max,
            ack_delay_mean: agg.ack_delay_mean,
            retrans_delay_mean: agg.retrans_delay_mean,
            estimated_loss: agg.estimated_loss,
            estimated_loss_pct: agg.estimated_loss_pct,
            congestion_mean: agg.congestion_mean,
            congestion_max: agg.congestion_max,
        });

        for (pos, &idx) in order.iter().enumerate() {
            let derived = metrics[pos];
            section.rows.push(MetricsRow {
                conn_id: conn_id.clone(),
                timestamp: records[idx].timestamp,
                ipd: derived.ipd,
                jitter: derived.jitter,
                rtt: derived.rtt,
                ack_delay: derived.ack_delay,
                retrans_delay: derived.retrans_delay,
                possible_loss: derived.possible_loss,
                seq_loss: derived.seq_loss,
                congestion_score: derived.congestion_score,
            });
        }
    }
    section
}

fn format_ip(ip: Option<std::net::IpAddr>) -> String {
    ip.map(|ip| ip.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn update_ts_bounds(first: &mut Option<f64>, last: &mut Option<f64>, ts: f64) {
    match first {
        None => *first = Some(ts),
        Some(existing) => {
            if ts < *existing {
                *first = Some(ts);
            }
        }
    }
    match last {
        None => *last = Some(ts),
        Some(existing) => {
            if ts > *existing {
                *last = Some(ts);
            }
        }
    }
}

fn ts_to_rfc3339(ts: Option<f64>) -> Option<String> {
    let ts = ts?;
    let nanos = (ts * 1_000_000_000.0) as i128;
    OffsetDateTime::from_unix_timestamp_nanos(nanos)
        .ok()
        .and_then(|dt| dt.format(&Rfc3339).ok())
}
