use std::collections::HashMap;

use super::record::{PacketRecord, Transport};

/// Derived metrics for one packet within its connection.
///
/// `None` means undefined (insufficient history, no match found), never zero.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub(crate) struct PacketMetrics {
    pub ipd: Option<f64>,
    pub jitter: Option<f64>,
    pub rtt: Option<f64>,
    pub ack_delay: Option<f64>,
    pub retrans_delay: Option<f64>,
    pub possible_loss: Option<u64>,
    pub seq_loss: Option<u64>,
    pub congestion_score: Option<f64>,
}

/// Aggregate statistics for one connection.
#[derive(Debug, Clone, Default)]
pub(crate) struct ConnectionAggregates {
    pub packets: u64,
    pub retransmissions: Option<u64>,
    pub packet_loss_pct: Option<f64>,
    pub ipd_mean: Option<f64>,
    pub ipd_std: Option<f64>,
    pub jitter_mean: Option<f64>,
    pub jitter_max: Option<f64>,
    pub rtt_mean: Option<f64>,
    pub rtt_max: Option<f64>,
    pub ack_delay_mean: Option<f64>,
    pub retrans_delay_mean: Option<f64>,
    pub estimated_loss: Option<u64>,
    pub estimated_loss_pct: Option<f64>,
    pub congestion_mean: Option<f64>,
    pub congestion_max: Option<f64>,
}

/// Single pass over one time-ordered connection.
///
/// `order` holds record indices sorted by the grouper; the returned metrics
/// vector is parallel to it. A computation that cannot produce a defined
/// value leaves the field `None` for that packet; the pass never aborts.
pub(crate) fn compute_connection_metrics(
    records: &[PacketRecord],
    order: &[usize],
) -> (Vec<PacketMetrics>, ConnectionAggregates) {
    let mut metrics = vec![PacketMetrics::default(); order.len()];
    if order.is_empty() {
        return (metrics, ConnectionAggregates::default());
    }
    let transport = records[order[0]].transport;

    for pos in 1..order.len() {
        let ipd = records[order[pos]].timestamp - records[order[pos - 1]].timestamp;
        metrics[pos].ipd = Some(ipd);
        if let Some(prev_ipd) = metrics[pos - 1].ipd {
            metrics[pos].jitter = Some((ipd - prev_ipd).abs());
        }
    }

    match transport {
        Transport::Tcp => compute_tcp_metrics(records, order, &mut metrics),
        Transport::Udp => compute_udp_metrics(records, order, &mut metrics),
        Transport::Other => {}
    }

    let aggregates = aggregate(records, order, &metrics, transport);
    (metrics, aggregates)
}

fn compute_tcp_metrics(records: &[PacketRecord], order: &[usize], metrics: &mut [PacketMetrics]) {
    // Retransmission delay: first occurrence of each sequence number wins.
    let mut first_seen: HashMap<u32, usize> = HashMap::new();
    for (pos, &idx) in order.iter().enumerate() {
        let Some(meta) = records[idx].tcp else { continue };
        if meta.seq == 0 {
            continue;
        }
        match first_seen.get(&meta.seq) {
            Some(&first) => {
                metrics[pos].retrans_delay =
                    Some(records[idx].timestamp - records[order[first]].timestamp);
            }
            None => {
                first_seen.insert(meta.seq, pos);
            }
        }
    }

    // Handshake RTT: SYN-only packet paired with the first SYN-ACK after it.
    for (pos, &idx) in order.iter().enumerate() {
        let Some(meta) = records[idx].tcp else { continue };
        if !(meta.syn && !meta.ack) {
            continue;
        }
        for &later in &order[pos + 1..] {
            let Some(other) = records[later].tcp else { continue };
            if other.syn && other.ack {
                metrics[pos].rtt = Some(records[later].timestamp - records[idx].timestamp);
                break;
            }
        }
    }

    // ACK delay: payload packet immediately followed by its cumulative ACK.
    for pos in 0..order.len().saturating_sub(1) {
        let record = &records[order[pos]];
        let Some(meta) = record.tcp else { continue };
        if record.payload_len == 0 {
            continue;
        }
        let next = &records[order[pos + 1]];
        let Some(next_meta) = next.tcp else { continue };
        let expected = meta.seq.wrapping_add(record.payload_len as u32);
        if next_meta.ack && next_meta.ack_num == expected {
            metrics[pos].ack_delay = Some(next.timestamp - record.timestamp);
        }
    }
}

fn compute_udp_metrics(records: &[PacketRecord], order: &[usize], metrics: &mut [PacketMetrics]) {
    let defined: Vec<f64> = metrics.iter().filter_map(|m| m.ipd).collect();
    let n = defined.len();
    let sum: f64 = defined.iter().sum();
    let sum_sq: f64 = defined.iter().map(|v| v * v).sum();
    let conn_mean = if n > 0 { sum / n as f64 } else { 0.0 };

    // Timing-gap loss estimate. An outlier inflates a standard deviation it
    // is part of and can mask itself with few samples, so each gap is tested
    // against the spread of the remaining gaps; the loss count itself uses
    // the full-connection mean.
    for metric in metrics.iter_mut() {
        let Some(ipd) = metric.ipd else { continue };
        let mut loss = 0u64;
        if n >= 2 {
            let rest_n = (n - 1) as f64;
            let rest_mean = (sum - ipd) / rest_n;
            let rest_var = ((sum_sq - ipd * ipd) / rest_n - rest_mean * rest_mean).max(0.0);
            let threshold = rest_mean + 3.0 * rest_var.sqrt();
            if ipd > threshold && conn_mean > 0.0 {
                loss = ((ipd / conn_mean).ceil() as u64).saturating_sub(1);
            }
        }
        metric.possible_loss = Some(loss);
    }

    // Sequence-gap loss, only meaningful when the whole connection carries
    // RTP-like sequence numbers.
    if order.iter().all(|&idx| records[idx].udp_seq.is_some()) {
        for pos in 1..order.len() {
            let prev = records[order[pos - 1]].udp_seq.unwrap_or(0) as i64;
            let curr = records[order[pos]].udp_seq.unwrap_or(0) as i64;
            let gap = curr - (prev + 1);
            metrics[pos].seq_loss = Some(gap.max(0) as u64);
        }
    }

    // Heuristic congestion index, not a calibrated metric.
    for metric in metrics.iter_mut() {
        if metric.ipd.is_none() {
            continue;
        }
        let jitter_term = match (metric.jitter, conn_mean > 0.0) {
            (Some(jitter), true) => jitter / conn_mean,
            _ => 0.0,
        };
        let loss_term = metric.possible_loss.unwrap_or(0) as f64 / 5.0;
        metric.congestion_score = Some(0.5 * jitter_term + 0.5 * loss_term);
    }
}

fn aggregate(
    records: &[PacketRecord],
    order: &[usize],
    metrics: &[PacketMetrics],
    transport: Transport,
) -> ConnectionAggregates {
    let mut agg = ConnectionAggregates {
        packets: order.len() as u64,
        ..Default::default()
    };

    let ipds: Vec<f64> = metrics.iter().filter_map(|m| m.ipd).collect();
    agg.ipd_mean = mean(&ipds);
    agg.ipd_std = sample_std(&ipds);
    let jitters: Vec<f64> = metrics.iter().filter_map(|m| m.jitter).collect();
    agg.jitter_mean = mean(&jitters);
    agg.jitter_max = max(&jitters);

    match transport {
        Transport::Tcp => {
            let retrans = order
                .iter()
                .filter(|&&idx| records[idx].is_retransmission)
                .count() as u64;
            agg.retransmissions = Some(retrans);
            agg.packet_loss_pct = Some(retrans as f64 / order.len() as f64 * 100.0);

            let rtts: Vec<f64> = metrics.iter().filter_map(|m| m.rtt).collect();
            agg.rtt_mean = mean(&rtts);
            agg.rtt_max = max(&rtts);
            let acks: Vec<f64> = metrics.iter().filter_map(|m| m.ack_delay).collect();
            agg.ack_delay_mean = mean(&acks);
            let delays: Vec<f64> = metrics.iter().filter_map(|m| m.retrans_delay).collect();
            agg.retrans_delay_mean = mean(&delays);
        }
        Transport::Udp => {
            let loss: u64 = metrics.iter().filter_map(|m| m.possible_loss).sum();
            agg.estimated_loss = Some(loss);
            let denom = agg.packets + loss;
            if denom > 0 {
                agg.estimated_loss_pct = Some(loss as f64 / denom as f64 * 100.0);
            }
            let scores: Vec<f64> = metrics.iter().filter_map(|m| m.congestion_score).collect();
            agg.congestion_mean = mean(&scores);
            agg.congestion_max = max(&scores);
        }
        Transport::Other => {}
    }

    agg
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

fn sample_std(values: &[f64]) -> Option<f64> {
    let mean = mean(values)?;
    if values.len() < 2 {
        return Some(0.0);
    }
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    Some(var.sqrt())
}

fn max(values: &[f64]) -> Option<f64> {
    values.iter().copied().reduce(f64::max)
}
