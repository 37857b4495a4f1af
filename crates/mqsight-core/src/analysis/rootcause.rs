use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::RootCauseReport;

/// Overall delay statistics; zeros when no samples were recorded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DelayStatistics {
    pub min_delay: f64,
    pub max_delay: f64,
    pub avg_delay: f64,
    pub median_delay: f64,
}

/// One delay observation with its exogenous factors.
#[derive(Debug, Clone)]
pub struct FactorSample {
    /// Delay measurement in seconds.
    pub delay: f64,
    /// Packet size in bytes.
    pub packet_size: u64,
    /// Protocol label (e.g. "MQTT", "TCP").
    pub protocol: String,
    pub source_ip: String,
    pub destination_ip: String,
}

/// Univariate delay-vs-factor grouping.
///
/// Groups samples by each factor independently and reports the arithmetic
/// mean delay per distinct value. No cross-factor correlation is performed;
/// this is a grouping utility, not a statistical model, and its output must
/// not be read as causal.
#[derive(Debug, Default)]
pub struct RootCauseAnalysis {
    samples: Vec<FactorSample>,
}

impl RootCauseAnalysis {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one observation. Samples are never dropped or deduplicated.
    pub fn add_sample(&mut self, sample: FactorSample) {
        self.samples.push(sample);
    }

    /// Overall min/max/mean/median of the recorded delays.
    pub fn statistics(&self) -> DelayStatistics {
        if self.samples.is_empty() {
            return DelayStatistics::default();
        }
        let mut delays: Vec<f64> = self.samples.iter().map(|s| s.delay).collect();
        delays.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let mid = delays.len() / 2;
        let median = if delays.len() % 2 == 1 {
            delays[mid]
        } else {
            (delays[mid - 1] + delays[mid]) / 2.0
        };

        DelayStatistics {
            min_delay: delays[0],
            max_delay: delays[delays.len() - 1],
            avg_delay: delays.iter().sum::<f64>() / delays.len() as f64,
            median_delay: median,
        }
    }

    /// Build the full report: overall statistics plus per-factor means.
    pub fn correlate(&self) -> RootCauseReport {
        let mut by_packet_size: BTreeMap<u64, Acc> = BTreeMap::new();
        let mut by_protocol: BTreeMap<String, Acc> = BTreeMap::new();
        let mut by_source_ip: BTreeMap<String, Acc> = BTreeMap::new();
        let mut by_destination_ip: BTreeMap<String, Acc> = BTreeMap::new();

        for sample in &self.samples {
            by_packet_size
                .entry(sample.packet_size)
                .or_default()
                .push(sample.delay);
            by_protocol
                .entry(sample.protocol.clone())
                .or_default()
                .push(sample.delay);
            by_source_ip
                .entry(sample.source_ip.clone())
                .or_default()
                .push(sample.delay);
            by_destination_ip
                .entry(sample.destination_ip.clone())
                .or_default()
                .push(sample.delay);
        }

        RootCauseReport {
            stats: self.statistics(),
            by_packet_size: finish(by_packet_size),
            by_protocol: finish(by_protocol),
            by_source_ip: finish(by_source_ip),
            by_destination_ip: finish(by_destination_ip),
        }
    }
}

#[derive(Debug, Default)]
struct Acc {
    sum: f64,
    count: u64,
}

impl Acc {
    fn push(&mut self, delay: f64) {
        self.sum += delay;
        self.count += 1;
    }

    fn mean(&self) -> f64 {
        self.sum / self.count as f64
    }
}

fn finish<K: Ord>(groups: BTreeMap<K, Acc>) -> BTreeMap<K, f64> {
    groups.into_iter().map(|(k, acc)| (k, acc.mean())).collect()
}
