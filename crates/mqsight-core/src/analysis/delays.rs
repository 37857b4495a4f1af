use std::collections::BTreeMap;

use crate::{Bottleneck, DelayCategory, DelayColumnStats, DelayRow, DelaySection, DelayThresholds};

use super::correlate::{MessageTimes, PublishMeta};

/// Anomaly sensitivity per delay column; the cloud path is treated as
/// inherently more variable.
const K_DEVICE_TO_BROKER: f64 = 2.0;
const K_BROKER_PROCESSING: f64 = 2.5;
const K_CLOUD_UPLOAD: f64 = 3.0;
const K_TOTAL: f64 = 2.0;

/// Raw delay decomposition for one completable message.
#[derive(Debug, Clone)]
pub(crate) struct Decomposition {
    pub msg_id: String,
    pub synthetic: bool,
    pub device_publish_time: f64,
    pub device_to_broker: f64,
    pub broker_processing: f64,
    pub cloud_upload: f64,
    pub total: f64,
    pub publish: Option<PublishMeta>,
}

/// Derive stage delays for every completable message.
///
/// Messages missing either the client publish or the broker ACK are
/// abandoned and excluded. Unobserved later stages contribute zero, and the
/// total falls back to the two-stage sum when no cloud ACK was seen.
pub(crate) fn decompose_messages(messages: &BTreeMap<String, MessageTimes>) -> Vec<Decomposition> {
    let mut decomposed: Vec<Decomposition> = messages
        .iter()
        .filter_map(|(msg_id, times)| {
            let client_publish = times.client_publish_time?;
            let broker_ack = times.broker_ack_time?;

            let device_to_broker = broker_ack - client_publish;
            let broker_processing = times
                .broker_forward_time
                .map(|forward| forward - broker_ack)
                .unwrap_or(0.0);
            let cloud_upload = match (times.cloud_ack_time, times.broker_forward_time) {
                (Some(cloud_ack), Some(forward)) => cloud_ack - forward,
                _ => 0.0,
            };
            let total = match times.cloud_ack_time {
                Some(cloud_ack) => cloud_ack - client_publish,
                None => device_to_broker + broker_processing,
            };

            Some(Decomposition {
                msg_id: msg_id.clone(),
                synthetic: times.synthetic,
                device_publish_time: client_publish,
                device_to_broker,
                broker_processing,
                cloud_upload,
                total,
                publish: times.publish,
            })
        })
        .collect();

    decomposed.sort_by(|a, b| {
        a.device_publish_time
            .partial_cmp(&b.device_publish_time)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.msg_id.cmp(&b.msg_id))
    });
    decomposed
}

/// Classify decomposed delays against whole-dataset statistics.
///
/// Thresholds and categories are pure functions of the input set, so the
/// result is reproducible for an unchanged dataset. An empty input produces
/// an empty section, not an error.
pub(crate) fn classify_delays(decomposed: &[Decomposition]) -> DelaySection {
    if decomposed.is_empty() {
        return DelaySection::default();
    }

    let device: Vec<f64> = decomposed.iter().map(|d| d.device_to_broker).collect();
    let broker: Vec<f64> = decomposed.iter().map(|d| d.broker_processing).collect();
    let cloud: Vec<f64> = decomposed.iter().map(|d| d.cloud_upload).collect();
    let total: Vec<f64> = decomposed.iter().map(|d| d.total).collect();

    let device_stats = column_stats("device_to_broker_delay", &device);
    let broker_stats = column_stats("broker_processing_delay", &broker);
    let cloud_stats = column_stats("cloud_upload_delay", &cloud);
    let total_stats = column_stats("total_delay", &total);

    let thresholds = DelayThresholds {
        device_to_broker: device_stats.mean + K_DEVICE_TO_BROKER * device_stats.std,
        broker_processing: broker_stats.mean + K_BROKER_PROCESSING * broker_stats.std,
        cloud_upload: cloud_stats.mean + K_CLOUD_UPLOAD * cloud_stats.std,
        total: total_stats.mean + K_TOTAL * total_stats.std,
    };

    let messages = decomposed
        .iter()
        .map(|d| {
            let is_anomaly = d.device_to_broker > thresholds.device_to_broker
                || d.broker_processing > thresholds.broker_processing
                || d.cloud_upload > thresholds.cloud_upload
                || d.total > thresholds.total;

            DelayRow {
                msg_id: d.msg_id.clone(),
                synthetic_id: d.synthetic,
                device_publish_time: d.device_publish_time,
                device_to_broker_delay: d.device_to_broker,
                broker_processing_delay: d.broker_processing,
                cloud_upload_delay: d.cloud_upload,
                total_delay: d.total,
                device_to_broker_category: categorize(d.device_to_broker, &device_stats),
                broker_processing_category: categorize(d.broker_processing, &broker_stats),
                cloud_upload_category: categorize(d.cloud_upload, &cloud_stats),
                is_anomaly,
                bottleneck: bottleneck(d),
            }
        })
        .collect();

    DelaySection {
        thresholds: Some(thresholds),
        stats: vec![device_stats, broker_stats, cloud_stats, total_stats],
        messages,
    }
}

/// Bucket a stage delay against its column distribution.
fn categorize(value: f64, stats: &DelayColumnStats) -> DelayCategory {
    if value <= stats.mean - 0.5 * stats.std {
        DelayCategory::Low
    } else if value <= stats.mean + 0.5 * stats.std {
        DelayCategory::Normal
    } else if value <= stats.mean + 2.0 * stats.std {
        DelayCategory::High
    } else {
        DelayCategory::VeryHigh
    }
}

/// Largest stage delay wins; ties resolve in fixed stage order.
fn bottleneck(d: &Decomposition) -> Bottleneck {
    let mut winner = Bottleneck::DeviceToBroker;
    let mut best = d.device_to_broker;
    if d.broker_processing > best {
        winner = Bottleneck::BrokerProcessing;
        best = d.broker_processing;
    }
    if d.cloud_upload > best {
        winner = Bottleneck::CloudUpload;
    }
    winner
}

fn column_stats(column: &str, values: &[f64]) -> DelayColumnStats {
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let std = if values.len() < 2 {
        0.0
    } else {
        let var =
            values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
        var.sqrt()
    };
    let max = values.iter().copied().fold(f64::MIN, f64::max);

    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    let median = if sorted.len() % 2 == 1 {
        sorted[mid]
    } else {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    };

    DelayColumnStats {
        column: column.to_string(),
        mean,
        median,
        max,
        std,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::{classify_delays, decompose_messages};
    use crate::analysis::correlate::MessageTimes;
    use crate::{Bottleneck, DelayCategory};

    fn times(
        client_publish: Option<f64>,
        broker_ack: Option<f64>,
        broker_forward: Option<f64>,
        cloud_ack: Option<f64>,
    ) -> MessageTimes {
        MessageTimes {
            client_publish_time: client_publish,
            broker_ack_time: broker_ack,
            broker_forward_time: broker_forward,
            cloud_ack_time: cloud_ack,
            ..MessageTimes::default()
        }
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn four_stage_message_decomposes_fully() {
        let mut messages = BTreeMap::new();
        messages.insert(
            "7".to_string(),
            times(Some(10.000), Some(10.020), Some(10.025), Some(10.200)),
        );

        let decomposed = decompose_messages(&messages);
        assert_eq!(decomposed.len(), 1);
        let d = &decomposed[0];
        assert!(close(d.device_to_broker, 0.020));
        assert!(close(d.broker_processing, 0.005));
        assert!(close(d.cloud_upload, 0.175));
        assert!(close(d.total, 0.200));

        let section = classify_delays(&decomposed);
        assert_eq!(section.messages[0].bottleneck, Bottleneck::CloudUpload);
    }

    #[test]
    fn two_stage_message_falls_back_to_stage_sum() {
        let mut messages = BTreeMap::new();
        messages.insert(
            "9".to_string(),
            times(Some(10.000), Some(10.300), None, None),
        );

        let decomposed = decompose_messages(&messages);
        assert_eq!(decomposed.len(), 1);
        let d = &decomposed[0];
        assert!(close(d.broker_processing, 0.0));
        assert!(close(d.cloud_upload, 0.0));
        assert!(close(d.total, 0.300));

        let section = classify_delays(&decomposed);
        assert_eq!(section.messages[0].bottleneck, Bottleneck::DeviceToBroker);
    }

    #[test]
    fn incomplete_messages_are_abandoned() {
        let mut messages = BTreeMap::new();
        messages.insert("1".to_string(), times(Some(1.0), None, None, None));
        messages.insert("2".to_string(), times(None, Some(2.0), None, None));
        messages.insert("3".to_string(), times(Some(1.0), Some(1.1), None, None));

        let decomposed = decompose_messages(&messages);
        assert_eq!(decomposed.len(), 1);
        assert_eq!(decomposed[0].msg_id, "3");
    }

    #[test]
    fn rows_are_ordered_by_publish_time_then_id() {
        let mut messages = BTreeMap::new();
        messages.insert("b".to_string(), times(Some(5.0), Some(5.1), None, None));
        messages.insert("a".to_string(), times(Some(5.0), Some(5.2), None, None));
        messages.insert("c".to_string(), times(Some(1.0), Some(1.1), None, None));

        let ids: Vec<String> = decompose_messages(&messages)
            .into_iter()
            .map(|d| d.msg_id)
            .collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn total_is_at_least_device_to_broker_with_cloud_ack() {
        let mut messages = BTreeMap::new();
        messages.insert(
            "x".to_string(),
            times(Some(1.0), Some(1.2), Some(1.3), Some(2.0)),
        );
        let decomposed = decompose_messages(&messages);
        assert!(decomposed[0].total >= decomposed[0].device_to_broker);
    }

    #[test]
    fn zero_variance_column_has_no_anomalies() {
        let mut messages = BTreeMap::new();
        for i in 0..4 {
            messages.insert(format!("m{i}"), times(Some(1.0), Some(1.1), None, None));
        }

        let decomposed = decompose_messages(&messages);
        let section = classify_delays(&decomposed);
        let thresholds = section.thresholds.unwrap();
        // std is zero, so the cutoff collapses onto the mean and nothing
        // can sit strictly above it.
        assert!((thresholds.device_to_broker - 0.1).abs() < 1e-9);
        assert!(section.messages.iter().all(|m| !m.is_anomaly));
    }

    #[test]
    fn outlier_is_flagged_and_bucketed_very_high() {
        let mut messages = BTreeMap::new();
        for i in 0..10 {
            let base = i as f64 * 10.0;
            messages.insert(
                format!("m{i:02}"),
                times(Some(base), Some(base + 0.1), None, None),
            );
        }
        messages.insert("big".to_string(), times(Some(100.0), Some(108.0), None, None));

        let decomposed = decompose_messages(&messages);
        let section = classify_delays(&decomposed);
        let outlier = section
            .messages
            .iter()
            .find(|m| m.msg_id == "big")
            .unwrap();
        assert!(outlier.is_anomaly);
        assert_eq!(outlier.device_to_broker_category, DelayCategory::VeryHigh);
        let steady = section
            .messages
            .iter()
            .find(|m| m.msg_id == "m00")
            .unwrap();
        assert!(!steady.is_anomaly);
    }

    #[test]
    fn classification_is_idempotent() {
        let mut messages = BTreeMap::new();
        messages.insert(
            "1".to_string(),
            times(Some(1.0), Some(1.05), Some(1.06), Some(1.4)),
        );
        messages.insert("2".to_string(), times(Some(2.0), Some(2.3), None, None));
        messages.insert("3".to_string(), times(Some(3.0), Some(3.01), None, None));

        let decomposed = decompose_messages(&messages);
        let first = serde_json::to_value(classify_delays(&decomposed)).unwrap();
        let second = serde_json::to_value(classify_delays(&decomposed)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn empty_input_produces_empty_section() {
        let messages = BTreeMap::new();
        let decomposed = decompose_messages(&messages);
        let section = classify_delays(&decomposed);
        assert!(section.thresholds.is_none());
        assert!(section.stats.is_empty());
        assert!(section.messages.is_empty());
    }
}
