use std::collections::BTreeMap;
use std::net::IpAddr;

use super::record::{PacketRecord, Transport};

/// Direction-agnostic flow identity: unordered endpoint pair plus transport.
///
/// Both directions of one conversation map to the same key; the endpoint
/// with the smaller (ip, port) pair always occupies slot `a`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct ConnectionKey {
    pub transport: Transport,
    pub endpoint_a: (IpAddr, u16),
    pub endpoint_b: (IpAddr, u16),
}

impl ConnectionKey {
    /// Derive the key for a record; `None` when addresses or ports are absent.
    pub(crate) fn from_record(record: &PacketRecord) -> Option<Self> {
        let src = (record.src_ip?, record.src_port?);
        let dst = (record.dst_ip?, record.dst_port?);
        let (endpoint_a, endpoint_b) = if src <= dst { (src, dst) } else { (dst, src) };
        Some(Self {
            transport: record.transport,
            endpoint_a,
            endpoint_b,
        })
    }

    /// Canonical id, e.g. `10.0.0.1:1000<->10.0.0.2:1883/tcp`.
    pub(crate) fn label(&self) -> String {
        format!(
            "{}<->{}/{}",
            format_endpoint(self.endpoint_a),
            format_endpoint(self.endpoint_b),
            self.transport.as_str()
        )
    }
}

fn format_endpoint((ip, port): (IpAddr, u16)) -> String {
    match ip {
        IpAddr::V4(addr) => format!("{addr}:{port}"),
        IpAddr::V6(addr) => format!("[{addr}]:{port}"),
    }
}

/// Group records of one transport into per-connection index sequences.
///
/// Each sequence is ordered by timestamp ascending; equal timestamps keep
/// capture order. Single-record connections are retained; delta-based
/// metrics simply stay undefined for them.
pub(crate) fn group_connections(
    records: &[PacketRecord],
    transport: Transport,
) -> BTreeMap<ConnectionKey, Vec<usize>> {
    let mut groups: BTreeMap<ConnectionKey, Vec<usize>> = BTreeMap::new();
    for record in records {
        if record.transport != transport {
            continue;
        }
        if let Some(key) = ConnectionKey::from_record(record) {
            groups.entry(key).or_default().push(record.index);
        }
    }
    for order in groups.values_mut() {
        order.sort_by(|&a, &b| {
            records[a]
                .timestamp
                .partial_cmp(&records[b].timestamp)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.cmp(&b))
        });
    }
    groups
}
