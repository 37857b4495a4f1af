use std::io::{Read, Seek, SeekFrom};

use pcap_parser::Linktype;

use super::error::PcapSourceError;
use super::layout;

/// Read the magic bytes and rewind the reader to the start.
///
/// # Errors
/// Returns `PcapSourceError` when the reader cannot be read or rewound.
pub fn sniff_magic<R: Read + Seek>(reader: &mut R) -> Result<[u8; 4], PcapSourceError> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    reader.seek(SeekFrom::Start(0))?;
    Ok(magic)
}

/// Check whether the magic bytes announce a PCAPNG section header.
pub fn is_pcapng_magic(magic: &[u8; 4]) -> bool {
    magic == &layout::PCAPNG_MAGIC
}

/// Resolve the linktype for a PCAPNG interface id, defaulting to Ethernet.
pub fn linktype_for_interface(linktypes: &[Linktype], if_id: u32) -> Linktype {
    linktypes
        .get(if_id as usize)
        .copied()
        .unwrap_or(Linktype::ETHERNET)
}

/// Convert a legacy PCAP second/microsecond pair to epoch seconds.
pub fn legacy_ts_to_seconds(ts_sec: u32, ts_usec: u32) -> f64 {
    ts_sec as f64 + ts_usec as f64 * 1e-6
}

/// Convert a PCAPNG high/low timestamp (microsecond resolution) to seconds.
pub fn pcapng_ts_to_seconds(ts_high: u32, ts_low: u32) -> f64 {
    let ts = ((ts_high as u64) << 32) | (ts_low as u64);
    ts as f64 * 1e-6
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Read};

    use pcap_parser::Linktype;

    use super::{
        is_pcapng_magic, legacy_ts_to_seconds, linktype_for_interface, pcapng_ts_to_seconds,
        sniff_magic,
    };
    use crate::source::pcap::error::PcapSourceError;

    #[test]
    fn detect_pcapng_magic() {
        assert!(is_pcapng_magic(&super::layout::PCAPNG_MAGIC));
        assert!(!is_pcapng_magic(&[0xd4, 0xc3, 0xb2, 0xa1]));
    }

    #[test]
    fn sniff_magic_rewinds() {
        let bytes = [0x0a, 0x0d, 0x0d, 0x0a, 0x01];
        let mut cursor = Cursor::new(bytes);
        let magic = sniff_magic(&mut cursor).unwrap();
        assert_eq!(magic, [0x0a, 0x0d, 0x0d, 0x0a]);
        let mut buf = [0u8; 1];
        cursor.read_exact(&mut buf).unwrap();
        assert_eq!(buf[0], 0x0a);
    }

    #[test]
    fn sniff_magic_too_short() {
        let bytes = [0x0a, 0x0d];
        let mut cursor = Cursor::new(bytes);
        let err = sniff_magic(&mut cursor).unwrap_err();
        assert!(matches!(err, PcapSourceError::Io(_)));
    }

    #[test]
    fn linktype_defaults_to_ethernet_when_missing() {
        let linktypes = [Linktype::RAW];
        assert_eq!(linktype_for_interface(&linktypes, 0), Linktype::RAW);
        assert_eq!(linktype_for_interface(&linktypes, 3), Linktype::ETHERNET);
    }

    #[test]
    fn timestamp_conversions() {
        let seconds = legacy_ts_to_seconds(10, 250_000);
        assert!((seconds - 10.25).abs() < f64::EPSILON);
        let seconds = pcapng_ts_to_seconds(0, 1_500_000);
        assert!((seconds - 1.5).abs() < f64::EPSILON);
    }
}
