mod pcap;

pub use pcap::PcapFileSource;

use pcap_parser::Linktype;
use thiserror::Error;

/// One raw captured frame as emitted by a packet source.
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// Capture timestamp in epoch seconds, when the format provides one.
    pub ts: Option<f64>,
    /// Link layer of the capture interface.
    pub linktype: Linktype,
    /// Frame bytes starting at the link layer.
    pub data: Vec<u8>,
}

/// Pull-based frame supplier driving the analysis pipeline.
///
/// Implementations own their I/O; the analysis layer only ever sees
/// [`RawFrame`] values, so tests can feed synthetic traffic from memory.
pub trait PacketSource {
    fn next_frame(&mut self) -> Result<Option<RawFrame>, SourceError>;
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("PCAP parse error: {0}")]
    Pcap(String),
}

impl From<pcap::error::PcapSourceError> for SourceError {
    fn from(value: pcap::error::PcapSourceError) -> Self {
        match value {
            pcap::error::PcapSourceError::Io(err) => SourceError::Io(err),
            pcap::error::PcapSourceError::Pcap { context, message } => {
                SourceError::Pcap(format!("{context}: {message}"))
            }
        }
    }
}
