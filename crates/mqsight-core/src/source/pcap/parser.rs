use std::fs::File;
use std::path::Path;

use pcap_parser::{
    Block, LegacyPcapReader, Linktype, PcapBlockOwned, PcapNGReader, traits::PcapReaderIterator,
};

use crate::source::{PacketSource, RawFrame, SourceError};

use super::error::PcapSourceError;
use super::layout;
use super::reader::{
    is_pcapng_magic, legacy_ts_to_seconds, linktype_for_interface, pcapng_ts_to_seconds,
    sniff_magic,
};

/// File-backed packet source supporting legacy PCAP and PCAPNG.
pub struct PcapFileSource {
    inner: FileReader,
}

enum FileReader {
    Legacy {
        reader: LegacyPcapReader<File>,
        linktype: Option<Linktype>,
    },
    Ng {
        reader: PcapNGReader<File>,
        linktypes: Vec<Linktype>,
    },
}

impl PcapFileSource {
    pub fn open(path: &Path) -> Result<Self, SourceError> {
        let mut file = File::open(path).map_err(SourceError::from)?;
        let magic = sniff_magic(&mut file).map_err(SourceError::from)?;

        let inner = if is_pcapng_magic(&magic) {
            let reader =
                PcapNGReader::new(layout::PCAP_READER_BUFFER_SIZE, file).map_err(|e| {
                    SourceError::from(PcapSourceError::Pcap {
                        context: "pcapng reader init",
                        message: e.to_string(),
                    })
                })?;
            FileReader::Ng {
                reader,
                linktypes: Vec::new(),
            }
        } else {
            let reader =
                LegacyPcapReader::new(layout::PCAP_READER_BUFFER_SIZE, file).map_err(|e| {
                    SourceError::from(PcapSourceError::Pcap {
                        context: "pcap reader init",
                        message: e.to_string(),
                    })
                })?;
            FileReader::Legacy {
                reader,
                linktype: None,
            }
        };

        Ok(Self { inner })
    }
}

impl PacketSource for PcapFileSource {
    fn next_frame(&mut self) -> Result<Option<RawFrame>, SourceError> {
        advance(&mut self.inner).map_err(SourceError::from)
    }
}

fn advance(reader: &mut FileReader) -> Result<Option<RawFrame>, PcapSourceError> {
    loop {
        let step = match reader {
            FileReader::Legacy { reader, linktype } => {
                step_reader(reader, "pcap", |block| legacy_frame(block, linktype))?
            }
            FileReader::Ng { reader, linktypes } => {
                step_reader(reader, "pcapng", |block| ng_frame(block, linktypes))?
            }
        };
        match step {
            Step::Frame(frame) => return Ok(Some(frame)),
            Step::Skip => {}
            Step::Eof => return Ok(None),
        }
    }
}

enum Step {
    Frame(RawFrame),
    Skip,
    Eof,
}

fn step_reader<R, F>(reader: &mut R, context: &'static str, decode: F) -> Result<Step, PcapSourceError>
where
    R: PcapReaderIterator,
    F: FnOnce(&PcapBlockOwned<'_>) -> Option<RawFrame>,
{
    match reader.next() {
        Ok((offset, block)) => {
            let step = match decode(&block) {
                Some(frame) => Step::Frame(frame),
                None => Step::Skip,
            };
            reader.consume(offset);
            Ok(step)
        }
        Err(pcap_parser::PcapError::Eof) => Ok(Step::Eof),
        Err(pcap_parser::PcapError::Incomplete(_)) => {
            reader.refill().map_err(|e| PcapSourceError::Pcap {
                context,
                message: e.to_string(),
            })?;
            Ok(Step::Skip)
        }
        Err(e) => Err(PcapSourceError::Pcap {
            context,
            message: e.to_string(),
        }),
    }
}

fn legacy_frame(block: &PcapBlockOwned<'_>, linktype: &mut Option<Linktype>) -> Option<RawFrame> {
    match block {
        PcapBlockOwned::LegacyHeader(header) => {
            *linktype = Some(header.network);
            None
        }
        PcapBlockOwned::Legacy(packet) => Some(RawFrame {
            ts: Some(legacy_ts_to_seconds(packet.ts_sec, packet.ts_usec)),
            linktype: linktype.unwrap_or(Linktype::ETHERNET),
            data: packet.data.to_vec(),
        }),
        _ => None,
    }
}

fn ng_frame(block: &PcapBlockOwned<'_>, linktypes: &mut Vec<Linktype>) -> Option<RawFrame> {
    match block {
        PcapBlockOwned::NG(Block::InterfaceDescription(intf)) => {
            linktypes.push(intf.linktype);
            None
        }
        PcapBlockOwned::NG(Block::EnhancedPacket(packet)) => Some(RawFrame {
            ts: Some(pcapng_ts_to_seconds(packet.ts_high, packet.ts_low)),
            linktype: linktype_for_interface(linktypes, packet.if_id),
            data: packet.data.to_vec(),
        }),
        PcapBlockOwned::NG(Block::SimplePacket(packet)) => Some(RawFrame {
            ts: None,
            linktype: linktype_for_interface(linktypes, 0),
            data: packet.data.to_vec(),
        }),
        _ => None,
    }
}
