/// Buffer size handed to the pcap-parser reader iterators.
pub const PCAP_READER_BUFFER_SIZE: usize = 65536;

/// PCAPNG section header block magic (first four file bytes).
pub const PCAPNG_MAGIC: [u8; 4] = [0x0a, 0x0d, 0x0d, 0x0a];
