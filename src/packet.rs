/// Read-only context for the packet currently being decoded (spec §3
/// "Packet context").
///
/// Exposed immutably to every component; the raw buffer is borrowed for
/// the lifetime of one `decode_packet` call, matching the "single
/// immutable borrow per packet" concurrency contract in §5.
#[derive(Debug, Clone, Copy)]
pub struct PacketContext<'input> {
    /// Link-layer type of `raw` (caller-supplied, e.g. a DLT/LINKTYPE id).
    pub link_type: u32,
    /// Ordinal number of this packet within the capture (1-based).
    pub ordinal: u64,
    /// Capture timestamp, seconds component.
    pub timestamp_s: u32,
    /// Capture timestamp, microseconds component.
    pub timestamp_us: u32,
    /// Length of the packet as it appeared on the wire; may exceed
    /// `raw.len()` if the capture snaplen truncated it.
    pub wire_len: u32,
    /// The captured bytes. `caplen() == raw.len()`.
    pub raw: &'input [u8],
}

impl<'input> PacketContext<'input> {
    #[must_use]
    pub fn new(
        link_type: u32,
        ordinal: u64,
        timestamp_s: u32,
        timestamp_us: u32,
        wire_len: u32,
        raw: &'input [u8],
    ) -> Self {
        Self { link_type, ordinal, timestamp_s, timestamp_us, wire_len, raw }
    }

    /// Number of bytes actually captured. May be less than `wire_len`.
    #[must_use]
    pub fn caplen(&self) -> usize {
        self.raw.len()
    }
}
