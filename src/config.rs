//! Decoder-wide configuration flags (spec §6 "Configuration flags").

/// Switches that shape what a `decode_packet` call produces, without
/// changing the bytes it reads or the variables/tables it mutates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecoderConfig {
    /// Build a [`crate::summary::SummaryRecord`] for every packet.
    pub generate_summary: bool,
    /// Populate `ShowValue`/`ShowMap` while walking the `DetailTree`
    /// (spec §4.5).
    pub generate_detail_simple: bool,
    /// Also run custom `showdtl` templates (spec §4.6), a strictly more
    /// expensive pass than `generate_detail_simple`.
    pub generate_detail_full: bool,
    /// Keep every packet's `DetailTree`/`SummaryView` instead of
    /// discarding it once the caller has read it (spec §6).
    pub keep_all_packets: bool,
    /// Emit a raw hex dump alongside the detail tree.
    pub generate_raw_dump: bool,
    /// Materialize `FieldNode`s for fields whose sole purpose is to be
    /// discarded (spec §4.2.2 Phase B/C "materialize trivial discard
    /// nodes"); off by default to keep the common case lean.
    pub emit_discard_nodes: bool,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            generate_summary: true,
            generate_detail_simple: true,
            generate_detail_full: false,
            keep_all_packets: false,
            generate_raw_dump: false,
            emit_discard_nodes: false,
        }
    }
}
