use crate::db::RegexId;
use crate::expr::ExprId;

/// Byte order a field or protocol default decodes in (spec §3 "a
/// protocol has ... a field-byte-order default").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Big,
    Little,
}

/// Either a literal byte sequence or a compiled regex used to locate a
/// token boundary (spec §3 `tokenended`/`tokenwrapped`/`delimited`).
#[derive(Debug, Clone)]
pub enum TokenMatcher {
    Bytes(Vec<u8>),
    Regex(RegexId),
}

/// Per-field-kind shape descriptors (spec §3 "Field kinds").
#[derive(Debug, Clone)]
pub enum FieldKind {
    Fixed { size: usize },
    Bit { width: u8, mask: Option<u64>, is_last_in_group: bool },
    Variable { length_expr: ExprId },
    Line,
    TokenEnded {
        end: TokenMatcher,
        end_offset_expr: Option<ExprId>,
        trailing_discard: Option<usize>,
    },
    TokenWrapped {
        begin: TokenMatcher,
        end: TokenMatcher,
        begin_offset_expr: Option<ExprId>,
        end_offset_expr: Option<ExprId>,
        trailing_discard: Option<usize>,
    },
    Pattern { regex: RegexId, partial_match_continues: bool },
    EatAll,
    Padding { align: usize },
    Plugin { id: u32 },
    Tlv { type_size: usize, length_size: usize },
    Delimited {
        begin: Option<RegexId>,
        end: RegexId,
        continue_on_missing_begin: bool,
        continue_on_missing_end: bool,
    },
    HdrLine { separator: RegexId },
    Dynamic { regex: RegexId },
    Asn1,
    Xml { size_expr: Option<ExprId> },
}

impl FieldKind {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            FieldKind::Fixed { .. } => "fixed",
            FieldKind::Bit { .. } => "bit",
            FieldKind::Variable { .. } => "variable",
            FieldKind::Line => "line",
            FieldKind::TokenEnded { .. } => "tokenended",
            FieldKind::TokenWrapped { .. } => "tokenwrapped",
            FieldKind::Pattern { .. } => "pattern",
            FieldKind::EatAll => "eatall",
            FieldKind::Padding { .. } => "padding",
            FieldKind::Plugin { .. } => "plugin",
            FieldKind::Tlv { .. } => "tlv",
            FieldKind::Delimited { .. } => "delimited",
            FieldKind::HdrLine { .. } => "hdrline",
            FieldKind::Dynamic { .. } => "dynamic",
            FieldKind::Asn1 => "asn1",
            FieldKind::Xml { .. } => "xml",
        }
    }
}

/// One of the four base presentations available for `base` in a
/// visualization template (spec §4.5 item 4); `Ascii`/`Float`/`Double`
/// round the six-way spec list out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumberBase {
    Bin,
    Dec,
    Hex,
    HexNo0x,
    Ascii,
    Float,
    Double,
}

/// One of the four built-in presentation routines (spec §6 "Consumed:
/// Native-function callbacks").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeFunction {
    Ipv4Dotted,
    Ascii,
    AsciiLine,
    HttpContent,
}

/// How a field's raw bytes become its `ShowValue` (spec §4.5, §4.6).
#[derive(Debug, Clone, Default)]
pub struct VisualizationTemplate {
    pub base: Option<NumberBase>,
    pub digit_size: u8,
    pub separator: Option<char>,
    /// Evaluated as a switch over the field value; the literal for the
    /// matching case becomes `ShowMap` (spec §4.5 item 5).
    pub map_table: Option<Vec<(u64, String)>>,
    pub custom_template: Option<crate::db::ElementId>,
    pub native_function: Option<NativeFunction>,
    pub plugin: Option<u32>,
}
