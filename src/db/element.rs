use crate::db::field::{ByteOrder, FieldKind, VisualizationTemplate};
use crate::db::ElementId;
use crate::expr::ExprId;

/// Condition attached to a `case`/`match` element (spec §4.2 "evaluate
/// key-expr → select matching case (numeric equality or range; buffer
/// sized exact compare, case-sensitive per DB flag)").
#[derive(Debug, Clone)]
pub enum CaseMatch {
    Number(u64),
    NumberRange(u64, u64),
    Buffer { bytes: Vec<u8>, case_sensitive: bool },
    /// A full boolean expression, as used by `set`/`choice` `match`
    /// elements (spec §4.2.3: "Evaluate match conditions ... against
    /// that FieldNode").
    Expr(ExprId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopCtrlKind {
    Break,
    Continue,
}

/// The four loop shapes from spec §4.2.1.
#[derive(Debug, Clone)]
pub enum LoopKind {
    TimesToRepeat { count_expr: ExprId },
    While { condition_expr: ExprId },
    DoWhile { condition_expr: ExprId },
    Size { size_expr: ExprId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupAction {
    Add,
    Purge,
    Obsolete,
}

/// Attribute a `protofield` node of a `showdtl`/summary template reads
/// off the PDML element its path resolves to (spec §4.6: "`value`,
/// `show`, `showmap`, `showdtl`, `mask`, `position`, `size`, `name`,
/// `longname`").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateAttr {
    Value,
    Show,
    ShowMap,
    ShowDetails,
    Mask,
    Position,
    Size,
    Name,
    LongName,
}

/// A `text` template node's content (spec §4.6: "inserts a literal or
/// the string/number result of an expression").
#[derive(Debug, Clone)]
pub enum TemplateText {
    Literal(String),
    Expr(ExprId),
}

/// A `section` template node's target (spec §4.7: "`section(index)`
/// switches target slot; `section(next)` advances").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionTarget {
    Index(usize),
    Next,
}

/// Packet-context attribute read by a `pkthdr` summary template node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PktHdrAttr {
    LinkType,
    FrameLen,
    PacketLen,
    TimestampS,
    TimestampUs,
    Ordinal,
}

/// Current-protocol attribute read by a `protohdr` summary template node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtoHdrAttr {
    Name,
    LongName,
}

/// One node of the protocol DB's element graph (spec §3 "ProtocolDB").
///
/// `variable-decl`, `lookuptable-decl`, `showsum-template`, and
/// `showdtl-template` are realized as separate top-level structures on
/// [`crate::db::ProtocolDb`] rather than graph nodes (see DESIGN.md):
/// they are declarations consumed once at decoder construction, not
/// subtrees walked during a field decode. Everything that genuinely
/// participates in `decode_fields`' depth-first walk is a variant here.
#[derive(Debug, Clone)]
pub enum ElementKind {
    Field {
        name: String,
        long_name: String,
        kind: FieldKind,
        byte_order: ByteOrder,
        visualize: VisualizationTemplate,
    },
    Switch { key_expr: ExprId },
    Case { matches: CaseMatch },
    Default,
    Loop { kind: LoopKind },
    LoopCtrl { ctrl: LoopCtrlKind },
    If {
        condition: ExprId,
        then_branch: Option<ElementId>,
        else_branch: Option<ElementId>,
        missing_data_branch: Option<ElementId>,
    },
    Block { name: String },
    IncludeBlock { target: ElementId },
    Set { prototype: ElementId, exit_when: ExprId },
    Choice { prototype: ElementId },
    Match { condition: ExprId, rename: Option<String> },
    DefaultMatch { rename: Option<String> },
    AssignVariable { var: String, expr: ExprId },
    AssignLookupTable { table: String, field: usize, expr: ExprId },
    UpdateLookupTable {
        table: String,
        action: LookupAction,
        keys: Vec<ExprId>,
        data: Vec<ExprId>,
        external_call: Option<(String, String)>,
    },
    NextProto { proto_expr: ExprId },
    /// The candidate's own `execute-verify` list (on [`crate::db::Protocol`],
    /// keyed by `proto_expr`'s resolved index) runs before
    /// `$protoverifyresult` is read — not a pointer carried here (spec
    /// §4.1: "the engine additionally runs the candidate's
    /// `execute-verify` section").
    NextProtoCandidate { proto_expr: ExprId },

    /// `protofield` node of a `showdtl`/summary template tree (spec §4.6,
    /// §4.7) — distinct from [`crate::expr::ExprNode::ProtoFieldRef`],
    /// which resolves a value for the expression evaluator rather than a
    /// presentation attribute for a renderer.
    TemplateField { path: Vec<String>, attr: TemplateAttr },
    TemplateText { text: TemplateText },
    Section { target: SectionTarget },
    PktHdr { attr: PktHdrAttr },
    ProtoHdr { attr: ProtoHdrAttr },
}

/// One node of the element arena: an [`ElementKind`] plus the generic
/// `FirstChild`/`NextSibling` links (spec §9 "Cyclic graphs").
#[derive(Debug, Clone)]
pub struct ElementNode {
    pub kind: ElementKind,
    pub first_child: Option<ElementId>,
    pub next_sibling: Option<ElementId>,
}
