//! The protocol DB's data model (spec §3, §6 "Consumed: Protocol DB").
//!
//! This module only describes the DB; it never builds one from XML
//! (explicit non-goal, spec §1) — callers construct a [`ProtocolDb`]
//! value directly (as this crate's own tests do) or via a loader that
//! lives outside this crate's scope.

pub mod element;
pub mod field;

use crate::arena::{Arena, Id};
use crate::db::element::ElementNode;
use crate::expr::ExprId;
use regex::Regex;

pub use element::{
    CaseMatch, ElementKind, LookupAction, LoopCtrlKind, LoopKind, PktHdrAttr, ProtoHdrAttr, SectionTarget,
    TemplateAttr, TemplateText,
};
pub use field::{ByteOrder, FieldKind, NativeFunction, NumberBase, TokenMatcher, VisualizationTemplate};

pub type ElementId = Id<ElementNode>;
pub type RegexId = Id<Regex>;

/// One entry of a protocol's `execute-before`/`execute-verify`/
/// `execute-after` code list (spec §4.1: "each is gated by an optional
/// `when` expression evaluated without an active field context").
#[derive(Debug, Clone)]
pub struct ExecEntry {
    pub when: Option<ExprId>,
    pub statement: ElementId,
}

/// Template used by the [`crate::summary::SummaryBuilder`] (spec §4.7).
#[derive(Debug, Clone)]
pub struct SummaryTemplate {
    pub root: ElementId,
}

/// Template used by the custom-detail renderer (spec §4.6).
#[derive(Debug, Clone)]
pub struct DetailTemplate {
    pub root: ElementId,
}

/// One encapsulation entry consulted by the next-protocol walk (spec
/// §4.1 "Next-protocol selection"). The walk recurses through
/// `nextproto`/`nextproto-candidate`/`switch`/`if`/`assign-*` elements
/// reachable from `first_item` via the normal `FirstChild`/`NextSibling`
/// links, so this is just an entry point, not a distinct element kind.
#[derive(Debug, Clone, Copy)]
pub struct Encapsulation {
    pub first_item: ElementId,
}

/// A protocol definition (spec §3 "A protocol has...").
#[derive(Debug, Clone)]
pub struct Protocol {
    pub name: String,
    pub long_name: String,
    pub first_field: ElementId,
    pub encapsulation: Option<Encapsulation>,
    pub execute_before: Vec<ExecEntry>,
    pub execute_verify: Vec<ExecEntry>,
    pub execute_after: Vec<ExecEntry>,
    pub summary_template: Option<SummaryTemplate>,
    pub detail_template: Option<DetailTemplate>,
    pub byte_order: ByteOrder,
}

/// Declaration of a variable the store must pre-create (spec §3
/// "Variable store", §4.4 "declare variable").
#[derive(Debug, Clone)]
pub struct VariableDecl {
    pub name: String,
    pub validity: crate::variables::Validity,
    pub is_buffer: bool,
    pub max_size: usize,
}

/// Declaration of a lookup table the store must pre-create.
#[derive(Debug, Clone)]
pub struct LookupTableDecl {
    pub name: String,
    pub key_schema: Vec<crate::lookup::KeySlot>,
    pub data_schema: Vec<crate::lookup::SlotKind>,
}

/// The full, read-only protocol database (spec §3, §6).
#[derive(Debug, Clone)]
pub struct ProtocolDb {
    pub elements: Arena<ElementNode>,
    pub exprs: Arena<crate::expr::ExprNode>,
    pub regexes: Vec<Regex>,
    pub protocols: Vec<Protocol>,
    pub start_proto: usize,
    pub default_proto: usize,
    pub ether_padding_proto: Option<usize>,
    /// Declared summary-view column long names (spec §6: "a declared
    /// summary-view column list of length N").
    pub summary_columns: Vec<String>,
    pub variable_decls: Vec<VariableDecl>,
    pub lookuptable_decls: Vec<LookupTableDecl>,
}

impl ProtocolDb {
    #[must_use]
    pub fn new(start_proto: usize, default_proto: usize) -> Self {
        Self {
            elements: Arena::new(),
            exprs: Arena::new(),
            regexes: Vec::new(),
            protocols: Vec::new(),
            start_proto,
            default_proto,
            ether_padding_proto: None,
            summary_columns: Vec::new(),
            variable_decls: Vec::new(),
            lookuptable_decls: Vec::new(),
        }
    }

    pub fn push_element(&mut self, node: ElementNode) -> ElementId {
        self.elements.push(node)
    }

    pub fn push_expr(&mut self, node: crate::expr::ExprNode) -> ExprId {
        self.exprs.push(node)
    }

    pub fn push_regex(&mut self, pattern: &str) -> Result<RegexId, regex::Error> {
        let compiled = Regex::new(pattern)?;
        self.regexes.push(compiled);
        Ok(RegexId::new((self.regexes.len() - 1) as u32))
    }

    #[must_use]
    pub fn regex(&self, id: RegexId) -> &Regex {
        &self.regexes[id.index()]
    }

    #[must_use]
    pub fn element(&self, id: ElementId) -> &ElementNode {
        &self.elements[id]
    }

    #[must_use]
    pub fn protocol(&self, index: usize) -> Option<&Protocol> {
        self.protocols.get(index)
    }
}
