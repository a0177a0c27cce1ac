//! Field Decoder (spec §4.2): walks one protocol's field description,
//! producing `DetailTree` nodes for every field shape, with speculative
//! decode/rollback for `set`/`choice`.

use crate::db::{
    ByteOrder, CaseMatch, ElementId, ElementKind, FieldKind, LookupAction, LoopCtrlKind, LoopKind, ProtocolDb,
    TokenMatcher,
};
use crate::error::{DecodeError, Status};
use crate::expr::{Evaluated, Evaluator, ExprId};
use crate::lookup::{LookupTableStore, SlotValue};
use crate::packet::PacketContext;
use crate::plugins::{ExternalCallHandler, FieldPlugin};
use crate::tree::{DetailTree, FieldNodeId, ProtoNodeId};
use crate::variables::{StandardVar, VariableStore};

/// What a step of `decode_fields` did, distinct from the field-level
/// [`Status`]: a `loopctrl` element unwinds to its enclosing `loop`
/// without otherwise affecting status (spec §4.2 "`loop_ctrl`").
enum Step {
    Status(Status),
    Ctrl(LoopCtrlKind),
}

/// Everything the field decoder needs, borrowed for one `decode_packet`
/// call (spec §5 "exclusively owned by the packet being decoded").
pub struct DecodeCtx<'ctx, 'input> {
    pub db: &'ctx ProtocolDb,
    pub tree: &'ctx mut DetailTree,
    pub vars: &'ctx mut VariableStore,
    pub lookups: &'ctx mut LookupTableStore,
    pub packet: PacketContext<'input>,
    pub field_plugin: Option<&'ctx dyn FieldPlugin>,
    pub external_calls: Option<&'ctx mut dyn ExternalCallHandler>,
    pub now: u64,
    pub current_field: Option<FieldNodeId>,
    pub emit_discard_nodes: bool,
    /// Absolute offset the current protocol started decoding at, so
    /// `set_current_offset` can keep `$currentprotooffset` in lockstep
    /// with `$currentoffset` (spec §3 standard-variable table; netbee's
    /// `netpdlprotodecoder.cpp` recomputes this at every offset advance).
    pub current_proto_start: usize,
}

impl<'ctx, 'input> DecodeCtx<'ctx, 'input> {
    pub(crate) fn evaluator(&mut self) -> Evaluator<'_> {
        Evaluator {
            db: self.db,
            vars: &mut *self.vars,
            lookups: &mut *self.lookups,
            tree: &*self.tree,
            packet: self.packet,
            current_field: self.current_field,
            now: self.now,
        }
    }

    pub(crate) fn eval_number(&mut self, id: ExprId) -> Result<Evaluated<u32>, DecodeError> {
        Ok(self.evaluator().eval_number(id)?)
    }

    pub(crate) fn eval_buffer(&mut self, id: ExprId) -> Result<Evaluated<Vec<u8>>, DecodeError> {
        Ok(self.evaluator().eval_buffer(id)?)
    }

    pub(crate) fn current_offset(&self) -> usize {
        self.vars.get_number(self.vars.standard(StandardVar::CurrentOffset)).unwrap_or(0) as usize
    }

    pub(crate) fn set_current_offset(&mut self, offset: usize) {
        let id = self.vars.standard(StandardVar::CurrentOffset);
        let _ = self.vars.set_number(id, offset as u32);
        let proto_off_id = self.vars.standard(StandardVar::CurrentProtoOffset);
        let rel = offset.saturating_sub(self.current_proto_start);
        let _ = self.vars.set_number(proto_off_id, rel as u32);
    }
}

/// Byte-offset span a Phase A measurement produced, before commitment
/// (spec §4.2.2 "Phase A").
struct MeasureSpan {
    start_discard: usize,
    length: usize,
    end_discard: usize,
    token_lens: Option<(usize, usize, usize)>,
}

enum FieldMeasure {
    /// Zero-length result: the field does not exist at this position.
    Absent,
    /// A controlling expression (length-expr, count-expr, ...) came
    /// back as a warning; no field, and the caller's status upgrades.
    ExprWarning,
    Present(MeasureSpan),
}

fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn find_regex(db: &ProtocolDb, haystack: &[u8], regex: crate::db::RegexId) -> Option<(usize, usize)> {
    let text = std::str::from_utf8(haystack).ok()?;
    let m = db.regex(regex).find(text)?;
    Some((m.start(), m.end() - m.start()))
}

fn find_matcher(db: &ProtocolDb, haystack: &[u8], matcher: &TokenMatcher) -> Option<(usize, usize)> {
    match matcher {
        TokenMatcher::Bytes(needle) => find_bytes(haystack, needle).map(|start| (start, needle.len())),
        TokenMatcher::Regex(id) => find_regex(db, haystack, *id),
    }
}

fn read_uint(bytes: &[u8], order: ByteOrder) -> u64 {
    match order {
        ByteOrder::Big => bytes.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b)),
        ByteOrder::Little => bytes.iter().rev().fold(0u64, |acc, &b| (acc << 8) | u64::from(b)),
    }
}

/// Phase A: compute a field's span without touching the tree (spec
/// §4.2.2). `window` is the packet's remaining bytes from the current
/// offset through `max_offset` inclusive.
fn measure_field(
    ctx: &mut DecodeCtx<'_, '_>,
    kind: &FieldKind,
    byte_order: ByteOrder,
    abs_offset: usize,
    proto_start: usize,
    max_offset: usize,
) -> Result<FieldMeasure, DecodeError> {
    let caplen = ctx.packet.caplen();
    let limit = (max_offset + 1).min(caplen);
    if abs_offset >= limit {
        return Ok(FieldMeasure::Absent);
    }
    let window = &ctx.packet.raw[abs_offset..limit];

    let present = |length: usize| {
        FieldMeasure::Present(MeasureSpan { start_discard: 0, length, end_discard: 0, token_lens: None })
    };

    match kind {
        FieldKind::Fixed { size } => {
            if *size == 0 {
                Ok(FieldMeasure::Absent)
            } else {
                Ok(present(*size))
            }
        }
        FieldKind::Bit { .. } => unreachable!("bit fields are measured as a group, not individually"),
        FieldKind::Variable { length_expr } => match ctx.eval_number(*length_expr)? {
            Evaluated::Warning => Ok(FieldMeasure::ExprWarning),
            Evaluated::Value(0) => Ok(FieldMeasure::Absent),
            Evaluated::Value(len) => Ok(present(len as usize)),
        },
        FieldKind::Line => {
            let nl = window.iter().position(|&b| b == b'\n');
            match nl {
                Some(pos) => {
                    let has_cr = pos > 0 && window[pos - 1] == b'\r';
                    let content_len = if has_cr { pos - 1 } else { pos };
                    Ok(FieldMeasure::Present(MeasureSpan {
                        start_discard: 0,
                        length: content_len,
                        end_discard: pos + 1 - content_len,
                        token_lens: None,
                    }))
                }
                None => Ok(present(window.len())),
            }
        }
        FieldKind::TokenEnded { end, end_offset_expr, trailing_discard } => {
            let (field_len, end_len) = match find_matcher(ctx.db, window, end) {
                Some((start, matched_len)) => (start, matched_len),
                None => (window.len(), 0),
            };
            let mut field_len = field_len;
            if let Some(expr) = end_offset_expr {
                match ctx.eval_number(*expr)? {
                    Evaluated::Warning => return Ok(FieldMeasure::ExprWarning),
                    Evaluated::Value(v) => field_len = v as usize,
                }
            }
            let end_discard = end_len + trailing_discard.unwrap_or(0);
            Ok(FieldMeasure::Present(MeasureSpan {
                start_discard: 0,
                length: field_len,
                end_discard,
                token_lens: Some((0, field_len, end_discard)),
            }))
        }
        FieldKind::TokenWrapped { begin, end, begin_offset_expr, end_offset_expr, trailing_discard } => {
            let begin_pos = if let Some(expr) = begin_offset_expr {
                match ctx.eval_number(*expr)? {
                    Evaluated::Warning => return Ok(FieldMeasure::ExprWarning),
                    // spec §9 Open Question (b): absolute offset, not relative.
                    Evaluated::Value(abs) => Some((abs as usize).saturating_sub(abs_offset), 0usize),
                }
            } else {
                find_matcher(ctx.db, window, begin)
            };
            let Some((begin_start, begin_len)) = begin_pos else {
                // "fields do not exist if begin token missing" (spec §4.2.2).
                return Ok(FieldMeasure::Absent);
            };
            let after_begin = begin_start + begin_len;
            if after_begin > window.len() {
                return Ok(FieldMeasure::ExprWarning);
            }
            let rest = &window[after_begin..];
            let (field_len, end_len) = if let Some(expr) = end_offset_expr {
                match ctx.eval_number(*expr)? {
                    Evaluated::Warning => return Ok(FieldMeasure::ExprWarning),
                    Evaluated::Value(abs) => ((abs as usize).saturating_sub(abs_offset + after_begin), 0),
                }
            } else {
                match find_matcher(ctx.db, rest, end) {
                    Some((start, matched_len)) => (start, matched_len),
                    None => (rest.len(), 0),
                }
            };
            let end_discard = end_len + trailing_discard.unwrap_or(0);
            Ok(FieldMeasure::Present(MeasureSpan {
                start_discard: begin_start + begin_len,
                length: field_len,
                end_discard,
                token_lens: Some((begin_len, field_len, end_discard)),
            }))
        }
        FieldKind::Pattern { regex, partial_match_continues } => {
            let text = match std::str::from_utf8(window) {
                Ok(t) => t,
                Err(_) => return Ok(FieldMeasure::ExprWarning),
            };
            match ctx.db.regex(*regex).find(text) {
                Some(m) if m.start() == 0 => Ok(present(m.end())),
                _ if *partial_match_continues => Ok(FieldMeasure::ExprWarning),
                _ => Ok(FieldMeasure::Absent),
            }
        }
        FieldKind::EatAll => Ok(present(window.len())),
        FieldKind::Padding { align } => {
            if *align == 0 {
                return Ok(FieldMeasure::Absent);
            }
            let rel = abs_offset - proto_start;
            let pad = align - (rel % align);
            let pad = if pad == *align { 0 } else { pad };
            if pad == 0 {
                Ok(FieldMeasure::Absent)
            } else {
                Ok(present(pad.min(window.len())))
            }
        }
        FieldKind::Plugin { id } => match ctx.field_plugin {
            Some(plugin) => match plugin.decode(*id, window) {
                Ok(result) if result.consumed == 0 => Ok(FieldMeasure::Absent),
                Ok(result) => Ok(present(result.consumed)),
                Err(msg) => Err(DecodeError::Plugin(msg)),
            },
            None => Err(DecodeError::Plugin(format!("no field plugin registered for id {id}"))),
        },
        FieldKind::Tlv { type_size, length_size } => {
            let header_len = type_size + length_size;
            if window.len() < header_len {
                return Ok(FieldMeasure::ExprWarning);
            }
            let value_len = read_uint(&window[*type_size..header_len], byte_order) as usize;
            Ok(present(header_len + value_len))
        }
        FieldKind::Delimited { begin, end, continue_on_missing_begin, continue_on_missing_end } => {
            let (skip, begin_len) = match begin {
                Some(regex) => match find_regex(ctx.db, window, *regex) {
                    Some((start, len)) => (start + len, len),
                    None if *continue_on_missing_begin => (0, 0),
                    None => return Ok(FieldMeasure::Absent),
                },
                None => (0, 0),
            };
            if skip > window.len() {
                return Ok(FieldMeasure::ExprWarning);
            }
            let rest = &window[skip..];
            let (field_len, end_len) = match find_regex(ctx.db, rest, *end) {
                Some((start, len)) => (start, len),
                None if *continue_on_missing_end => (rest.len(), 0),
                None => return Ok(FieldMeasure::ExprWarning),
            };
            Ok(FieldMeasure::Present(MeasureSpan {
                start_discard: skip,
                length: field_len,
                end_discard: end_len,
                token_lens: Some((begin_len, field_len, end_len)),
            }))
        }
        FieldKind::HdrLine { separator } => {
            let mut cursor = 0usize;
            loop {
                let rest = &window[cursor..];
                match find_regex(ctx.db, rest, *separator) {
                    Some((start, len)) => {
                        let next = cursor + start + len;
                        let continues = rest
                            .get(start + len)
                            .is_some_and(|&b| b == b'\t' || b == b' ');
                        if continues {
                            cursor = next;
                            continue;
                        }
                        let trimmed = trim_trailing_crlf(&window[..cursor + start]);
                        return Ok(FieldMeasure::Present(MeasureSpan {
                            start_discard: 0,
                            length: trimmed,
                            end_discard: (cursor + start + len) - trimmed,
                            token_lens: None,
                        }));
                    }
                    None => return Ok(present(window.len())),
                }
            }
        }
        FieldKind::Dynamic { regex } => {
            let text = match std::str::from_utf8(window) {
                Ok(t) => t,
                Err(_) => return Ok(FieldMeasure::ExprWarning),
            };
            match ctx.db.regex(*regex).find(text) {
                Some(m) if m.start() == 0 => Ok(present(m.end())),
                _ => Ok(FieldMeasure::Absent),
            }
        }
        FieldKind::Asn1 => measure_asn1(window),
        FieldKind::Xml { size_expr } => match size_expr {
            Some(expr) => match ctx.eval_number(*expr)? {
                Evaluated::Warning => Ok(FieldMeasure::ExprWarning),
                Evaluated::Value(len) => Ok(present(len as usize)),
            },
            None => {
                let text = String::from_utf8_lossy(window);
                // spec §9 Open Question (c): any terminator search suffices.
                match text.find("</") {
                    Some(start) => match text[start..].find('>') {
                        Some(rel) => Ok(present(start + rel + 1)),
                        None => Ok(present(window.len())),
                    },
                    None => Ok(present(window.len())),
                }
            }
        },
    }
}

fn trim_trailing_crlf(bytes: &[u8]) -> usize {
    let mut len = bytes.len();
    if len > 0 && bytes[len - 1] == b'\n' {
        len -= 1;
    }
    if len > 0 && bytes[len - 1] == b'\r' {
        len -= 1;
    }
    len
}

fn measure_asn1(window: &[u8]) -> Result<FieldMeasure, DecodeError> {
    if window.is_empty() {
        return Ok(FieldMeasure::Absent);
    }
    let mut pos = 0usize;
    // identifier octet(s): long form when the low 5 bits are all set.
    let first = window[pos];
    pos += 1;
    if first & 0x1F == 0x1F {
        while window.get(pos).is_some_and(|&b| b & 0x80 != 0) {
            pos += 1;
        }
        pos += 1; // final identifier octet
        if pos > window.len() {
            return Ok(FieldMeasure::ExprWarning);
        }
    }
    let Some(&len_octet) = window.get(pos) else {
        return Ok(FieldMeasure::ExprWarning);
    };
    pos += 1;
    if len_octet == 0x80 {
        // indefinite length: value runs until a `00 00` EOC sentinel.
        let eoc = window[pos..]
            .windows(2)
            .position(|w| w == [0x00, 0x00])
            .map(|rel| pos + rel);
        return match eoc {
            Some(eoc_pos) => Ok(FieldMeasure::Present(MeasureSpan {
                start_discard: 0,
                length: eoc_pos,
                end_discard: 2,
                token_lens: None,
            })),
            None => Ok(FieldMeasure::ExprWarning),
        };
    }
    let value_len = if len_octet & 0x80 == 0 {
        usize::from(len_octet)
    } else {
        let n = usize::from(len_octet & 0x7F);
        if pos + n > window.len() {
            return Ok(FieldMeasure::ExprWarning);
        }
        let v = read_uint(&window[pos..pos + n], ByteOrder::Big) as usize;
        pos += n;
        v
    };
    Ok(FieldMeasure::Present(MeasureSpan {
        start_discard: pos,
        length: value_len,
        end_discard: 0,
        token_lens: None,
    }))
}

/// Commit a measured span into the tree, clipping to `caplen` and
/// flagging a truncated-field warning as the DetailTree Builder would
/// (spec §4.5 item 1). Returns the field node and the resulting status.
fn commit_field(
    ctx: &mut DecodeCtx<'_, '_>,
    parent: Option<FieldNodeId>,
    parent_proto: ProtoNodeId,
    name: &str,
    long_name: &str,
    abs_offset: usize,
    span: &MeasureSpan,
    source_element: Option<ElementId>,
) -> (FieldNodeId, Status) {
    let caplen = ctx.packet.caplen();
    let position = abs_offset + span.start_discard;
    let (size, status) = if position + span.length > caplen {
        (caplen.saturating_sub(position), Status::Warning)
    } else {
        (span.length, Status::Success)
    };
    let id = ctx.tree.alloc_field(parent, parent_proto, name, long_name, position, size, true, source_element);
    if status == Status::Warning {
        ctx.tree.fields[id].show_value = Some("(Truncated field)".to_string());
    }
    if let Some((begin_len, field_len, end_len)) = span.token_lens {
        let b = ctx.vars.standard(StandardVar::TokenBeginLen);
        let f = ctx.vars.standard(StandardVar::TokenFieldLen);
        let e = ctx.vars.standard(StandardVar::TokenEndLen);
        let _ = ctx.vars.set_number(b, begin_len as u32);
        let _ = ctx.vars.set_number(f, field_len as u32);
        let _ = ctx.vars.set_number(e, end_len as u32);
    }
    (id, status)
}

/// Decode a sibling chain starting at `first` (spec §4.2 "field
/// iterator"). Returns the merged status and total bytes consumed
/// (`new_offset - start_offset`).
pub fn decode_fields(
    ctx: &mut DecodeCtx<'_, '_>,
    first: Option<ElementId>,
    max_offset: usize,
    parent: Option<FieldNodeId>,
    parent_proto: ProtoNodeId,
) -> Result<(Status, usize), DecodeError> {
    let start_offset = ctx.current_offset();
    let mut status = Status::Success;
    let mut next = first;
    while let Some(elem_id) = next {
        if ctx.current_offset() > max_offset {
            break;
        }
        let node = ctx.db.element(elem_id).clone();
        match decode_one(ctx, elem_id, &node.kind, max_offset, parent, parent_proto)? {
            Step::Status(s) => status = status.upgrade(s),
            Step::Ctrl(_) => {
                // loopctrl escaping its enclosing loop: nothing here catches
                // it, so treat it as a db-inconsistency rather than silently
                // dropping control flow.
                return Err(DecodeError::Db(crate::error::DbError::DanglingReference(elem_id.index() as u32)));
            }
        }
        next = node.next_sibling;
    }
    let consumed = ctx.current_offset() - start_offset;
    Ok((status, consumed))
}

fn decode_one(
    ctx: &mut DecodeCtx<'_, '_>,
    elem_id: ElementId,
    kind: &ElementKind,
    max_offset: usize,
    parent: Option<FieldNodeId>,
    parent_proto: ProtoNodeId,
) -> Result<Step, DecodeError> {
    match kind {
        ElementKind::Field { kind: FieldKind::Bit { .. }, .. } => {
            decode_bit_group(ctx, elem_id, max_offset, parent, parent_proto)
        }
        ElementKind::Field { name, long_name, kind: field_kind, byte_order, .. } => {
            decode_single_field(ctx, elem_id, name, long_name, field_kind, *byte_order, max_offset, parent, parent_proto)
        }
        ElementKind::Switch { key_expr } => decode_switch(ctx, elem_id, *key_expr, max_offset, parent, parent_proto),
        ElementKind::If { condition, then_branch, else_branch, missing_data_branch } => {
            decode_if(ctx, *condition, *then_branch, *else_branch, *missing_data_branch, max_offset, parent, parent_proto)
        }
        ElementKind::Loop { kind: loop_kind } => decode_loop(ctx, elem_id, loop_kind, max_offset, parent, parent_proto),
        ElementKind::LoopCtrl { ctrl } => Ok(Step::Ctrl(*ctrl)),
        ElementKind::IncludeBlock { target } => {
            let body = ctx.db.element(*target).first_child;
            let (s, _) = decode_fields(ctx, body, max_offset, parent, parent_proto)?;
            Ok(Step::Status(s))
        }
        ElementKind::Block { name } => decode_block(ctx, elem_id, name, max_offset, parent, parent_proto),
        ElementKind::Set { prototype, exit_when } => {
            decode_set(ctx, elem_id, *prototype, *exit_when, max_offset, parent, parent_proto).map(Step::Status)
        }
        ElementKind::Choice { prototype } => {
            decode_choice(ctx, elem_id, *prototype, max_offset, parent, parent_proto).map(Step::Status)
        }
        ElementKind::AssignVariable { var, expr } => {
            assign_variable(ctx, var, *expr)?;
            Ok(Step::Status(Status::Success))
        }
        ElementKind::AssignLookupTable { table, field, expr } => {
            assign_lookup_field(ctx, table, *field, *expr)?;
            Ok(Step::Status(Status::Success))
        }
        ElementKind::UpdateLookupTable { table, action, keys, data, external_call } => {
            update_lookup_table(ctx, table, *action, keys, data, external_call.as_ref())?;
            Ok(Step::Status(Status::Success))
        }
        ElementKind::Case { .. } | ElementKind::Default => {
            // reached only via decode_switch's own dispatch.
            let body = ctx.db.element(elem_id).first_child;
            let (s, _) = decode_fields(ctx, body, max_offset, parent, parent_proto)?;
            Ok(Step::Status(s))
        }
        ElementKind::Match { .. } | ElementKind::DefaultMatch { .. } => {
            // reached only via decode_set/decode_choice's own dispatch.
            Ok(Step::Status(Status::Success))
        }
        ElementKind::NextProto { .. } | ElementKind::NextProtoCandidate { .. } => {
            // part of the encapsulation walk (spec §4.1), not the field
            // iterator; a DB that places one here is inconsistent.
            Err(DecodeError::Db(crate::error::DbError::UnknownTag(elem_id.index() as u32)))
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn decode_single_field(
    ctx: &mut DecodeCtx<'_, '_>,
    elem_id: ElementId,
    name: &str,
    long_name: &str,
    field_kind: &FieldKind,
    byte_order: ByteOrder,
    max_offset: usize,
    parent: Option<FieldNodeId>,
    parent_proto: ProtoNodeId,
) -> Result<Step, DecodeError> {
    let abs_offset = ctx.current_offset();
    let proto_start = ctx.tree.protos[parent_proto].start;
    let measured = measure_field(ctx, field_kind, byte_order, abs_offset, proto_start, max_offset)?;
    let span = match measured {
        FieldMeasure::Absent => return Ok(Step::Status(Status::Success)),
        FieldMeasure::ExprWarning => {
            log::warn!(target: "netpdl_decoder::decode", "field `{name}` could not be measured (truncated input)");
            return Ok(Step::Status(Status::Warning));
        }
        FieldMeasure::Present(span) => span,
    };
    if span.start_discard > 0 && ctx.emit_discard_nodes {
        ctx.tree.alloc_field(
            parent,
            parent_proto,
            "_discard",
            "(discarded bytes)",
            abs_offset,
            span.start_discard,
            false,
            None,
        );
    }
    let (field_id, status) =
        commit_field(ctx, parent, parent_proto, name, long_name, abs_offset, &span, Some(elem_id));
    ctx.current_field = Some(field_id);
    let field_end = ctx.tree.fields[field_id].end();

    let descend_status = decode_subfields(ctx, field_id, field_kind, field_end, parent_proto)?;

    let new_offset = abs_offset + span.start_discard + span.length + span.end_discard;
    ctx.set_current_offset(new_offset);
    if span.end_discard > 0 && ctx.emit_discard_nodes {
        ctx.tree.alloc_field(
            parent,
            parent_proto,
            "_discard",
            "(discarded bytes)",
            field_end,
            span.end_discard,
            false,
            None,
        );
    }
    Ok(Step::Status(status.upgrade(descend_status)))
}

/// Phase C: descend into composite field kinds (spec §4.2.2).
fn decode_subfields(
    ctx: &mut DecodeCtx<'_, '_>,
    field_id: FieldNodeId,
    kind: &FieldKind,
    field_end: usize,
    parent_proto: ProtoNodeId,
) -> Result<Status, DecodeError> {
    match kind {
        FieldKind::Tlv { type_size, length_size } => {
            let position = ctx.tree.fields[field_id].position;
            ctx.tree.alloc_field(Some(field_id), parent_proto, "Type", "Type", position, *type_size, true, None);
            ctx.tree.alloc_field(
                Some(field_id),
                parent_proto,
                "Length",
                "Length",
                position + type_size,
                *length_size,
                true,
                None,
            );
            let value_start = position + type_size + length_size;
            if value_start < field_end {
                ctx.tree.alloc_field(
                    Some(field_id),
                    parent_proto,
                    "Value",
                    "Value",
                    value_start,
                    field_end - value_start,
                    true,
                    None,
                );
            }
            Ok(Status::Success)
        }
        FieldKind::HdrLine { .. } => {
            let position = ctx.tree.fields[field_id].position;
            let size = ctx.tree.fields[field_id].size;
            let bytes = &ctx.packet.raw[position..position + size];
            match bytes.iter().position(|&b| b == b':') {
                Some(sep) => {
                    ctx.tree.alloc_field(Some(field_id), parent_proto, "HName", "Header name", position, sep, true, None);
                    let rest = &bytes[sep + 1..];
                    let trim = rest.iter().take_while(|&&b| b == b' ').count();
                    ctx.tree.alloc_field(
                        Some(field_id),
                        parent_proto,
                        "HValue",
                        "Header value",
                        position + sep + 1 + trim,
                        size - sep - 1 - trim,
                        true,
                        None,
                    );
                }
                None => {
                    ctx.tree.alloc_field(Some(field_id), parent_proto, "HName", "Header name", position, size, true, None);
                }
            }
            Ok(Status::Success)
        }
        FieldKind::Dynamic { regex } => {
            let position = ctx.tree.fields[field_id].position;
            let size = ctx.tree.fields[field_id].size;
            let text = match std::str::from_utf8(&ctx.packet.raw[position..position + size]) {
                Ok(t) => t,
                Err(_) => return Ok(Status::Warning),
            };
            if let Some(caps) = ctx.db.regex(*regex).captures(text) {
                for name in ctx.db.regex(*regex).capture_names().flatten() {
                    if let Some(m) = caps.name(name) {
                        ctx.tree.alloc_field(
                            Some(field_id),
                            parent_proto,
                            name,
                            name,
                            position + m.start(),
                            m.len(),
                            true,
                            None,
                        );
                    }
                }
            }
            Ok(Status::Success)
        }
        FieldKind::Xml { .. } => Ok(Status::Success),
        _ => Ok(Status::Success),
    }
}

fn decode_bit_group(
    ctx: &mut DecodeCtx<'_, '_>,
    first_elem: ElementId,
    max_offset: usize,
    parent: Option<FieldNodeId>,
    parent_proto: ProtoNodeId,
) -> Result<Step, DecodeError> {
    let abs_offset = ctx.current_offset();
    let mut members = Vec::new();
    let mut cursor = Some(first_elem);
    let mut total_width = 0u32;
    let mut last_in_group_reached = false;
    while let Some(id) = cursor {
        let node = ctx.db.element(id).clone();
        let ElementKind::Field { name, long_name, kind: FieldKind::Bit { width, mask, is_last_in_group }, .. } =
            &node.kind
        else {
            break;
        };
        total_width += u32::from(*width);
        members.push((id, name.clone(), long_name.clone(), *width, *mask));
        last_in_group_reached = *is_last_in_group;
        cursor = node.next_sibling;
        if last_in_group_reached {
            break;
        }
    }
    if members.is_empty() {
        return Ok(Step::Status(Status::Success));
    }
    let container_size = (total_width as usize).div_ceil(8);
    if abs_offset + container_size > ctx.packet.caplen().min(max_offset + 1) {
        return Ok(Step::Status(Status::Warning));
    }
    let container = &ctx.packet.raw[abs_offset..abs_offset + container_size];
    let mut bit_cursor = crate::cursor::BitCursor::new(container);
    for (elem_id, name, long_name, width, mask) in &members {
        let raw = bit_cursor.read(*width).map_err(|_| DecodeError::OffsetInvariant("bit group overruns container"))?;
        let value = match mask {
            Some(m) => crate::expr::extract_bits(raw, *m),
            None => raw,
        };
        let id = ctx.tree.alloc_field(
            parent,
            parent_proto,
            name.as_str(),
            long_name.as_str(),
            abs_offset,
            container_size,
            true,
            Some(*elem_id),
        );
        ctx.tree.fields[id].mask = *mask;
        ctx.tree.fields[id].bit_value = Some(value);
    }
    ctx.set_current_offset(abs_offset + container_size);
    if !last_in_group_reached {
        log::warn!(target: "netpdl_decoder::decode", "bit group ended without is-last-in-group");
    }
    Ok(Step::Status(Status::Success))
}

pub(crate) fn case_matches(ctx: &mut DecodeCtx<'_, '_>, key: &Evaluated<crate::expr::ExprValue>, case: &CaseMatch) -> Result<bool, DecodeError> {
    let Evaluated::Value(key) = key else { return Ok(false) };
    use crate::expr::ExprValue;
    Ok(match (case, key) {
        (CaseMatch::Number(n), ExprValue::Number(k)) => u64::from(*k) == *n,
        (CaseMatch::NumberRange(lo, hi), ExprValue::Number(k)) => (*lo..=*hi).contains(&u64::from(*k)),
        (CaseMatch::Buffer { bytes, case_sensitive: true }, ExprValue::Buffer(b)) => bytes == b,
        (CaseMatch::Buffer { bytes, case_sensitive: false }, ExprValue::Buffer(b)) => {
            bytes.eq_ignore_ascii_case(b)
        }
        (CaseMatch::Expr(expr), _) => matches!(ctx.eval_number(*expr)?, Evaluated::Value(v) if v != 0),
        _ => false,
    })
}

fn decode_switch(
    ctx: &mut DecodeCtx<'_, '_>,
    switch_id: ElementId,
    key_expr: ExprId,
    max_offset: usize,
    parent: Option<FieldNodeId>,
    parent_proto: ProtoNodeId,
) -> Result<Step, DecodeError> {
    let key = ctx.evaluator().eval_value(key_expr)?;
    if matches!(key, Evaluated::Warning) {
        return Ok(Step::Status(Status::Warning));
    }
    let mut cursor = ctx.db.element(switch_id).first_child;
    let mut default_body = None;
    while let Some(id) = cursor {
        let node = ctx.db.element(id).clone();
        match &node.kind {
            ElementKind::Case { matches } => {
                if case_matches(ctx, &key, matches)? {
                    let (s, _) = decode_fields(ctx, node.first_child, max_offset, parent, parent_proto)?;
                    return Ok(Step::Status(s));
                }
            }
            ElementKind::Default => default_body = Some(node.first_child),
            _ => {}
        }
        cursor = node.next_sibling;
    }
    match default_body {
        Some(body) => {
            let (s, _) = decode_fields(ctx, body, max_offset, parent, parent_proto)?;
            Ok(Step::Status(s))
        }
        None => Err(DecodeError::Db(crate::error::DbError::NoMatchingCase(switch_id.index() as u32))),
    }
}

#[allow(clippy::too_many_arguments)]
fn decode_if(
    ctx: &mut DecodeCtx<'_, '_>,
    condition: ExprId,
    then_branch: Option<ElementId>,
    else_branch: Option<ElementId>,
    missing_data_branch: Option<ElementId>,
    max_offset: usize,
    parent: Option<FieldNodeId>,
    parent_proto: ProtoNodeId,
) -> Result<Step, DecodeError> {
    match ctx.eval_number(condition)? {
        Evaluated::Value(v) if v != 0 => {
            let (s, _) = decode_fields(ctx, then_branch, max_offset, parent, parent_proto)?;
            Ok(Step::Status(s))
        }
        Evaluated::Value(_) => match else_branch {
            Some(b) => {
                let (s, _) = decode_fields(ctx, Some(b), max_offset, parent, parent_proto)?;
                Ok(Step::Status(s))
            }
            None => Ok(Step::Status(Status::Success)),
        },
        Evaluated::Warning => match missing_data_branch {
            Some(b) => {
                let (s, _) = decode_fields(ctx, Some(b), max_offset, parent, parent_proto)?;
                Ok(Step::Status(s))
            }
            None => Ok(Step::Status(Status::Warning)),
        },
    }
}

fn decode_block(
    ctx: &mut DecodeCtx<'_, '_>,
    block_id: ElementId,
    name: &str,
    max_offset: usize,
    parent: Option<FieldNodeId>,
    parent_proto: ProtoNodeId,
) -> Result<Step, DecodeError> {
    let abs_offset = ctx.current_offset();
    let checkpoint = ctx.tree.checkpoint().0;
    let block_node = ctx.tree.alloc_field(parent, parent_proto, name, name, abs_offset, 0, false, Some(block_id));
    let body = ctx.db.element(block_id).first_child;
    let (status, consumed) = decode_fields(ctx, body, max_offset, Some(block_node), parent_proto)?;
    if consumed == 0 {
        ctx.tree.rollback_fields(checkpoint);
    } else {
        ctx.tree.fields[block_node].size = consumed;
    }
    Ok(Step::Status(status))
}

fn decode_loop(
    ctx: &mut DecodeCtx<'_, '_>,
    elem_id: ElementId,
    loop_kind: &LoopKind,
    max_offset: usize,
    parent: Option<FieldNodeId>,
    parent_proto: ProtoNodeId,
) -> Result<Step, DecodeError> {
    let body = ctx.db.element(elem_id).first_child;
    let mut status = Status::Success;
    let mut iterations_done = 0u32;
    let mut bytes_done = 0usize;

    let target = match loop_kind {
        LoopKind::TimesToRepeat { count_expr } => match ctx.eval_number(*count_expr)? {
            Evaluated::Warning => return Ok(Step::Status(Status::Warning)),
            Evaluated::Value(n) => LoopTarget::Count(n),
        },
        LoopKind::Size { size_expr } => match ctx.eval_number(*size_expr)? {
            Evaluated::Warning => return Ok(Step::Status(Status::Warning)),
            Evaluated::Value(n) => LoopTarget::Bytes(n as usize),
        },
        LoopKind::While { .. } | LoopKind::DoWhile { .. } => LoopTarget::Condition,
    };

    loop {
        if ctx.current_offset() > max_offset {
            break;
        }
        match &target {
            LoopTarget::Count(n) if iterations_done >= *n => break,
            LoopTarget::Bytes(s) if bytes_done >= *s => break,
            _ => {}
        }
        if let LoopKind::While { condition_expr } = loop_kind {
            match ctx.eval_number(*condition_expr)? {
                Evaluated::Warning => break,
                Evaluated::Value(0) => break,
                Evaluated::Value(_) => {}
            }
        }
        let (s, consumed) = decode_fields(ctx, body, max_offset, parent, parent_proto)?;
        status = status.upgrade(s);
        iterations_done += 1;
        bytes_done += consumed;
        if consumed == 0 {
            break; // starvation guard (spec §4.2.1)
        }
        if let LoopKind::DoWhile { condition_expr } = loop_kind {
            match ctx.eval_number(*condition_expr)? {
                Evaluated::Warning | Evaluated::Value(0) => break,
                Evaluated::Value(_) => {}
            }
        }
    }
    Ok(Step::Status(status))
}

enum LoopTarget {
    Count(u32),
    Bytes(usize),
    Condition,
}

/// `set` (spec §4.2.3): iterated speculative decode with retroactive
/// rename on match. Restoring `ctx.current_offset()` on a rejected
/// iteration also restores `$currentprotooffset`, since
/// `set_current_offset` derives it from `current_proto_start` rather
/// than tracking it separately — no second checkpoint needed.
fn decode_set(
    ctx: &mut DecodeCtx<'_, '_>,
    set_id: ElementId,
    prototype: ElementId,
    exit_when: ExprId,
    max_offset: usize,
    parent: Option<FieldNodeId>,
    parent_proto: ProtoNodeId,
) -> Result<Status, DecodeError> {
    let matches_first = ctx.db.element(set_id).first_child;
    let mut status = Status::Success;
    loop {
        match ctx.eval_number(exit_when)? {
            Evaluated::Value(v) if v != 0 => break,
            Evaluated::Warning => {
                status = status.upgrade(Status::Warning);
                break;
            }
            Evaluated::Value(_) => {}
        }
        let field_checkpoint = ctx.tree.checkpoint().0;
        let offset_checkpoint = ctx.current_offset();
        match decode_speculative_match(ctx, prototype, matches_first, max_offset, parent, parent_proto)? {
            Some(SpeculativeOutcome { status: iter_status, consumed }) => {
                status = status.upgrade(iter_status);
                if consumed == 0 {
                    break;
                }
            }
            None => {
                ctx.tree.rollback_fields(field_checkpoint);
                ctx.set_current_offset(offset_checkpoint);
                break;
            }
        }
    }
    Ok(status)
}

/// `choice` (spec §4.2.4): one-shot version of the same machinery.
fn decode_choice(
    ctx: &mut DecodeCtx<'_, '_>,
    choice_id: ElementId,
    prototype: ElementId,
    max_offset: usize,
    parent: Option<FieldNodeId>,
    parent_proto: ProtoNodeId,
) -> Result<Status, DecodeError> {
    let matches_first = ctx.db.element(choice_id).first_child;
    let field_checkpoint = ctx.tree.checkpoint().0;
    let offset_checkpoint = ctx.current_offset();
    match decode_speculative_match(ctx, prototype, matches_first, max_offset, parent, parent_proto)? {
        Some(outcome) => Ok(outcome.status),
        None => {
            ctx.tree.rollback_fields(field_checkpoint);
            ctx.set_current_offset(offset_checkpoint);
            Ok(Status::Success)
        }
    }
}

struct SpeculativeOutcome {
    status: Status,
    consumed: usize,
}

/// Shared core of `set`/`choice` (spec §4.2.3 steps 1-7): decode the
/// prototype field once, then test `match`/`default-match` children
/// against the tentative `FieldNode`. A DB that declares no match
/// children at all accepts every non-empty tentative decode outright.
fn decode_speculative_match(
    ctx: &mut DecodeCtx<'_, '_>,
    prototype: ElementId,
    matches_first: Option<ElementId>,
    max_offset: usize,
    parent: Option<FieldNodeId>,
    parent_proto: ProtoNodeId,
) -> Result<Option<SpeculativeOutcome>, DecodeError> {
    let start_offset = ctx.current_offset();
    let proto_node = ctx.db.element(prototype).clone();
    let ElementKind::Field { name, long_name, kind: field_kind, byte_order, .. } = &proto_node.kind else {
        return Err(DecodeError::Db(crate::error::DbError::UnknownTag(prototype.index() as u32)));
    };
    let step = decode_single_field(ctx, prototype, name, long_name, field_kind, *byte_order, max_offset, parent, parent_proto)?;
    let Step::Status(field_status) = step else {
        return Ok(None);
    };
    if ctx.current_offset() == start_offset {
        return Ok(None);
    }
    let matched_field = ctx.current_field.expect("decode_single_field sets current_field when it advances the offset");
    if !apply_matches(ctx, matches_first, matched_field)? {
        return Ok(None);
    }
    Ok(Some(SpeculativeOutcome { status: field_status, consumed: ctx.current_offset() - start_offset }))
}

/// Evaluate a `set`/`choice`'s `match`/`default-match` children against
/// the tentatively decoded field, applying the first truthy rename.
/// Returns whether the tentative field is accepted; a `set`/`choice`
/// with no match children at all has no selection criteria, so every
/// non-empty tentative decode is accepted unconditionally.
fn apply_matches(
    ctx: &mut DecodeCtx<'_, '_>,
    matches_first: Option<ElementId>,
    field_id: FieldNodeId,
) -> Result<bool, DecodeError> {
    if matches_first.is_none() {
        return Ok(true);
    }
    let mut cursor = matches_first;
    let mut default_rename = None;
    while let Some(id) = cursor {
        let node = ctx.db.element(id).clone();
        match &node.kind {
            ElementKind::Match { condition, rename } => {
                if matches!(ctx.eval_number(*condition)?, Evaluated::Value(v) if v != 0) {
                    if let Some(new_name) = rename {
                        ctx.tree.fields[field_id].name = new_name.clone();
                    }
                    return Ok(true);
                }
            }
            ElementKind::DefaultMatch { rename } => default_rename = Some(rename.clone()),
            _ => {}
        }
        cursor = node.next_sibling;
    }
    if let Some(rename) = default_rename {
        if let Some(new_name) = rename {
            ctx.tree.fields[field_id].name = new_name;
        }
        return Ok(true);
    }
    Ok(false)
}

pub(crate) fn assign_variable(ctx: &mut DecodeCtx<'_, '_>, var: &str, expr: ExprId) -> Result<(), DecodeError> {
    let Some(id) = ctx.vars.id_of(var) else {
        return Err(DecodeError::Variable(crate::error::VariableError::NotFound(var.to_string())));
    };
    match ctx.evaluator().eval_value(expr)? {
        Evaluated::Value(crate::expr::ExprValue::Number(n)) => ctx.vars.set_number(id, n)?,
        Evaluated::Value(crate::expr::ExprValue::Buffer(b)) => ctx.vars.set_buffer(id, &b)?,
        Evaluated::Warning => {
            log::warn!(target: "netpdl_decoder::decode", "assign-variable `{var}`: unconditional missing reference");
            return Err(DecodeError::Expr(crate::error::ExprError::UnresolvedReference(var.to_string())));
        }
    }
    Ok(())
}

pub(crate) fn assign_lookup_field(ctx: &mut DecodeCtx<'_, '_>, table: &str, field: usize, expr: ExprId) -> Result<(), DecodeError> {
    let value = match ctx.evaluator().eval_value(expr)? {
        Evaluated::Value(v) => v,
        Evaluated::Warning => {
            return Err(DecodeError::Expr(crate::error::ExprError::UnresolvedReference(table.to_string())));
        }
    };
    let slot = match value {
        crate::expr::ExprValue::Number(n) => SlotValue::Number(u64::from(n)),
        crate::expr::ExprValue::Buffer(b) => SlotValue::Buffer(b),
    };
    ctx.lookups.get_mut(table)?.set_field(field, slot)?;
    Ok(())
}

pub(crate) fn update_lookup_table(
    ctx: &mut DecodeCtx<'_, '_>,
    table: &str,
    action: LookupAction,
    keys: &[ExprId],
    data: &[ExprId],
    external_call: Option<&(String, String)>,
) -> Result<(), DecodeError> {
    let mut key_values = Vec::with_capacity(keys.len());
    for &k in keys {
        match ctx.evaluator().eval_value(k)? {
            Evaluated::Value(crate::expr::ExprValue::Number(n)) => key_values.push(SlotValue::Number(u64::from(n))),
            Evaluated::Value(crate::expr::ExprValue::Buffer(b)) => key_values.push(SlotValue::Buffer(b)),
            Evaluated::Warning => return Ok(()),
        }
    }
    let mut data_values = Vec::with_capacity(data.len());
    for &d in data {
        match ctx.evaluator().eval_value(d)? {
            Evaluated::Value(crate::expr::ExprValue::Number(n)) => data_values.push(SlotValue::Number(u64::from(n))),
            Evaluated::Value(crate::expr::ExprValue::Buffer(b)) => data_values.push(SlotValue::Buffer(b)),
            Evaluated::Warning => return Ok(()),
        }
    }
    if let Some((module, function)) = external_call {
        let extra = ctx
            .external_calls
            .as_deref_mut()
            .ok_or_else(|| DecodeError::Plugin(format!("no external-call handler for {module}::{function}")))?
            .call(module, function, &key_values)
            .map_err(DecodeError::Plugin)?;
        data_values.extend(extra);
    }
    let now = ctx.now;
    match action {
        LookupAction::Add => {
            ctx.lookups.get_mut(table)?.add(key_values, data_values, crate::variables::Validity::ThisSession, None, None, None, now)?
        }
        LookupAction::Purge => ctx.lookups.get_mut(table)?.purge(&key_values, now)?,
        LookupAction::Obsolete => ctx.lookups.get_mut(table)?.obsolete(&key_values, now)?,
    }
    Ok(())
}

/// Run one `execute-before`/`execute-verify`/`execute-after` entry
/// (spec §4.1 "each is gated by an optional `when` expression evaluated
/// without an active field context"). `ctx.current_field` must already
/// be `None` for the `when`/statement evaluation to match that
/// contract; callers build a fresh [`DecodeCtx`] for code-list
/// execution rather than reusing one left over from field decode.
pub(crate) fn exec_entry(ctx: &mut DecodeCtx<'_, '_>, when: Option<ExprId>, statement: ElementId) -> Result<(), DecodeError> {
    if let Some(cond) = when {
        match ctx.eval_number(cond)? {
            Evaluated::Value(v) if v != 0 => {}
            Evaluated::Value(_) => return Ok(()),
            Evaluated::Warning => return Ok(()),
        }
    }
    let node = ctx.db.element(statement).clone();
    match &node.kind {
        ElementKind::AssignVariable { var, expr } => assign_variable(ctx, var, *expr),
        ElementKind::AssignLookupTable { table, field, expr } => assign_lookup_field(ctx, table, *field, *expr),
        ElementKind::UpdateLookupTable { table, action, keys, data, external_call } => {
            update_lookup_table(ctx, table, *action, keys, data, external_call.as_ref())
        }
        _ => Err(DecodeError::Db(crate::error::DbError::UnknownTag(statement.index() as u32))),
    }
}
