//! Protocol Dispatcher & Encapsulation Walker (spec §4.1).
//!
//! [`decode_packet`] is the engine's single public entry point: it runs
//! the pre-work GC/seeding, then iterates protocols, handing each one's
//! field description to the [`crate::decode`] Field Decoder and running
//! the DetailTree Builder / SummaryView Builder passes in between.

use crate::config::DecoderConfig;
use crate::db::{ElementKind, ExecEntry, Protocol, ProtocolDb};
use crate::decode::{assign_lookup_field, assign_variable, case_matches, decode_fields, exec_entry, update_lookup_table, DecodeCtx};
use crate::error::{DbError, DecodeError, Status};
use crate::expr::Evaluated;
use crate::lookup::LookupTableStore;
use crate::packet::PacketContext;
use crate::plugins::{ExternalCallHandler, FieldPlugin, NativeFunctions, ShowPlugin};
use crate::render;
use crate::summary::{self, SummaryRecord};
use crate::tree::DetailTree;
use crate::variables::{StandardVar, VariableStore, VerifyResult};

/// Everything a `decode_packet` call produces for one packet.
#[derive(Debug, Clone)]
pub struct DecodeResult {
    pub tree: DetailTree,
    pub summary: Option<SummaryRecord>,
    pub status: Status,
}

fn set_std(vars: &mut VariableStore, var: StandardVar, value: u32) -> Result<(), DecodeError> {
    let id = vars.standard(var);
    vars.set_number(id, value)?;
    Ok(())
}

fn seed_standard_variables(vars: &mut VariableStore, packet: PacketContext<'_>) -> Result<(), DecodeError> {
    set_std(vars, StandardVar::LinkType, packet.link_type)?;
    set_std(vars, StandardVar::FrameLen, packet.wire_len)?;
    // Seeded from caplen but not re-seeded afterward: a protocol's
    // `execute-after`/field description can shrink it via `assign-variable`
    // (e.g. to its own declared total-length field) to mark everything past
    // that point as ether padding rather than more protocol (spec.md:108-115,
    // :317; see `decode_packet`'s `bytes_to_be_decoded` check).
    set_std(vars, StandardVar::PacketLen, packet.raw.len() as u32)?;
    set_std(vars, StandardVar::TimestampS, packet.timestamp_s)?;
    set_std(vars, StandardVar::TimestampUs, packet.timestamp_us)?;
    let buf_id = vars.standard(StandardVar::PacketBuffer);
    vars.set_ref_buffer(buf_id, 0, packet.raw.len())?;
    Ok(())
}

fn verify_result_from_number(raw: u32) -> VerifyResult {
    VerifyResult::try_from(raw).unwrap_or(VerifyResult::NotFound)
}

/// Run a candidate protocol's own `execute-verify` code list (spec §4.1:
/// "the engine additionally runs the candidate's `execute-verify`
/// section") — the same per-entry `when`-gated dispatch as
/// `execute-before`/`execute-after`, just keyed by the candidate's
/// resolved protocol index rather than the current one.
fn exec_candidate_verify(ctx: &mut DecodeCtx<'_, '_>, proto_idx: usize) -> Result<(), DecodeError> {
    let entries: Vec<ExecEntry> = match ctx.db.protocol(proto_idx) {
        Some(p) => p.execute_verify.clone(),
        None => return Ok(()),
    };
    for entry in &entries {
        exec_entry(ctx, entry.when, entry.statement)?;
    }
    Ok(())
}

/// Depth-first walk of one protocol's encapsulation tree (spec §4.1
/// "Next-protocol selection"). Returns `Some(proto)` the instant a
/// `found` result is reached; otherwise keeps scanning and leaves the
/// first remembered `candidate`/`deferred` in `remembered`.
fn walk_encapsulation(
    ctx: &mut DecodeCtx<'_, '_>,
    first: Option<crate::db::ElementId>,
    remembered: &mut Option<(usize, VerifyResult)>,
) -> Result<Option<usize>, DecodeError> {
    let mut cursor = first;
    while let Some(id) = cursor {
        let node = ctx.db.element(id).clone();
        match &node.kind {
            ElementKind::NextProto { proto_expr } => {
                if let Evaluated::Value(v) = ctx.eval_number(*proto_expr)? {
                    return Ok(Some(v as usize));
                }
            }
            ElementKind::NextProtoCandidate { proto_expr } => {
                if let Evaluated::Value(v) = ctx.eval_number(*proto_expr)? {
                    let proto_idx = v as usize;
                    exec_candidate_verify(ctx, proto_idx)?;
                    let result_id = ctx.vars.standard(StandardVar::ProtoVerifyResult);
                    let raw = ctx.vars.get_number(result_id).unwrap_or(0);
                    match verify_result_from_number(raw) {
                        VerifyResult::Found => return Ok(Some(proto_idx)),
                        result @ (VerifyResult::Candidate | VerifyResult::Deferred) => {
                            if remembered.is_none() {
                                *remembered = Some((proto_idx, result));
                            }
                        }
                        VerifyResult::NotFound => {}
                    }
                }
            }
            ElementKind::Switch { key_expr } => {
                let key = ctx.evaluator().eval_value(*key_expr)?;
                let mut case_cursor = ctx.db.element(id).first_child;
                let mut matched_body = None;
                let mut default_body = None;
                while let Some(case_id) = case_cursor {
                    let case_node = ctx.db.element(case_id).clone();
                    match &case_node.kind {
                        ElementKind::Case { matches } => {
                            if case_matches(ctx, &key, matches)? {
                                matched_body = case_node.first_child;
                                break;
                            }
                        }
                        ElementKind::Default => default_body = Some(case_node.first_child),
                        _ => {}
                    }
                    case_cursor = case_node.next_sibling;
                }
                let body = matched_body.or(default_body.flatten());
                if let Some(found) = walk_encapsulation(ctx, body, remembered)? {
                    return Ok(Some(found));
                }
            }
            ElementKind::If { condition, then_branch, else_branch, .. } => match ctx.eval_number(*condition)? {
                Evaluated::Value(v) if v != 0 => {
                    if let Some(found) = walk_encapsulation(ctx, *then_branch, remembered)? {
                        return Ok(Some(found));
                    }
                }
                Evaluated::Value(_) => {
                    if let Some(b) = else_branch {
                        if let Some(found) = walk_encapsulation(ctx, Some(*b), remembered)? {
                            return Ok(Some(found));
                        }
                    }
                }
                // truncated condition: skip this element, keep scanning siblings
                Evaluated::Warning => {}
            },
            ElementKind::AssignVariable { var, expr } => assign_variable(ctx, var, *expr)?,
            ElementKind::AssignLookupTable { table, field, expr } => assign_lookup_field(ctx, table, *field, *expr)?,
            ElementKind::UpdateLookupTable { table, action, keys, data, external_call } => {
                update_lookup_table(ctx, table, *action, keys, data, external_call.as_ref())?;
            }
            _ => return Err(DecodeError::Db(DbError::UnknownTag(id.index() as u32))),
        }
        cursor = node.next_sibling;
    }
    Ok(None)
}

/// Apply the three next-protocol selection rules (spec §4.1): first
/// `found` wins; else the first remembered `candidate`/`deferred`; else
/// `DefaultProto`. A protocol with no encapsulation section at all has
/// no candidates to walk, so it defers straight to `DefaultProto` — the
/// ether-padding fallback is triggered by the caller based on
/// `$packetlen` vs `caplen` (see `decode_packet`), not by the absence of
/// an encapsulation section.
fn select_next_protocol(ctx: &mut DecodeCtx<'_, '_>, protocol: &Protocol) -> Result<usize, DecodeError> {
    let Some(encap) = protocol.encapsulation else {
        return Ok(ctx.db.default_proto);
    };
    let mut remembered: Option<(usize, VerifyResult)> = None;
    if let Some(found) = walk_encapsulation(ctx, Some(encap.first_item), &mut remembered)? {
        return Ok(found);
    }
    if let Some((proto_idx, result)) = remembered {
        let id = ctx.vars.standard(StandardVar::ProtoVerifyResult);
        ctx.vars.set_number(id, result as u32)?;
        return Ok(proto_idx);
    }
    Ok(ctx.db.default_proto)
}

/// Decode one packet end to end (spec §4.1 `decode_packet` entry).
#[allow(clippy::too_many_arguments)]
pub fn decode_packet(
    db: &ProtocolDb,
    vars: &mut VariableStore,
    lookups: &mut LookupTableStore,
    config: &DecoderConfig,
    native: &dyn NativeFunctions,
    show_plugin: Option<&dyn ShowPlugin>,
    field_plugin: Option<&dyn FieldPlugin>,
    mut external_calls: Option<&mut dyn ExternalCallHandler>,
    packet: PacketContext<'_>,
) -> Result<DecodeResult, DecodeError> {
    vars.garbage_collect();
    seed_standard_variables(vars, packet)?;

    let mut tree = DetailTree::new();
    let now = u64::from(packet.timestamp_s);
    let caplen = packet.caplen();

    let mut current_offset = 0usize;
    let mut current_proto = db.start_proto;
    // Tracks the protocol actually decoded in the prior iteration, distinct
    // from `current_proto` (which already holds the *next* protocol to
    // decode by the time a new iteration starts); seeded to `start_proto`
    // since there is no real previous protocol for the first packet.
    let mut prev_decoded_proto = current_proto;
    let mut overall_status = Status::Success;
    // One shared record accumulating every protocol's summary-template
    // fragment for the whole packet (spec §4.1 pre-work "Initialize an
    // empty DetailTree and SummaryRecord for the packet"; netbee's
    // `psmlmaker.cpp` zeroes `m_summaryItemsData` once per packet and every
    // protocol's `AddHeaderFragment` call writes into that same array).
    let mut summary_record = config.generate_summary.then(|| SummaryRecord::new(db.summary_columns.len()));

    while current_offset < caplen {
        set_std(vars, StandardVar::PrevProto, prev_decoded_proto as u32)?;

        let protocol = db.protocol(current_proto).ok_or(DecodeError::Db(DbError::UnknownProtocol(current_proto)))?;

        let mut aborted = false;
        let next_offset;
        let mut next_proto = current_proto;
        {
            let mut ctx = DecodeCtx {
                db,
                tree: &mut tree,
                vars,
                lookups,
                packet,
                field_plugin,
                external_calls: external_calls.as_deref_mut(),
                now,
                current_field: None,
                emit_discard_nodes: config.emit_discard_nodes,
                current_proto_start: current_offset,
            };

            for entry in &protocol.execute_before {
                exec_entry(&mut ctx, entry.when, entry.statement)?;
            }

            let proto_checkpoint = ctx.tree.checkpoint();
            let proto_id = ctx.tree.alloc_proto(current_proto, current_offset);
            ctx.set_current_offset(current_offset);

            let max_offset = caplen.saturating_sub(1);
            let (status, consumed) = decode_fields(&mut ctx, protocol.first_field, max_offset, None, proto_id)?;
            overall_status = overall_status.upgrade(status);

            if status.is_failure() {
                ctx.tree.rollback_fields(proto_checkpoint.0);
                ctx.tree.discard_last_proto(proto_checkpoint.1);
                aborted = true;
                next_offset = ctx.current_offset();
            } else if consumed == 0 && status == Status::Warning {
                ctx.tree.rollback_fields(proto_checkpoint.0);
                ctx.tree.discard_last_proto(proto_checkpoint.1);
                aborted = true;
                next_offset = ctx.current_offset();
            } else {
                ctx.tree.finalize_proto_size(proto_id, consumed);
                for entry in &protocol.execute_after {
                    exec_entry(&mut ctx, entry.when, entry.statement)?;
                }
                next_offset = ctx.current_offset();
                // spec.md:108-115,317 "bytes to be decoded" vs. raw
                // `caplen`: `$packetlen` shrinks below `caplen` as
                // protocols (e.g. IP) assign it their own declared total
                // length, so a packet can have physical bytes left
                // (`caplen`) after its logical content (`$packetlen`) is
                // exhausted — that remainder is ether padding, not a
                // protocol to keep decoding (netbee
                // `netpdldecoder.cpp::BytesToBeDecoded`).
                let packetlen_id = ctx.vars.standard(StandardVar::PacketLen);
                let packetlen = ctx.vars.get_number(packetlen_id).unwrap_or(caplen as u32) as usize;
                let bytes_to_be_decoded = packetlen.min(caplen);
                if next_offset < bytes_to_be_decoded {
                    next_proto = select_next_protocol(&mut ctx, protocol)?;
                    let id = ctx.vars.standard(StandardVar::NextProto);
                    ctx.vars.set_number(id, next_proto as u32)?;
                } else if next_offset < caplen {
                    next_proto = ctx.db.ether_padding_proto.unwrap_or(ctx.db.default_proto);
                    let id = ctx.vars.standard(StandardVar::NextProto);
                    ctx.vars.set_number(id, next_proto as u32)?;
                }
            }
        }

        current_offset = next_offset;
        if aborted {
            break;
        }

        if config.generate_detail_simple {
            render::render_tree(db, &mut tree, packet.raw, native, show_plugin);
        }
        if config.generate_detail_full {
            render::render_custom_details_tree(db, &mut tree, vars, lookups, packet, packet.raw, now)?;
        }
        if let (Some(record), Some(tmpl)) = (summary_record.as_mut(), &protocol.summary_template) {
            summary::build_summary(
                record,
                db,
                &tree,
                vars,
                lookups,
                packet,
                packet.raw,
                now,
                &protocol.name,
                &protocol.long_name,
                tmpl.root,
            )?;
        }

        prev_decoded_proto = current_proto;
        current_proto = next_proto;
    }

    Ok(DecodeResult { tree, summary: summary_record, status: overall_status })
}
