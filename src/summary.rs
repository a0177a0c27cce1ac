//! SummaryView Builder (spec §4.7).
//!
//! Runs once per protocol after that protocol's fields are fully
//! decoded: walks the protocol's `SummaryTemplate` over the just-built
//! `DetailTree` slice, appending into the one [`SummaryRecord`] shared
//! for the whole packet (spec §4.1 pre-work "Initialize an empty
//! DetailTree and SummaryRecord for the packet"; every protocol's
//! fragment lands in the same record, same as netbee's
//! `psmlmaker.cpp::AddHeaderFragment`). Because this walker runs as a
//! single post-decode pass rather than interleaved with block-level
//! decode, the spec's overflow-slot merge (appending past the last
//! declared column into an N+1th slot while still inside a block) has
//! no distinct "still inside a block" moment to trigger from —
//! [`SummaryRecord::append`] still implements the mechanism, but no
//! caller in this design exercises it (see DESIGN.md).

use crate::db::{ElementKind, PktHdrAttr, ProtoHdrAttr, ProtocolDb, SectionTarget};
use crate::error::{DbError, DecodeError};
use crate::expr::{Evaluated, Evaluator};
use crate::lookup::LookupTableStore;
use crate::packet::PacketContext;
use crate::template::{render_text, resolve_attr_text, resolve_field_for_path};
use crate::tree::DetailTree;
use crate::variables::VariableStore;

/// One row of the summary view: `columns` fixed slots plus an overflow
/// slot for content written past the declared column count (spec §4.7
/// "a fixed column count N ... content written past the Nth column is
/// appended to an overflow slot").
#[derive(Debug, Clone)]
pub struct SummaryRecord {
    slots: Vec<String>,
    overflow: String,
    current: usize,
}

impl SummaryRecord {
    #[must_use]
    pub fn new(columns: usize) -> Self {
        Self { slots: vec![String::new(); columns], overflow: String::new(), current: 0 }
    }

    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.slots
    }

    #[must_use]
    pub fn overflow(&self) -> &str {
        &self.overflow
    }

    /// Write into the current target slot, or the overflow slot once
    /// `section` has advanced past the last declared column.
    pub fn append(&mut self, text: &str) {
        match self.slots.get_mut(self.current) {
            Some(slot) => slot.push_str(text),
            None => self.overflow.push_str(text),
        }
    }

    /// Apply a `section` template node's target (spec §4.7).
    pub fn set_section(&mut self, target: SectionTarget) {
        self.current = match target {
            SectionTarget::Index(i) => i,
            SectionTarget::Next => self.current + 1,
        };
    }

    /// Move whatever has accumulated in the overflow slot back into the
    /// record's last declared column (spec §4.7's merge rule).
    pub fn flush_overflow(&mut self) {
        if self.overflow.is_empty() {
            return;
        }
        if let Some(last) = self.slots.last_mut() {
            last.push_str(&self.overflow);
        }
        self.overflow.clear();
    }
}

/// Append one protocol's summary fragment by walking its
/// `SummaryTemplate` root over the DetailTree field span already
/// committed for that protocol, into the packet's shared `record` (spec
/// §4.7).
#[allow(clippy::too_many_arguments)]
pub fn build_summary(
    record: &mut SummaryRecord,
    db: &ProtocolDb,
    tree: &DetailTree,
    vars: &mut VariableStore,
    lookups: &mut LookupTableStore,
    packet: PacketContext<'_>,
    raw: &[u8],
    now: u64,
    proto_name: &str,
    proto_long_name: &str,
    root: crate::db::ElementId,
) -> Result<(), DecodeError> {
    walk_template(db, tree, vars, lookups, packet, raw, now, proto_name, proto_long_name, Some(root), record)?;
    record.flush_overflow();
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn walk_template(
    db: &ProtocolDb,
    tree: &DetailTree,
    vars: &mut VariableStore,
    lookups: &mut LookupTableStore,
    packet: PacketContext<'_>,
    raw: &[u8],
    now: u64,
    proto_name: &str,
    proto_long_name: &str,
    first: Option<crate::db::ElementId>,
    record: &mut SummaryRecord,
) -> Result<(), DecodeError> {
    let mut cursor = first;
    while let Some(id) = cursor {
        let node = db.element(id).clone();
        match &node.kind {
            ElementKind::TemplateField { path, attr } => {
                if let Some(target) = resolve_field_for_path(tree, db, None, path) {
                    record.append(&resolve_attr_text(tree, raw, target, *attr));
                }
            }
            ElementKind::TemplateText { text } => {
                record.append(&render_text(db, tree, vars, lookups, packet, None, now, text)?);
            }
            ElementKind::Section { target } => record.set_section(*target),
            ElementKind::PktHdr { attr } => record.append(&render_pkthdr(packet, *attr)),
            ElementKind::ProtoHdr { attr } => {
                record.append(match attr {
                    ProtoHdrAttr::Name => proto_name,
                    ProtoHdrAttr::LongName => proto_long_name,
                });
            }
            ElementKind::If { condition, then_branch, else_branch, .. } => {
                let mut evaluator = Evaluator { db, vars, lookups, tree, packet, current_field: None, now };
                match evaluator.eval_number(*condition)? {
                    Evaluated::Value(v) if v != 0 => {
                        walk_template(
                            db, tree, vars, lookups, packet, raw, now, proto_name, proto_long_name, *then_branch,
                            record,
                        )?;
                    }
                    Evaluated::Value(_) => {
                        if let Some(b) = else_branch {
                            walk_template(
                                db,
                                tree,
                                vars,
                                lookups,
                                packet,
                                raw,
                                now,
                                proto_name,
                                proto_long_name,
                                Some(*b),
                                record,
                            )?;
                        }
                    }
                    Evaluated::Warning => {}
                }
            }
            _ => return Err(DecodeError::Db(DbError::UnknownTag(id.index() as u32))),
        }
        cursor = node.next_sibling;
    }
    Ok(())
}

fn render_pkthdr(packet: PacketContext<'_>, attr: PktHdrAttr) -> String {
    match attr {
        PktHdrAttr::LinkType => packet.link_type.to_string(),
        PktHdrAttr::FrameLen => packet.wire_len.to_string(),
        PktHdrAttr::PacketLen => packet.raw.len().to_string(),
        PktHdrAttr::TimestampS => packet.timestamp_s.to_string(),
        PktHdrAttr::TimestampUs => packet.timestamp_us.to_string(),
        PktHdrAttr::Ordinal => packet.ordinal.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_past_last_column_goes_to_overflow() {
        let mut record = SummaryRecord::new(2);
        record.set_section(SectionTarget::Index(1));
        record.append("b");
        record.set_section(SectionTarget::Next);
        record.append("extra");
        assert_eq!(record.columns(), &["".to_string(), "b".to_string()]);
        assert_eq!(record.overflow(), "extra");
        record.flush_overflow();
        assert_eq!(record.columns()[1], "bextra");
    }
}
