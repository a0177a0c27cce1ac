//! DetailTree Builder (spec §4.5) and custom-detail renderer (spec §4.6).
//!
//! Field measurement and commitment happen in [`crate::decode`]; the
//! functions here run as a second pass once a field's node already
//! exists, gated by `DecoderConfig::generate_detail_simple` /
//! `generate_detail_full`. Truncated-field flagging (spec §4.5 item 1)
//! already happened during commitment, so [`render_field`] leaves an
//! already-flagged node alone.

use crate::db::{ElementKind, FieldKind, NativeFunction, NumberBase, ProtocolDb};
use crate::error::{DbError, DecodeError};
use crate::expr::{Evaluated, Evaluator};
use crate::lookup::LookupTableStore;
use crate::packet::PacketContext;
use crate::plugins::{NativeFunctions, ShowPlugin};
use crate::template::{render_text, resolve_attr_text, resolve_field_for_path};
use crate::tree::{DetailTree, FieldNodeId};
use crate::variables::VariableStore;

fn bytes_to_u64_be(bytes: &[u8]) -> u64 {
    let take = bytes.len().min(8);
    bytes[..take].iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
}

fn run_native_function(native: &dyn NativeFunctions, kind: NativeFunction, bytes: &[u8]) -> Option<String> {
    match kind {
        NativeFunction::Ipv4Dotted => native.ipv4_dotted(bytes),
        NativeFunction::Ascii => native.ascii(bytes),
        NativeFunction::AsciiLine => native.ascii_line(bytes),
        NativeFunction::HttpContent => native.http_content(bytes),
    }
}

/// Render grouped hex/bin with left-zero padding to full digit width
/// (spec §4.5 item 4, grounded on netbee's `formatfield_bytestring`
/// digit-size table: groups of 1/2/4/8 bytes).
fn render_grouped(bytes: &[u8], base: NumberBase, digit_size: u8, separator: Option<char>) -> String {
    let group_len = usize::from(digit_size.max(1));
    let parts: Vec<String> = bytes
        .chunks(group_len)
        .map(|chunk| {
            let value = bytes_to_u64_be(chunk);
            match base {
                NumberBase::Hex => format!("0x{:01$x}", value, group_len * 2),
                NumberBase::HexNo0x => format!("{:01$x}", value, group_len * 2),
                NumberBase::Bin => format!("{:01$b}", value, group_len * 8),
                _ => unreachable!("render_grouped only called for hex/hex-no-0x/bin"),
            }
        })
        .collect();
    match separator {
        Some(sep) => parts.join(&sep.to_string()),
        None => parts.concat(),
    }
}

fn render_by_base(bytes: &[u8], base: Option<NumberBase>, digit_size: u8, separator: Option<char>) -> String {
    match base {
        None => render_grouped(bytes, NumberBase::HexNo0x, digit_size, separator),
        Some(NumberBase::Ascii) => String::from_utf8_lossy(bytes).into_owned(),
        Some(NumberBase::Float) => bytes
            .get(..4)
            .map(|b| f32::from_be_bytes(b.try_into().expect("checked length 4")).to_string())
            .unwrap_or_default(),
        Some(NumberBase::Double) => bytes
            .get(..8)
            .map(|b| f64::from_be_bytes(b.try_into().expect("checked length 8")).to_string())
            .unwrap_or_default(),
        Some(NumberBase::Dec) => bytes_to_u64_be(bytes).to_string(),
        Some(base @ (NumberBase::Hex | NumberBase::HexNo0x | NumberBase::Bin)) => {
            render_grouped(bytes, base, digit_size, separator)
        }
    }
}

/// Apply one field's `VisualizationTemplate` (spec §4.5 items 2-5):
/// native-function presentation, then plugin presentation, then the
/// base/digit-size/separator rendering, then map-table lookup.
pub fn render_field(
    db: &ProtocolDb,
    tree: &mut DetailTree,
    raw: &[u8],
    field_id: FieldNodeId,
    native: &dyn NativeFunctions,
    show_plugin: Option<&dyn ShowPlugin>,
) {
    if tree.fields[field_id].show_value.is_some() {
        return;
    }
    let Some(elem_id) = tree.fields[field_id].source_element else { return };
    let ElementKind::Field { visualize, kind, .. } = &db.element(elem_id).kind else { return };

    // A bit field's container bytes are shared with its siblings, so the
    // value to render is the already bit-extracted number rather than a
    // slice of the packet buffer (spec §4.2 "`bit`").
    let bit_bytes;
    let bytes: &[u8] = if let FieldKind::Bit { width, .. } = kind {
        let Some(value) = tree.fields[field_id].bit_value else { return };
        let nbytes = usize::from(*width).div_ceil(8).max(1);
        bit_bytes = value.to_be_bytes();
        &bit_bytes[bit_bytes.len() - nbytes..]
    } else {
        let position = tree.fields[field_id].position;
        let size = tree.fields[field_id].size;
        let Some(b) = raw.get(position..position + size) else { return };
        b
    };

    let rendered = if let Some(native_fn) = visualize.native_function {
        run_native_function(native, native_fn, bytes)
    } else if let Some(plugin_id) = visualize.plugin {
        show_plugin.and_then(|p| p.render(plugin_id, bytes))
    } else {
        Some(render_by_base(bytes, visualize.base, visualize.digit_size, visualize.separator))
    };
    if let Some(text) = rendered {
        tree.fields[field_id].show_value = Some(text);
    }

    if let Some(map) = &visualize.map_table {
        let key = bytes_to_u64_be(bytes);
        if let Some((_, literal)) = map.iter().find(|(k, _)| *k == key) {
            tree.fields[field_id].show_map = Some(literal.clone());
        }
    }
}

/// Walk every field of `tree` applying [`render_field`] (spec §4.5's
/// pass over the whole DetailTree once a protocol finishes decoding).
pub fn render_tree(
    db: &ProtocolDb,
    tree: &mut DetailTree,
    raw: &[u8],
    native: &dyn NativeFunctions,
    show_plugin: Option<&dyn ShowPlugin>,
) {
    for i in 0..tree.fields.len() {
        let id = FieldNodeId::new(i as u32);
        render_field(db, tree, raw, id, native, show_plugin);
    }
}

/// Run a `showdtl` custom-detail template (spec §4.6) for one field,
/// producing its `ShowDetails` string.
#[allow(clippy::too_many_arguments)]
pub fn render_custom_detail(
    db: &ProtocolDb,
    tree: &DetailTree,
    vars: &mut VariableStore,
    lookups: &mut LookupTableStore,
    packet: PacketContext<'_>,
    raw: &[u8],
    field_id: FieldNodeId,
    now: u64,
    root: crate::db::ElementId,
) -> Result<String, DecodeError> {
    let mut out = String::new();
    render_nodes(db, tree, vars, lookups, packet, raw, field_id, now, Some(root), &mut out)?;
    Ok(out)
}

#[allow(clippy::too_many_arguments)]
fn render_nodes(
    db: &ProtocolDb,
    tree: &DetailTree,
    vars: &mut VariableStore,
    lookups: &mut LookupTableStore,
    packet: PacketContext<'_>,
    raw: &[u8],
    field_id: FieldNodeId,
    now: u64,
    first: Option<crate::db::ElementId>,
    out: &mut String,
) -> Result<(), DecodeError> {
    let mut cursor = first;
    while let Some(id) = cursor {
        let node = db.element(id).clone();
        match &node.kind {
            ElementKind::TemplateField { path, attr } => {
                if let Some(target) = resolve_field_for_path(tree, db, Some(field_id), path) {
                    out.push_str(&resolve_attr_text(tree, raw, target, *attr));
                }
            }
            ElementKind::TemplateText { text } => {
                out.push_str(&render_text(db, tree, vars, lookups, packet, Some(field_id), now, text)?);
            }
            ElementKind::If { condition, then_branch, else_branch, .. } => {
                let mut evaluator = Evaluator { db, vars, lookups, tree, packet, current_field: Some(field_id), now };
                match evaluator.eval_number(*condition)? {
                    Evaluated::Value(v) if v != 0 => {
                        render_nodes(db, tree, vars, lookups, packet, raw, field_id, now, *then_branch, out)?;
                    }
                    Evaluated::Value(_) => {
                        if let Some(b) = else_branch {
                            render_nodes(db, tree, vars, lookups, packet, raw, field_id, now, Some(*b), out)?;
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

/// Run every field's `showdtl` custom-detail template, where declared
/// (spec §4.5 item 6 "custom-detail template, if present, overrides/
/// supplements the plain ShowValue"). Runs after [`render_tree`] so a
/// template's `protofield(show=...)` references see the rendered value.
#[allow(clippy::too_many_arguments)]
pub fn render_custom_details_tree(
    db: &ProtocolDb,
    tree: &mut DetailTree,
    vars: &mut VariableStore,
    lookups: &mut LookupTableStore,
    packet: PacketContext<'_>,
    raw: &[u8],
    now: u64,
) -> Result<(), DecodeError> {
    for i in 0..tree.fields.len() {
        let id = FieldNodeId::new(i as u32);
        let Some(elem_id) = tree.fields[id].source_element else { continue };
        let ElementKind::Field { visualize, .. } = &db.element(elem_id).kind else { continue };
        let Some(root) = visualize.custom_template else { continue };
        let rendered = render_custom_detail(db, tree, vars, lookups, packet, raw, id, now, root)?;
        tree.fields[id].show_details = Some(rendered);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_no_0x_groups_pad_to_full_width() {
        assert_eq!(render_grouped(&[0x4, 0x55], NumberBase::HexNo0x, 1, None), "0455");
        assert_eq!(render_grouped(&[0x00, 0x50], NumberBase::Hex, 2, None), "0x0050");
    }

    #[test]
    fn separator_joins_groups() {
        assert_eq!(render_grouped(&[0x01, 0x02, 0x03, 0x04], NumberBase::HexNo0x, 1, Some('.')), "01.02.03.04");
    }
}
