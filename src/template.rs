//! Shared primitives for the two template-tree walkers: the custom-detail
//! renderer (spec §4.6 `showdtl`, see [`crate::render`]) and the
//! SummaryView Builder (spec §4.7, see [`crate::summary`]). Both walk an
//! [`crate::db::ElementKind`] subtree of `TemplateField`/`TemplateText`/`If`
//! nodes (plus `Section`/`PktHdr`/`ProtoHdr` for summaries only); this
//! module holds what they have in common: attribute rendering and
//! protofield-path resolution.

use crate::db::{ProtocolDb, TemplateAttr, TemplateText};
use crate::error::DecodeError;
use crate::expr::{resolve_protofield_path, Evaluated, Evaluator, ExprValue};
use crate::lookup::LookupTableStore;
use crate::packet::PacketContext;
use crate::tree::{DetailTree, FieldNodeId};
use crate::variables::VariableStore;

/// Resolve a `protofield` node's path against the DetailTree (spec §4.6:
/// "`protofield` inserts a named attribute from a resolved PDML
/// element"). An empty path refers to the field the template is
/// currently rendering for (the `showdtl` node's own field).
#[must_use]
pub fn resolve_field_for_path(
    tree: &DetailTree,
    db: &ProtocolDb,
    current_field: Option<FieldNodeId>,
    path: &[String],
) -> Option<FieldNodeId> {
    if path.is_empty() {
        current_field
    } else {
        resolve_protofield_path(tree, db, path)
    }
}

/// Render one of the nine attributes a `protofield` template node may
/// select (spec §4.6).
#[must_use]
pub fn resolve_attr_text(tree: &DetailTree, raw: &[u8], field_id: FieldNodeId, attr: TemplateAttr) -> String {
    let field = &tree.fields[field_id];
    match attr {
        TemplateAttr::Value => raw
            .get(field.position..field.end())
            .map(|bytes| bytes.iter().map(|b| format!("{b:02x}")).collect())
            .unwrap_or_default(),
        TemplateAttr::Show => field.show_value.clone().unwrap_or_default(),
        TemplateAttr::ShowMap => field.show_map.clone().unwrap_or_default(),
        TemplateAttr::ShowDetails => field.show_details.clone().unwrap_or_default(),
        TemplateAttr::Mask => field.mask.map(|m| format!("{m:#x}")).unwrap_or_default(),
        TemplateAttr::Position => field.position.to_string(),
        TemplateAttr::Size => field.size.to_string(),
        TemplateAttr::Name => field.name.clone(),
        TemplateAttr::LongName => field.long_name.clone(),
    }
}

/// Render a `text` template node: a literal is copied verbatim; an
/// expression is evaluated and stringified (spec §4.6: "inserts a
/// literal or the string/number result of an expression").
#[allow(clippy::too_many_arguments)]
pub fn render_text(
    db: &ProtocolDb,
    tree: &DetailTree,
    vars: &mut VariableStore,
    lookups: &mut LookupTableStore,
    packet: PacketContext<'_>,
    current_field: Option<FieldNodeId>,
    now: u64,
    text: &TemplateText,
) -> Result<String, DecodeError> {
    match text {
        TemplateText::Literal(s) => Ok(s.clone()),
        TemplateText::Expr(expr) => {
            let mut evaluator = Evaluator { db, vars, lookups, tree, packet, current_field, now };
            match evaluator.eval_value(*expr)? {
                Evaluated::Value(ExprValue::Number(n)) => Ok(n.to_string()),
                Evaluated::Value(ExprValue::Buffer(b)) => Ok(String::from_utf8_lossy(&b).into_owned()),
                Evaluated::Warning => Ok(String::new()),
            }
        }
    }
}
