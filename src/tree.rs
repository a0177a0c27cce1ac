use crate::arena::{Arena, Id};

pub type FieldNodeId = Id<FieldNode>;
pub type ProtoNodeId = Id<ProtoNode>;

/// One node of the per-packet parse forest (spec §3 "DetailTree").
///
/// Every `[position, position + size)` span must lie within
/// `[0, caplen)` — checked by the builder before a node is ever linked
/// into the tree (spec invariant list, first bullet).
#[derive(Debug, Clone)]
pub struct FieldNode {
    pub name: String,
    pub long_name: String,
    pub position: usize,
    pub size: usize,
    pub mask: Option<u64>,
    /// Already-extracted numeric value of a `bit`-kind field (spec §4.2
    /// "`bit`"). Bit-field siblings share their container's bytes, so
    /// [`crate::render::render_field`] reads this instead of re-slicing
    /// the packet buffer, letting the usual base/map-table rendering
    /// (spec §4.5 items 2-6) run for bit fields same as any other kind.
    pub bit_value: Option<u32>,
    pub show_value: Option<String>,
    pub show_map: Option<String>,
    pub show_details: Option<String>,
    pub parent: Option<FieldNodeId>,
    pub first_child: Option<FieldNodeId>,
    pub next_sibling: Option<FieldNodeId>,
    pub last_child: Option<FieldNodeId>,
    /// `false` for block-kind container nodes that aren't themselves a
    /// decoded field (spec §3: "`isField` flag (false for block roots)").
    pub is_field: bool,
    pub parent_proto: ProtoNodeId,
    /// The DB element this node was produced from, so the DetailTree
    /// Builder can look up its `VisualizationTemplate` (spec §4.5)
    /// without re-walking the element graph in lockstep.
    pub source_element: Option<crate::db::ElementId>,
}

impl FieldNode {
    #[must_use]
    pub fn end(&self) -> usize {
        self.position + self.size
    }
}

/// Root of one protocol's fields within a packet, chained in capture
/// order (spec §3 "ProtoNode"s chained in capture order").
#[derive(Debug, Clone)]
pub struct ProtoNode {
    pub proto_index: usize,
    pub start: usize,
    pub size: usize,
    pub first_field: Option<FieldNodeId>,
    pub last_field: Option<FieldNodeId>,
    pub next: Option<ProtoNodeId>,
}

/// Per-packet parse tree: a forest of [`FieldNode`]s grouped under
/// [`ProtoNode`]s (spec §3). Every node in a `DetailTree` is owned by the
/// packet arena and is released wholesale when the next packet begins
/// (spec §3 "Ownership").
#[derive(Debug, Clone)]
pub struct DetailTree {
    pub protos: Arena<ProtoNode>,
    pub fields: Arena<FieldNode>,
    proto_head: Option<ProtoNodeId>,
    proto_tail: Option<ProtoNodeId>,
}

impl Default for DetailTree {
    fn default() -> Self {
        Self::new()
    }
}

impl DetailTree {
    #[must_use]
    pub fn new() -> Self {
        Self {
            protos: Arena::with_capacity(20),
            fields: Arena::with_capacity(400),
            proto_head: None,
            proto_tail: None,
        }
    }

    /// Release every node and start fresh for the next packet (spec §3
    /// "Ownership": "all nodes are released together when the next
    /// packet begins").
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn alloc_proto(&mut self, proto_index: usize, start: usize) -> ProtoNodeId {
        let id = self.protos.push(ProtoNode {
            proto_index,
            start,
            size: 0,
            first_field: None,
            last_field: None,
            next: None,
        });
        if let Some(tail) = self.proto_tail {
            self.protos[tail].next = Some(id);
        } else {
            self.proto_head = Some(id);
        }
        self.proto_tail = Some(id);
        id
    }

    #[must_use]
    pub fn first_proto(&self) -> Option<ProtoNodeId> {
        self.proto_head
    }

    /// Return the most recently allocated proto node to the arena
    /// (used when a zero-length protocol decode is discarded).
    pub fn discard_last_proto(&mut self, checkpoint: usize) {
        self.protos.truncate(checkpoint);
        self.proto_tail = if checkpoint == 0 { None } else { Some(Id::new((checkpoint - 1) as u32)) };
        if checkpoint == 0 {
            self.proto_head = None;
        }
    }

    pub fn alloc_field(
        &mut self,
        parent: Option<FieldNodeId>,
        parent_proto: ProtoNodeId,
        name: impl Into<String>,
        long_name: impl Into<String>,
        position: usize,
        size: usize,
        is_field: bool,
        source_element: Option<crate::db::ElementId>,
    ) -> FieldNodeId {
        let id = self.fields.push(FieldNode {
            name: name.into(),
            long_name: long_name.into(),
            position,
            size,
            mask: None,
            bit_value: None,
            show_value: None,
            show_map: None,
            show_details: None,
            parent,
            first_child: None,
            last_child: None,
            next_sibling: None,
            is_field,
            parent_proto,
            source_element,
        });
        match parent {
            Some(parent_id) => {
                if let Some(last) = self.fields[parent_id].last_child {
                    self.fields[last].next_sibling = Some(id);
                } else {
                    self.fields[parent_id].first_child = Some(id);
                }
                self.fields[parent_id].last_child = Some(id);
            }
            None => {
                let proto = &mut self.protos[parent_proto];
                if let Some(last) = proto.last_field {
                    self.fields[last].next_sibling = Some(id);
                } else {
                    proto.first_field = Some(id);
                }
                proto.last_field = Some(id);
            }
        }
        id
    }

    /// Number of field nodes currently allocated; used as a speculative
    /// checkpoint mark (spec §9 "Speculative decoding rollback").
    #[must_use]
    pub fn checkpoint(&self) -> (usize, usize) {
        (self.fields.len(), self.protos.len())
    }

    /// Undo every allocation made since `checkpoint` (spec §4.2.3 step 7
    /// "rollback"). Proto truncation is handled separately via
    /// [`Self::discard_last_proto`] since a rollback never spans more
    /// than the current protocol.
    pub fn rollback_fields(&mut self, checkpoint: usize) {
        self.fields.truncate(checkpoint);
    }

    pub fn finalize_proto_size(&mut self, proto: ProtoNodeId, size: usize) {
        self.protos[proto].size = size;
    }

    pub fn children(&self, parent: FieldNodeId) -> impl Iterator<Item = FieldNodeId> + '_ {
        FieldSiblingIter { tree: self, current: self.fields[parent].first_child }
    }

    pub fn proto_fields(&self, proto: ProtoNodeId) -> impl Iterator<Item = FieldNodeId> + '_ {
        FieldSiblingIter { tree: self, current: self.protos[proto].first_field }
    }

    pub fn protos_in_order(&self) -> impl Iterator<Item = ProtoNodeId> + '_ {
        ProtoIter { tree: self, current: self.proto_head }
    }
}

struct FieldSiblingIter<'a> {
    tree: &'a DetailTree,
    current: Option<FieldNodeId>,
}

impl<'a> Iterator for FieldSiblingIter<'a> {
    type Item = FieldNodeId;
    fn next(&mut self) -> Option<Self::Item> {
        let id = self.current?;
        self.current = self.tree.fields[id].next_sibling;
        Some(id)
    }
}

struct ProtoIter<'a> {
    tree: &'a DetailTree,
    current: Option<ProtoNodeId>,
}

impl<'a> Iterator for ProtoIter<'a> {
    type Item = ProtoNodeId;
    fn next(&mut self) -> Option<Self::Item> {
        let id = self.current?;
        self.current = self.tree.protos[id].next;
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollback_discards_iteration_nodes() {
        let mut tree = DetailTree::new();
        let proto = tree.alloc_proto(0, 0);
        tree.alloc_field(None, proto, "a", "A", 0, 1, true, None);
        let (fields_ckpt, _) = tree.checkpoint();
        tree.alloc_field(None, proto, "b", "B", 1, 1, true, None);
        assert_eq!(tree.fields.len(), 2);
        tree.rollback_fields(fields_ckpt);
        assert_eq!(tree.fields.len(), 1);
    }

    #[test]
    fn siblings_chain_in_allocation_order() {
        let mut tree = DetailTree::new();
        let proto = tree.alloc_proto(0, 0);
        let a = tree.alloc_field(None, proto, "a", "A", 0, 1, true, None);
        let _b = tree.alloc_field(None, proto, "b", "B", 1, 1, true, None);
        let names: Vec<_> = tree.proto_fields(proto).map(|id| tree.fields[id].name.clone()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(tree.fields[a].parent.is_none());
    }
}
