//! End-to-end seed scenarios driving `dispatch::decode_packet` against
//! hand-built `ProtocolDb` fixtures, one per worked example in the
//! decoding-model write-up.

use netpdl_decoder::db::element::ElementNode;
use netpdl_decoder::db::{
    ByteOrder, CaseMatch, ElementId, ElementKind, Encapsulation, ExecEntry, FieldKind, NumberBase, Protocol,
    ProtocolDb, TokenMatcher, VisualizationTemplate,
};
use netpdl_decoder::expr::{Call, CmpOp, ExprId, ExprNode};
use netpdl_decoder::variables::{StandardVar, Validity, VariableStore, VariableValue};
use netpdl_decoder::{decode_packet, DecoderConfig, DefaultNativeFunctions, LookupTableStore, PacketContext, Status};

fn hex_bytes(s: &str) -> Vec<u8> {
    let clean: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    (0..clean.len()).step_by(2).map(|i| u8::from_str_radix(&clean[i..i + 2], 16).unwrap()).collect()
}

fn node(kind: ElementKind) -> ElementNode {
    ElementNode { kind, first_child: None, next_sibling: None }
}

fn field(db: &mut ProtocolDb, name: &str, kind: FieldKind) -> ElementId {
    db.push_element(node(ElementKind::Field {
        name: name.to_string(),
        long_name: name.to_string(),
        kind,
        byte_order: ByteOrder::Big,
        visualize: VisualizationTemplate::default(),
    }))
}

fn chain(db: &mut ProtocolDb, ids: &[ElementId]) {
    for pair in ids.windows(2) {
        db.elements.get_mut(pair[0]).unwrap().next_sibling = Some(pair[1]);
    }
}

fn set_first_child(db: &mut ProtocolDb, parent: ElementId, child: ElementId) {
    db.elements.get_mut(parent).unwrap().first_child = Some(child);
}

fn protocol(name: &str, first_field: ElementId, encapsulation: Option<Encapsulation>) -> Protocol {
    Protocol {
        name: name.to_string(),
        long_name: name.to_string(),
        first_field,
        encapsulation,
        execute_before: vec![],
        execute_verify: vec![],
        execute_after: vec![],
        summary_template: None,
        detail_template: None,
        byte_order: ByteOrder::Big,
    }
}

fn minimal_config() -> DecoderConfig {
    DecoderConfig {
        generate_summary: false,
        generate_detail_simple: false,
        generate_detail_full: false,
        keep_all_packets: false,
        generate_raw_dump: false,
        emit_discard_nodes: false,
    }
}

fn packet(raw: &[u8]) -> PacketContext<'_> {
    PacketContext::new(1, 1, 0, 0, raw.len() as u32, raw)
}

fn bit_field(name: &str, width: u8, is_last_in_group: bool) -> ElementNode {
    node(ElementKind::Field {
        name: name.to_string(),
        long_name: name.to_string(),
        kind: FieldKind::Bit { width, mask: None, is_last_in_group },
        byte_order: ByteOrder::Big,
        visualize: VisualizationTemplate { base: Some(NumberBase::Dec), ..VisualizationTemplate::default() },
    })
}

// --- scenario 1: IPv4/TCP without options --------------------------------

#[test]
fn ipv4_tcp_without_options() {
    let mut db = ProtocolDb::new(0, 2);

    let ip_version = db.push_element(bit_field("version", 4, false));
    let ip_ihl = db.push_element(bit_field("ihl", 4, true));
    let ip_tos = field(&mut db, "tos", FieldKind::Fixed { size: 1 });
    let ip_totallen = field(&mut db, "totallen", FieldKind::Fixed { size: 2 });
    let ip_id = field(&mut db, "id", FieldKind::Fixed { size: 2 });
    let ip_flagsfrag = field(&mut db, "flagsfrag", FieldKind::Fixed { size: 2 });
    let ip_ttl = field(&mut db, "ttl", FieldKind::Fixed { size: 1 });
    let ip_proto = field(&mut db, "proto", FieldKind::Fixed { size: 1 });
    let ip_checksum = field(&mut db, "checksum", FieldKind::Fixed { size: 2 });
    let ip_src = field(&mut db, "src", FieldKind::Fixed { size: 4 });
    let ip_dst = field(&mut db, "dst", FieldKind::Fixed { size: 4 });
    chain(
        &mut db,
        &[ip_version, ip_ihl, ip_tos, ip_totallen, ip_id, ip_flagsfrag, ip_ttl, ip_proto, ip_checksum, ip_src, ip_dst],
    );

    let proto_ref = db.push_expr(ExprNode::ProtoFieldRef { path: vec!["ip".into(), "proto".into()] });
    let proto_num = db.push_expr(ExprNode::Call(Call::Buf2Int { value: proto_ref, mask: None }));
    let tcp_idx_lit = db.push_expr(ExprNode::NumberLiteral(1));
    let nextproto_tcp = db.push_element(node(ElementKind::NextProto { proto_expr: tcp_idx_lit }));
    let case_tcp = db.push_element(node(ElementKind::Case { matches: CaseMatch::Number(6) }));
    set_first_child(&mut db, case_tcp, nextproto_tcp);
    let switch = db.push_element(node(ElementKind::Switch { key_expr: proto_num }));
    set_first_child(&mut db, switch, case_tcp);

    // `tcp.execute_before` captures `$prevproto` at the moment tcp decode
    // starts, into a plain variable we can read back after the whole
    // packet has been decoded (the loop's own `$prevproto` value is
    // transient, overwritten again before `decode_packet` returns).
    let mut vars = VariableStore::default();
    vars.declare("capturedprevproto", Validity::Static, VariableValue::Number(0), VariableValue::Number(0), 0).unwrap();
    let prevproto_ref = db.push_expr(ExprNode::VariableRef { name: "prevproto".into(), is_buffer: false, mask: None, slice: None });
    let capture_stmt = db.push_element(node(ElementKind::AssignVariable {
        var: "capturedprevproto".into(),
        expr: prevproto_ref,
    }));

    db.protocols.push(protocol("ip", ip_version, Some(Encapsulation { first_item: switch })));

    let tcp_srcport = field(&mut db, "srcport", FieldKind::Fixed { size: 2 });
    let tcp_dstport = field(&mut db, "dstport", FieldKind::Fixed { size: 2 });
    let tcp_seq = field(&mut db, "seq", FieldKind::Fixed { size: 4 });
    let tcp_ack = field(&mut db, "ack", FieldKind::Fixed { size: 4 });
    let tcp_dataofs = field(&mut db, "dataofs_reserved", FieldKind::Fixed { size: 1 });
    let tcp_flags = field(&mut db, "flags", FieldKind::Fixed { size: 1 });
    let tcp_window = field(&mut db, "window", FieldKind::Fixed { size: 2 });
    let tcp_checksum = field(&mut db, "checksum", FieldKind::Fixed { size: 2 });
    let tcp_urgptr = field(&mut db, "urgptr", FieldKind::Fixed { size: 2 });
    chain(
        &mut db,
        &[tcp_srcport, tcp_dstport, tcp_seq, tcp_ack, tcp_dataofs, tcp_flags, tcp_window, tcp_checksum, tcp_urgptr],
    );
    let mut tcp_proto = protocol("tcp", tcp_srcport, None);
    tcp_proto.execute_before = vec![ExecEntry { when: None, statement: capture_stmt }];
    db.protocols.push(tcp_proto);

    let data_payload = field(&mut db, "payload", FieldKind::EatAll);
    db.protocols.push(protocol("data", data_payload, None));

    let raw = hex_bytes(
        "4500 002e 0001 0000 4006 0000 7f00 0001 7f00 0001 \
         0014 0050 0000 0000 0000 0000 5002 2000 0000 0000 6869",
    );
    assert_eq!(raw.len(), 42);

    let mut lookups = LookupTableStore::default();
    let config = minimal_config();
    let native = DefaultNativeFunctions;
    let result = decode_packet(&db, &mut vars, &mut lookups, &config, &native, None, None, None, packet(&raw)).unwrap();

    assert_eq!(result.status, Status::Success);

    let protos: Vec<_> = result.tree.protos_in_order().map(|id| result.tree.protos[id].proto_index).collect();
    assert_eq!(protos, vec![0, 1, 2]);

    let ip_node = result.tree.first_proto().unwrap();
    assert_eq!(result.tree.protos[ip_node].size, 20);
    let tcp_node = result.tree.protos[ip_node].next.unwrap();
    assert_eq!(result.tree.protos[tcp_node].size, 20);
    let data_node = result.tree.protos[tcp_node].next.unwrap();
    assert_eq!(result.tree.protos[data_node].size, 2);

    let src_field = result.tree.proto_fields(ip_node).find(|&id| result.tree.fields[id].name == "src").unwrap();
    let f = &result.tree.fields[src_field];
    assert_eq!(&raw[f.position..f.end()], &[127, 0, 0, 1]);

    let prev_id = vars.id_of("capturedprevproto").unwrap();
    assert_eq!(vars.get_number(prev_id).unwrap(), 0, "tcp's execute-before should see ip's index as $prevproto");
}

// --- scenario 2: bit-field group (version/ihl share one byte) -----------

#[test]
fn bit_field_group_advances_offset_once() {
    let mut db = ProtocolDb::new(0, 0);
    let version = db.push_element(bit_field("version", 4, false));
    let ihl = db.push_element(bit_field("ihl", 4, true));
    let trailer = field(&mut db, "trailer", FieldKind::EatAll);
    chain(&mut db, &[version, ihl, trailer]);
    db.protocols.push(protocol("bitdemo", version, None));

    let raw = [0x45u8, 0xAA, 0xBB];
    let mut vars = VariableStore::default();
    let mut lookups = LookupTableStore::default();
    let mut config = minimal_config();
    config.generate_detail_simple = true;
    let native = DefaultNativeFunctions;
    let result = decode_packet(&db, &mut vars, &mut lookups, &config, &native, None, None, None, packet(&raw)).unwrap();

    assert_eq!(result.status, Status::Success);
    let proto = result.tree.first_proto().unwrap();
    let fields: Vec<_> = result.tree.proto_fields(proto).collect();
    assert_eq!(fields.len(), 3);
    let version_node = &result.tree.fields[fields[0]];
    let ihl_node = &result.tree.fields[fields[1]];
    assert_eq!(version_node.position, 0);
    assert_eq!(version_node.size, 1);
    assert_eq!(version_node.show_value.as_deref(), Some("4"));
    assert_eq!(ihl_node.position, 0);
    assert_eq!(ihl_node.show_value.as_deref(), Some("5"));
    let trailer_node = &result.tree.fields[fields[2]];
    assert_eq!(trailer_node.position, 1);
    assert_eq!(trailer_node.size, 2);
}

// --- scenario 3: switch/case next-protocol selection ----------------------

#[test]
fn switch_case_selects_next_protocol_by_ethertype() {
    let mut db = ProtocolDb::new(0, 1);
    let ethertype = field(&mut db, "ethertype", FieldKind::Fixed { size: 2 });
    let ethertype_ref = db.push_expr(ExprNode::ProtoFieldRef { path: vec!["eth".into(), "ethertype".into()] });
    let ethertype_num = db.push_expr(ExprNode::Call(Call::Buf2Int { value: ethertype_ref, mask: None }));
    let ip_idx_lit = db.push_expr(ExprNode::NumberLiteral(1));
    let nextproto_ip = db.push_element(node(ElementKind::NextProto { proto_expr: ip_idx_lit }));
    let case_ip = db.push_element(node(ElementKind::Case { matches: CaseMatch::Number(0x0800) }));
    set_first_child(&mut db, case_ip, nextproto_ip);
    let switch = db.push_element(node(ElementKind::Switch { key_expr: ethertype_num }));
    set_first_child(&mut db, switch, case_ip);
    db.protocols.push(protocol("eth", ethertype, Some(Encapsulation { first_item: switch })));

    let stub = field(&mut db, "stub", FieldKind::Fixed { size: 1 });
    db.protocols.push(protocol("ip", stub, None));

    let raw = [0x08u8, 0x00, 0xAA];
    let mut vars = VariableStore::default();
    let mut lookups = LookupTableStore::default();
    let config = minimal_config();
    let native = DefaultNativeFunctions;
    let result = decode_packet(&db, &mut vars, &mut lookups, &config, &native, None, None, None, packet(&raw)).unwrap();

    assert_eq!(result.status, Status::Success);
    let protos: Vec<_> = result.tree.protos_in_order().map(|id| result.tree.protos[id].proto_index).collect();
    assert_eq!(protos, vec![0, 1]);

    let nextproto_id = vars.standard(StandardVar::NextProto);
    assert_eq!(vars.get_number(nextproto_id).unwrap(), 1);
}

// --- scenario 4: tokenended HTTP request line -----------------------------

#[test]
fn tokenended_line_excludes_terminator_from_size() {
    let mut db = ProtocolDb::new(0, 0);
    let line = field(
        &mut db,
        "line",
        FieldKind::TokenEnded {
            end: TokenMatcher::Bytes(b"\r\n".to_vec()),
            end_offset_expr: None,
            trailing_discard: None,
        },
    );
    db.protocols.push(protocol("httpline", line, None));

    let raw = b"GET / HTTP/1.0\r\n";
    assert_eq!(raw.len(), 16);
    let mut vars = VariableStore::default();
    let mut lookups = LookupTableStore::default();
    let config = minimal_config();
    let native = DefaultNativeFunctions;
    let result = decode_packet(&db, &mut vars, &mut lookups, &config, &native, None, None, None, packet(raw)).unwrap();

    assert_eq!(result.status, Status::Success);
    let proto = result.tree.first_proto().unwrap();
    let line_id = result.tree.proto_fields(proto).next().unwrap();
    let f = &result.tree.fields[line_id];
    // The field's own `size` covers only its content, not the `\r\n`
    // terminator (see DESIGN.md: `commit_field` never folds `end_discard`
    // into `FieldNode.size`); the terminator's length still shows up in
    // `$token_end_len`.
    assert_eq!(f.position, 0);
    assert_eq!(f.size, 14);
    assert_eq!(&raw[f.position..f.end()], b"GET / HTTP/1.0");

    let begin_len = vars.get_number(vars.standard(StandardVar::TokenBeginLen)).unwrap();
    let field_len = vars.get_number(vars.standard(StandardVar::TokenFieldLen)).unwrap();
    let end_len = vars.get_number(vars.standard(StandardVar::TokenEndLen)).unwrap();
    assert_eq!(begin_len, 0);
    assert_eq!(field_len, 14);
    assert_eq!(end_len, 2);
}

// --- scenario 5: set of TLVs (IP-options-style NOP/NOP/EOL) ---------------

#[test]
fn set_of_tlvs_iterates_until_eol() {
    let mut db = ProtocolDb::new(0, 0);
    let marker = field(&mut db, "marker", FieldKind::Fixed { size: 1 });

    let tlv_proto = field(&mut db, "tlv", FieldKind::Tlv { type_size: 1, length_size: 0 });

    fn this_num(db: &mut ProtocolDb) -> ExprId {
        let this_buf = db.push_expr(ExprNode::ProtoFieldThis);
        db.push_expr(ExprNode::Call(Call::Buf2Int { value: this_buf, mask: None }))
    }
    let one = db.push_expr(ExprNode::NumberLiteral(1));
    let zero = db.push_expr(ExprNode::NumberLiteral(0));

    let nop_lhs = this_num(&mut db);
    let nop_cond = db.push_expr(ExprNode::Compare { op: CmpOp::Eq, lhs: nop_lhs, rhs: one });
    let eol_lhs = this_num(&mut db);
    let eol_cond = db.push_expr(ExprNode::Compare { op: CmpOp::Eq, lhs: eol_lhs, rhs: zero });

    let match_nop = db.push_element(node(ElementKind::Match { condition: nop_cond, rename: Some("ipopt-nop".into()) }));
    let match_eol = db.push_element(node(ElementKind::Match { condition: eol_cond, rename: Some("ipopt-eol".into()) }));
    chain(&mut db, &[match_nop, match_eol]);

    let exit_lhs = this_num(&mut db);
    let exit_when = db.push_expr(ExprNode::Compare { op: CmpOp::Eq, lhs: exit_lhs, rhs: zero });
    let set_id = db.push_element(node(ElementKind::Set { prototype: tlv_proto, exit_when }));
    set_first_child(&mut db, set_id, match_nop);

    chain(&mut db, &[marker, set_id]);
    db.protocols.push(protocol("optsdemo", marker, None));

    let raw = [0xFFu8, 0x01, 0x01, 0x00];
    let mut vars = VariableStore::default();
    let mut lookups = LookupTableStore::default();
    let config = minimal_config();
    let native = DefaultNativeFunctions;
    let result = decode_packet(&db, &mut vars, &mut lookups, &config, &native, None, None, None, packet(&raw)).unwrap();

    assert_eq!(result.status, Status::Success);
    let proto = result.tree.first_proto().unwrap();
    let names: Vec<_> = result.tree.proto_fields(proto).map(|id| result.tree.fields[id].name.clone()).collect();
    assert_eq!(names, vec!["marker", "ipopt-nop", "ipopt-nop", "ipopt-eol"]);
    let positions: Vec<_> = result.tree.proto_fields(proto).map(|id| result.tree.fields[id].position).collect();
    assert_eq!(positions, vec![0, 1, 2, 3]);
}

// --- scenario 6: truncated packet aborts with a warning, no ProtoNode ----

#[test]
fn truncated_self_referential_length_aborts_with_warning() {
    let mut db = ProtocolDb::new(0, 0);
    let totallen_ref = db.push_expr(ExprNode::ProtoFieldRef { path: vec!["ip".into(), "totallen".into()] });
    let length_expr = db.push_expr(ExprNode::Call(Call::Buf2Int { value: totallen_ref, mask: None }));
    // This field names itself as its own length source: at the moment
    // it is measured, no `ip.totallen` field exists yet in the tree, so
    // the reference can never resolve and the decode always warns.
    let bogus = field(&mut db, "totallen", FieldKind::Variable { length_expr });
    db.protocols.push(protocol("ip", bogus, None));

    let raw = vec![0u8; 14];
    let mut vars = VariableStore::default();
    let mut lookups = LookupTableStore::default();
    let config = minimal_config();
    let native = DefaultNativeFunctions;
    let result = decode_packet(&db, &mut vars, &mut lookups, &config, &native, None, None, None, packet(&raw)).unwrap();

    assert_eq!(result.status, Status::Warning);
    assert_eq!(result.tree.protos_in_order().count(), 0, "the aborted protocol leaves no ProtoNode behind");
}
