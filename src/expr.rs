//! Typed expression trees and their evaluator (spec §4.3).
//!
//! Every node declares a return type of `Number` or `Buffer`; the two
//! entry points [`Evaluator::eval_number`] and [`Evaluator::eval_buffer`]
//! mirror that split. A `protofield`/`protofield-this` operand that
//! fails to resolve yields [`Evaluated::Warning`] rather than an error —
//! conditional contexts (`if`, `switch` default, `set` exit-when) can
//! trap it; the field decoder escalates an unconditional use to failure
//! itself (spec §7 "missing-field-reference").

use crate::arena::Id;
use crate::db::{ProtocolDb, RegexId};
use crate::error::ExprError;
use crate::lookup::{SlotValue, LookupTableStore};
use crate::packet::PacketContext;
use crate::tree::{DetailTree, FieldNodeId};
use crate::variables::VariableStore;

pub type ExprId = Id<ExprNode>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnType {
    Number,
    Buffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitwiseOp {
    And,
    Or,
    Xor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    BitNot,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Function-call operands (spec §4.3 "Operands: function calls").
#[derive(Debug, Clone)]
pub enum Call {
    Buf2Int { value: ExprId, mask: Option<u64> },
    Ascii2Int(ExprId),
    Int2Buf { value: ExprId, size: u8 },
    ChangeByteOrder { value: ExprId, size: u8 },
    IsPresent { path: Vec<String> },
    HasString { value: ExprId, regex: RegexId },
    ExtractString { value: ExprId, regex: RegexId, match_index: usize },
    IsAsn1Type { value: ExprId, class: u8, tag: u8 },
    CheckLookupTable { table: String, keys: Vec<ExprId> },
    UpdateLookupTable { table: String, keys: Vec<ExprId> },
}

/// One node of an expression tree (spec §4.3).
#[derive(Debug, Clone)]
pub enum ExprNode {
    NumberLiteral(u32),
    StringLiteral(Vec<u8>),
    VariableRef { name: String, is_buffer: bool, mask: Option<u64>, slice: Option<(ExprId, ExprId)> },
    LookupFieldRef { table: String, field: usize, is_buffer: bool, slice: Option<(ExprId, ExprId)> },
    /// `protoname.fieldname[.sub...]` (spec §4.3 "Protofield resolution").
    ProtoFieldRef { path: Vec<String> },
    /// Resolves against the field currently being decoded.
    ProtoFieldThis,
    Call(Call),
    Arith { op: ArithOp, lhs: ExprId, rhs: ExprId },
    Bitwise { op: BitwiseOp, lhs: ExprId, rhs: ExprId },
    Logical { op: LogicalOp, lhs: ExprId, rhs: ExprId },
    Unary { op: UnaryOp, operand: ExprId },
    Compare { op: CmpOp, lhs: ExprId, rhs: ExprId },
}

impl ExprNode {
    #[must_use]
    pub fn return_type(&self) -> ReturnType {
        use ExprNode::*;
        match self {
            NumberLiteral(_) => ReturnType::Number,
            StringLiteral(_) => ReturnType::Buffer,
            VariableRef { is_buffer, .. } | LookupFieldRef { is_buffer, .. } => {
                if *is_buffer { ReturnType::Buffer } else { ReturnType::Number }
            }
            ProtoFieldRef { .. } | ProtoFieldThis => ReturnType::Buffer,
            Call(call) => match call {
                Call::Int2Buf { .. } | Call::ChangeByteOrder { .. } | Call::ExtractString { .. } => {
                    ReturnType::Buffer
                }
                _ => ReturnType::Number,
            },
            Arith { .. } | Bitwise { .. } | Logical { .. } | Unary { .. } | Compare { .. } => ReturnType::Number,
        }
    }
}

/// Either a resolved value, or a recoverable warning (truncation /
/// missing protofield reference) that callers may trap.
#[derive(Debug, Clone)]
pub enum Evaluated<T> {
    Value(T),
    Warning,
}

impl<T> Evaluated<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Evaluated<U> {
        match self {
            Evaluated::Value(v) => Evaluated::Value(f(v)),
            Evaluated::Warning => Evaluated::Warning,
        }
    }

    #[must_use]
    pub fn is_warning(&self) -> bool {
        matches!(self, Evaluated::Warning)
    }
}

#[derive(Debug, Clone)]
pub enum ExprValue {
    Number(u32),
    Buffer(Vec<u8>),
}

/// Bit-extraction helper shared with `buf2int` (spec §4.3, grounded on
/// netbee's `NETPDL_EXPR_EXTRACT_BITS`: shift right until the mask's
/// lowest set bit is at position 0, then AND with the shifted mask).
#[must_use]
pub fn extract_bits(value: u32, mask: u64) -> u32 {
    if mask == 0 {
        return 0;
    }
    let mut shifted_mask = mask;
    let mut v = u64::from(value);
    while shifted_mask & 1 == 0 {
        shifted_mask >>= 1;
        v >>= 1;
    }
    (v & shifted_mask) as u32
}

fn buf_to_u32_be(bytes: &[u8]) -> u32 {
    let take = bytes.len().min(4);
    let mut acc: u32 = 0;
    for &b in &bytes[..take] {
        acc = (acc << 8) | u32::from(b);
    }
    acc
}

/// Borrows every collaborator the evaluator needs to resolve operands
/// (spec §4.3: "access to runtime variables, lookup tables, prior parse
/// results, and the raw packet").
pub struct Evaluator<'a> {
    pub db: &'a ProtocolDb,
    pub vars: &'a mut VariableStore,
    pub lookups: &'a mut LookupTableStore,
    pub tree: &'a DetailTree,
    pub packet: PacketContext<'a>,
    /// The field currently being decoded, for `protofield-this`.
    pub current_field: Option<FieldNodeId>,
    /// Clock used for lookup-table expiry; derived from the packet
    /// timestamp so tests are deterministic without a wall clock.
    pub now: u64,
}

impl<'a> Evaluator<'a> {
    fn resolve_slice(
        &mut self,
        bytes: &[u8],
        slice: Option<(ExprId, ExprId)>,
    ) -> Result<Evaluated<Vec<u8>>, ExprError> {
        let Some((start_id, size_id)) = slice else {
            return Ok(Evaluated::Value(bytes.to_vec()));
        };
        let start = match self.eval_number(start_id)? {
            Evaluated::Value(v) => v as usize,
            Evaluated::Warning => return Ok(Evaluated::Warning),
        };
        let size = match self.eval_number(size_id)? {
            Evaluated::Value(v) => v as usize,
            Evaluated::Warning => return Ok(Evaluated::Warning),
        };
        match bytes.get(start..start + size) {
            Some(slice) => Ok(Evaluated::Value(slice.to_vec())),
            None => Ok(Evaluated::Warning),
        }
    }

    fn resolve_protofield(&self, path: &[String]) -> Option<FieldNodeId> {
        resolve_protofield_path(self.tree, self.db, path)
    }

    pub fn eval_value(&mut self, id: ExprId) -> Result<Evaluated<ExprValue>, ExprError> {
        match self.db.exprs[id].return_type() {
            ReturnType::Number => Ok(self.eval_number(id)?.map(ExprValue::Number)),
            ReturnType::Buffer => Ok(self.eval_buffer(id)?.map(ExprValue::Buffer)),
        }
    }

    pub fn eval_number(&mut self, id: ExprId) -> Result<Evaluated<u32>, ExprError> {
        let node = self.db.exprs[id].clone();
        match node {
            ExprNode::NumberLiteral(v) => Ok(Evaluated::Value(v)),
            ExprNode::VariableRef { name, is_buffer: false, mask, .. } => {
                let var_id = self.vars.id_of(&name).ok_or_else(|| {
                    ExprError::Variable(crate::error::VariableError::NotFound(name.clone()))
                })?;
                let raw = self.vars.get_number(var_id)?;
                Ok(Evaluated::Value(match mask {
                    Some(m) => extract_bits(raw, m),
                    None => raw,
                }))
            }
            ExprNode::LookupFieldRef { table, field, is_buffer: false, .. } => {
                match self.lookups.get(&table)?.select_field(field) {
                    Ok(&SlotValue::Number(n)) => Ok(Evaluated::Value(n as u32)),
                    Ok(SlotValue::Buffer(_)) => {
                        Err(ExprError::TypeMismatch { expected: "number", found: "buffer" })
                    }
                    Err(_) => Ok(Evaluated::Warning),
                }
            }
            ExprNode::Call(call) => self.eval_call_number(call),
            ExprNode::Arith { op, lhs, rhs } => {
                let (a, b) = match (self.eval_number(lhs)?, self.eval_number(rhs)?) {
                    (Evaluated::Value(a), Evaluated::Value(b)) => (a, b),
                    _ => return Ok(Evaluated::Warning),
                };
                Ok(Evaluated::Value(match op {
                    ArithOp::Add => a.wrapping_add(b),
                    ArithOp::Sub => a.wrapping_sub(b),
                    ArithOp::Mul => a.wrapping_mul(b),
                    ArithOp::Div => a.checked_div(b).unwrap_or(0),
                    ArithOp::Mod => a.checked_rem(b).unwrap_or(0),
                }))
            }
            ExprNode::Bitwise { op, lhs, rhs } => {
                let (a, b) = match (self.eval_number(lhs)?, self.eval_number(rhs)?) {
                    (Evaluated::Value(a), Evaluated::Value(b)) => (a, b),
                    _ => return Ok(Evaluated::Warning),
                };
                Ok(Evaluated::Value(match op {
                    BitwiseOp::And => a & b,
                    BitwiseOp::Or => a | b,
                    BitwiseOp::Xor => a ^ b,
                }))
            }
            ExprNode::Logical { op, lhs, rhs } => self.eval_logical(op, lhs, rhs),
            ExprNode::Unary { op, operand } => {
                let v = match self.eval_number(operand)? {
                    Evaluated::Value(v) => v,
                    Evaluated::Warning => return Ok(Evaluated::Warning),
                };
                Ok(Evaluated::Value(match op {
                    UnaryOp::Not => u32::from(v == 0),
                    UnaryOp::BitNot => !v,
                    UnaryOp::Neg => (v as i32).wrapping_neg() as u32,
                }))
            }
            ExprNode::Compare { op, lhs, rhs } => self.eval_compare(op, lhs, rhs),
            ExprNode::ProtoFieldRef { .. } | ExprNode::ProtoFieldThis => {
                Err(ExprError::TypeMismatch { expected: "number", found: "buffer" })
            }
            ExprNode::StringLiteral(_) => {
                Err(ExprError::TypeMismatch { expected: "number", found: "buffer" })
            }
            ExprNode::VariableRef { is_buffer: true, .. }
            | ExprNode::LookupFieldRef { is_buffer: true, .. } => {
                Err(ExprError::TypeMismatch { expected: "number", found: "buffer" })
            }
        }
    }

    pub fn eval_buffer(&mut self, id: ExprId) -> Result<Evaluated<Vec<u8>>, ExprError> {
        let node = self.db.exprs[id].clone();
        match node {
            ExprNode::StringLiteral(bytes) => Ok(Evaluated::Value(bytes)),
            ExprNode::VariableRef { name, is_buffer: true, slice, .. } => {
                let var_id = self.vars.id_of(&name).ok_or_else(|| {
                    ExprError::Variable(crate::error::VariableError::NotFound(name.clone()))
                })?;
                if let Ok(bytes) = self.vars.get_buffer(var_id) {
                    let bytes = bytes.to_vec();
                    return self.resolve_slice(&bytes, slice);
                }
                // ref-buffer: resolve against the packet
                let r = self.vars.get_ref_buffer(var_id)?;
                match r {
                    crate::variables::RefBuffer::Unset => Ok(Evaluated::Warning),
                    crate::variables::RefBuffer::Packet { offset, len } => {
                        match self.packet.raw.get(offset..offset + len) {
                            Some(bytes) => self.resolve_slice(&bytes.to_vec(), slice),
                            None => {
                                log::warn!(target: "netpdl_decoder::expr", "packetbuffer read past caplen");
                                Ok(Evaluated::Warning)
                            }
                        }
                    }
                }
            }
            ExprNode::LookupFieldRef { table, field, is_buffer: true, slice } => {
                match self.lookups.get(&table)?.select_field(field) {
                    Ok(SlotValue::Buffer(b)) => {
                        let b = b.clone();
                        self.resolve_slice(&b, slice)
                    }
                    Ok(&SlotValue::Number(_)) => {
                        Err(ExprError::TypeMismatch { expected: "buffer", found: "number" })
                    }
                    Err(_) => Ok(Evaluated::Warning),
                }
            }
            ExprNode::ProtoFieldRef { path } => self.eval_protofield_bytes(&path),
            ExprNode::ProtoFieldThis => match self.current_field {
                Some(id) => {
                    let f = &self.tree.fields[id];
                    match self.packet.raw.get(f.position..f.end()) {
                        Some(bytes) => Ok(Evaluated::Value(bytes.to_vec())),
                        None => Ok(Evaluated::Warning),
                    }
                }
                None => Ok(Evaluated::Warning),
            },
            ExprNode::Call(call) => self.eval_call_buffer(call),
            _ => Err(ExprError::TypeMismatch { expected: "buffer", found: "number" }),
        }
    }

    fn eval_protofield_bytes(&mut self, path: &[String]) -> Result<Evaluated<Vec<u8>>, ExprError> {
        match self.resolve_protofield(path) {
            Some(id) => {
                let f = &self.tree.fields[id];
                match self.packet.raw.get(f.position..f.end()) {
                    Some(bytes) => Ok(Evaluated::Value(bytes.to_vec())),
                    None => Ok(Evaluated::Warning),
                }
            }
            None => Ok(Evaluated::Warning),
        }
    }

    fn eval_logical(&mut self, op: LogicalOp, lhs: ExprId, rhs: ExprId) -> Result<Evaluated<u32>, ExprError> {
        let l = match self.eval_number(lhs)? {
            Evaluated::Value(v) => v,
            Evaluated::Warning => return Ok(Evaluated::Warning),
        };
        match (op, l) {
            (LogicalOp::And, 0) => Ok(Evaluated::Value(0)),
            (LogicalOp::Or, v) if v != 0 => Ok(Evaluated::Value(1)),
            _ => match self.eval_number(rhs)? {
                Evaluated::Value(r) => Ok(Evaluated::Value(u32::from(r != 0))),
                Evaluated::Warning => Ok(Evaluated::Warning),
            },
        }
    }

    fn eval_compare(&mut self, op: CmpOp, lhs: ExprId, rhs: ExprId) -> Result<Evaluated<u32>, ExprError> {
        let l = match self.eval_value(lhs)? {
            Evaluated::Value(v) => v,
            Evaluated::Warning => return Ok(Evaluated::Warning),
        };
        let r = match self.eval_value(rhs)? {
            Evaluated::Value(v) => v,
            Evaluated::Warning => return Ok(Evaluated::Warning),
        };
        let ordering = match (&l, &r) {
            (ExprValue::Number(a), ExprValue::Number(b)) => a.cmp(b),
            (ExprValue::Buffer(a), ExprValue::Buffer(b)) => {
                let n = a.len().min(b.len());
                a[..n].cmp(&b[..n])
            }
            _ => return Err(ExprError::TypeMismatch { expected: "matching operands", found: "mixed" }),
        };
        use std::cmp::Ordering::*;
        let result = match (op, ordering) {
            (CmpOp::Eq, Equal) | (CmpOp::Le, Equal) | (CmpOp::Ge, Equal) => true,
            (CmpOp::Ne, Equal) | (CmpOp::Lt, Equal) | (CmpOp::Gt, Equal) => false,
            (CmpOp::Eq, _) | (CmpOp::Ne, Equal) => false,
            (CmpOp::Ne, _) => true,
            (CmpOp::Lt, Less) | (CmpOp::Le, Less) => true,
            (CmpOp::Gt, Greater) | (CmpOp::Ge, Greater) => true,
            _ => false,
        };
        Ok(Evaluated::Value(u32::from(result)))
    }

    fn eval_call_number(&mut self, call: Call) -> Result<Evaluated<u32>, ExprError> {
        match call {
            Call::Buf2Int { value, mask } => match self.eval_buffer(value)? {
                Evaluated::Value(bytes) => {
                    let v = buf_to_u32_be(&bytes);
                    Ok(Evaluated::Value(match mask {
                        Some(m) => extract_bits(v, m),
                        None => v,
                    }))
                }
                Evaluated::Warning => Ok(Evaluated::Warning),
            },
            Call::Ascii2Int(value) => match self.eval_buffer(value)? {
                Evaluated::Value(bytes) => {
                    let s = String::from_utf8_lossy(&bytes);
                    Ok(Evaluated::Value(s.trim().parse::<u32>().unwrap_or(0)))
                }
                Evaluated::Warning => Ok(Evaluated::Warning),
            },
            Call::IsPresent { path } => Ok(Evaluated::Value(u32::from(self.resolve_protofield(&path).is_some()))),
            Call::HasString { value, regex } => match self.eval_buffer(value)? {
                Evaluated::Value(bytes) => {
                    let text = String::from_utf8_lossy(&bytes);
                    Ok(Evaluated::Value(u32::from(self.db.regex(regex).is_match(&text))))
                }
                Evaluated::Warning => Ok(Evaluated::Warning),
            },
            Call::IsAsn1Type { value, class, tag } => match self.eval_buffer(value)? {
                Evaluated::Value(bytes) => {
                    let Some(&first) = bytes.first() else { return Ok(Evaluated::Warning) };
                    let actual_class = first >> 6;
                    let actual_tag = first & 0x1F;
                    Ok(Evaluated::Value(u32::from(actual_class == class && actual_tag == tag)))
                }
                Evaluated::Warning => Ok(Evaluated::Warning),
            },
            Call::CheckLookupTable { table, keys } => {
                let key_values = match self.eval_keys(&keys)? {
                    Some(v) => v,
                    None => return Ok(Evaluated::Warning),
                };
                let now = self.now;
                Ok(Evaluated::Value(u32::from(self.lookups.get_mut(&table)?.check(&key_values, now).is_ok())))
            }
            Call::UpdateLookupTable { table, keys } => {
                let key_values = match self.eval_keys(&keys)? {
                    Some(v) => v,
                    None => return Ok(Evaluated::Warning),
                };
                let now = self.now;
                Ok(Evaluated::Value(u32::from(
                    self.lookups.get_mut(&table)?.check_and_update(&key_values, now).is_ok(),
                )))
            }
            Call::Int2Buf { .. } | Call::ChangeByteOrder { .. } | Call::ExtractString { .. } => {
                Err(ExprError::TypeMismatch { expected: "number", found: "buffer" })
            }
        }
    }

    fn eval_call_buffer(&mut self, call: Call) -> Result<Evaluated<Vec<u8>>, ExprError> {
        match call {
            Call::Int2Buf { value, size } => match self.eval_number(value)? {
                Evaluated::Value(v) => {
                    let bytes = v.to_be_bytes();
                    let size = size as usize;
                    let start = bytes.len().saturating_sub(size);
                    Ok(Evaluated::Value(bytes[start..].to_vec()))
                }
                Evaluated::Warning => Ok(Evaluated::Warning),
            },
            Call::ChangeByteOrder { value, size } => match self.eval_buffer(value)? {
                Evaluated::Value(mut bytes) => {
                    bytes.truncate(size as usize);
                    bytes.reverse();
                    Ok(Evaluated::Value(bytes))
                }
                Evaluated::Warning => Ok(Evaluated::Warning),
            },
            Call::ExtractString { value, regex, match_index } => match self.eval_buffer(value)? {
                Evaluated::Value(bytes) => {
                    let text = String::from_utf8_lossy(&bytes);
                    match self.db.regex(regex).captures(&text) {
                        Some(caps) => match caps.get(match_index) {
                            Some(m) => Ok(Evaluated::Value(m.as_str().as_bytes().to_vec())),
                            None => Ok(Evaluated::Warning),
                        },
                        None => Ok(Evaluated::Warning),
                    }
                }
                Evaluated::Warning => Ok(Evaluated::Warning),
            },
            _ => Err(ExprError::TypeMismatch { expected: "buffer", found: "number" }),
        }
    }

    fn eval_keys(&mut self, keys: &[ExprId]) -> Result<Option<Vec<SlotValue>>, ExprError> {
        let mut out = Vec::with_capacity(keys.len());
        for &key in keys {
            match self.eval_value(key)? {
                Evaluated::Value(ExprValue::Number(n)) => out.push(SlotValue::Number(u64::from(n))),
                Evaluated::Value(ExprValue::Buffer(b)) => out.push(SlotValue::Buffer(b)),
                Evaluated::Warning => return Ok(None),
            }
        }
        Ok(Some(out))
    }
}

pub(crate) fn resolve_protofield_path(tree: &DetailTree, db: &ProtocolDb, path: &[String]) -> Option<FieldNodeId> {
    if path.len() < 2 {
        return None;
    }
    let proto_name = path[0].as_str();
    let protos: Vec<_> = tree.protos_in_order().collect();
    for &proto_id in protos.iter().rev() {
        let idx = tree.protos[proto_id].proto_index;
        if db.protocols.get(idx).map(|p| p.name.as_str()) != Some(proto_name) {
            continue;
        }
        if let Some(found) = find_latest_named(tree, tree.proto_fields(proto_id), &path[1]) {
            return descend_named(tree, found, &path[2..]);
        }
    }
    None
}

fn find_latest_named(tree: &DetailTree, iter: impl Iterator<Item = FieldNodeId>, name: &str) -> Option<FieldNodeId> {
    iter.filter(|&id| tree.fields[id].name == name).last()
}

fn descend_named(tree: &DetailTree, mut current: FieldNodeId, rest: &[String]) -> Option<FieldNodeId> {
    for name in rest {
        current = find_latest_named(tree, tree.children(current), name)?;
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_bits_matches_netbee_semantics() {
        assert_eq!(extract_bits(0x45, 0xF0), 0x4);
        assert_eq!(extract_bits(0x45, 0x0F), 0x5);
        assert_eq!(extract_bits(0xABCD, 0xFF00), 0xAB);
    }

    #[test]
    fn buf2int_reads_up_to_four_bytes_big_endian() {
        assert_eq!(buf_to_u32_be(&[0x01, 0x02]), 0x0102);
        assert_eq!(buf_to_u32_be(&[0xff, 0x00, 0x00, 0x01, 0x02]), 0xff000001);
    }
}
