use crate::error::VariableError;
use num_enum::TryFromPrimitive;
use std::collections::HashMap;

/// Lifetime class of a variable or lookup-table entry (spec GLOSSARY
/// "Validity").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    /// Lives for the whole decoder instance.
    Static,
    /// Reset to its initial value at the start of every packet.
    ThisPacket,
    /// Expires according to a custom keep/hit-time schedule (lookup
    /// tables) or lives until explicitly cleared (variables).
    ThisSession,
}

/// The kind of value a variable slot holds (spec §3 "Variable store").
#[derive(Debug, Clone)]
pub enum VariableValue {
    Number(u32),
    /// Owned backing storage, sized at declaration.
    Buffer(Vec<u8>),
    /// Non-owning `(pointer, length)` view into another buffer (packet
    /// data, typically). Represented as an owned copy of a raw pointer's
    /// worth of bytes is unsound across packets, so instead we store an
    /// index range into the packet buffer that the caller resolves; for
    /// any buffer that isn't the packet itself, a ref-buffer is realized
    /// eagerly as a borrowed slice for the duration of that packet via
    /// [`RefBuffer::Packet`].
    RefBuffer(RefBuffer),
    /// A protocol index (used by `$prevproto`, `$nextproto`, and
    /// `$protoverifyresult`, whose four-valued result is carried as a
    /// plain number per spec §3's standard-variable table).
    Protocol(Option<u32>),
}

/// A non-owning view recorded by `assign-variable` / "set ref-buffer".
/// Only the packet buffer is long-lived enough in this engine's
/// single-packet-at-a-time model to be referenced this way; see spec §5
/// "Packet buffer: immutable borrow for the duration of the packet's
/// decode; variables ... may hold views into it."
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefBuffer {
    Unset,
    Packet { offset: usize, len: usize },
}

#[derive(Debug, Clone)]
pub struct Variable {
    pub name: String,
    pub validity: Validity,
    pub value: VariableValue,
    pub initial: VariableValue,
    pub max_size: usize,
}

/// Well-known variable IDs that must exist in every store (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StandardVar {
    LinkType,
    FrameLen,
    PacketLen,
    TimestampS,
    TimestampUs,
    CurrentOffset,
    CurrentProtoOffset,
    PacketBuffer,
    PrevProto,
    NextProto,
    ShowNetNames,
    ProtoVerifyResult,
    TokenBeginLen,
    TokenFieldLen,
    TokenEndLen,
}

impl StandardVar {
    #[must_use]
    pub fn name(self) -> &'static str {
        use StandardVar::*;
        match self {
            LinkType => "linktype",
            FrameLen => "framelen",
            PacketLen => "packetlen",
            TimestampS => "timestamp_s",
            TimestampUs => "timestamp_us",
            CurrentOffset => "currentoffset",
            CurrentProtoOffset => "currentprotooffset",
            PacketBuffer => "packetbuffer",
            PrevProto => "prevproto",
            NextProto => "nextproto",
            ShowNetNames => "shownetnames",
            ProtoVerifyResult => "protoverifyresult",
            TokenBeginLen => "token_begin_len",
            TokenFieldLen => "token_field_len",
            TokenEndLen => "token_end_len",
        }
    }

    const ALL: [StandardVar; 15] = [
        StandardVar::LinkType,
        StandardVar::FrameLen,
        StandardVar::PacketLen,
        StandardVar::TimestampS,
        StandardVar::TimestampUs,
        StandardVar::CurrentOffset,
        StandardVar::CurrentProtoOffset,
        StandardVar::PacketBuffer,
        StandardVar::PrevProto,
        StandardVar::NextProto,
        StandardVar::ShowNetNames,
        StandardVar::ProtoVerifyResult,
        StandardVar::TokenBeginLen,
        StandardVar::TokenFieldLen,
        StandardVar::TokenEndLen,
    ];
}

/// `$protoverifyresult`'s four-valued domain (spec §4.1 next-protocol
/// selection). Encoded as a plain number in the variable store so the
/// expression evaluator's uniform numeric path can read it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum VerifyResult {
    NotFound = 0,
    Found = 1,
    Candidate = 2,
    Deferred = 3,
}

/// Bounded per-decoder variable store (spec §4.4).
///
/// Default capacity is 40 entries, matching spec §3. Standard variables
/// are declared eagerly at construction so `garbage_collect` can always
/// find them.
#[derive(Debug, Clone)]
pub struct VariableStore {
    capacity: usize,
    by_name: HashMap<String, usize>,
    slots: Vec<Variable>,
    standard: HashMap<StandardVar, usize>,
}

impl Default for VariableStore {
    fn default() -> Self {
        Self::new(40)
    }
}

impl VariableStore {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let mut store = Self {
            capacity,
            by_name: HashMap::new(),
            slots: Vec::with_capacity(capacity),
            standard: HashMap::new(),
        };
        for var in StandardVar::ALL {
            let (validity, value) = match var {
                StandardVar::PacketBuffer => {
                    (Validity::ThisPacket, VariableValue::RefBuffer(RefBuffer::Unset))
                }
                StandardVar::PrevProto | StandardVar::NextProto => {
                    (Validity::ThisPacket, VariableValue::Protocol(None))
                }
                _ => (Validity::ThisPacket, VariableValue::Number(0)),
            };
            let id = store
                .declare(var.name(), validity, value.clone(), value, 0)
                .expect("standard variable set fits in default capacity");
            store.standard.insert(var, id);
        }
        store
    }

    /// Declare a new variable slot (spec §4.4 "declare variable").
    pub fn declare(
        &mut self,
        name: &str,
        validity: Validity,
        initial: VariableValue,
        value: VariableValue,
        max_size: usize,
    ) -> Result<usize, VariableError> {
        if self.slots.len() >= self.capacity {
            return Err(VariableError::StoreFull(self.capacity));
        }
        let id = self.slots.len();
        self.slots.push(Variable {
            name: name.to_string(),
            validity,
            value,
            initial,
            max_size,
        });
        self.by_name.insert(name.to_string(), id);
        Ok(id)
    }

    #[must_use]
    pub fn id_of(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    #[must_use]
    pub fn standard(&self, var: StandardVar) -> usize {
        self.standard[&var]
    }

    #[must_use]
    pub fn get(&self, id: usize) -> &Variable {
        &self.slots[id]
    }

    pub fn get_number(&self, id: usize) -> Result<u32, VariableError> {
        match self.slots[id].value {
            VariableValue::Number(v) => Ok(v),
            // mirrors `set_number`'s transparent write support for
            // `Protocol` slots (`$prevproto`/`$nextproto`): unset reads
            // as 0 so an `if`/`switch`/`match` expression can compare
            // against it before any protocol has been assigned.
            VariableValue::Protocol(v) => Ok(v.unwrap_or(0)),
            _ => Err(VariableError::NotANumber(self.slots[id].name.clone())),
        }
    }

    pub fn set_number(&mut self, id: usize, value: u32) -> Result<(), VariableError> {
        match &mut self.slots[id].value {
            VariableValue::Number(slot) => {
                *slot = value;
                Ok(())
            }
            VariableValue::Protocol(slot) => {
                *slot = Some(value);
                Ok(())
            }
            _ => Err(VariableError::NotANumber(self.slots[id].name.clone())),
        }
    }

    pub fn set_protocol(&mut self, id: usize, proto: Option<u32>) -> Result<(), VariableError> {
        match &mut self.slots[id].value {
            VariableValue::Protocol(slot) => {
                *slot = proto;
                Ok(())
            }
            _ => Err(VariableError::NotANumber(self.slots[id].name.clone())),
        }
    }

    pub fn get_protocol(&self, id: usize) -> Result<Option<u32>, VariableError> {
        match self.slots[id].value {
            VariableValue::Protocol(p) => Ok(p),
            _ => Err(VariableError::NotANumber(self.slots[id].name.clone())),
        }
    }

    pub fn get_buffer(&self, id: usize) -> Result<&[u8], VariableError> {
        match &self.slots[id].value {
            VariableValue::Buffer(b) => Ok(b),
            _ => Err(VariableError::NotABuffer(self.slots[id].name.clone())),
        }
    }

    pub fn set_buffer(&mut self, id: usize, bytes: &[u8]) -> Result<(), VariableError> {
        let slot = &mut self.slots[id];
        match &mut slot.value {
            VariableValue::Buffer(buf) => {
                if bytes.len() > slot.max_size {
                    return Err(VariableError::BufferOverflow {
                        name: slot.name.clone(),
                        len: bytes.len(),
                        cap: slot.max_size,
                    });
                }
                buf.clear();
                buf.extend_from_slice(bytes);
                Ok(())
            }
            _ => Err(VariableError::NotABuffer(slot.name.clone())),
        }
    }

    pub fn set_ref_buffer(&mut self, id: usize, offset: usize, len: usize) -> Result<(), VariableError> {
        match &mut self.slots[id].value {
            VariableValue::RefBuffer(slot) => {
                *slot = RefBuffer::Packet { offset, len };
                Ok(())
            }
            _ => Err(VariableError::NotABuffer(self.slots[id].name.clone())),
        }
    }

    pub fn get_ref_buffer(&self, id: usize) -> Result<RefBuffer, VariableError> {
        match self.slots[id].value {
            VariableValue::RefBuffer(r) => Ok(r),
            _ => Err(VariableError::NotABuffer(self.slots[id].name.clone())),
        }
    }

    /// Reset every `this-packet` variable to its initial value (spec §4.1
    /// pre-work step 1, §4.4 "per-packet GC", and the invariant "for
    /// every `this-packet` variable V, at the start of each packet decode
    /// `V.value == V.initial_value`"). Buffer variables are zeroed unless
    /// an initial value was declared; ref-buffer pointers are cleared.
    pub fn garbage_collect(&mut self) {
        for slot in &mut self.slots {
            if slot.validity == Validity::ThisPacket {
                slot.value = match &slot.initial {
                    VariableValue::RefBuffer(_) => VariableValue::RefBuffer(RefBuffer::Unset),
                    other => other.clone(),
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_variables_exist_with_known_ids() {
        let store = VariableStore::default();
        for var in StandardVar::ALL {
            assert!(store.id_of(var.name()).is_some(), "{:?}", var);
        }
    }

    #[test]
    fn this_packet_gc_resets_to_initial() {
        let mut store = VariableStore::default();
        let id = store.standard(StandardVar::CurrentOffset);
        store.set_number(id, 42).unwrap();
        assert_eq!(store.get_number(id).unwrap(), 42);
        store.garbage_collect();
        assert_eq!(store.get_number(id).unwrap(), 0);
    }

    #[test]
    fn ref_buffer_cleared_on_gc() {
        let mut store = VariableStore::default();
        let id = store.standard(StandardVar::PacketBuffer);
        store.set_ref_buffer(id, 4, 10).unwrap();
        store.garbage_collect();
        assert_eq!(store.get_ref_buffer(id).unwrap(), RefBuffer::Unset);
    }

    #[test]
    fn store_full_is_reported() {
        let mut store = VariableStore::new(15);
        let err = store.declare(
            "extra",
            Validity::Static,
            VariableValue::Number(0),
            VariableValue::Number(0),
            0,
        );
        assert!(matches!(err, Err(VariableError::StoreFull(15))));
    }
}
