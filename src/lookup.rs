use crate::error::LookupError;
use crate::variables::Validity;
use std::collections::HashMap;

/// A typed slot in a table's key or data schema (spec §3 "Lookup table
/// store").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    Number,
    Buffer,
}

/// Declaration of one key slot, with an optional mask applied before
/// comparison (spec §4.4: "Masked keys compare
/// `(incoming & mask) == (entry-key & mask)`").
#[derive(Debug, Clone)]
pub struct KeySlot {
    pub kind: SlotKind,
    pub mask: Option<u64>,
}

/// A fully keyed value, one per [`KeySlot`]/data-slot in a table schema.
#[derive(Debug, Clone, PartialEq)]
pub enum SlotValue {
    Number(u64),
    Buffer(Vec<u8>),
}

fn key_matches(incoming: &SlotValue, stored: &SlotValue, slot: &KeySlot) -> bool {
    match (incoming, stored, slot.mask) {
        (SlotValue::Number(a), SlotValue::Number(b), Some(mask)) => (a & mask) == (b & mask),
        (SlotValue::Number(a), SlotValue::Number(b), None) => a == b,
        (SlotValue::Buffer(a), SlotValue::Buffer(b), _) => a == b,
        _ => false,
    }
}

#[derive(Debug, Clone)]
struct Entry {
    keys: Vec<SlotValue>,
    data: Vec<SlotValue>,
    inserted_at: u64,
    last_hit_at: u64,
    keep_time: Option<u64>,
    hit_time: Option<u64>,
    new_hit_time: Option<u64>,
    hit_count: u64,
    valid: bool,
}

impl Entry {
    fn expired(&self, now: u64) -> bool {
        if let Some(keep) = self.keep_time {
            if now.saturating_sub(self.inserted_at) > keep {
                return true;
            }
        }
        let idle_limit = if self.hit_count > 0 { self.new_hit_time } else { self.hit_time };
        if let Some(idle) = idle_limit {
            if now.saturating_sub(self.last_hit_at) > idle {
                return true;
            }
        }
        false
    }
}

/// One named lookup table (spec §3 "Lookup table store", §4.4).
#[derive(Debug, Clone)]
pub struct LookupTable {
    pub name: String,
    pub key_schema: Vec<KeySlot>,
    pub data_schema: Vec<SlotKind>,
    entries: Vec<Entry>,
    last_match: Option<usize>,
}

impl LookupTable {
    #[must_use]
    pub fn new(name: impl Into<String>, key_schema: Vec<KeySlot>, data_schema: Vec<SlotKind>) -> Self {
        Self {
            name: name.into(),
            key_schema,
            data_schema,
            entries: Vec::new(),
            last_match: None,
        }
    }

    fn find_index(&mut self, keys: &[SlotValue], now: u64) -> Option<usize> {
        let mut obsolete = Vec::new();
        let mut found = None;
        for (i, entry) in self.entries.iter().enumerate() {
            if !entry.valid {
                continue;
            }
            let all_match = entry
                .keys
                .iter()
                .zip(keys.iter())
                .zip(self.key_schema.iter())
                .all(|((stored, incoming), slot)| key_matches(incoming, stored, slot));
            if all_match {
                if entry.expired(now) {
                    obsolete.push(i);
                    continue;
                }
                found = Some(i);
                break;
            }
        }
        for i in obsolete {
            self.entries[i].valid = false;
        }
        found
    }

    /// `check(keys)` (spec §4.4).
    pub fn check(&mut self, keys: &[SlotValue], now: u64) -> Result<(), LookupError> {
        if keys.len() != self.key_schema.len() {
            return Err(LookupError::KeyArity {
                table: self.name.clone(),
                expected: self.key_schema.len(),
                got: keys.len(),
            });
        }
        match self.find_index(keys, now) {
            Some(i) => {
                self.last_match = Some(i);
                Ok(())
            }
            None => Err(LookupError::Miss(self.name.clone())),
        }
    }

    /// `check-and-update(keys)`: on hit, refresh the idle expiry to
    /// `new-hit-time` (spec §4.4).
    pub fn check_and_update(&mut self, keys: &[SlotValue], now: u64) -> Result<(), LookupError> {
        self.check(keys, now)?;
        if let Some(i) = self.last_match {
            self.entries[i].last_hit_at = now;
            self.entries[i].hit_count += 1;
        }
        Ok(())
    }

    /// `add(keys, data, validity, keep, hit, new-hit)` (spec §4.4).
    #[allow(clippy::too_many_arguments)]
    pub fn add(
        &mut self,
        keys: Vec<SlotValue>,
        data: Vec<SlotValue>,
        validity: Validity,
        keep_time: Option<u64>,
        hit_time: Option<u64>,
        new_hit_time: Option<u64>,
        now: u64,
    ) -> Result<(), LookupError> {
        if keys.len() != self.key_schema.len() {
            return Err(LookupError::KeyArity {
                table: self.name.clone(),
                expected: self.key_schema.len(),
                got: keys.len(),
            });
        }
        // replace an existing entry with the same key, if any
        if let Some(i) = self.find_index(&keys, now) {
            self.entries.remove(i);
        }
        let _ = validity; // validity only affects GC sweep policy, tracked via `valid`
        self.entries.push(Entry {
            keys,
            data,
            inserted_at: now,
            last_hit_at: now,
            keep_time,
            hit_time,
            new_hit_time,
            hit_count: 0,
            valid: true,
        });
        Ok(())
    }

    /// `purge(keys)`: remove a matching entry outright.
    pub fn purge(&mut self, keys: &[SlotValue], now: u64) -> Result<(), LookupError> {
        if let Some(i) = self.find_index(keys, now) {
            self.entries.remove(i);
        }
        Ok(())
    }

    /// `obsolete(keys)`: mark invalid without freeing.
    pub fn obsolete(&mut self, keys: &[SlotValue], now: u64) -> Result<(), LookupError> {
        if let Some(i) = self.find_index(keys, now) {
            self.entries[i].valid = false;
        }
        Ok(())
    }

    /// `select-field(table, field)`: read a data slot from the most
    /// recently matched entry.
    pub fn select_field(&self, field_index: usize) -> Result<&SlotValue, LookupError> {
        let i = self.last_match.ok_or_else(|| LookupError::Miss(self.name.clone()))?;
        self.entries[i]
            .data
            .get(field_index)
            .ok_or_else(|| LookupError::Miss(self.name.clone()))
    }

    /// `assign-lookuptable`: overwrite a data slot of the most recently
    /// matched entry in place (spec §3 element kind `assign-lookuptable`).
    pub fn set_field(&mut self, field_index: usize, value: SlotValue) -> Result<(), LookupError> {
        let i = self.last_match.ok_or_else(|| LookupError::Miss(self.name.clone()))?;
        let slot = self
            .entries[i]
            .data
            .get_mut(field_index)
            .ok_or_else(|| LookupError::Miss(self.name.clone()))?;
        *slot = value;
        Ok(())
    }
}

/// Store of all named lookup tables for one decoder instance.
#[derive(Debug, Clone, Default)]
pub struct LookupTableStore {
    tables: HashMap<String, LookupTable>,
}

impl LookupTableStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare(&mut self, table: LookupTable) {
        self.tables.insert(table.name.clone(), table);
    }

    pub fn get_mut(&mut self, name: &str) -> Result<&mut LookupTable, LookupError> {
        self.tables.get_mut(name).ok_or_else(|| LookupError::NotFound(name.to_string()))
    }

    pub fn get(&self, name: &str) -> Result<&LookupTable, LookupError> {
        self.tables.get(name).ok_or_else(|| LookupError::NotFound(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> LookupTable {
        LookupTable::new(
            "flows",
            vec![KeySlot { kind: SlotKind::Number, mask: None }],
            vec![SlotKind::Number],
        )
    }

    #[test]
    fn add_then_check_hits() {
        let mut t = table();
        t.add(
            vec![SlotValue::Number(7)],
            vec![SlotValue::Number(100)],
            Validity::ThisSession,
            Some(60),
            Some(30),
            Some(10),
            0,
        )
        .unwrap();
        assert!(t.check(&[SlotValue::Number(7)], 5).is_ok());
        assert!(t.check(&[SlotValue::Number(8)], 5).is_err());
    }

    #[test]
    fn keep_time_expiry_is_hard() {
        let mut t = table();
        t.add(
            vec![SlotValue::Number(7)],
            vec![SlotValue::Number(100)],
            Validity::ThisSession,
            Some(10),
            None,
            None,
            0,
        )
        .unwrap();
        assert!(t.check(&[SlotValue::Number(7)], 5).is_ok());
        assert!(t.check(&[SlotValue::Number(7)], 11).is_err());
    }

    #[test]
    fn masked_key_matches_subsuming_bits() {
        let mut t = LookupTable::new(
            "masked",
            vec![KeySlot { kind: SlotKind::Number, mask: Some(0xFF00) }],
            vec![],
        );
        t.add(vec![SlotValue::Number(0x1234)], vec![], Validity::Static, None, None, None, 0)
            .unwrap();
        assert!(t.check(&[SlotValue::Number(0x12FF)], 0).is_ok());
        assert!(t.check(&[SlotValue::Number(0x1134)], 0).is_err());
    }
}
