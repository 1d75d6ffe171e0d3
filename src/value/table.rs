//! Hybrid array+hash table backing Lua's single aggregate type.

use super::{float_to_integer_exact, LuaValue};
use ahash::AHashMap;
use std::cell::RefCell;
use std::rc::Rc;

/// A table key, normalized so integer `3` and float `3.0` occupy the
/// same hash-part slot (an integer key I and float key F that
/// compares equal by the rules above map to the same slot").
#[derive(Clone)]
pub enum TableKey {
    Boolean(bool),
    Integer(i64),
    Number(u64), // non-integral float, bit pattern (NaN is rejected before this point)
    Str(Rc<[u8]>),
    Table(*const RefCell<LuaTable>),
    Function(*const super::Closure),
    Thread(*const RefCell<crate::vm::thread::LuaThread>),
    UserData(*const RefCell<super::UserData>),
}

impl PartialEq for TableKey {
    fn eq(&self, other: &Self) -> bool {
        use TableKey::*;
        match (self, other) {
            (Boolean(a), Boolean(b)) => a == b,
            (Integer(a), Integer(b)) => a == b,
            (Number(a), Number(b)) => a == b,
            (Str(a), Str(b)) => a.as_ref() == b.as_ref(),
            (Table(a), Table(b)) => a == b,
            (Function(a), Function(b)) => a == b,
            (Thread(a), Thread(b)) => a == b,
            (UserData(a), UserData(b)) => a == b,
            _ => false,
        }
    }
}
impl Eq for TableKey {}

impl std::hash::Hash for TableKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        use std::hash::Hash as _;
        match self {
            TableKey::Boolean(b) => (0u8, b).hash(state),
            TableKey::Integer(i) => (1u8, i).hash(state),
            TableKey::Number(bits) => (1u8, (*bits as i128) + (1i128 << 64)).hash(state),
            TableKey::Str(s) => (2u8, s.as_ref()).hash(state),
            TableKey::Table(p) => (3u8, *p as usize).hash(state),
            TableKey::Function(p) => (4u8, *p as usize).hash(state),
            TableKey::Thread(p) => (5u8, *p as usize).hash(state),
            TableKey::UserData(p) => (6u8, *p as usize).hash(state),
        }
    }
}

/// Outcome of normalizing a `LuaValue` into a table key.
pub enum KeyError {
    Nil,
    Nan,
}

impl TableKey {
    pub fn from_value(v: &LuaValue) -> Result<TableKey, KeyError> {
        match v {
            LuaValue::Nil => Err(KeyError::Nil),
            LuaValue::Boolean(b) => Ok(TableKey::Boolean(*b)),
            LuaValue::Integer(i) => Ok(TableKey::Integer(*i)),
            LuaValue::Number(f) => {
                if f.is_nan() {
                    Err(KeyError::Nan)
                } else if let Some(i) = float_to_integer_exact(*f) {
                    Ok(TableKey::Integer(i))
                } else {
                    Ok(TableKey::Number(f.to_bits()))
                }
            }
            LuaValue::Str(s) => Ok(TableKey::Str(s.clone())),
            LuaValue::Table(t) => Ok(TableKey::Table(Rc::as_ptr(t))),
            LuaValue::Function(f) => Ok(TableKey::Function(Rc::as_ptr(f))),
            LuaValue::Thread(t) => Ok(TableKey::Thread(Rc::as_ptr(t))),
            LuaValue::UserData(u) => Ok(TableKey::UserData(Rc::as_ptr(u))),
        }
    }

    pub fn to_value(&self) -> LuaValue {
        match self {
            TableKey::Boolean(b) => LuaValue::Boolean(*b),
            TableKey::Integer(i) => LuaValue::Integer(*i),
            TableKey::Number(bits) => LuaValue::Number(f64::from_bits(*bits)),
            TableKey::Str(s) => LuaValue::Str(s.clone()),
            // Table/Function/Thread/UserData keys keep a raw pointer only;
            // reconstructing the owning Rc safely requires the live value,
            // which table iteration always has on hand (see `LuaTable::next`).
            _ => LuaValue::Nil,
        }
    }
}

/// The hash part stores live `LuaValue` keys alongside the normalized
/// lookup key so `next`/iteration can hand back real values for
/// reference-typed keys (whose [`TableKey`] is just a raw pointer).
struct HashEntry {
    key: LuaValue,
    value: LuaValue,
}

#[derive(Default)]
pub struct LuaTable {
    /// Dense 1-based array part; `array[i]` holds logical index `i+1`.
    array: Vec<LuaValue>,
    /// Insertion-ordered hash part for deterministic iteration.
    hash: Vec<HashEntry>,
    hash_index: AHashMap<TableKey, usize>,
    pub metatable: Option<Rc<RefCell<LuaTable>>>,
}

impl LuaTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(array_hint: usize, hash_hint: usize) -> Self {
        LuaTable {
            array: Vec::with_capacity(array_hint),
            hash: Vec::with_capacity(hash_hint),
            hash_index: AHashMap::with_capacity(hash_hint),
            metatable: None,
        }
    }

    pub fn get_int(&self, i: i64) -> LuaValue {
        if i >= 1 && (i as usize) <= self.array.len() {
            return self.array[(i - 1) as usize].clone();
        }
        self.get_hash(&TableKey::Integer(i))
    }

    fn get_hash(&self, key: &TableKey) -> LuaValue {
        match self.hash_index.get(key) {
            Some(&idx) => self.hash[idx].value.clone(),
            None => LuaValue::Nil,
        }
    }

    pub fn get(&self, key: &LuaValue) -> LuaValue {
        match TableKey::from_value(key) {
            Ok(TableKey::Integer(i)) => self.get_int(i),
            Ok(k) => self.get_hash(&k),
            Err(_) => LuaValue::Nil,
        }
    }

    /// `rawset` semantics: assigning `nil` deletes; `nil`/`NaN` keys error.
    pub fn set(&mut self, key: LuaValue, value: LuaValue) -> Result<(), &'static str> {
        let k = match TableKey::from_value(&key) {
            Ok(k) => k,
            Err(KeyError::Nil) => return Err("table index is nil"),
            Err(KeyError::Nan) => return Err("table index is NaN"),
        };
        if let TableKey::Integer(i) = k {
            self.set_int(i, value);
            return Ok(());
        }
        self.set_hash(k, key, value);
        Ok(())
    }

    pub fn set_int(&mut self, i: i64, value: LuaValue) {
        if i >= 1 && (i as usize) <= self.array.len() {
            let idx = (i - 1) as usize;
            if value.is_nil() && idx == self.array.len() - 1 {
                self.array.pop();
                // Shrink further: trailing nils left by earlier deletions.
                while matches!(self.array.last(), Some(LuaValue::Nil)) {
                    self.array.pop();
                }
            } else {
                self.array[idx] = value;
            }
            return;
        }
        if i >= 1 && (i as usize) == self.array.len() + 1 && !value.is_nil() {
            self.array.push(value);
            // Absorb any contiguous successors already sitting in the hash part.
            let mut next = self.array.len() as i64 + 1;
            while let Some(&idx) = self.hash_index.get(&TableKey::Integer(next)) {
                let v = self.hash[idx].value.clone();
                self.remove_hash_at(idx);
                self.array.push(v);
                next += 1;
            }
            return;
        }
        self.set_hash(TableKey::Integer(i), LuaValue::Integer(i), value);
    }

    fn set_hash(&mut self, k: TableKey, key_value: LuaValue, value: LuaValue) {
        if let Some(&idx) = self.hash_index.get(&k) {
            if value.is_nil() {
                self.remove_hash_at(idx);
            } else {
                self.hash[idx].value = value;
            }
            return;
        }
        if value.is_nil() {
            return;
        }
        let idx = self.hash.len();
        self.hash.push(HashEntry {
            key: key_value,
            value,
        });
        self.hash_index.insert(k, idx);
    }

    fn remove_hash_at(&mut self, idx: usize) {
        // Swap-remove keeps lookups O(1); reinsert iteration position of
        // the moved entry.
        let removed_key = TableKey::from_value(&self.hash[idx].key).ok();
        self.hash.swap_remove(idx);
        if let Some(k) = removed_key {
            self.hash_index.remove(&k);
        }
        if idx < self.hash.len() {
            let moved_key = TableKey::from_value(&self.hash[idx].key).ok();
            if let Some(k) = moved_key {
                self.hash_index.insert(k, idx);
            }
        }
    }

    /// Length operator: a border `n` with `t[n] ~= nil` and `t[n+1] == nil`.
    pub fn len(&self) -> i64 {
        if !self.array.is_empty() && !matches!(self.array.last(), Some(LuaValue::Nil)) {
            let n = self.array.len() as i64;
            if self.get_hash(&TableKey::Integer(n + 1)).is_nil() {
                return n;
            }
            // The array's tail is full but the hash part continues the
            // sequence; binary-search upward through the hash part.
            let mut lo = n;
            let mut hi = n + 1;
            while !self.get_hash(&TableKey::Integer(hi)).is_nil() {
                lo = hi;
                if hi > i64::MAX / 2 {
                    // Degenerate: linear scan rather than overflow.
                    let mut j = lo;
                    while !self.get_hash(&TableKey::Integer(j + 1)).is_nil() {
                        j += 1;
                    }
                    return j;
                }
                hi *= 2;
            }
            while hi - lo > 1 {
                let mid = lo + (hi - lo) / 2;
                if self.get_hash(&TableKey::Integer(mid)).is_nil() {
                    hi = mid;
                } else {
                    lo = mid;
                }
            }
            return lo;
        }
        if self.array.is_empty() {
            return 0;
        }
        // Array part has a nil somewhere; binary search for a border inside it.
        let mut lo: i64 = 0;
        let mut hi: i64 = self.array.len() as i64;
        while hi - lo > 1 {
            let mid = lo + (hi - lo) / 2;
            if self.array[(mid - 1) as usize].is_nil() {
                hi = mid;
            } else {
                lo = mid;
            }
        }
        lo
    }

    pub fn is_empty(&self) -> bool {
        self.array.iter().all(|v| v.is_nil()) && self.hash.is_empty()
    }

    /// `next(t, k)`: array part ascending, then hash part in insertion
    /// order. `k == Nil` starts iteration.
    pub fn next(&self, key: &LuaValue) -> Result<Option<(LuaValue, LuaValue)>, &'static str> {
        let start_hash_from = if key.is_nil() {
            // Find the first non-nil array slot.
            for (i, v) in self.array.iter().enumerate() {
                if !v.is_nil() {
                    return Ok(Some((LuaValue::Integer(i as i64 + 1), v.clone())));
                }
            }
            0
        } else if let Some(i) = key.as_integer_exact() {
            if i >= 1 && (i as usize) <= self.array.len() {
                for j in (i as usize)..self.array.len() {
                    if !self.array[j].is_nil() {
                        return Ok(Some((LuaValue::Integer(j as i64 + 1), self.array[j].clone())));
                    }
                }
                0
            } else {
                self.hash_position_after(key)?
            }
        } else {
            self.hash_position_after(key)?
        };

        for j in start_hash_from..self.hash.len() {
            if !self.hash[j].value.is_nil() {
                return Ok(Some((self.hash[j].key.clone(), self.hash[j].value.clone())));
            }
        }
        Ok(None)
    }

    fn hash_position_after(&self, key: &LuaValue) -> Result<usize, &'static str> {
        let k = match TableKey::from_value(key) {
            Ok(k) => k,
            Err(_) => return Err("invalid key to 'next'"),
        };
        match self.hash_index.get(&k) {
            Some(&idx) => Ok(idx + 1),
            None => Err("invalid key to 'next'"),
        }
    }

    pub fn array_len(&self) -> usize {
        self.array.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn array_part_grows_and_length_operator() {
        let mut t = LuaTable::new();
        for i in 1..=5 {
            t.set_int(i, LuaValue::Integer(i * 10));
        }
        assert_eq!(t.len(), 5);
        t.set_int(5, LuaValue::Nil);
        assert_eq!(t.len(), 4);
    }

    #[test]
    fn integer_and_float_key_share_slot() {
        let mut t = LuaTable::new();
        let n: i64 = 9_007_199_254_740_991;
        t.set(LuaValue::Integer(n), LuaValue::Integer(1)).unwrap();
        let got = t.get(&LuaValue::Number(n as f64));
        assert!(matches!(got, LuaValue::Integer(1)));
    }

    #[test]
    fn nan_key_rejected() {
        let mut t = LuaTable::new();
        let err = t.set(LuaValue::Number(f64::NAN), LuaValue::Integer(1));
        assert!(err.is_err());
    }

    #[test]
    fn deleting_key_removes_it() {
        let mut t = LuaTable::new();
        t.set(LuaValue::Str(Rc::from(&b"k"[..])), LuaValue::Integer(1))
            .unwrap();
        t.set(LuaValue::Str(Rc::from(&b"k"[..])), LuaValue::Nil)
            .unwrap();
        assert!(t.get(&LuaValue::Str(Rc::from(&b"k"[..]))).is_nil());
    }
}
