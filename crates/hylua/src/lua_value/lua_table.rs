use std::cell::RefCell;
use std::hash::{BuildHasher, Hash, Hasher};
use std::rc::Rc;

use ahash::RandomState;

use crate::lua_value::LuaValue;
use crate::lua_vm::{LuaError, LuaResult};

pub type TableRef = Rc<RefCell<LuaTable>>;

pub const HASH_LOAD_FACTOR: f64 = 0.8;
pub const ARRAY_LOAD_FACTOR: f64 = 0.8;

pub const INITIAL_HASH_SIZE: usize = 16;
pub const INITIAL_ARRAY_SIZE: usize = 8;

fn find_power_of_two(n: usize) -> usize {
    let mut res = 1;
    while res < n {
        res <<= 1;
    }
    res
}

/// The hybrid associative container backing every script-visible aggregate.
///
/// Two independent stores: a dense array segment for small positive integer
/// keys (slot `k - 1` holds key `k`) and an open-addressed hash segment for
/// everything else. A key is visible through exactly one of the two at any
/// time; whole-valued float keys alias their integer form.
pub struct LuaTable {
    array: Vec<LuaValue>,
    array_entries: usize,

    hash_keys: Vec<LuaValue>,
    hash_values: Vec<LuaValue>,
    hash_entries: usize,

    state: RandomState,

    metatable: Option<TableRef>,
}

impl LuaTable {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_ARRAY_SIZE, INITIAL_HASH_SIZE)
    }

    pub fn with_capacity(array_size: usize, hash_size: usize) -> Self {
        let array_capacity = find_power_of_two(array_size);
        let hash_capacity = find_power_of_two(hash_size);

        Self {
            array: vec![LuaValue::Nil; array_capacity],
            array_entries: 0,
            hash_keys: vec![LuaValue::Nil; hash_capacity],
            hash_values: vec![LuaValue::Nil; hash_capacity],
            hash_entries: 0,
            state: RandomState::new(),
            metatable: None,
        }
    }

    pub fn set_metatable(&mut self, meta: Option<TableRef>) {
        self.metatable = meta;
    }

    pub fn get_metatable(&self) -> Option<TableRef> {
        self.metatable.clone()
    }

    /// Count of populated slots across both segments. Not the `#` border;
    /// see [`LuaTable::maxn`] for that.
    pub fn size(&self) -> usize {
        self.array_entries + self.hash_entries
    }

    fn check_key(key: &LuaValue) -> LuaResult<()> {
        match key {
            LuaValue::Nil => Err(LuaError::type_error("table index is nil")),
            LuaValue::Number(n) if n.is_nan() => Err(LuaError::type_error("table index is NaN")),
            _ => Ok(()),
        }
    }

    pub fn rawget(&self, key: &LuaValue) -> LuaResult<LuaValue> {
        Self::check_key(key)?;

        // Integer-valued number keys route through the array first
        if let LuaValue::Number(n) = key {
            let slot = *n as i64;
            if *n == slot as f64 {
                return Ok(self.rawget_int(slot));
            }
        }

        Ok(self.hash_get(key))
    }

    pub fn rawget_int(&self, key: i64) -> LuaValue {
        if key >= 1 && ((key - 1) as usize) < self.array.len() {
            return self.array[(key - 1) as usize].clone();
        }
        self.hash_get(&LuaValue::Number(key as f64))
    }

    pub fn rawget_str(&self, key: &str) -> LuaValue {
        self.hash_get(&LuaValue::string(key))
    }

    pub fn rawset(&mut self, key: &LuaValue, value: LuaValue) -> LuaResult<()> {
        Self::check_key(key)?;

        if let LuaValue::Number(n) = key {
            let slot = *n as i64;
            if *n == slot as f64 {
                self.rawset_int(slot, value);
                return Ok(());
            }
        }

        self.hash_set(key.clone(), value);
        Ok(())
    }

    pub fn rawset_int(&mut self, key: i64, value: LuaValue) {
        match self.set_array_slot(key - 1, value) {
            None => {}
            Some(value) => {
                // Negative zero is still zero
                let key = if key == 0 { 0.0 } else { key as f64 };
                self.hash_set(LuaValue::Number(key), value);
            }
        }
    }

    pub fn rawset_str(&mut self, key: &str, value: LuaValue) {
        self.hash_set(LuaValue::string(key), value);
    }

    /// Border scan: walks the array run starting at 1, then probes the hash
    /// segment for a contiguous continuation. For a table with holes this
    /// is *a* border, matching `#` semantics.
    pub fn maxn(&self) -> i64 {
        let mut n: i64 = 1;
        while (n as usize) < self.array_entries {
            if self.array[n as usize].is_nil() {
                break;
            }
            n += 1;
        }
        while !self.rawget_int(n).is_nil() {
            n += 1;
        }
        n - 1
    }

    /// List-style insertion at `index`, shifting the run above it up by
    /// one through repeated rawget/rawset.
    pub fn insert(&mut self, value: LuaValue, index: i64) {
        let mut space = index;
        while !self.rawget_int(space).is_nil() {
            space += 1;
        }
        while space != index {
            let below = self.rawget_int(space - 1);
            self.rawset_int(space, below);
            space -= 1;
        }
        self.rawset_int(space, value);
    }

    /// List-style removal at `index`, shifting the run above it down by
    /// one. Returns the removed value.
    pub fn remove(&mut self, index: i64) -> LuaValue {
        let removed = self.rawget_int(index);
        self.rawset_int(index, LuaValue::Nil);

        let mut check = index;
        loop {
            let moved = self.rawget_int(check + 1);
            if moved.is_nil() {
                break;
            }
            self.rawset_int(check, moved);
            check += 1;
        }
        self.rawset_int(check, LuaValue::Nil);
        removed
    }

    /// Stable iteration: array segment in index order, then hash segment in
    /// slot order. Passing a key that is not present raises; mutating the
    /// key set mid-iteration is undefined.
    pub fn next_key(&self, key: &LuaValue) -> LuaResult<Option<LuaValue>> {
        let mut array_index: i64 = -1;
        let mut hash_slot: i64 = 0;

        if key.is_nil() {
            array_index = 0;
        } else {
            if let LuaValue::Number(n) = key {
                let index = *n as i64;
                if *n == index as f64 && index >= 1 && ((index - 1) as usize) < self.array.len() {
                    if self.array[(index - 1) as usize].is_nil() {
                        return Err(LuaError::runtime("invalid key to 'next'"));
                    }
                    array_index = index;
                    hash_slot = -1;
                }
            }

            if hash_slot != -1 {
                let slot = self.hash_slot(key);
                if self.hash_keys[slot].is_nil() {
                    return Err(LuaError::runtime("invalid key to 'next'"));
                }
                hash_slot = slot as i64 + 1;
            }
        }

        if array_index != -1 {
            for index in (array_index as usize)..self.array.len() {
                if !self.array[index].is_nil() {
                    return Ok(Some(LuaValue::Number((index + 1) as f64)));
                }
            }
            hash_slot = 0;
        }

        for slot in (hash_slot as usize)..self.hash_keys.len() {
            if !self.hash_keys[slot].is_nil() {
                return Ok(Some(self.hash_keys[slot].clone()));
            }
        }

        Ok(None)
    }

    /*
     * Array segment
     */

    /// Store into array slot `slot` (zero-based). Returns the value back
    /// when the array refuses it: out of the doubling window, or within it
    /// but below the growth load factor.
    fn set_array_slot(&mut self, slot: i64, value: LuaValue) -> Option<LuaValue> {
        if slot < 0 {
            return Some(value);
        }
        let slot = slot as usize;
        let capacity = self.array.len();

        if slot < capacity {
            let taken = !self.array[slot].is_nil();
            if !value.is_nil() && !taken {
                self.array_entries += 1;
            }
            if value.is_nil() && taken {
                self.array_entries -= 1;
            }
            self.array[slot] = value;
            None
        } else if slot < capacity * 2 {
            if self.array_entries as f64 > capacity as f64 * ARRAY_LOAD_FACTOR {
                self.array.resize(capacity * 2, LuaValue::Nil);
                self.set_array_slot(slot as i64, value)
            } else {
                Some(value)
            }
        } else {
            Some(value)
        }
    }

    /*
     * Hash segment
     */

    fn hash_of(&self, key: &LuaValue) -> u64 {
        let mut hasher = self.state.build_hasher();
        match key {
            LuaValue::Nil => {}
            LuaValue::Boolean(b) => {
                1u8.hash(&mut hasher);
                b.hash(&mut hasher);
            }
            LuaValue::Number(n) => {
                // Whole-valued floats hash as their integer form so 2.0
                // and an integer-constructed 2 land in the same slot
                let int = *n as i64;
                if *n == int as f64 {
                    2u8.hash(&mut hasher);
                    int.hash(&mut hasher);
                } else {
                    3u8.hash(&mut hasher);
                    n.to_bits().hash(&mut hasher);
                }
            }
            LuaValue::String(s) => {
                4u8.hash(&mut hasher);
                s.as_bytes().hash(&mut hasher);
            }
            LuaValue::Table(t) => {
                5u8.hash(&mut hasher);
                (Rc::as_ptr(t) as usize).hash(&mut hasher);
            }
            LuaValue::Function(f) => {
                6u8.hash(&mut hasher);
                f.addr().hash(&mut hasher);
            }
            LuaValue::Coroutine(c) => {
                7u8.hash(&mut hasher);
                (Rc::as_ptr(c) as usize).hash(&mut hasher);
            }
        }
        hasher.finish()
    }

    /// Linear probe: slot holding `key`, or the first empty slot of its
    /// probe sequence. The load factor guarantees an empty slot exists.
    fn hash_slot(&self, key: &LuaValue) -> usize {
        let mask = self.hash_keys.len() - 1;
        let mut slot = (self.hash_of(key) as usize) & mask;

        while !self.hash_keys[slot].is_nil() && self.hash_keys[slot] != *key {
            slot = (slot + 1) & mask;
        }
        slot
    }

    fn hash_get(&self, key: &LuaValue) -> LuaValue {
        self.hash_values[self.hash_slot(key)].clone()
    }

    fn hash_set(&mut self, key: LuaValue, value: LuaValue) {
        let slot = self.hash_slot(&key);

        if value.is_nil() {
            if !self.hash_keys[slot].is_nil() {
                self.clear_hash_slot(slot);
            }
        } else {
            let is_new = self.hash_keys[slot].is_nil();

            self.hash_keys[slot] = key;
            self.hash_values[slot] = value;

            if is_new {
                self.hash_entries += 1;

                if self.hash_entries as f64 > self.hash_keys.len() as f64 * HASH_LOAD_FACTOR {
                    self.expand_hash();
                }
            }
        }
    }

    /// Backward-shift deletion over the cyclic probe order, no tombstones.
    ///
    /// Invariant: an entry at `check` whose home slot is `desired` may fill
    /// the hole at `space` only when `space` lies on its probe path, i.e.
    /// the cyclic distance `desired -> check` covers `space -> check`.
    fn clear_hash_slot(&mut self, removed: usize) {
        let mask = self.hash_keys.len() - 1;

        self.hash_keys[removed] = LuaValue::Nil;
        self.hash_values[removed] = LuaValue::Nil;
        self.hash_entries -= 1;

        // `space` always holds the hole
        let mut space = removed;
        let mut check = (removed + 1) & mask;

        while !self.hash_keys[check].is_nil() {
            let desired = (self.hash_of(&self.hash_keys[check]) as usize) & mask;

            if (check.wrapping_sub(desired) & mask) >= (check.wrapping_sub(space) & mask) {
                self.hash_keys.swap(space, check);
                self.hash_values.swap(space, check);
                space = check;
            }

            check = (check + 1) & mask;
        }
    }

    fn expand_hash(&mut self) {
        let new_capacity = self.hash_keys.len() * 2;

        let old_keys = std::mem::replace(&mut self.hash_keys, vec![LuaValue::Nil; new_capacity]);
        let old_values =
            std::mem::replace(&mut self.hash_values, vec![LuaValue::Nil; new_capacity]);

        for (key, value) in old_keys.into_iter().zip(old_values) {
            if !key.is_nil() {
                let slot = self.hash_slot(&key);
                self.hash_keys[slot] = key;
                self.hash_values[slot] = value;
            }
        }
    }
}

impl Default for LuaTable {
    fn default() -> Self {
        Self::new()
    }
}
