//! Open-addressed, linear-probing hash table keyed by interned strings.
//!
//! One `Table` implementation backs the globals table, every class's method
//! table, every instance's field table, and (used as a set, values
//! ignored) the string-interning table itself.

use crate::object::Obj;
use crate::value::Value;

const MAX_LOAD: f64 = 0.75;

#[derive(Clone)]
struct Entry {
    key: Option<Obj>,
    value: Value,
}

pub struct Table {
    entries: Vec<Entry>,
    /// Active entries plus tombstones (a tombstone is `key: None, value:
    /// Bool(true)`), matching the reference implementation's `count` field.
    count: usize,
}

impl Table {
    pub fn new() -> Self {
        Table {
            entries: Vec::new(),
            count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.key.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the value for `key`, if present.
    pub fn get(&self, key: Obj) -> Option<Value> {
        if self.entries.is_empty() {
            return None;
        }
        let idx = self.find_entry(&self.entries, key);
        self.entries[idx].key.map(|_| self.entries[idx].value)
    }

    /// Inserts or overwrites `key`'s value. Returns `true` if this created a
    /// brand-new key (matching `DEFINE_GLOBAL`'s "creates" semantics).
    pub fn set(&mut self, key: Obj, value: Value) -> bool {
        if self.needs_growth() {
            self.grow();
        }
        let idx = self.find_entry(&self.entries, key);
        let is_new_key = self.entries[idx].key.is_none();
        if is_new_key && matches!(self.entries[idx].value, Value::Nil) {
            self.count += 1;
        }
        self.entries[idx] = Entry {
            key: Some(key),
            value,
        };
        is_new_key
    }

    /// Deletes `key`, leaving a tombstone so later probes still find
    /// entries placed after a collision with it.
    pub fn delete(&mut self, key: Obj) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let idx = self.find_entry(&self.entries, key);
        if self.entries[idx].key.is_none() {
            return false;
        }
        self.entries[idx] = Entry {
            key: None,
            value: Value::Bool(true),
        };
        true
    }

    /// Finds an existing interned string with identical content, without
    /// requiring an `Obj` handle to compare against (used before a freshly
    /// allocated string is interned, to see if it can be discarded instead).
    pub fn find_string(&self, text: &str, hash: u32) -> Option<Obj> {
        if self.entries.is_empty() {
            return None;
        }
        let capacity = self.entries.len();
        let mut index = (hash as usize) % capacity;
        loop {
            let entry = &self.entries[index];
            match entry.key {
                None => {
                    // Stop only on a true empty slot (not a tombstone: a
                    // tombstone's value is Bool(true), a genuinely empty
                    // slot's value is Nil).
                    if matches!(entry.value, Value::Nil) {
                        return None;
                    }
                }
                Some(key) => {
                    let s = key.as_string().expect("table key must be a string");
                    if s.hash == hash && s.as_str() == text {
                        return Some(key);
                    }
                }
            }
            index = (index + 1) % capacity;
        }
    }

    /// Drops every entry whose key object is still white (unreachable) —
    /// the weak-set cleanup step of a GC cycle.
    pub fn remove_white(&mut self) {
        for entry in self.entries.iter_mut() {
            if let Some(key) = entry.key {
                if !key.header().marked.get() {
                    entry.key = None;
                    entry.value = Value::Bool(true);
                }
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Obj, Value)> + '_ {
        self.entries
            .iter()
            .filter_map(|e| e.key.map(|k| (k, e.value)))
    }

    fn needs_growth(&self) -> bool {
        (self.count + 1) as f64 > self.entries.len() as f64 * MAX_LOAD
    }

    fn grow(&mut self) {
        let new_capacity = if self.entries.is_empty() {
            8
        } else {
            self.entries.len() * 2
        };
        let mut new_entries = vec![
            Entry {
                key: None,
                value: Value::Nil,
            };
            new_capacity
        ];
        let mut live = 0;
        for entry in self.entries.iter() {
            if let Some(key) = entry.key {
                let idx = self.find_entry(&new_entries, key);
                new_entries[idx] = Entry {
                    key: Some(key),
                    value: entry.value,
                };
                live += 1;
            }
        }
        self.entries = new_entries;
        self.count = live;
    }

    fn find_entry(&self, entries: &[Entry], key: Obj) -> usize {
        let hash = key.as_string().expect("table key must be a string").hash;
        let capacity = entries.len();
        let mut index = (hash as usize) % capacity;
        let mut tombstone: Option<usize> = None;
        loop {
            let entry = &entries[index];
            match entry.key {
                None => {
                    if matches!(entry.value, Value::Nil) {
                        // Truly empty: reuse an earlier tombstone if we saw one.
                        return tombstone.unwrap_or(index);
                    } else if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                }
                Some(k) if k == key => return index,
                Some(_) => {}
            }
            index = (index + 1) % capacity;
        }
    }
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}
