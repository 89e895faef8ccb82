//! Weak-table storage (`§4.8`)
//!
//! Four storage flavors sharing one interface (get/insert/remove/iterate).
//! `__mode` selects which side(s) of an entry are weak. Because this crate's
//! heap (`crate::heap::LuaHeap`) never frees an object except through an
//! explicit [`crate::heap::LuaHeap::collect_garbage`] sweep, "weak" here
//! means: excluded from the sweep's mark phase, and purged from the table
//! if found unmarked afterwards (`§9`'s documented conservative fallback,
//! made precise with an actual mark/sweep rather than "never purges").

use std::collections::HashMap;

use crate::value::{TableKey, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeakMode {
    Strong,
    WeakKeys,
    WeakValues,
    WeakBoth,
}

impl WeakMode {
    pub fn from_mode_string(s: &str) -> Self {
        let k = s.contains('k');
        let v = s.contains('v');
        match (k, v) {
            (true, true) => WeakMode::WeakBoth,
            (true, false) => WeakMode::WeakKeys,
            (false, true) => WeakMode::WeakValues,
            (false, false) => WeakMode::Strong,
        }
    }

    pub fn weak_keys(self) -> bool {
        matches!(self, WeakMode::WeakKeys | WeakMode::WeakBoth)
    }

    pub fn weak_values(self) -> bool {
        matches!(self, WeakMode::WeakValues | WeakMode::WeakBoth)
    }
}

/// Hash-part storage for a [`crate::value::Table`]. A single `HashMap` plus
/// a tag for which sides are weak; `§4.8`'s "transition ... migrates
/// existing entries in a single pass" is just changing the tag, since the
/// underlying map doesn't change shape.
#[derive(Debug)]
pub struct TableStorage {
    entries: HashMap<TableKey, Value>,
    mode: WeakMode,
}

impl TableStorage {
    pub fn new_strong() -> Self {
        TableStorage { entries: HashMap::new(), mode: WeakMode::Strong }
    }

    pub fn with_capacity(cap: usize) -> Self {
        TableStorage { entries: HashMap::with_capacity(cap), mode: WeakMode::Strong }
    }

    pub fn mode(&self) -> WeakMode {
        self.mode
    }

    /// Change `__mode`. Existing entries are kept; they'll be purged on the
    /// next sweep if the new mode makes them ineligible.
    pub fn set_mode(&mut self, mode: WeakMode) {
        self.mode = mode;
    }

    pub fn get(&self, key: &TableKey) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn insert(&mut self, key: TableKey, value: Value) {
        self.entries.insert(key, value);
    }

    pub fn remove(&mut self, key: &TableKey) {
        self.entries.remove(key);
    }

    /// Remove-and-return, used by `Table::set`'s array-migration path.
    pub fn take(&mut self, key: &TableKey) -> Option<Value> {
        self.entries.remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TableKey, &Value)> {
        self.entries.iter()
    }

    /// `next(t, key)` support: any deterministic-enough order works since
    /// `§3` only requires each live key visited at most once per traversal;
    /// `HashMap`'s iteration order is stable across a single un-mutated map.
    pub fn first(&self) -> Option<(Value, Value)> {
        self.entries.iter().next().map(|(k, v)| (k.to_value(), v.clone()))
    }

    pub fn next_after(&self, key: &TableKey) -> Option<(Value, Value)> {
        let mut seen = false;
        for (k, v) in &self.entries {
            if seen {
                return Some((k.to_value(), v.clone()));
            }
            if k == key {
                seen = true;
            }
        }
        None
    }

    /// Drop every entry whose key or value (per `mode`) fails the liveness
    /// predicate. Called once per table during a forced
    /// `collectgarbage("collect")` sweep.
    pub fn purge_dead(&mut self, key_alive: impl Fn(&TableKey) -> bool, value_alive: impl Fn(&Value) -> bool) {
        if !self.mode.weak_keys() && !self.mode.weak_values() {
            return;
        }
        self.entries.retain(|k, v| {
            (!self.mode.weak_keys() || key_alive(k)) && (!self.mode.weak_values() || value_alive(v))
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_from_string() {
        assert_eq!(WeakMode::from_mode_string("k"), WeakMode::WeakKeys);
        assert_eq!(WeakMode::from_mode_string("v"), WeakMode::WeakValues);
        assert_eq!(WeakMode::from_mode_string("kv"), WeakMode::WeakBoth);
        assert_eq!(WeakMode::from_mode_string(""), WeakMode::Strong);
    }

    #[test]
    fn purge_removes_dead_weak_keys_only() {
        let mut s = TableStorage::new_strong();
        s.set_mode(WeakMode::WeakKeys);
        s.insert(TableKey::Integer(1), Value::Integer(100));
        s.insert(TableKey::Integer(2), Value::Integer(200));
        // Pretend only key 1 is still reachable elsewhere.
        s.purge_dead(|k| matches!(k, TableKey::Integer(1)), |_| true);
        assert_eq!(s.len(), 1);
        assert_eq!(s.get(&TableKey::Integer(1)), Some(&Value::Integer(100)));
    }
}
