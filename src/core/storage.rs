use std::collections::HashMap;

use super::identifier::Key;

pub type Value = Vec<u8>;

/// In-memory key → value store served on FIND_VALUE hits.
///
/// Keys collide last-writer-wins. Lives for the process lifetime; there is
/// no eviction and nothing is persisted.
#[derive(Debug, Default)]
pub struct Storage {
    map: HashMap<Key, Value>,
}

impl Storage {
    pub fn new() -> Self {
        Storage {
            map: HashMap::new(),
        }
    }

    pub fn insert(&mut self, key: Key, value: Value) {
        self.map.insert(key, value);
    }

    pub fn get(&self, key: &Key) -> Option<&Value> {
        self.map.get(key)
    }

    pub fn remove(&mut self, key: &Key) -> Option<Value> {
        self.map.remove(key)
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.map.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
