// src/store.rs
//! Where coordinator results land. The dashboard keeps one JSON value per
//! panel key; observers wait on the version channel instead of polling.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::watch;

pub trait StateStore: Send + Sync {
    fn set(&self, key: &str, value: Value);
    fn get(&self, key: &str) -> Option<Value>;
}

#[derive(Debug)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Value>>,
    version: watch::Sender<u64>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            entries: RwLock::new(HashMap::new()),
            version,
        }
    }

    /// Bumped on every write.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Length of an array value, 0 for anything else.
    pub fn len_of(&self, key: &str) -> usize {
        self.entries
            .read()
            .get(key)
            .and_then(Value::as_array)
            .map_or(0, Vec::len)
    }
}

impl StateStore for MemoryStore {
    fn set(&self, key: &str, value: Value) {
        self.entries.write().insert(key.to_string(), value);
        self.version.send_modify(|v| *v += 1);
    }

    fn get(&self, key: &str) -> Option<Value> {
        self.entries.read().get(key).cloned()
    }
}
