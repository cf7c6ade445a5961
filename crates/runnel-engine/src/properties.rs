use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Run-scoped key-value bag shared by the orchestrator and every invocation.
///
/// Work functions of the same tick run concurrently and may read or write
/// this map at the same time, so every access goes through a lock. Cloning
/// the handle shares the underlying map. Values are JSON for flexibility.
#[derive(Debug, Clone, Default)]
pub struct RunProperties {
    data: Arc<RwLock<HashMap<String, serde_json::Value>>>,
}

impl RunProperties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a bag from initial data.
    pub fn from_map(data: HashMap<String, serde_json::Value>) -> Self {
        Self {
            data: Arc::new(RwLock::new(data)),
        }
    }

    /// Get a value by key.
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.read(|data| data.get(key).cloned())
    }

    /// Get a value as a string, if it's a string.
    pub fn get_str(&self, key: &str) -> Option<String> {
        self.read(|data| data.get(key).and_then(|v| v.as_str()).map(String::from))
    }

    /// Get a value as an integer, if it's an integer.
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.read(|data| data.get(key).and_then(|v| v.as_i64()))
    }

    /// Set a value, returning the previous one.
    pub fn set(&self, key: impl Into<String>, value: serde_json::Value) -> Option<serde_json::Value> {
        self.write(|data| data.insert(key.into(), value))
    }

    /// Set a string value.
    pub fn set_str(&self, key: impl Into<String>, value: impl Into<String>) {
        self.set(key, serde_json::Value::String(value.into()));
    }

    pub fn remove(&self, key: &str) -> Option<serde_json::Value> {
        self.write(|data| data.remove(key))
    }

    /// Atomically add `delta` to an integer counter, treating a missing or
    /// non-integer value as zero. Returns the new value.
    pub fn increment(&self, key: &str, delta: i64) -> i64 {
        self.write(|data| {
            let next = data.get(key).and_then(|v| v.as_i64()).unwrap_or(0) + delta;
            data.insert(key.to_string(), serde_json::json!(next));
            next
        })
    }

    /// Merge a map into this bag (overwrites on conflict).
    pub fn merge(&self, other: HashMap<String, serde_json::Value>) {
        self.write(|data| data.extend(other));
    }

    /// Copy of the current contents.
    pub fn snapshot(&self) -> HashMap<String, serde_json::Value> {
        self.read(|data| data.clone())
    }

    pub fn len(&self) -> usize {
        self.read(|data| data.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.write(|data| data.clear());
    }

    fn read<R>(&self, f: impl FnOnce(&HashMap<String, serde_json::Value>) -> R) -> R {
        let guard = self.data.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    fn write<R>(&self, f: impl FnOnce(&mut HashMap<String, serde_json::Value>) -> R) -> R {
        let mut guard = self.data.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }
}
