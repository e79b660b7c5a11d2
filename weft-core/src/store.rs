//! Where operation logs live.
//!
//! ```text
//!   instance A: DocumentArena ──┐
//!                               ├──▶ LogStore ──▶ OperationLog per DocKey
//!   instance B: DocumentArena ──┘
//! ```
//!
//! Every arena of a deployment opens its logs from one [`LogStore`], so a
//! document has exactly one version history no matter which instance
//! accepted a submit. Transform and append run under the log's lock,
//! which makes version checks authoritative across instances.

use crate::operation::DocKey;
use crate::oplog::OperationLog;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// One document's log, shared by every actor that serves it.
pub type SharedLog = Arc<Mutex<OperationLog>>;

/// Backing store for document logs.
pub trait LogStore: Send + Sync + 'static {
    /// Returns the log for `key`, creating an empty one on first use.
    fn open(&self, key: &DocKey) -> SharedLog;

    /// Returns the log for `key` if any instance has opened it.
    fn get(&self, key: &DocKey) -> Option<SharedLog>;

    /// Every document of `collection` the store holds.
    fn keys(&self, collection: &str) -> Vec<DocKey>;

    fn name(&self) -> &'static str;
}

/// In-process store. Clone the `Arc` into each arena that should see the
/// same documents.
#[derive(Default)]
pub struct MemoryLogStore {
    logs: RwLock<HashMap<DocKey, SharedLog>>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.logs.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LogStore for MemoryLogStore {
    fn open(&self, key: &DocKey) -> SharedLog {
        if let Some(log) = self.get(key) {
            return log;
        }
        let mut logs = self.logs.write().unwrap_or_else(PoisonError::into_inner);
        logs.entry(key.clone())
            .or_insert_with(|| {
                log::debug!("opened log for {}", key);
                Arc::new(Mutex::new(OperationLog::new(key.clone())))
            })
            .clone()
    }

    fn get(&self, key: &DocKey) -> Option<SharedLog> {
        self.logs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn keys(&self, collection: &str) -> Vec<DocKey> {
        self.logs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .filter(|k| k.collection == collection)
            .cloned()
            .collect()
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::Component;
    use crate::operation::Operation;
    use crate::path;
    use serde_json::json;

    #[test]
    fn test_open_returns_the_same_log() {
        let store = MemoryLogStore::new();
        let key = DocKey::new("notes", "n1");
        let a = store.open(&key);
        let b = store.open(&key);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(store.len(), 1);

        a.lock()
            .unwrap()
            .submit(Operation::edit("s", 1, 0, vec![Component::set(path!["k"], json!(1))]))
            .unwrap();
        assert_eq!(b.lock().unwrap().version(), 1);
    }

    #[test]
    fn test_get_does_not_create() {
        let store = MemoryLogStore::new();
        assert!(store.get(&DocKey::new("notes", "n1")).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_keys_filters_by_collection() {
        let store = MemoryLogStore::new();
        store.open(&DocKey::new("notes", "n1"));
        store.open(&DocKey::new("notes", "n2"));
        store.open(&DocKey::new("record_tbl", "r1"));
        let mut keys = store.keys("notes");
        keys.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(keys, vec![DocKey::new("notes", "n1"), DocKey::new("notes", "n2")]);
        assert_eq!(store.name(), "memory");
    }
}
