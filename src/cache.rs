use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use crate::holder::Holder;

/// Per-category identity cache: `key -> Weak<Holder>`.
///
/// Guarantees that within one process there is at most one live holder, and
/// therefore one monitor, per (category, key). Entries are weak so a record
/// nobody references can be collected; dead slots are pruned opportunistically.
pub(crate) struct HolderCache {
    index_name: String,
    entries: Mutex<HashMap<String, Weak<Holder>>>,
}

impl HolderCache {
    pub fn new(index_name: &str) -> Self {
        Self {
            index_name: index_name.to_string(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// The holder for `key`, allocating one when the slot is empty or its
    /// holder has been dropped.
    pub fn lookup(&self, key: &str) -> Arc<Holder> {
        let mut entries = self.entries.lock().unwrap();
        if let Some(existing) = entries.get(key).and_then(Weak::upgrade) {
            return existing;
        }
        let holder = Arc::new(Holder::new(key, &self.index_name));
        entries.insert(key.to_string(), Arc::downgrade(&holder));
        holder
    }

    /// Drops the entry for a removed record.
    pub fn evict(&self, key: &str) {
        self.entries.lock().unwrap().remove(key);
    }

    /// Keys with a live holder. Enumeration unions these with the back-end
    /// listing so records mutated but not yet persisted are visible.
    pub fn keys(&self) -> Vec<String> {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|_, weak| weak.strong_count() > 0);
        entries.keys().cloned().collect()
    }
}
