use std::sync::Arc;

use crate::category::Category;
use crate::data::MapData;
use crate::error::Result;
use crate::holder::Holder;
use crate::sorter::SortValue;
use crate::value::{Value, ValueMap};

/// A persisted, back-end-stored record of string-keyed values.
///
/// Obtained from [`Category::map`]. Handles are cheap to clone and compare
/// equal when they address the same (category, key). Reads load the record
/// payload on demand; mutations update it in memory and register a deferred
/// save with the persister, so rapid successive mutations collapse into one
/// back-end write.
#[derive(Clone)]
pub struct StoredMap {
    category: Category,
    holder: Arc<Holder>,
}

impl StoredMap {
    pub(crate) fn new(category: Category, holder: Arc<Holder>) -> Self {
        Self { category, holder }
    }

    pub fn key(&self) -> &str {
        self.holder.key()
    }

    pub fn category(&self) -> &Category {
        &self.category
    }

    /// Runs a read against the payload under the holder monitor.
    fn read<R>(&self, f: impl FnOnce(&MapData) -> R) -> Result<R> {
        let mut mon = self.holder.lock();
        let payload = self.holder.load_payload(&mut mon, self.category.driver())?;
        let data = payload.lock().unwrap();
        Ok(f(&data))
    }

    /// Runs a mutation through the persister, optionally with an
    /// after-persist callback.
    fn mutate<R>(
        &self,
        callback: Option<crate::driver::Callback>,
        f: impl FnOnce(&mut MapData) -> R,
    ) -> Result<R> {
        self.category
            .persister()
            .schedule(&self.category, &self.holder, callback, f)
    }

    // reads

    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        self.read(|data| data.map().get(key).cloned())
    }

    pub fn len(&self) -> Result<usize> {
        self.read(|data| data.map().len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.read(|data| data.map().is_empty())
    }

    pub fn contains_key(&self, key: &str) -> Result<bool> {
        self.read(|data| data.map().contains_key(key))
    }

    pub fn keys(&self) -> Result<Vec<String>> {
        self.read(|data| data.map().keys().map(str::to_string).collect())
    }

    /// A snapshot of the whole value tree.
    pub fn to_map(&self) -> Result<ValueMap> {
        self.read(|data| data.map().clone())
    }

    pub fn sorter(&self) -> Result<SortValue> {
        self.read(|data| data.sorter().clone())
    }

    pub fn secondary_key(&self) -> Result<Option<String>> {
        self.read(|data| data.secondary_key().map(str::to_string))
    }

    /// The record's tags; an unset tag list reads as empty.
    pub fn tags(&self) -> Result<Vec<String>> {
        self.read(|data| data.tags().to_vec())
    }

    // mutations

    pub fn put(&self, key: impl Into<String>, value: impl Into<Value>) -> Result<Option<Value>> {
        let (key, value) = (key.into(), value.into());
        self.mutate(None, |data| data.map_mut().insert(key, value))
    }

    pub fn put_then(
        &self,
        key: impl Into<String>,
        value: impl Into<Value>,
        callback: impl FnOnce() + Send + 'static,
    ) -> Result<Option<Value>> {
        let (key, value) = (key.into(), value.into());
        self.mutate(Some(Box::new(callback)), |data| {
            data.map_mut().insert(key, value)
        })
    }

    pub fn put_all(&self, entries: ValueMap) -> Result<()> {
        self.mutate(None, |data| {
            for (k, v) in entries.iter() {
                data.map_mut().insert(k, v.clone());
            }
        })
    }

    pub fn remove_key(&self, key: &str) -> Result<Option<Value>> {
        self.mutate(None, |data| data.map_mut().remove(key))
    }

    pub fn clear(&self) -> Result<()> {
        self.mutate(None, |data| data.map_mut().clear())
    }

    /// Adds `by` to a numeric field, returning the new value. Non-numeric or
    /// absent fields are left alone. Arithmetic wraps on overflow.
    pub fn increase_by(&self, key: &str, by: i64) -> Result<Option<i64>> {
        self.mutate(None, |data| {
            let current = data.map().get(key).and_then(Value::as_int)?;
            let next = current.wrapping_add(by);
            data.map_mut().insert(key, next);
            Some(next)
        })
    }

    pub fn decrease_by(&self, key: &str, by: i64) -> Result<Option<i64>> {
        self.increase_by(key, by.wrapping_neg())
    }

    /// Sets a numeric field to `target`, returning the difference from its
    /// previous value. Arithmetic wraps on overflow.
    pub fn adjust_get_difference(&self, key: &str, target: i64) -> Result<Option<i64>> {
        self.mutate(None, |data| {
            let current = data.map().get(key).and_then(Value::as_int)?;
            data.map_mut().insert(key, target);
            Some(target.wrapping_sub(current))
        })
    }

    pub fn set_sorter(&self, sorter: impl Into<SortValue>) -> Result<()> {
        let sorter = sorter.into();
        self.mutate(None, |data| data.set_sorter(sorter))
    }

    pub fn set_sorter_then(
        &self,
        sorter: impl Into<SortValue>,
        callback: impl FnOnce() + Send + 'static,
    ) -> Result<()> {
        let sorter = sorter.into();
        self.mutate(Some(Box::new(callback)), |data| data.set_sorter(sorter))
    }

    pub fn set_secondary_key(&self, secondary_key: Option<String>) -> Result<()> {
        self.mutate(None, |data| data.set_secondary_key(secondary_key))
    }

    pub fn set_tags(&self, tags: Vec<String>) -> Result<()> {
        self.mutate(None, |data| data.set_tags(tags))
    }

    pub fn set_tags_then(
        &self,
        tags: Vec<String>,
        callback: impl FnOnce() + Send + 'static,
    ) -> Result<()> {
        self.mutate(Some(Box::new(callback)), |data| data.set_tags(tags))
    }

    /// Removes the record from the back-end immediately: any scheduled save
    /// is cancelled, the cross-process lease is taken, and the record leaves
    /// both indices. Later mutations through this handle stay in memory.
    pub fn remove(&self) -> Result<()> {
        self.category.persister().remove(&self.category, &self.holder)
    }
}

impl PartialEq for StoredMap {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.holder, &other.holder)
            || (self.category == other.category && self.key() == other.key())
    }
}

impl Eq for StoredMap {}

impl std::fmt::Debug for StoredMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredMap")
            .field("category", &self.category.name())
            .field("key", &self.key())
            .finish()
    }
}
