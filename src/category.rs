use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use crate::cache::HolderCache;
use crate::collator::{Collator, Locale};
use crate::driver::{Driver, Keys, Query};
use crate::error::Result;
use crate::map::StoredMap;
use crate::names;
use crate::persister::Persister;
use crate::sorter::{self, SortValue};

/// A named group of records sharing one back-end index.
///
/// The category owns the identity cache that guarantees one holder per key,
/// the ordered locales list, and the collator derived from it. Its name maps
/// 1:1 onto an internal index name through the persistent name directory, so
/// the binding survives restarts.
///
/// Handles are cheap clones of one shared category; equality is identity
/// within the store.
#[derive(Clone)]
pub struct Category {
    inner: Arc<CategoryInner>,
}

struct CategoryInner {
    name: String,
    index_name: String,
    locales_index: String,
    driver: Arc<dyn Driver>,
    persister: Arc<Persister>,
    locales: RwLock<Vec<Locale>>,
    collator: RwLock<Collator>,
    cache: HolderCache,
}

impl Category {
    pub(crate) fn open(
        driver: Arc<dyn Driver>,
        persister: Arc<Persister>,
        app_code: &str,
        name: &str,
    ) -> Result<Self> {
        let index_name = names::index_name(&driver, app_code, name)?;
        let locales_index = names::locales_index(app_code);

        let locales: Vec<Locale> = match driver.get(&index_name, &locales_index)? {
            Some(bytes) => bincode::deserialize(&bytes)?,
            None => Vec::new(),
        };
        let collator = Collator::new(&locales);

        tracing::debug!(category = %name, index = %index_name, "category opened");

        Ok(Self {
            inner: Arc::new(CategoryInner {
                name: name.to_string(),
                cache: HolderCache::new(&index_name),
                index_name,
                locales_index,
                driver,
                persister,
                locales: RwLock::new(locales),
                collator: RwLock::new(collator),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The derived back-end index name (basic Latin, length-limited).
    pub fn index_name(&self) -> &str {
        &self.inner.index_name
    }

    pub fn locales(&self) -> Vec<Locale> {
        self.inner.locales.read().unwrap().clone()
    }

    /// Replaces the category locales, persists them and rebuilds the
    /// collator. Existing sort keys are not re-collated.
    pub fn set_locales(&self, locales: &[Locale]) -> Result<()> {
        let bytes = bincode::serialize(&locales.to_vec())?;
        self.inner.driver.put_primary(
            &self.inner.index_name,
            &self.inner.locales_index,
            bytes,
            Box::new(|| {}),
            Box::new(|| {}),
        )?;
        *self.inner.locales.write().unwrap() = locales.to_vec();
        *self.inner.collator.write().unwrap() = Collator::new(locales);
        Ok(())
    }

    pub fn collator(&self) -> Collator {
        self.inner.collator.read().unwrap().clone()
    }

    pub(crate) fn driver(&self) -> &Arc<dyn Driver> {
        &self.inner.driver
    }

    pub(crate) fn persister(&self) -> &Arc<Persister> {
        &self.inner.persister
    }

    pub(crate) fn evict(&self, key: &str) {
        self.inner.cache.evict(key);
    }

    /// The record for `key`. Two concurrent calls for the same key return
    /// handles backed by the same holder.
    pub fn map(&self, key: &str) -> StoredMap {
        StoredMap::new(self.clone(), self.inner.cache.lookup(key))
    }

    /// All records of the category, lazily.
    ///
    /// The back-end listing is unioned with the keys currently held in the
    /// identity cache, so records mutated but not yet persisted show up too.
    pub fn maps(&self) -> Result<Maps> {
        let listed = self.inner.driver.list(&self.inner.index_name, &Query::default())?;
        Ok(Maps {
            category: self.clone(),
            listed,
            seen: HashSet::new(),
            cached: self.inner.cache.keys().into_iter(),
        })
    }

    /// Records matching the filter, in the driver's result order. Filtered
    /// listings reflect the back-end index only.
    pub fn maps_where(&self, lookup: &Lookup) -> Result<Vec<StoredMap>> {
        let query = lookup.to_query(self);
        let keys = self.inner.driver.list(&self.inner.index_name, &query)?;
        Ok(keys.map(|key| self.map(&key)).collect())
    }

    pub fn count(&self) -> Result<u64> {
        self.inner.driver.count(&self.inner.index_name, &Query::default())
    }

    pub fn count_where(&self, lookup: &Lookup) -> Result<u64> {
        let query = lookup.to_query(self);
        self.inner.driver.count(&self.inner.index_name, &query)
    }

    /// Drops every record of the category from the back-end. In-memory
    /// handles are not touched; their next save recreates the record.
    pub fn remove_all(&self) -> Result<()> {
        self.inner.driver.remove_all(&self.inner.index_name)
    }
}

/// Categories compare by identity: one instance per name per store.
impl PartialEq for Category {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Category {}

impl std::fmt::Debug for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Category")
            .field("name", &self.inner.name)
            .field("index_name", &self.inner.index_name)
            .finish()
    }
}

/// Lazy record enumeration: back-end keys first, then cached-only keys.
pub struct Maps {
    category: Category,
    listed: Keys,
    seen: HashSet<String>,
    cached: std::vec::IntoIter<String>,
}

impl Iterator for Maps {
    type Item = StoredMap;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(key) = self.listed.next() {
            self.seen.insert(key.clone());
            return Some(self.category.map(&key));
        }
        loop {
            let key = self.cached.next()?;
            if self.seen.insert(key.clone()) {
                return Some(self.category.map(&key));
            }
        }
    }
}

/// Filter set for [`Category::maps_where`] and [`Category::count_where`].
/// Sorter bounds are given as plain sort values and encoded with the
/// category collator; the text query goes to the driver verbatim.
#[derive(Debug, Clone, Default)]
pub struct Lookup {
    text: Option<String>,
    min_sorter: Option<SortValue>,
    max_sorter: Option<SortValue>,
    descending: bool,
    tags: Option<Vec<String>>,
    from: Option<usize>,
    size: Option<usize>,
}

impl Lookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(mut self, query: impl Into<String>) -> Self {
        self.text = Some(query.into());
        self
    }

    pub fn min_sorter(mut self, min: impl Into<SortValue>) -> Self {
        self.min_sorter = Some(min.into());
        self
    }

    pub fn max_sorter(mut self, max: impl Into<SortValue>) -> Self {
        self.max_sorter = Some(max.into());
        self
    }

    pub fn descending(mut self) -> Self {
        self.descending = true;
        self
    }

    pub fn any_of_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = Some(tags);
        self
    }

    pub fn page(mut self, from: usize, size: usize) -> Self {
        self.from = Some(from);
        self.size = Some(size);
        self
    }

    fn to_query(&self, category: &Category) -> Query {
        let collator = category.collator();
        let max_len = category.driver().max_sorter_len();
        let encode = |v: &SortValue| sorter::sorter_bytes(v, &collator, max_len);
        Query {
            text: self.text.clone(),
            min_sorter: self.min_sorter.as_ref().map(encode),
            max_sorter: self.max_sorter.as_ref().map(encode),
            descending: self.descending,
            tags: self.tags.clone(),
            from: self.from,
            size: self.size,
        }
    }
}
