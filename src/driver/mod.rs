pub mod memory;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use crate::collator::Locale;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::value::ValueMap;

/// Completion signal handed to a driver call. Drivers may invoke it inline or
/// from their own threads; the library only relies on the documented order of
/// delivery per save.
pub type Callback = Box<dyn FnOnce() + Send>;

/// A lazy, finite sequence of record keys. Dropping it releases whatever
/// back-end resources (cursors, scrolls) the listing holds.
pub type Keys = Box<dyn Iterator<Item = String> + Send>;

/// Filter combination for listing and counting keys in an index. All parts
/// are optional and compose.
#[derive(Debug, Clone, Default)]
pub struct Query {
    /// Free-text query, passed to the back-end verbatim.
    pub text: Option<String>,
    /// Sort-byte range, inclusive bounds.
    pub min_sorter: Option<Vec<u8>>,
    pub max_sorter: Option<Vec<u8>>,
    /// Reverse the sort-byte order of the result.
    pub descending: bool,
    /// Match records carrying any of these tags.
    pub tags: Option<Vec<String>>,
    /// Pagination offset and page size, applied after the other filters.
    pub from: Option<usize>,
    pub size: Option<usize>,
}

/// Capability interface a back-end connector implements.
///
/// One instance represents one open connection. Every `index` argument is
/// guaranteed to contain only basic Latin letters, digits and underscores,
/// and to be no longer than [`Driver::max_index_name_len`]; the library
/// shortens and encodes user names before they reach the driver. Drivers
/// create indices on first use.
///
/// A record write is two-staged: [`Driver::put_primary`] stores the opaque
/// payload blob and must fire `on_primary_done` once the blob is durably
/// accepted and `on_ready_for_secondary` once the driver is willing to index
/// (possibly the same moment); [`Driver::put_secondary`] then makes the
/// record searchable. The library never issues the secondary write before the
/// primary's completion signal.
pub trait Driver: Send + Sync {
    /// Maximum characters in an index name.
    fn max_index_name_len(&self) -> usize;

    /// Maximum characters in a record key.
    fn max_key_len(&self) -> usize;

    /// Maximum characters in a tag.
    fn max_tag_len(&self) -> usize;

    /// Maximum bytes in a sort value the back-end can index.
    fn max_sorter_len(&self) -> usize;

    /// Fetches the primary blob of a record, or `None` when absent.
    fn get(&self, key: &str, index: &str) -> Result<Option<Vec<u8>>>;

    fn put_primary(
        &self,
        key: &str,
        index: &str,
        value: Vec<u8>,
        on_primary_done: Callback,
        on_ready_for_secondary: Callback,
    ) -> Result<()>;

    #[allow(clippy::too_many_arguments)]
    fn put_secondary(
        &self,
        key: &str,
        index: &str,
        map: &ValueMap,
        locales: &[Locale],
        secondary_key: Option<&str>,
        sorter: &[u8],
        tags: &[String],
        on_done: Callback,
    ) -> Result<()>;

    /// Removes a record from both indices; `on_done` fires when the removal
    /// is durable.
    fn remove(&self, key: &str, index: &str, on_done: Callback) -> Result<()>;

    /// Lists keys matching `query`, ordered by sort bytes (then key) in the
    /// requested direction.
    fn list(&self, index: &str, query: &Query) -> Result<Keys>;

    /// Counts keys matching `query`, ignoring pagination.
    fn count(&self, index: &str, query: &Query) -> Result<u64>;

    /// Names of all indices existing for this connection.
    fn indices(&self) -> Result<Vec<String>>;

    /// Attempts to take the advisory lease on (key, index) for `ttl`.
    ///
    /// Returns a non-positive value when the lease was acquired, or the
    /// number of milliseconds after which the current lease auto-expires. An
    /// already expired lease is replaced and counts as acquired.
    fn try_lock(&self, key: &str, index: &str, ttl: Duration) -> Result<i64>;

    /// Releases the lease on (key, index) regardless of its remaining TTL.
    fn unlock(&self, key: &str, index: &str) -> Result<()>;

    /// Drops every record in the index.
    fn remove_all(&self, index: &str) -> Result<()>;

    /// Closes the connection. Called exactly once, when the store closes.
    fn close(&self) -> Result<()>;
}

/// Constructor for a driver: opens a connection from the configuration.
pub type DriverFactory = fn(&Config) -> Result<Arc<dyn Driver>>;

fn registry() -> &'static Mutex<HashMap<String, DriverFactory>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, DriverFactory>>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut map: HashMap<String, DriverFactory> = HashMap::new();
        map.insert("memory".to_string(), memory::open);
        Mutex::new(map)
    })
}

/// Makes a driver available under `name` for the `driver` configuration
/// property. The built-in `memory` driver is pre-registered.
pub fn register_driver(name: impl Into<String>, factory: DriverFactory) {
    registry().lock().unwrap().insert(name.into(), factory);
}

/// Opens the connection named by the configuration's `driver` property.
pub fn open_driver(config: &Config) -> Result<Arc<dyn Driver>> {
    let name = config.driver();
    let factory = registry()
        .lock()
        .unwrap()
        .get(name)
        .copied()
        .ok_or_else(|| Error::Config(format!("unknown driver: {name}")))?;
    factory(config)
}
