use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use crate::category::Category;
use crate::config::Config;
use crate::driver::{self, Driver};
use crate::error::{Error, Result};
use crate::names;
use crate::persister::Persister;

/// A database connection plus everything that hangs off it: the application
/// code, the driver, the category registry and the write-path persister.
///
/// Stores are process-wide: [`get_store`] returns the same instance for the
/// same configuration until it is closed. Handles are cheap clones of one
/// shared store.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    config: Config,
    app_code: String,
    driver: Arc<dyn Driver>,
    persister: Arc<Persister>,
    categories: Mutex<HashMap<String, Category>>,
    closed: AtomicBool,
}

fn registry() -> &'static Mutex<HashMap<Config, Store>> {
    static STORES: OnceLock<Mutex<HashMap<Config, Store>>> = OnceLock::new();
    STORES.get_or_init(|| Mutex::new(HashMap::new()))
}

/// The store for `config`, created on first request. Identical
/// configurations share one store.
pub fn get_store(config: Config) -> Result<Store> {
    let mut stores = registry().lock().unwrap();
    if let Some(existing) = stores.get(&config) {
        return Ok(existing.clone());
    }
    let store = Store::create(config.clone())?;
    stores.insert(config, store.clone());
    Ok(store)
}

impl Store {
    fn create(config: Config) -> Result<Self> {
        let driver = driver::open_driver(&config)?;
        let persister = Arc::new(Persister::new(Arc::clone(&driver), config.persister()?)?);
        let app_code = config.application_code().to_string();

        tracing::info!(application = %app_code, driver = %config.driver(), "store opened");

        Ok(Self {
            inner: Arc::new(StoreInner {
                config,
                app_code,
                driver,
                persister,
                categories: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// The prefix distinguishing this application's indices in the back-end.
    pub fn application_code(&self) -> &str {
        &self.inner.app_code
    }

    /// The named category, created on first request. The name is bound to
    /// its internal index name for the lifetime of the store and, through
    /// the name directory, across restarts.
    pub fn category(&self, name: &str) -> Result<Category> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        let mut categories = self.inner.categories.lock().unwrap();
        if let Some(existing) = categories.get(name) {
            return Ok(existing.clone());
        }
        let category = Category::open(
            Arc::clone(&self.inner.driver),
            Arc::clone(&self.inner.persister),
            &self.inner.app_code,
            name,
        )?;
        categories.insert(name.to_string(), category.clone());
        Ok(category)
    }

    /// Every category of this application present in the back-end, by
    /// inverse-translating the index names.
    pub fn categories(&self) -> Result<Vec<Category>> {
        let mut found = Vec::new();
        for index in self.inner.driver.indices()? {
            if let Some(name) = names::category_name(&self.inner.driver, &self.inner.app_code, &index)?
            {
                found.push(self.category(&name)?);
            }
        }
        Ok(found)
    }

    /// Closes the store: drains the persister, closes the driver connection
    /// and drops the store from the process registry. Only the first call
    /// does anything.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!(application = %self.inner.app_code, "closing store");
        self.inner.persister.stop();
        self.inner.driver.close()?;
        registry().lock().unwrap().remove(&self.inner.config);
        Ok(())
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("application_code", &self.inner.app_code)
            .field("driver", &self.inner.config.driver())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collator::Locale;
    use crate::sorter::SortValue;
    use std::sync::mpsc;
    use std::time::Duration;

    /// Config with millisecond persister windows and a namespaced memory
    /// back-end, so scenarios run fast and can be observed from a second
    /// connection.
    fn fast_config(namespace: &str) -> Config {
        Config::new()
            .set("memory.namespace", namespace)
            .set("persister.scheduleDelayMs", "60")
            .set("persister.rescheduleDelayMs", "40")
    }

    #[test]
    fn test_same_config_yields_the_same_store() {
        let config = fast_config("store-identity");
        let a = get_store(config.clone()).unwrap();
        let b = get_store(config).unwrap();
        assert!(Arc::ptr_eq(&a.inner, &b.inner));

        let other = get_store(fast_config("store-identity-other")).unwrap();
        assert!(!Arc::ptr_eq(&a.inner, &other.inner));

        a.close().unwrap();
        other.close().unwrap();
    }

    #[test]
    fn test_unknown_driver_fails_at_creation() {
        let config = Config::new().set("driver", "jdbc");
        assert!(matches!(get_store(config), Err(Error::Config(_))));
    }

    #[test]
    fn test_categories_are_stable_per_name() {
        let store = get_store(fast_config("store-categories")).unwrap();
        let a = store.category("articles").unwrap();
        let b = store.category("articles").unwrap();
        assert!(a == b);
        assert_eq!(a.name(), "articles");
        store.close().unwrap();
    }

    #[test]
    fn test_close_is_idempotent_and_final() {
        let store = get_store(fast_config("store-close")).unwrap();
        store.close().unwrap();
        store.close().unwrap();
        assert!(matches!(store.category("c"), Err(Error::Closed)));
    }

    #[test]
    fn test_close_drains_pending_saves() {
        let namespace = "store-drain";
        let store = get_store(fast_config(namespace)).unwrap();
        let cat = store.category("notes").unwrap();
        cat.map("n1").put("text", "do not lose me").unwrap();
        // close before the coalescing window has elapsed
        store.close().unwrap();

        // a fresh store over the same back-end sees the record
        let reopened = get_store(fast_config(namespace).set("applicationCode", "storedmap")).unwrap();
        let cat = reopened.category("notes").unwrap();
        assert_eq!(
            cat.map("n1").get("text").unwrap(),
            Some("do not lose me".into())
        );
        reopened.close().unwrap();
    }

    #[test]
    fn test_mutations_after_close_are_rejected() {
        let store = get_store(fast_config("store-closed-mutation")).unwrap();
        let cat = store.category("c").unwrap();
        let map = cat.map("k");
        store.close().unwrap();
        assert!(matches!(map.put("a", 1i64), Err(Error::Closed)));
    }

    #[test]
    fn test_category_directory_round_trip() {
        // force the directory path with a tight index-name limit and
        // non-Latin names on both sides of the candidate
        let config = fast_config("store-directory")
            .set("applicationCode", "My App!")
            .set("memory.maxIndexNameLength", "24");
        let store = get_store(config).unwrap();
        let cat = store.category("Статьи").unwrap();

        let (tx, rx) = mpsc::channel();
        cat.map("a1")
            .put_then("title", "заголовок", move || tx.send(()).unwrap())
            .unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let names: Vec<String> = store
            .categories()
            .unwrap()
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        assert!(names.contains(&"Статьи".to_string()), "got {names:?}");

        // the binding is stable: reopening the category yields the same index
        let again = store.category("Статьи").unwrap();
        assert_eq!(again.index_name(), cat.index_name());
        store.close().unwrap();
    }

    #[test]
    fn test_locales_persist_across_stores() {
        let namespace = "store-locales";
        let store = get_store(fast_config(namespace)).unwrap();
        let cat = store.category("people").unwrap();
        let locales = vec![Locale::parse("de_DE").unwrap()];
        cat.set_locales(&locales).unwrap();
        store.close().unwrap();

        let reopened =
            get_store(fast_config(namespace).set("applicationCode", "storedmap")).unwrap();
        let cat = reopened.category("people").unwrap();
        assert_eq!(cat.locales(), locales);
        reopened.close().unwrap();
    }

    #[test]
    fn test_sorted_and_filtered_listing() {
        let store = get_store(fast_config("store-queries")).unwrap();
        let cat = store.category("books").unwrap();

        let (tx, rx) = mpsc::channel();
        for (key, title, year, tag) in [
            ("b1", "Der Apfel", 1990i64, "de"),
            ("b2", "Zebra", 2005, "en"),
            ("b3", "Mango", 1998, "en"),
        ] {
            let map = cat.map(key);
            let tx = tx.clone();
            map.put("title", title).unwrap();
            map.set_sorter(year).unwrap();
            map.set_tags_then(vec![tag.to_string()], move || tx.send(()).unwrap())
                .unwrap();
        }
        for _ in 0..3 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }

        // sort-range scan over the numeric sorter
        let mid = cat
            .maps_where(
                &crate::category::Lookup::new()
                    .min_sorter(1995i64)
                    .max_sorter(2010i64),
            )
            .unwrap();
        let keys: Vec<_> = mid.iter().map(|m| m.key().to_string()).collect();
        assert_eq!(keys, vec!["b3", "b2"]);

        // descending flips the order
        let desc = cat
            .maps_where(
                &crate::category::Lookup::new()
                    .min_sorter(1995i64)
                    .max_sorter(2010i64)
                    .descending(),
            )
            .unwrap();
        let keys: Vec<_> = desc.iter().map(|m| m.key().to_string()).collect();
        assert_eq!(keys, vec!["b2", "b3"]);

        // tag filtering
        assert_eq!(
            cat.count_where(&crate::category::Lookup::new().any_of_tags(vec!["en".to_string()]))
                .unwrap(),
            2
        );

        // pagination applies after the other filters
        let page = cat
            .maps_where(
                &crate::category::Lookup::new().min_sorter(1900i64).page(1, 1),
            )
            .unwrap();
        let keys: Vec<_> = page.iter().map(|m| m.key().to_string()).collect();
        assert_eq!(keys, vec!["b3"]);

        // verbatim text query, answered by the driver
        let found = cat
            .maps_where(&crate::category::Lookup::new().text("apfel"))
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].key(), "b1");

        assert_eq!(cat.count().unwrap(), 3);
        store.close().unwrap();
    }

    #[test]
    fn test_enumeration_includes_unsaved_records() {
        // a roomy window so the fresh record is reliably still unsaved when
        // the listing runs
        let config = fast_config("store-enumeration").set("persister.scheduleDelayMs", "400");
        let store = get_store(config).unwrap();
        let cat = store.category("drafts").unwrap();

        let saved_rx = {
            let (tx, rx) = mpsc::channel();
            cat.map("old").put_then("x", 1i64, move || tx.send(()).unwrap()).unwrap();
            rx
        };
        saved_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // mutate without waiting for the save; the back-end cannot know yet
        let fresh = cat.map("new");
        fresh.put("x", 1i64).unwrap();
        assert_eq!(cat.count().unwrap(), 1);

        let keys: Vec<_> = cat.maps().unwrap().map(|m| m.key().to_string()).collect();
        assert!(keys.contains(&"old".to_string()));
        assert!(keys.contains(&"new".to_string()), "got {keys:?}");
        assert_eq!(keys.len(), 2);
        store.close().unwrap();
    }

    #[test]
    fn test_remove_all_empties_the_category() {
        let store = get_store(fast_config("store-remove-all")).unwrap();
        let cat = store.category("tmp").unwrap();
        let (tx, rx) = mpsc::channel();
        cat.map("a").put_then("x", 1i64, move || tx.send(()).unwrap()).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(cat.count().unwrap(), 1);

        cat.remove_all().unwrap();
        assert_eq!(cat.count().unwrap(), 0);
        store.close().unwrap();
    }

    #[test]
    fn test_sorting_follows_category_locales() {
        let store = get_store(fast_config("store-collation")).unwrap();
        let cat = store.category("words").unwrap();
        cat.set_locales(&[Locale::parse("sv").unwrap()]).unwrap();

        let (tx, rx) = mpsc::channel();
        for (key, word) in [("w1", "zebra"), ("w2", "\u{00E5}r")] {
            let tx = tx.clone();
            let map = cat.map(key);
            map.set_sorter(SortValue::Text(word.to_string())).unwrap();
            map.put_then("w", word, move || tx.send(()).unwrap()).unwrap();
        }
        for _ in 0..2 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }

        // Swedish: å sorts after z
        let keys: Vec<_> = cat
            .maps_where(&crate::category::Lookup::new().min_sorter(""))
            .unwrap()
            .iter()
            .map(|m| m.key().to_string())
            .collect();
        assert_eq!(keys, vec!["w1", "w2"]);
        store.close().unwrap();
    }
}
