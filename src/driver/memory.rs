use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use crossbeam_skiplist::SkipMap;
use dashmap::DashMap;
use itertools::Itertools as _;

use crate::collator::Locale;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::value::{Value, ValueMap};

use super::{Callback, Driver, Keys, Query};

/// In-memory back-end.
///
/// Connections opened with the same `memory.namespace` property share one
/// logical database, which is how tests exercise lease contention between
/// independent clients. Without a namespace every connection gets a private
/// database.
///
/// Driver-specific properties:
///
/// - `memory.namespace` — shared database name
/// - `memory.maxIndexNameLength`, `memory.maxKeyLength`,
///   `memory.maxTagLength`, `memory.maxSorterLength` — reported limits
/// - `memory.secondaryDelayMs` — defer the secondary-write completion signal
///   by this much, on a background thread
pub struct MemoryDriver {
    backend: Arc<Backend>,
    limits: Limits,
    secondary_delay: Duration,
}

#[derive(Debug, Clone)]
struct Limits {
    index_name: usize,
    key: usize,
    tag: usize,
    sorter: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            index_name: 200,
            key: 200,
            tag: 100,
            sorter: 64,
        }
    }
}

#[derive(Default)]
struct Backend {
    indices: DashMap<String, Arc<IndexData>>,
    stats: Stats,
}

#[derive(Default)]
struct IndexData {
    primary: SkipMap<String, Vec<u8>>,
    secondary: Mutex<HashMap<String, SecondaryEntry>>,
    leases: Mutex<HashMap<String, Instant>>,
}

#[derive(Debug, Clone, Default)]
struct SecondaryEntry {
    sorter: Vec<u8>,
    tags: Vec<String>,
    text: String,
}

/// Write counters, for asserting coalescing behaviour from tests.
#[derive(Default)]
pub struct Stats {
    primary_puts: AtomicU64,
    secondary_puts: AtomicU64,
    removes: AtomicU64,
}

impl Stats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::SeqCst);
    }
}

fn namespaces() -> &'static DashMap<String, Arc<Backend>> {
    static NAMESPACES: OnceLock<DashMap<String, Arc<Backend>>> = OnceLock::new();
    NAMESPACES.get_or_init(DashMap::new)
}

/// Driver-registry entry point.
pub fn open(config: &Config) -> Result<Arc<dyn Driver>> {
    Ok(MemoryDriver::connect(config)? as Arc<dyn Driver>)
}

impl MemoryDriver {
    /// Opens a connection; the concrete type additionally exposes the write
    /// counters used by timing-sensitive tests.
    pub fn connect(config: &Config) -> Result<Arc<MemoryDriver>> {
        let backend = match config.get("memory.namespace") {
            Some(ns) => namespaces()
                .entry(ns.to_string())
                .or_insert_with(|| Arc::new(Backend::default()))
                .clone(),
            None => Arc::new(Backend::default()),
        };

        let mut limits = Limits::default();
        if let Some(n) = parse_limit(config, "memory.maxIndexNameLength")? {
            limits.index_name = n;
        }
        if let Some(n) = parse_limit(config, "memory.maxKeyLength")? {
            limits.key = n;
        }
        if let Some(n) = parse_limit(config, "memory.maxTagLength")? {
            limits.tag = n;
        }
        if let Some(n) = parse_limit(config, "memory.maxSorterLength")? {
            limits.sorter = n;
        }

        let secondary_delay = match config.get("memory.secondaryDelayMs") {
            Some(v) => Duration::from_millis(v.parse().map_err(|_| {
                Error::Config(format!("memory.secondaryDelayMs is not a number: {v}"))
            })?),
            None => Duration::ZERO,
        };

        Ok(Arc::new(MemoryDriver {
            backend,
            limits,
            secondary_delay,
        }))
    }

    pub fn primary_puts(&self) -> u64 {
        self.backend.stats.primary_puts.load(Ordering::SeqCst)
    }

    pub fn secondary_puts(&self) -> u64 {
        self.backend.stats.secondary_puts.load(Ordering::SeqCst)
    }

    pub fn removes(&self) -> u64 {
        self.backend.stats.removes.load(Ordering::SeqCst)
    }

    fn index(&self, name: &str) -> Arc<IndexData> {
        self.backend
            .indices
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(IndexData::default()))
            .clone()
    }

    /// Keys matching the query, fully materialised in result order.
    fn select(&self, index: &str, query: &Query) -> Vec<String> {
        let data = self.index(index);
        let secondary = data.secondary.lock().unwrap();

        let mut matched: Vec<(Vec<u8>, String)> = Vec::new();
        for entry in data.primary.iter() {
            let key = entry.key().clone();
            let meta = secondary.get(&key).cloned().unwrap_or_default();
            if !matches(&meta, query) {
                continue;
            }
            matched.push((meta.sorter, key));
        }
        drop(secondary);

        let ordered = matched.into_iter().sorted_by(|a, b| {
            let cmp = a.cmp(b);
            if query.descending {
                cmp.reverse()
            } else {
                cmp
            }
        });

        ordered.map(|(_, key)| key).collect()
    }
}

fn matches(meta: &SecondaryEntry, query: &Query) -> bool {
    if let Some(text) = &query.text {
        if !meta.text.to_lowercase().contains(&text.to_lowercase()) {
            return false;
        }
    }
    if let Some(min) = &query.min_sorter {
        if meta.sorter.as_slice() < min.as_slice() {
            return false;
        }
    }
    if let Some(max) = &query.max_sorter {
        if meta.sorter.as_slice() > max.as_slice() {
            return false;
        }
    }
    if let Some(tags) = &query.tags {
        if !tags.iter().any(|t| meta.tags.contains(t)) {
            return false;
        }
    }
    true
}

fn paginate(keys: Vec<String>, query: &Query) -> Vec<String> {
    let from = query.from.unwrap_or(0);
    let size = query.size.unwrap_or(usize::MAX);
    keys.into_iter().skip(from).take(size).collect()
}

fn parse_limit(config: &Config, key: &str) -> Result<Option<usize>> {
    match config.get(key) {
        None => Ok(None),
        Some(v) => v
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("{key} is not a number: {v}"))),
    }
}

impl Driver for MemoryDriver {
    fn max_index_name_len(&self) -> usize {
        self.limits.index_name
    }

    fn max_key_len(&self) -> usize {
        self.limits.key
    }

    fn max_tag_len(&self) -> usize {
        self.limits.tag
    }

    fn max_sorter_len(&self) -> usize {
        self.limits.sorter
    }

    fn get(&self, key: &str, index: &str) -> Result<Option<Vec<u8>>> {
        let data = self.index(index);
        Ok(data.primary.get(key).map(|e| e.value().clone()))
    }

    fn put_primary(
        &self,
        key: &str,
        index: &str,
        value: Vec<u8>,
        on_primary_done: Callback,
        on_ready_for_secondary: Callback,
    ) -> Result<()> {
        let data = self.index(index);
        data.primary.insert(key.to_string(), value);
        Stats::bump(&self.backend.stats.primary_puts);
        on_primary_done();
        on_ready_for_secondary();
        Ok(())
    }

    fn put_secondary(
        &self,
        key: &str,
        index: &str,
        map: &ValueMap,
        _locales: &[Locale],
        secondary_key: Option<&str>,
        sorter: &[u8],
        tags: &[String],
        on_done: Callback,
    ) -> Result<()> {
        let mut text = String::new();
        Value::Map(map.clone()).collect_text(&mut text);
        if let Some(sk) = secondary_key {
            text.push(' ');
            text.push_str(sk);
        }

        let entry = SecondaryEntry {
            sorter: sorter.to_vec(),
            tags: tags.to_vec(),
            text,
        };

        let data = self.index(index);
        data.secondary.lock().unwrap().insert(key.to_string(), entry);
        Stats::bump(&self.backend.stats.secondary_puts);

        if self.secondary_delay.is_zero() {
            on_done();
        } else {
            let delay = self.secondary_delay;
            std::thread::spawn(move || {
                std::thread::sleep(delay);
                on_done();
            });
        }
        Ok(())
    }

    fn remove(&self, key: &str, index: &str, on_done: Callback) -> Result<()> {
        let data = self.index(index);
        data.primary.remove(key);
        data.secondary.lock().unwrap().remove(key);
        Stats::bump(&self.backend.stats.removes);
        on_done();
        Ok(())
    }

    fn list(&self, index: &str, query: &Query) -> Result<Keys> {
        let keys = paginate(self.select(index, query), query);
        Ok(Box::new(keys.into_iter()))
    }

    fn count(&self, index: &str, query: &Query) -> Result<u64> {
        Ok(self.select(index, query).len() as u64)
    }

    fn indices(&self) -> Result<Vec<String>> {
        Ok(self
            .backend
            .indices
            .iter()
            .map(|e| e.key().clone())
            .collect())
    }

    fn try_lock(&self, key: &str, index: &str, ttl: Duration) -> Result<i64> {
        let data = self.index(index);
        let mut leases = data.leases.lock().unwrap();
        let now = Instant::now();
        if let Some(deadline) = leases.get(key) {
            if *deadline > now {
                let left = deadline.saturating_duration_since(now).as_millis() as i64;
                return Ok(left.max(1));
            }
        }
        leases.insert(key.to_string(), now + ttl);
        Ok(0)
    }

    fn unlock(&self, key: &str, index: &str) -> Result<()> {
        let data = self.index(index);
        data.leases.lock().unwrap().remove(key);
        Ok(())
    }

    fn remove_all(&self, index: &str) -> Result<()> {
        let data = self.index(index);
        for entry in data.primary.iter() {
            data.primary.remove(entry.key());
        }
        data.secondary.lock().unwrap().clear();
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver() -> Arc<MemoryDriver> {
        MemoryDriver::connect(&Config::new()).unwrap()
    }

    fn noop() -> Callback {
        Box::new(|| {})
    }

    fn put(d: &MemoryDriver, key: &str, index: &str, sorter: &[u8], tags: &[String], text: &str) {
        d.put_primary(key, index, b"blob".to_vec(), noop(), noop())
            .unwrap();
        let mut map = ValueMap::new();
        map.insert("body", text);
        d.put_secondary(key, index, &map, &[], None, sorter, tags, noop())
            .unwrap();
    }

    #[test]
    fn test_primary_round_trip() {
        let d = driver();
        assert_eq!(d.get("k", "idx").unwrap(), None);
        d.put_primary("k", "idx", vec![1, 2, 3], noop(), noop())
            .unwrap();
        assert_eq!(d.get("k", "idx").unwrap(), Some(vec![1, 2, 3]));

        let removed = Arc::new(AtomicU64::new(0));
        let seen = removed.clone();
        d.remove(
            "k",
            "idx",
            Box::new(move || {
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();
        assert_eq!(d.get("k", "idx").unwrap(), None);
        assert_eq!(removed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_callbacks_fire_in_order() {
        let d = driver();
        let order = Arc::new(Mutex::new(Vec::new()));
        let (a, b) = (order.clone(), order.clone());
        d.put_primary(
            "k",
            "idx",
            vec![],
            Box::new(move || a.lock().unwrap().push("primary")),
            Box::new(move || b.lock().unwrap().push("secondary-ready")),
        )
        .unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["primary", "secondary-ready"]);
    }

    #[test]
    fn test_list_sorts_by_sorter_bytes() {
        let d = driver();
        put(&d, "c", "idx", b"30", &[], "");
        put(&d, "a", "idx", b"10", &[], "");
        put(&d, "b", "idx", b"20", &[], "");

        let keys: Vec<_> = d.list("idx", &Query::default()).unwrap().collect();
        assert_eq!(keys, vec!["a", "b", "c"]);

        let desc = Query {
            descending: true,
            ..Query::default()
        };
        let keys: Vec<_> = d.list("idx", &desc).unwrap().collect();
        assert_eq!(keys, vec!["c", "b", "a"]);
    }

    #[test]
    fn test_range_filter_is_inclusive() {
        let d = driver();
        for (k, s) in [("a", "10"), ("b", "20"), ("c", "30"), ("d", "40")] {
            put(&d, k, "idx", s.as_bytes(), &[], "");
        }
        let q = Query {
            min_sorter: Some(b"20".to_vec()),
            max_sorter: Some(b"30".to_vec()),
            ..Query::default()
        };
        let keys: Vec<_> = d.list("idx", &q).unwrap().collect();
        assert_eq!(keys, vec!["b", "c"]);
        assert_eq!(d.count("idx", &q).unwrap(), 2);
    }

    #[test]
    fn test_tag_filter_matches_any() {
        let d = driver();
        put(&d, "a", "idx", b"", &["red".to_string()], "");
        put(&d, "b", "idx", b"", &["blue".to_string()], "");
        put(&d, "c", "idx", b"", &["red".to_string(), "blue".to_string()], "");

        let q = Query {
            tags: Some(vec!["red".to_string()]),
            ..Query::default()
        };
        let keys: Vec<_> = d.list("idx", &q).unwrap().collect();
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&"a".to_string()));
        assert!(keys.contains(&"c".to_string()));
    }

    #[test]
    fn test_text_filter() {
        let d = driver();
        put(&d, "a", "idx", b"", &[], "the quick brown fox");
        put(&d, "b", "idx", b"", &[], "lazy dog");

        let q = Query {
            text: Some("Quick".to_string()),
            ..Query::default()
        };
        let keys: Vec<_> = d.list("idx", &q).unwrap().collect();
        assert_eq!(keys, vec!["a"]);
    }

    #[test]
    fn test_pagination() {
        let d = driver();
        for i in 0..10 {
            put(&d, &format!("k{i}"), "idx", format!("{i}").as_bytes(), &[], "");
        }
        let q = Query {
            from: Some(3),
            size: Some(2),
            ..Query::default()
        };
        let keys: Vec<_> = d.list("idx", &q).unwrap().collect();
        assert_eq!(keys, vec!["k3", "k4"]);
        // counts ignore pagination
        assert_eq!(d.count("idx", &q).unwrap(), 10);
    }

    #[test]
    fn test_lease_ttl_and_unlock() {
        let d = driver();
        assert!(d.try_lock("k", "idx", Duration::from_millis(80)).unwrap() <= 0);
        let hint = d.try_lock("k", "idx", Duration::from_millis(80)).unwrap();
        assert!(hint > 0 && hint <= 80);

        // expired leases are replaced and count as acquired
        std::thread::sleep(Duration::from_millis(100));
        assert!(d.try_lock("k", "idx", Duration::from_millis(80)).unwrap() <= 0);

        d.unlock("k", "idx").unwrap();
        assert!(d.try_lock("k", "idx", Duration::from_secs(10)).unwrap() <= 0);
    }

    #[test]
    fn test_namespaces_share_state() {
        let config = Config::new().set("memory.namespace", "shared-test-ns");
        let a = MemoryDriver::connect(&config).unwrap();
        let b = MemoryDriver::connect(&config).unwrap();

        a.put_primary("k", "idx", vec![7], noop(), noop()).unwrap();
        assert_eq!(b.get("k", "idx").unwrap(), Some(vec![7]));

        // a lease taken through one connection blocks the other
        assert!(a.try_lock("k", "idx", Duration::from_secs(10)).unwrap() <= 0);
        assert!(b.try_lock("k", "idx", Duration::from_secs(10)).unwrap() > 0);

        let isolated = MemoryDriver::connect(&Config::new()).unwrap();
        assert_eq!(isolated.get("k", "idx").unwrap(), None);
    }

    #[test]
    fn test_remove_all() {
        let d = driver();
        put(&d, "a", "idx", b"", &[], "");
        put(&d, "b", "idx", b"", &[], "");
        d.remove_all("idx").unwrap();
        assert_eq!(d.count("idx", &Query::default()).unwrap(), 0);
        assert_eq!(d.get("a", "idx").unwrap(), None);
    }
}
