use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::{Error, Result};

/// String-keyed configuration for a store.
///
/// Two properties are interpreted by the library itself:
///
/// - `driver`: registry name of the back-end driver (default: `memory`)
/// - `applicationCode`: prefix for all index names created in the back-end
///   (default: `storedmap`)
///
/// Persister tuning keys (`persister.*`) are parsed into [`PersisterConfig`].
/// All other keys are passed through to the driver unchanged; drivers are
/// advised to namespace theirs (`memory.*`, `jdbc.*`, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Config {
    props: BTreeMap<String, String>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a property, builder style.
    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.props.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.props.get(key).map(String::as_str)
    }

    /// Registry name of the driver to open.
    pub fn driver(&self) -> &str {
        self.get("driver").unwrap_or("memory")
    }

    /// The prefix that distinguishes this application's indices in the
    /// underlying database.
    pub fn application_code(&self) -> &str {
        self.get("applicationCode").unwrap_or("storedmap")
    }

    pub fn persister(&self) -> Result<PersisterConfig> {
        let mut cfg = PersisterConfig::default();
        if let Some(ms) = self.millis("persister.scheduleDelayMs")? {
            cfg.schedule_delay = ms;
        }
        if let Some(ms) = self.millis("persister.rescheduleDelayMs")? {
            cfg.reschedule_delay = ms;
        }
        if let Some(ms) = self.millis("persister.lockTtlMs")? {
            cfg.lock_ttl = ms;
        }
        if let Some(n) = self.get("persister.workers") {
            cfg.workers = n
                .parse()
                .map_err(|_| Error::Config(format!("persister.workers is not a number: {n}")))?;
        }
        if cfg.schedule_delay.is_zero() || cfg.reschedule_delay.is_zero() {
            return Err(Error::Config(
                "persister delays must be strictly positive".to_string(),
            ));
        }
        Ok(cfg)
    }

    fn millis(&self, key: &str) -> Result<Option<Duration>> {
        match self.get(key) {
            None => Ok(None),
            Some(v) => v
                .parse()
                .map(|ms| Some(Duration::from_millis(ms)))
                .map_err(|_| Error::Config(format!("{key} is not a number of millis: {v}"))),
        }
    }
}

/// Timing knobs of the write path.
#[derive(Debug, Clone)]
pub struct PersisterConfig {
    /// Delay between the first mutation and the save task (coalescing window).
    pub schedule_delay: Duration,

    /// Delay applied when mutations arrive while a save task is pending; each
    /// one extends the window by this much.
    pub reschedule_delay: Duration,

    /// Lifetime of the cross-process lease taken for a save. Must exceed the
    /// longest expected persist latency.
    pub lock_ttl: Duration,

    /// Worker threads of the save executor.
    pub workers: usize,
}

impl Default for PersisterConfig {
    fn default() -> Self {
        Self {
            schedule_delay: Duration::from_secs(3),
            reschedule_delay: Duration::from_secs(2),
            lock_ttl: Duration::from_secs(100),
            workers: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::new();
        assert_eq!(config.driver(), "memory");
        assert_eq!(config.application_code(), "storedmap");

        let p = config.persister().unwrap();
        assert_eq!(p.schedule_delay, Duration::from_secs(3));
        assert_eq!(p.reschedule_delay, Duration::from_secs(2));
        assert_eq!(p.lock_ttl, Duration::from_secs(100));
        assert_eq!(p.workers, 5);
    }

    #[test]
    fn test_builder_and_passthrough() {
        let config = Config::new()
            .set("applicationCode", "acme")
            .set("persister.scheduleDelayMs", "120")
            .set("memory.namespace", "shared");

        assert_eq!(config.application_code(), "acme");
        assert_eq!(config.get("memory.namespace"), Some("shared"));
        let p = config.persister().unwrap();
        assert_eq!(p.schedule_delay, Duration::from_millis(120));
        // untouched keys keep their defaults
        assert_eq!(p.reschedule_delay, Duration::from_secs(2));
    }

    #[test]
    fn test_bad_numbers_are_config_errors() {
        let config = Config::new().set("persister.lockTtlMs", "soon");
        assert!(matches!(config.persister(), Err(Error::Config(_))));

        let config = Config::new().set("persister.scheduleDelayMs", "0");
        assert!(matches!(config.persister(), Err(Error::Config(_))));
    }

    #[test]
    fn test_config_equality_is_full_property_equality() {
        let a = Config::new().set("applicationCode", "x");
        let b = Config::new().set("applicationCode", "x");
        let c = Config::new().set("applicationCode", "y");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
