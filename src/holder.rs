use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::Duration;

use crate::data::MapData;
use crate::driver::Driver;
use crate::error::Result;

/// Identity of a holder across the process-wide persister tables.
pub(crate) type HolderKey = (String, String);

/// The canonical identity object for one (category, key) record.
///
/// The identity cache guarantees at most one live holder per pair, which
/// makes the holder's monitor the serialisation point for every operation
/// touching the record. The payload is referenced weakly: it exists while
/// some operation or pending save holds it, and is reloaded from the back-end
/// otherwise.
pub(crate) struct Holder {
    key: String,
    index_name: String,
    state: Mutex<HolderState>,
    monitor: Condvar,
}

pub(crate) struct HolderState {
    payload: Weak<Mutex<MapData>>,
    /// Set once the record has been removed; later mutations stay in memory.
    pub removed: bool,
}

impl Holder {
    pub fn new(key: &str, index_name: &str) -> Self {
        Self {
            key: key.to_string(),
            index_name: index_name.to_string(),
            state: Mutex::new(HolderState {
                payload: Weak::new(),
                removed: false,
            }),
            monitor: Condvar::new(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    pub fn pair(&self) -> HolderKey {
        (self.index_name.clone(), self.key.clone())
    }

    /// Enters the monitor.
    pub fn lock(&self) -> MutexGuard<'_, HolderState> {
        self.state.lock().unwrap()
    }

    /// Timed wait on the monitor; used while backing off on a contended
    /// lease and while waiting for an in-flight save to let go.
    pub fn wait_timeout<'a>(
        &self,
        guard: MutexGuard<'a, HolderState>,
        timeout: Duration,
    ) -> MutexGuard<'a, HolderState> {
        self.monitor.wait_timeout(guard, timeout).unwrap().0
    }

    /// Wakes every thread parked on this holder. Completion callbacks call
    /// this without holding the monitor.
    pub fn notify_all(&self) {
        self.monitor.notify_all();
    }

    /// Drops the weak payload slot so the next access reloads from the
    /// back-end.
    pub fn clear_payload(&self, state: &mut HolderState) {
        state.payload = Weak::new();
    }

    /// Load-or-create under the monitor: dereference the weak slot, read the
    /// primary blob on a miss, fall back to an empty payload for records that
    /// do not exist yet.
    pub fn load_payload(
        &self,
        state: &mut HolderState,
        driver: &Arc<dyn Driver>,
    ) -> Result<Arc<Mutex<MapData>>> {
        if let Some(payload) = state.payload.upgrade() {
            return Ok(payload);
        }

        let data = match driver.get(&self.key, &self.index_name)? {
            Some(bytes) => {
                tracing::debug!(key = %self.key, index = %self.index_name, "loaded record");
                bincode::deserialize(&bytes)?
            }
            None => {
                tracing::debug!(key = %self.key, index = %self.index_name, "new record");
                MapData::new()
            }
        };

        let payload = Arc::new(Mutex::new(data));
        state.payload = Arc::downgrade(&payload);
        Ok(payload)
    }
}
