use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use dashmap::DashMap;
use tokio::runtime::Runtime;

use crate::category::Category;
use crate::config::PersisterConfig;
use crate::data::MapData;
use crate::driver::{Callback, Driver};
use crate::error::{Error, Result};
use crate::holder::{Holder, HolderKey, HolderState};
use crate::sorter;

/// Ceiling and floor for one lease back-off wait; the driver's hint is
/// clamped between them.
const LEASE_RETRY_CAP: Duration = Duration::from_secs(2);
const LEASE_RETRY_FLOOR: Duration = Duration::from_millis(5);

const DRAIN_POLL: Duration = Duration::from_millis(100);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(180);

/// The write path: batches rapid in-memory mutations of one record into at
/// most one in-flight save, holding the cross-process lease on the record
/// from the moment a save is scheduled until its secondary write lands.
///
/// A record's save lives in two process-wide tables. `in_work` holds it while
/// the save is pending or its primary write is in flight; mutations arriving
/// in that window extend it instead of scheduling anew. `in_long_work` holds
/// it for as long as the lease is held, which outlasts `in_work` by the gap
/// between the primary and secondary writes; mutations arriving in that gap
/// ride the existing lease as a follow-up save.
pub(crate) struct Persister {
    shared: Arc<Shared>,
    runtime: Mutex<Option<Runtime>>,
}

struct Shared {
    driver: Arc<dyn Driver>,
    cfg: PersisterConfig,
    in_work: DashMap<HolderKey, Arc<SaveEntry>>,
    in_long_work: DashMap<HolderKey, Arc<SaveEntry>>,
    handle: tokio::runtime::Handle,
    closed: AtomicBool,
}

struct SaveEntry {
    holder: Arc<Holder>,
    category: Category,
    payload: Arc<Mutex<MapData>>,
    state: Mutex<SaveState>,
}

#[derive(Default)]
struct SaveState {
    /// A mutation arrived while the save was pending; run again later
    /// instead of writing now.
    reschedule: bool,
    /// The record is being removed; the save must not touch the driver.
    need_remove: bool,
    /// A remove is waiting for the lease; skip the secondary write and let
    /// the lease go.
    cancel_save: bool,
    /// The cross-process lease is ours. Set at schedule time for ordinary
    /// saves, inherited for follow-ups, acquired on first run otherwise.
    lease_held: bool,
    /// After-persist callbacks, run when this save's secondary write lands.
    callbacks: Vec<Callback>,
    /// A save to run under the same lease once this one completes.
    followup: Option<Arc<SaveEntry>>,
}

impl Persister {
    pub fn new(driver: Arc<dyn Driver>, cfg: PersisterConfig) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(cfg.workers.max(1))
            .thread_name("storedmap-indexer")
            .enable_time()
            .build()
            .map_err(|e| Error::Config(format!("failed to start persister executor: {e}")))?;

        let shared = Arc::new(Shared {
            driver,
            cfg,
            in_work: DashMap::new(),
            in_long_work: DashMap::new(),
            handle: runtime.handle().clone(),
            closed: AtomicBool::new(false),
        });

        Ok(Self {
            shared,
            runtime: Mutex::new(Some(runtime)),
        })
    }

    /// Registers a mutation of the record for eventual persistence and
    /// applies it under the holder monitor.
    ///
    /// Exactly one of three things happens: a pending save absorbs the
    /// mutation and extends its window; a save holding the lease past its
    /// primary write gains a follow-up; or the lease is acquired and a fresh
    /// save is scheduled after the coalescing delay. The mutation closure
    /// runs against the live payload in every case, so the save task picks
    /// it up when it snapshots.
    pub fn schedule<R>(
        &self,
        category: &Category,
        holder: &Arc<Holder>,
        callback: Option<Callback>,
        mutate: impl FnOnce(&mut MapData) -> R,
    ) -> Result<R> {
        let shared = &self.shared;
        if shared.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }

        let hk = holder.pair();
        let mut mon = holder.lock();

        // window still open: absorb
        if let Some(entry) = shared.in_work.get(&hk).map(|e| Arc::clone(e.value())) {
            let mut st = entry.state.lock().unwrap();
            st.reschedule = true;
            if let Some(cb) = callback {
                st.callbacks.push(cb);
            }
            drop(st);
            let mut payload = entry.payload.lock().unwrap();
            return Ok(mutate(&mut payload));
        }

        // primary written, lease still held for the secondary: ride it
        if let Some(long) = shared.in_long_work.get(&hk).map(|e| Arc::clone(e.value())) {
            let follow = {
                let mut st = long.state.lock().unwrap();
                match &st.followup {
                    Some(f) => Arc::clone(f),
                    None => {
                        let f = Arc::new(SaveEntry {
                            holder: Arc::clone(holder),
                            category: category.clone(),
                            payload: Arc::clone(&long.payload),
                            state: Mutex::new(SaveState {
                                lease_held: true,
                                ..SaveState::default()
                            }),
                        });
                        st.followup = Some(Arc::clone(&f));
                        f
                    }
                }
            };
            if let Some(cb) = callback {
                follow.state.lock().unwrap().callbacks.push(cb);
            }
            let mut payload = follow.payload.lock().unwrap();
            return Ok(mutate(&mut payload));
        }

        // fresh save: lease first, then open the coalescing window
        mon = acquire_lease(shared, holder, mon)?;
        let payload = holder.load_payload(&mut mon, &shared.driver)?;

        if mon.removed {
            // the record is gone from the back-end; the mutation stays in
            // memory only, and the lease we just took is of no use
            let _ = shared.driver.unlock(holder.key(), holder.index_name());
            let mut p = payload.lock().unwrap();
            return Ok(mutate(&mut p));
        }

        let entry = Arc::new(SaveEntry {
            holder: Arc::clone(holder),
            category: category.clone(),
            payload: Arc::clone(&payload),
            state: Mutex::new(SaveState {
                lease_held: true,
                callbacks: callback.into_iter().collect(),
                ..SaveState::default()
            }),
        });
        shared.in_work.insert(hk.clone(), Arc::clone(&entry));
        shared.in_long_work.insert(hk, Arc::clone(&entry));
        spawn_after(shared, shared.cfg.schedule_delay, entry);
        tracing::debug!(key = %holder.key(), index = %holder.index_name(), "save scheduled");

        let mut p = payload.lock().unwrap();
        Ok(mutate(&mut p))
    }

    /// Flags the in-long-work save of the record, if any, to release the
    /// lease without writing the secondary index. Cannot retract a primary
    /// write that already went out.
    pub fn cancel(&self, holder: &Arc<Holder>) {
        if let Some(long) = self
            .shared
            .in_long_work
            .get(&holder.pair())
            .map(|e| Arc::clone(e.value()))
        {
            long.state.lock().unwrap().cancel_save = true;
        }
    }

    /// Removes the record: cancels scheduled work, secures the lease, marks
    /// the holder removed, evicts it from the identity cache and drives the
    /// driver-side removal. The lease is released when the removal is
    /// durable.
    pub fn remove(&self, category: &Category, holder: &Arc<Holder>) -> Result<()> {
        let shared = &self.shared;
        let hk = holder.pair();
        let mut mon = holder.lock();
        if mon.removed {
            return Ok(());
        }

        tracing::debug!(key = %holder.key(), category = %category.name(), "removing record");
        self.cancel(holder);

        // a save still inside its window already took the lease for us
        let lease_ours = match shared.in_work.get(&hk).map(|e| Arc::clone(e.value())) {
            Some(entry) => {
                let mut st = entry.state.lock().unwrap();
                st.need_remove = true;
                st.lease_held
            }
            None => false,
        };
        if !lease_ours {
            mon = acquire_lease(shared, holder, mon)?;
        }

        mon.removed = true;
        holder.clear_payload(&mut mon);
        category.evict(holder.key());
        shared.in_work.remove(&hk);
        shared.in_long_work.remove(&hk);
        drop(mon);

        let driver = Arc::clone(&shared.driver);
        let done_holder = Arc::clone(holder);
        shared.driver.remove(
            holder.key(),
            holder.index_name(),
            Box::new(move || {
                if let Err(e) = driver.unlock(done_holder.key(), done_holder.index_name()) {
                    tracing::error!(key = %done_holder.key(), error = %e, "unlock after remove failed");
                }
                done_holder.notify_all();
            }),
        )
    }

    /// Drains and shuts the executor down: polls until no save holds a lease
    /// any more, then gives in-flight tasks a bounded grace period.
    pub fn stop(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        while !self.shared.in_long_work.is_empty() {
            std::thread::sleep(DRAIN_POLL);
        }
        if let Some(runtime) = self.runtime.lock().unwrap().take() {
            runtime.shutdown_timeout(SHUTDOWN_TIMEOUT);
        }
    }
}

fn spawn_after(shared: &Arc<Shared>, delay: Duration, entry: Arc<SaveEntry>) {
    let shared = Arc::clone(shared);
    let handle = shared.handle.clone();
    handle.spawn(async move {
        tokio::time::sleep(delay).await;
        tokio::task::spawn_blocking(move || run_save(shared, entry));
    });
}

impl Shared {
    fn clean_up_failed(&self, hk: &HolderKey, holder: &Holder) {
        self.in_work.remove(hk);
        self.in_long_work.remove(hk);
        if let Err(e) = self.driver.unlock(holder.key(), holder.index_name()) {
            tracing::error!(key = %holder.key(), error = %e, "unlock after failed save failed");
        }
        holder.notify_all();
    }
}

/// Takes the cross-process lease on the holder's record, backing off on the
/// monitor between attempts. The driver's wait hint is honoured up to the
/// retry cap so an expiring foreign lease is picked up promptly.
fn acquire_lease<'a>(
    shared: &Shared,
    holder: &'a Holder,
    mut mon: MutexGuard<'a, HolderState>,
) -> Result<MutexGuard<'a, HolderState>> {
    loop {
        let hint = shared
            .driver
            .try_lock(holder.key(), holder.index_name(), shared.cfg.lock_ttl)?;
        if hint <= 0 {
            return Ok(mon);
        }
        let wait = Duration::from_millis(hint as u64)
            .min(LEASE_RETRY_CAP)
            .max(LEASE_RETRY_FLOOR);
        tracing::debug!(
            key = %holder.key(),
            index = %holder.index_name(),
            wait_ms = wait.as_millis() as u64,
            "lease contended, backing off"
        );
        mon = holder.wait_timeout(mon, wait);
    }
}

/// One scheduled save task. Driver failures release the lease and clear the
/// tables; the in-memory payload survives and is retried on the next
/// mutation.
fn run_save(shared: Arc<Shared>, entry: Arc<SaveEntry>) {
    if let Err(e) = try_run_save(&shared, &entry) {
        tracing::error!(
            key = %entry.holder.key(),
            index = %entry.holder.index_name(),
            error = %e,
            "save failed"
        );
        shared.clean_up_failed(&entry.holder.pair(), &entry.holder);
    }
}

fn try_run_save(shared: &Arc<Shared>, entry: &Arc<SaveEntry>) -> Result<()> {
    let holder = &entry.holder;
    let mut mon = holder.lock();

    {
        let mut st = entry.state.lock().unwrap();
        if st.need_remove {
            // the remove path owns the tables and the lease
            return Ok(());
        }
        if st.reschedule {
            st.reschedule = false;
            drop(st);
            spawn_after(shared, shared.cfg.reschedule_delay, Arc::clone(entry));
            return Ok(());
        }
        if !st.lease_held {
            drop(st);
            mon = acquire_lease(shared, holder, mon)?;
            entry.state.lock().unwrap().lease_held = true;
        }
    }

    // snapshot under the monitor
    let (blob, map_tree, sorter_bytes, secondary_key, tags) = {
        let payload = entry.payload.lock().unwrap();
        let blob = bincode::serialize(&*payload)?;
        let sorter_bytes = sorter::sorter_bytes(
            payload.sorter(),
            &entry.category.collator(),
            shared.driver.max_sorter_len(),
        );
        (
            blob,
            payload.map().clone(),
            sorter_bytes,
            payload.secondary_key().map(str::to_string),
            payload.raw_tags().to_vec(),
        )
    };
    let locales = entry.category.locales();
    drop(mon);

    let hk = holder.pair();

    // when the primary blob is durable, either extend the window for
    // mutations that raced in, or leave only the long-work entry to hold the
    // lease for the secondary write
    let pd_shared = Arc::clone(shared);
    let pd_entry = Arc::clone(entry);
    let pd_hk = hk.clone();
    let on_primary_done: Callback = Box::new(move || {
        let holder = Arc::clone(&pd_entry.holder);
        let _mon = holder.lock();
        let mut st = pd_entry.state.lock().unwrap();
        if st.reschedule {
            st.reschedule = false;
            drop(st);
            spawn_after(&pd_shared, pd_shared.cfg.reschedule_delay, Arc::clone(&pd_entry));
        } else {
            drop(st);
            pd_shared.in_work.remove(&pd_hk);
        }
    });

    let rs_shared = Arc::clone(shared);
    let rs_entry = Arc::clone(entry);
    let on_ready: Callback = Box::new(move || {
        ready_for_secondary(
            rs_shared,
            rs_entry,
            map_tree,
            locales,
            secondary_key,
            sorter_bytes,
            tags,
        );
    });

    shared
        .driver
        .put_primary(holder.key(), holder.index_name(), blob, on_primary_done, on_ready)
}

fn ready_for_secondary(
    shared: Arc<Shared>,
    entry: Arc<SaveEntry>,
    map_tree: crate::value::ValueMap,
    locales: Vec<crate::collator::Locale>,
    secondary_key: Option<String>,
    sorter_bytes: Vec<u8>,
    tags: Vec<String>,
) {
    let holder = Arc::clone(&entry.holder);
    let hk = holder.pair();

    let (skip, removing) = {
        let _mon = holder.lock();
        let st = entry.state.lock().unwrap();
        (st.cancel_save || st.need_remove, st.need_remove)
    };
    if skip {
        if !removing {
            // cancelled: the remove path is parked on the monitor waiting
            // for this lease
            shared.in_long_work.remove(&hk);
            if let Err(e) = shared.driver.unlock(holder.key(), holder.index_name()) {
                tracing::error!(key = %holder.key(), error = %e, "unlock after cancel failed");
            }
        }
        holder.notify_all();
        return;
    }

    let done_shared = Arc::clone(&shared);
    let done_entry = Arc::clone(&entry);
    let on_done: Callback = Box::new(move || secondary_done(done_shared, done_entry));

    let result = shared.driver.put_secondary(
        holder.key(),
        holder.index_name(),
        &map_tree,
        &locales,
        secondary_key.as_deref(),
        &sorter_bytes,
        &tags,
        on_done,
    );
    if let Err(e) = result {
        tracing::error!(key = %holder.key(), error = %e, "secondary write failed");
        shared.clean_up_failed(&hk, &holder);
    }
}

fn secondary_done(shared: Arc<Shared>, entry: Arc<SaveEntry>) {
    let holder = Arc::clone(&entry.holder);
    let hk = holder.pair();
    let mut callbacks = Vec::new();

    {
        let _mon = holder.lock();
        let mut st = entry.state.lock().unwrap();
        if let Some(follow) = st.followup.take() {
            // the follow-up inherits the lease
            callbacks = std::mem::take(&mut st.callbacks);
            drop(st);
            shared.in_work.insert(hk.clone(), Arc::clone(&follow));
            shared.in_long_work.insert(hk.clone(), Arc::clone(&follow));
            spawn_after(&shared, shared.cfg.reschedule_delay, follow);
        } else if shared.in_work.contains_key(&hk) {
            // a successor save is pending; it keeps the lease and fires the
            // accumulated callbacks when it completes
            drop(st);
        } else {
            callbacks = std::mem::take(&mut st.callbacks);
            drop(st);
            shared.in_long_work.remove(&hk);
            if let Err(e) = shared.driver.unlock(holder.key(), holder.index_name()) {
                tracing::error!(key = %holder.key(), error = %e, "unlock after save failed");
            }
            tracing::debug!(key = %holder.key(), index = %holder.index_name(), "save complete");
        }
    }

    for cb in callbacks {
        cb();
    }
    holder.notify_all();
}
