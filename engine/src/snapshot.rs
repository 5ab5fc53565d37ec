use afl_snapshot_common::defs::page_align;
use log::log_enabled;
use snafu::Snafu;
use std::{
    collections::{hash_map::Entry, BTreeMap, BTreeSet, HashMap},
    fmt, result,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Instant,
};

use crate::{
    lock,
    mm::{MemoryManager, Page, TaskId},
    probes,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SnapshotState {
    Armed,
    Restoring,
    /// The record has been restored or discarded and is no longer reachable
    /// from the task table.
    Inactive,
}

/// Everything that has to be undone to bring a task back to the moment it
/// was armed.
///
/// An address is either in `dirty_pages` (it existed when the snapshot was
/// armed and has been written since) or in `new_pages` (it did not exist),
/// never in both.
pub struct SnapshotRecord {
    owner: TaskId,
    state: SnapshotState,
    dirty_pages: BTreeMap<usize, Page>,
    new_pages: BTreeSet<usize>,
}

impl SnapshotRecord {
    fn new(owner: TaskId) -> Self {
        Self {
            owner,
            state: SnapshotState::Armed,
            dirty_pages: BTreeMap::new(),
            new_pages: BTreeSet::new(),
        }
    }

    pub fn owner(&self) -> TaskId {
        self.owner
    }

    pub fn state(&self) -> SnapshotState {
        self.state
    }

    pub fn is_tracked(&self, address: usize) -> bool {
        self.dirty_pages.contains_key(&address) || self.new_pages.contains(&address)
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty_pages.len()
    }

    pub fn new_count(&self) -> usize {
        self.new_pages.len()
    }

    // The first copy is the only one that reflects the memory at arming time.
    fn insert_dirty(&mut self, address: usize, original: Page) -> bool {
        if self.is_tracked(address) {
            return false;
        }

        self.dirty_pages.insert(address, original);
        true
    }

    fn insert_new(&mut self, address: usize) -> bool {
        if self.dirty_pages.contains_key(&address) {
            return false;
        }

        self.new_pages.insert(address)
    }

    fn discard(&mut self) -> usize {
        let saved_pages = self.dirty_pages.len();
        self.dirty_pages.clear();
        self.new_pages.clear();
        self.state = SnapshotState::Inactive;
        saved_pages
    }

    fn log_pages(&self) {
        log::trace!("Snapshot of task {}:", self.owner);
        for address in self.dirty_pages.keys() {
            log::trace!("  dirty: {:#14x}", address);
        }
        for address in &self.new_pages {
            log::trace!("  new:   {:#14x}", address);
        }
    }
}

type SharedRecord = Arc<Mutex<SnapshotRecord>>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    pub restored: usize,
    pub released: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
pub struct SnapshotStats {
    pages_saved: AtomicUsize,
    pages_dropped: AtomicUsize,
    pages_held: AtomicUsize,
    new_pages: AtomicUsize,
    restores: AtomicUsize,
}

impl SnapshotStats {
    pub fn pages_saved(&self) -> usize {
        self.pages_saved.load(Ordering::Relaxed)
    }

    /// Pages left untracked because no backing copy could be made.
    pub fn pages_dropped(&self) -> usize {
        self.pages_dropped.load(Ordering::Relaxed)
    }

    /// Backing copies currently alive across all the records.
    pub fn pages_held(&self) -> usize {
        self.pages_held.load(Ordering::Relaxed)
    }

    pub fn new_pages(&self) -> usize {
        self.new_pages.load(Ordering::Relaxed)
    }

    pub fn restores(&self) -> usize {
        self.restores.load(Ordering::Relaxed)
    }

    fn release_held(&self, count: usize) {
        self.pages_held.fetch_sub(count, Ordering::Relaxed);
    }
}

impl fmt::Display for SnapshotStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "saved: {}, dropped: {}, new: {}, restores: {}",
            self.pages_saved(),
            self.pages_dropped(),
            self.new_pages(),
            self.restores()
        )
    }
}

/// Owns the snapshot records of all the tracked tasks.
///
/// Each record is reached only through the task table, and each record has
/// its own lock, so faults coming from different threads of the same process
/// are serialized while different processes never contend on a record.
pub struct SnapshotEngine {
    tasks: Mutex<HashMap<TaskId, SharedRecord>>,
    mm: Arc<dyn MemoryManager>,
    stats: SnapshotStats,
}

impl SnapshotEngine {
    pub fn new(mm: Arc<dyn MemoryManager>) -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            mm,
            stats: SnapshotStats::default(),
        }
    }

    fn lookup(&self, task: TaskId) -> Option<SharedRecord> {
        lock(&self.tasks).get(&task).cloned()
    }

    // Removes the entry only if it still refers to `record`, the task may
    // have been cleaned and armed again in the meantime.
    fn detach(&self, task: TaskId, record: &SharedRecord) -> bool {
        let mut tasks = lock(&self.tasks);
        match tasks.get(&task) {
            Some(current) if Arc::ptr_eq(current, record) => {
                tasks.remove(&task);
                true
            }
            _ => false,
        }
    }

    pub fn stats(&self) -> &SnapshotStats {
        &self.stats
    }

    pub fn armed_tasks(&self) -> usize {
        lock(&self.tasks).len()
    }

    pub fn is_armed(&self, task: TaskId) -> bool {
        self.lookup(task)
            .map(|record| lock(&record).state == SnapshotState::Armed)
            .unwrap_or(false)
    }

    /// Starts tracking the address space of `task`.
    ///
    /// Arming a task that still holds a record from a previous cycle fails,
    /// the caller has to restore or clean it first.
    pub fn arm(&self, task: TaskId) -> Result<()> {
        match lock(&self.tasks).entry(task) {
            Entry::Occupied(_) => AlreadyArmed { task }.fail(),
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::new(Mutex::new(SnapshotRecord::new(task))));
                log::debug!("Snapshot armed for task {}", task);
                Ok(())
            }
        }
    }

    /// Whether a write fault on `address` would be recorded.
    ///
    /// Lets the write-fault probe skip the page copy for untracked tasks and
    /// pages that are already saved.
    pub fn wants_page(&self, task: TaskId, address: usize) -> bool {
        let address = page_align(address);
        self.lookup(task)
            .map(|record| {
                let record = lock(&record);
                record.state == SnapshotState::Armed && !record.is_tracked(address)
            })
            .unwrap_or(false)
    }

    /// Saves the content `address` had before its first write since arming.
    ///
    /// Returns `false` when nothing was recorded: the task is not armed, or
    /// the page is already tracked.
    pub fn record_write(&self, task: TaskId, address: usize, original: Page) -> bool {
        let address = page_align(address);
        let record = match self.lookup(task) {
            Some(record) => record,
            None => return false,
        };

        let mut record = lock(&record);
        if record.state != SnapshotState::Armed || !record.insert_dirty(address, original) {
            return false;
        }

        self.stats.pages_saved.fetch_add(1, Ordering::Relaxed);
        self.stats.pages_held.fetch_add(1, Ordering::Relaxed);
        log::trace!("Task {}: saved page {:#x}", task, address);
        true
    }

    /// Marks `address` as created after arming, restore will unmap it.
    pub fn record_new_page(&self, task: TaskId, address: usize) -> bool {
        let address = page_align(address);
        let record = match self.lookup(task) {
            Some(record) => record,
            None => return false,
        };

        let mut record = lock(&record);
        if record.state != SnapshotState::Armed || !record.insert_new(address) {
            return false;
        }

        self.stats.new_pages.fetch_add(1, Ordering::Relaxed);
        log::trace!("Task {}: new page {:#x}", task, address);
        true
    }

    pub(crate) fn note_dropped_page(&self, task: TaskId, address: usize) {
        self.stats.pages_dropped.fetch_add(1, Ordering::Relaxed);
        log::warn!(
            "Task {}: page {:#x} left untracked, restore will be incomplete",
            task,
            page_align(address)
        );
    }

    /// Rolls the address space of `task` back to the moment it was armed.
    ///
    /// Returns `None` when the task has no armed snapshot, which covers a
    /// second restore racing with the first one.
    pub fn restore(&self, task: TaskId) -> Option<RestoreSummary> {
        let record = self.lookup(task)?;
        let restore_begin = Instant::now();

        let summary = {
            let mut record = lock(&record);
            if record.state != SnapshotState::Armed {
                log::debug!("Task {}: nothing to restore ({:?})", task, record.state);
                return None;
            }
            record.state = SnapshotState::Restoring;

            if log_enabled!(log::Level::Trace) {
                record.log_pages();
            }

            let summary = probes::with_probes_disabled(|| self.apply(&record));
            let saved_pages = record.discard();
            self.stats.release_held(saved_pages);
            summary
        };

        self.detach(task, &record);
        self.stats.restores.fetch_add(1, Ordering::Relaxed);

        if summary.failed > 0 {
            log::warn!(
                "Task {}: {} pages could not be restored",
                task,
                summary.failed
            );
        }
        log::debug!(
            "Task {}: restored {} pages, released {} pages in {:?}",
            task,
            summary.restored,
            summary.released,
            restore_begin.elapsed()
        );

        Some(summary)
    }

    fn apply(&self, record: &SnapshotRecord) -> RestoreSummary {
        let mut summary = RestoreSummary::default();

        for (&address, original) in &record.dirty_pages {
            match self.mm.write_page(record.owner, address, original) {
                Ok(()) => summary.restored += 1,
                Err(error) => {
                    log::warn!("Could not restore page {:#x}: {}", address, error);
                    summary.failed += 1;
                }
            }
        }

        for &address in &record.new_pages {
            match self.mm.zap_page(record.owner, address) {
                Ok(()) => summary.released += 1,
                Err(error) => {
                    log::warn!("Could not release page {:#x}: {}", address, error);
                    summary.failed += 1;
                }
            }
        }

        summary
    }

    /// Drops the snapshot of `task` without touching its memory.
    ///
    /// Returns whether there was anything to drop.
    pub fn clean(&self, task: TaskId) -> bool {
        let discarded = self.remove(task);
        if discarded {
            log::debug!("Snapshot cleaned for task {}", task);
        }
        discarded
    }

    /// Releases the record of a task that is really exiting.
    ///
    /// A restore running on another thread keeps its own reference to the
    /// record, so it completes before the record is torn down.
    pub fn release(&self, task: TaskId) -> bool {
        let released = self.remove(task);
        if released {
            log::debug!("Snapshot released on exit of task {}", task);
        }
        released
    }

    fn remove(&self, task: TaskId) -> bool {
        let record = match lock(&self.tasks).remove(&task) {
            Some(record) => record,
            None => return false,
        };

        // Waits for an in-flight restore to finish with the pages.
        let mut record = lock(&record);
        if record.state == SnapshotState::Inactive {
            return false;
        }

        let saved_pages = record.discard();
        self.stats.release_held(saved_pages);
        true
    }
}

pub type Result<T> = result::Result<T, Error>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Task {} already has an armed snapshot", task))]
    AlreadyArmed { task: TaskId },
}
