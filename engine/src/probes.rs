use afl_snapshot_common::defs::{page_align, PAGE_SIZE};
use std::{cell::Cell, sync::Arc};

use crate::{
    hook::Hook,
    mm::{MemoryManager, Page, TaskId},
    snapshot::SnapshotEngine,
};

thread_local! {
    static PROBES_ENABLED: Cell<bool> = Cell::new(true);
}

/// Runs `f` with the fault-path probes of the current thread turned off.
///
/// The engine touches the pages of the task it restores, and those accesses
/// must not be recorded into the record being restored.
pub fn with_probes_disabled<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    // An error is returned when `PROBES_ENABLED` has already been destroyed,
    // in that case the thread is going away and there is nothing to restore.
    let prev_enabled = PROBES_ENABLED
        .try_with(|enabled| enabled.replace(false))
        .ok();

    let ret = f();

    if let Some(prev_enabled) = prev_enabled {
        PROBES_ENABLED.with(|enabled| enabled.set(prev_enabled));
    }

    ret
}

fn probes_enabled() -> bool {
    PROBES_ENABLED
        .try_with(|enabled| enabled.get())
        .unwrap_or(false)
}

/// A copy-on-write fault that is about to duplicate a page.
#[derive(Clone, Copy, Debug)]
pub struct WriteFault {
    pub task: TaskId,
    pub address: usize,
}

/// A brand-new anonymous page entering the address space of a task.
#[derive(Clone, Copy, Debug)]
pub struct NewAnonPage {
    pub task: TaskId,
    pub address: usize,
}

/// A thread going through `do_exit`.
#[derive(Clone, Copy, Debug)]
pub struct TaskExit {
    pub task: TaskId,
    /// Set for the last thread of the group, the address space dies with it.
    pub group_dead: bool,
}

/// Names of the kernel functions the probes are attached to.
#[derive(Clone, Debug)]
pub struct HookTargets {
    pub write_fault: String,
    pub new_anon_page: String,
    pub task_exit: String,
}

impl Default for HookTargets {
    fn default() -> Self {
        Self {
            write_fault: "do_wp_page".to_string(),
            new_anon_page: "page_add_new_anon_rmap".to_string(),
            task_exit: "do_exit".to_string(),
        }
    }
}

/// The three probes that feed the snapshot engine from the fault path.
///
/// None of them can fail the code they are attached to: every problem ends
/// up as an untracked page and a warning.
pub struct FaultProbes {
    engine: Arc<SnapshotEngine>,
    mm: Arc<dyn MemoryManager>,
    page_limit: Option<usize>,
}

impl FaultProbes {
    pub fn new(engine: Arc<SnapshotEngine>, mm: Arc<dyn MemoryManager>) -> Self {
        Self {
            engine,
            mm,
            page_limit: None,
        }
    }

    /// Caps the number of backing copies alive at the same time.
    pub fn with_page_limit(mut self, page_limit: Option<usize>) -> Self {
        self.page_limit = page_limit;
        self
    }

    fn alloc_page(&self) -> Option<Page> {
        if let Some(page_limit) = self.page_limit {
            if self.engine.stats().pages_held() >= page_limit {
                return None;
            }
        }

        let mut buf = Vec::new();
        buf.try_reserve_exact(PAGE_SIZE).ok()?;
        buf.resize(PAGE_SIZE, 0);
        Some(buf.into_boxed_slice())
    }

    /// Must run before the kernel copies the page, afterwards the content
    /// would already include the write.
    pub fn wp_page_hook(&self, fault: &WriteFault) {
        if !probes_enabled() || !self.engine.wants_page(fault.task, fault.address) {
            return;
        }

        let address = page_align(fault.address);
        let mut original = match self.alloc_page() {
            Some(page) => page,
            None => {
                self.engine.note_dropped_page(fault.task, address);
                return;
            }
        };

        if let Err(error) = self.mm.read_page(fault.task, address, &mut original) {
            log::debug!("Could not copy page {:#x}: {}", address, error);
            self.engine.note_dropped_page(fault.task, address);
            return;
        }

        self.engine.record_write(fault.task, address, original);
    }

    pub fn do_anonymous_hook(&self, page: &NewAnonPage) {
        if !probes_enabled() {
            return;
        }

        self.engine.record_new_page(page.task, page.address);
    }

    /// Threads of an armed process may come and go, only the exit of the
    /// whole group drops its snapshot.
    pub fn exit_hook(&self, exit: &TaskExit) {
        if !exit.group_dead {
            log::trace!("Task {}: thread exit, snapshot kept", exit.task);
            return;
        }

        self.engine.release(exit.task);
    }

    /// Builds the hooks to hand to the interception provider, keyed by the
    /// kernel function each one replaces.
    pub fn hooks(self: &Arc<Self>, targets: &HookTargets) -> Vec<(String, Hook)> {
        let write_fault_probes = self.clone();
        let new_page_probes = self.clone();
        let exit_probes = self.clone();

        vec![
            (
                targets.write_fault.clone(),
                Hook::WriteFault(Box::new(move |fault: &WriteFault| {
                    write_fault_probes.wp_page_hook(fault)
                })),
            ),
            (
                targets.new_anon_page.clone(),
                Hook::NewAnonPage(Box::new(move |page: &NewAnonPage| {
                    new_page_probes.do_anonymous_hook(page)
                })),
            ),
            (
                targets.task_exit.clone(),
                Hook::TaskExit(Box::new(move |exit: &TaskExit| exit_probes.exit_hook(exit))),
            ),
        ]
    }
}
