use libc::c_long;
use std::sync::Arc;

use crate::{
    mm::TaskId,
    snapshot::SnapshotEngine,
    syscall_table::{PtRegs, SyscallHandler},
};

/// What to do with an intercepted `exit_group`.
#[derive(Debug, PartialEq, Eq)]
pub enum ExitDecision<A> {
    /// The memory was rolled back, the task keeps running.
    Continue,
    /// No snapshot, the original handler gets the untouched arguments.
    Delegate(A),
}

/// Restores the snapshot of `task` if it has one.
///
/// Only the caller that finds the record armed restores it. A second thread
/// of the same process calling `exit_group` while that restore runs waits
/// for it, finds nothing armed and is delegated, so the process really
/// exits.
pub fn decide<A>(engine: &SnapshotEngine, task: TaskId, args: A) -> ExitDecision<A> {
    match engine.restore(task) {
        Some(summary) => {
            log::trace!("exit_group of task {} turned into restore: {:?}", task, summary);
            ExitDecision::Continue
        }
        None => ExitDecision::Delegate(args),
    }
}

/// Replacement for the `exit_group` syscall table entry.
pub struct ExitTrampoline {
    engine: Arc<SnapshotEngine>,
    original: SyscallHandler,
}

impl ExitTrampoline {
    pub fn new(engine: Arc<SnapshotEngine>, original: SyscallHandler) -> Self {
        Self { engine, original }
    }

    pub fn original(&self) -> SyscallHandler {
        self.original
    }

    /// # Safety
    ///
    /// `regs` must be the register frame of the current syscall, it is
    /// forwarded as is to the original handler.
    pub unsafe fn dispatch(&self, task: TaskId, regs: *const PtRegs) -> c_long {
        match decide(&self.engine, task, regs) {
            ExitDecision::Continue => 0,
            ExitDecision::Delegate(regs) => (self.original)(regs),
        }
    }
}
