//! Fast process snapshots for fuzzing.
//!
//! A process arms a snapshot through the control device. From then on every
//! copy-on-write fault and every new anonymous page of its address space is
//! recorded, and `exit_group` is turned into "roll the memory back and keep
//! running" instead of a real exit.

pub mod device;
pub mod hook;
pub mod kernel;
pub mod mm;
pub mod module;
pub mod probes;
pub mod snapshot;
pub mod subsystem;
pub mod syscall_table;
pub mod trampoline;

#[cfg(test)]
mod testing;

pub use mm::TaskId;
pub use snapshot::SnapshotEngine;
pub use subsystem::{SubsystemBuilder, SubsystemState};

use std::sync::{Mutex, MutexGuard, PoisonError};

// Probes run on the fault path, a panic somewhere else must not turn every
// following fault into a second panic.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
