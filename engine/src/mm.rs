use snafu::Snafu;
use std::{fmt, result};

/// Thread group id of a tracked process.
///
/// Snapshots are per address space, so all the threads of a process share
/// the same id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub libc::pid_t);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Saved content of a single page.
pub type Page = Box<[u8]>;

/// Page-granular access to the address space of a task.
///
/// All the addresses are page aligned and all the buffers are exactly one
/// page long.
pub trait MemoryManager: Send + Sync {
    fn read_page(&self, task: TaskId, address: usize, buf: &mut [u8]) -> Result<()>;
    fn write_page(&self, task: TaskId, address: usize, data: &[u8]) -> Result<()>;
    /// Unmaps the page and releases its frame.
    fn zap_page(&self, task: TaskId, address: usize) -> Result<()>;
}

pub type Result<T> = result::Result<T, Error>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Page {:#x} is not mapped in task {}", address, task))]
    NotMapped { task: TaskId, address: usize },
    #[snafu(display("Task {} has no address space", task))]
    NoAddressSpace { task: TaskId },
}
