/// Name-based lookup of kernel symbols, exported or not.
pub trait SymbolResolver: Send + Sync {
    fn lookup_name(&self, name: &str) -> Option<usize>;
}

/// Raw access to kernel data.
pub trait KernelMemory: Send + Sync {
    /// Reads a word without faulting, `None` when the address is not mapped.
    fn probe_read(&self, address: usize) -> Option<u64>;

    /// # Safety
    ///
    /// `address` must point to a mapped, aligned word whose new value keeps
    /// every reader of it working.
    unsafe fn write_word(&self, address: usize, value: u64);

    /// State of the write-protect bit for read-only kernel data.
    fn write_protection(&self) -> bool;
    fn set_write_protection(&self, enabled: bool);
}

/// Runs `f` with kernel write protection lifted.
///
/// The section has to stay short, implementations run it on a single CPU
/// with preemption disabled.
pub fn with_write_protection_disabled<F, R>(memory: &dyn KernelMemory, f: F) -> R
where
    F: FnOnce() -> R,
{
    let was_protected = memory.write_protection();
    memory.set_write_protection(false);

    let ret = f();

    if was_protected {
        memory.set_write_protection(true);
    }

    ret
}
