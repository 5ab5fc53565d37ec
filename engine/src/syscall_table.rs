use snafu::{ensure, OptionExt, Snafu};
use std::{mem, result};

use crate::kernel::{self, KernelMemory, SymbolResolver};

/// Register frame handed to x86_64 syscall table entries.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct PtRegs {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub bp: u64,
    pub bx: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub ax: u64,
    pub cx: u64,
    pub dx: u64,
    pub si: u64,
    pub di: u64,
    pub orig_ax: u64,
    pub ip: u64,
    pub cs: u64,
    pub flags: u64,
    pub sp: u64,
    pub ss: u64,
}

// Non-x86 table entries take the unpacked arguments instead.
pub type SyscallHandler = unsafe extern "C" fn(regs: *const PtRegs) -> libc::c_long;

const WORD_SIZE: usize = mem::size_of::<u64>();

#[derive(Clone, Debug)]
pub struct LocatorConfig {
    pub table_symbol: String,
    /// The heuristic scan starts from this symbol.
    pub anchor_symbol: String,
    /// Handlers expected in the first two slots of the table.
    pub first_entry_symbol: String,
    pub second_entry_symbol: String,
    /// Bytes scanned past the anchor before giving up.
    pub scan_window: usize,
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            table_symbol: "sys_call_table".to_string(),
            anchor_symbol: "_etext".to_string(),
            first_entry_symbol: "__x64_sys_read".to_string(),
            second_entry_symbol: "__x64_sys_write".to_string(),
            scan_window: 256 * 1024 * 1024,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyscallTable {
    base: usize,
}

impl SyscallTable {
    pub fn base(&self) -> usize {
        self.base
    }

    pub fn slot(&self, nr: usize) -> usize {
        self.base + nr * WORD_SIZE
    }
}

/// Finds the syscall table, by name when possible.
pub fn locate(
    symbols: &dyn SymbolResolver,
    memory: &dyn KernelMemory,
    config: &LocatorConfig,
) -> Result<SyscallTable> {
    if let Some(base) = symbols.lookup_name(&config.table_symbol) {
        log::debug!("{} found at {:#x}", config.table_symbol, base);
        return Ok(SyscallTable { base });
    }

    log::debug!(
        "{} not exported, scanning from {}",
        config.table_symbol,
        config.anchor_symbol
    );

    let lookup = |name: &str| -> Result<usize> {
        symbols.lookup_name(name).context(SymbolNotFound {
            name: name.to_string(),
        })
    };
    let first = lookup(&config.first_entry_symbol)? as u64;
    let second = lookup(&config.second_entry_symbol)? as u64;
    let start = lookup(&config.anchor_symbol)? & !(WORD_SIZE - 1);

    let base = scan_for_table(memory, start, config.scan_window, first, second).context(
        TableNotFound {
            start,
            window: config.scan_window,
        },
    )?;
    log::debug!("Syscall table found by scanning at {:#x}", base);

    Ok(SyscallTable { base })
}

// Looks for two adjacent words holding the first two handlers of the table.
fn scan_for_table(
    memory: &dyn KernelMemory,
    start: usize,
    window: usize,
    first: u64,
    second: u64,
) -> Option<usize> {
    let end = start.saturating_add(window);
    let mut address = start;

    while address < end {
        if memory.probe_read(address) == Some(first)
            && memory.probe_read(address + WORD_SIZE) == Some(second)
        {
            return Some(address);
        }

        address = address.checked_add(WORD_SIZE)?;
    }

    None
}

/// The syscall table slot taken over by the subsystem.
///
/// The saved original handler is what runs when no snapshot is armed, and it
/// is written back bit-for-bit on removal.
#[derive(Debug)]
pub struct DispatchOverride {
    slot: usize,
    original: u64,
    replacement: Option<u64>,
}

impl DispatchOverride {
    /// Reads the current handler of `nr`, nothing is patched yet.
    pub fn prepare(memory: &dyn KernelMemory, table: SyscallTable, nr: usize) -> Result<Self> {
        let slot = table.slot(nr);
        let original = memory
            .probe_read(slot)
            .context(SlotUnreadable { slot })?;
        ensure!(original != 0, EmptySlot { slot });

        Ok(Self {
            slot,
            original,
            replacement: None,
        })
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn original(&self) -> u64 {
        self.original
    }

    pub fn is_committed(&self) -> bool {
        self.replacement.is_some()
    }

    pub fn original_handler(&self) -> SyscallHandler {
        // The word was read from a live syscall table slot and checked to be
        // non-null, so it is the address of a syscall handler.
        unsafe { mem::transmute::<usize, SyscallHandler>(self.original as usize) }
    }

    /// Points the slot to `replacement`.
    pub fn commit(&mut self, memory: &dyn KernelMemory, replacement: usize) -> Result<()> {
        ensure!(!self.is_committed(), AlreadyCommitted { slot: self.slot });

        let slot = self.slot;
        let original = self.original;
        kernel::with_write_protection_disabled(memory, || -> Result<()> {
            let current = memory.probe_read(slot);
            ensure!(current == Some(original), SlotChanged { slot });

            unsafe { memory.write_word(slot, replacement as u64) };
            Ok(())
        })?;

        self.replacement = Some(replacement as u64);
        log::debug!(
            "Syscall slot {:#x}: {:#x} -> {:#x}",
            slot,
            original,
            replacement
        );
        Ok(())
    }

    /// Puts the original handler back. Does nothing if never committed.
    pub fn revert(&mut self, memory: &dyn KernelMemory) {
        let replacement = match self.replacement.take() {
            Some(replacement) => replacement,
            None => return,
        };

        let slot = self.slot;
        let original = self.original;
        kernel::with_write_protection_disabled(memory, || {
            let current = memory.probe_read(slot);
            if current != Some(replacement) {
                log::warn!(
                    "Syscall slot {:#x} was changed to {:?}, restoring it anyway",
                    slot,
                    current
                );
            }

            unsafe { memory.write_word(slot, original) };
        });

        log::debug!("Syscall slot {:#x} restored to {:#x}", slot, original);
    }
}

pub type Result<T> = result::Result<T, Error>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Unable to resolve {}", name))]
    SymbolNotFound { name: String },
    #[snafu(display(
        "Unable to locate syscall table in [{:#x}, +{:#x})",
        start,
        window
    ))]
    TableNotFound { start: usize, window: usize },
    #[snafu(display("Syscall slot {:#x} is not readable", slot))]
    SlotUnreadable { slot: usize },
    #[snafu(display("Syscall slot {:#x} is empty", slot))]
    EmptySlot { slot: usize },
    #[snafu(display("Syscall slot {:#x} changed while patching", slot))]
    SlotChanged { slot: usize },
    #[snafu(display("Syscall slot {:#x} is already patched", slot))]
    AlreadyCommitted { slot: usize },
}
