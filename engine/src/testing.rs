//! In-memory stand-ins for the kernel services the subsystem runs on.

use afl_snapshot_common::defs::{NR_EXIT_GROUP, PAGE_SIZE};
use libc::c_long;
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use crate::{
    hook::{self, Hook, HookHandle, InterceptionProvider},
    kernel::{KernelMemory, SymbolResolver},
    lock,
    mm::{self, MemoryManager, TaskId},
    probes::{NewAnonPage, TaskExit, WriteFault},
    subsystem::ExitEntry,
    syscall_table::PtRegs,
    trampoline::ExitTrampoline,
};

pub const ETEXT: usize = 0xffff_ffff_8100_0003;
pub const TABLE_BASE: usize = 0xffff_ffff_8102_0000;
pub const SYS_READ: usize = 0xffff_ffff_8120_0010;
pub const SYS_WRITE: usize = 0xffff_ffff_8120_0080;
pub const FLUSH_TLB_MM_RANGE: usize = 0xffff_ffff_8107_3400;
pub const ZAP_PAGE_RANGE: usize = 0xffff_ffff_8128_9a00;
pub const EXIT_ENTRY: usize = 0xffff_ffff_c0de_0000;

const TABLE_ENTRIES: usize = 512;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// What [`fake_exit_group`] returns for a given first argument.
pub fn exit_group_result(di: u64) -> c_long {
    di as c_long + 1000
}

/// # Safety
///
/// `regs` must point to a valid register frame.
pub unsafe extern "C" fn fake_exit_group(regs: *const PtRegs) -> c_long {
    exit_group_result((*regs).di)
}

#[derive(Default)]
pub struct FakeAddressSpace {
    pages: Mutex<HashMap<(TaskId, usize), Vec<u8>>>,
    reads: AtomicUsize,
    write_delay: Option<Duration>,
}

impl FakeAddressSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every write back takes at least `delay`, to widen race windows.
    pub fn with_write_delay(delay: Duration) -> Self {
        Self {
            write_delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn map_page(&self, task: TaskId, address: usize, fill: u8) {
        lock(&self.pages).insert((task, address), vec![fill; PAGE_SIZE]);
    }

    /// Simulates the task writing the whole page.
    pub fn fill_page(&self, task: TaskId, address: usize, fill: u8) {
        let mut pages = lock(&self.pages);
        let page = pages
            .get_mut(&(task, address))
            .expect("filling an unmapped page");
        page.iter_mut().for_each(|byte| *byte = fill);
    }

    pub fn page(&self, task: TaskId, address: usize) -> Option<Vec<u8>> {
        lock(&self.pages).get(&(task, address)).cloned()
    }

    pub fn is_mapped(&self, task: TaskId, address: usize) -> bool {
        lock(&self.pages).contains_key(&(task, address))
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

impl MemoryManager for FakeAddressSpace {
    fn read_page(&self, task: TaskId, address: usize, buf: &mut [u8]) -> mm::Result<()> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let pages = lock(&self.pages);
        let page = pages
            .get(&(task, address))
            .ok_or(mm::Error::NotMapped { task, address })?;
        buf.copy_from_slice(page);
        Ok(())
    }

    fn write_page(&self, task: TaskId, address: usize, data: &[u8]) -> mm::Result<()> {
        if let Some(delay) = self.write_delay {
            thread::sleep(delay);
        }

        let mut pages = lock(&self.pages);
        let page = pages
            .get_mut(&(task, address))
            .ok_or(mm::Error::NotMapped { task, address })?;
        page.copy_from_slice(data);
        Ok(())
    }

    fn zap_page(&self, task: TaskId, address: usize) -> mm::Result<()> {
        lock(&self.pages)
            .remove(&(task, address))
            .map(|_| ())
            .ok_or(mm::Error::NotMapped { task, address })
    }
}

/// Kernel data as a sparse map of words. Everything not in the map faults.
pub struct FakeKernel {
    symbols: HashMap<String, usize>,
    memory: Mutex<BTreeMap<usize, u64>>,
    write_protection: AtomicBool,
    writes: AtomicUsize,
}

impl FakeKernel {
    pub fn new() -> Self {
        Self {
            symbols: HashMap::new(),
            memory: Mutex::new(BTreeMap::new()),
            write_protection: AtomicBool::new(true),
            writes: AtomicUsize::new(0),
        }
    }

    /// A kernel with a syscall table at [`TABLE_BASE`], exported under its
    /// name only when `exported` is set.
    pub fn with_syscall_table(exported: bool) -> Self {
        let mut kernel = Self::new();

        let mut symbols = vec![
            ("__x64_sys_read", SYS_READ),
            ("__x64_sys_write", SYS_WRITE),
            ("_etext", ETEXT),
            ("flush_tlb_mm_range", FLUSH_TLB_MM_RANGE),
            ("zap_page_range", ZAP_PAGE_RANGE),
        ];
        if exported {
            symbols.push(("sys_call_table", TABLE_BASE));
        }
        kernel.symbols = symbols
            .into_iter()
            .map(|(name, address)| (name.to_string(), address))
            .collect();

        {
            let mut memory = lock(&kernel.memory);
            for nr in 0..TABLE_ENTRIES {
                memory.insert(TABLE_BASE + nr * 8, 0);
            }
            memory.insert(TABLE_BASE, SYS_READ as u64);
            memory.insert(TABLE_BASE + 8, SYS_WRITE as u64);
            memory.insert(
                TABLE_BASE + NR_EXIT_GROUP * 8,
                fake_exit_group as usize as u64,
            );

            // Looks like the start of the table, but is followed by the
            // wrong handler.
            memory.insert(TABLE_BASE - 0x100, SYS_READ as u64);
            memory.insert(TABLE_BASE - 0xf8, SYS_READ as u64);
        }

        kernel
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Changes a word without going through the write protection.
    pub fn poke(&self, address: usize, value: u64) {
        lock(&self.memory).insert(address, value);
    }
}

impl SymbolResolver for FakeKernel {
    fn lookup_name(&self, name: &str) -> Option<usize> {
        self.symbols.get(name).copied()
    }
}

impl KernelMemory for FakeKernel {
    fn probe_read(&self, address: usize) -> Option<u64> {
        lock(&self.memory).get(&address).copied()
    }

    unsafe fn write_word(&self, address: usize, value: u64) {
        assert!(
            !self.write_protection(),
            "write to protected kernel memory at {:#x}",
            address
        );

        let mut memory = lock(&self.memory);
        let word = memory
            .get_mut(&address)
            .unwrap_or_else(|| panic!("write to unmapped kernel memory at {:#x}", address));
        *word = value;
        self.writes.fetch_add(1, Ordering::SeqCst);
    }

    fn write_protection(&self) -> bool {
        self.write_protection.load(Ordering::SeqCst)
    }

    fn set_write_protection(&self, enabled: bool) {
        self.write_protection.store(enabled, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct Interceptions {
    next_handle: u64,
    installed: Vec<(HookHandle, String, Hook)>,
    removed: Vec<String>,
    fail_on: HashSet<String>,
}

/// Provider side, handed over to the code under test.
pub struct FakeInterception {
    state: Arc<Mutex<Interceptions>>,
}

/// Test side of a [`FakeInterception`], fires the installed hooks.
#[derive(Clone)]
pub struct HookRegistry {
    state: Arc<Mutex<Interceptions>>,
}

impl FakeInterception {
    pub fn new() -> (Self, HookRegistry) {
        let state = Arc::new(Mutex::new(Interceptions::default()));
        (
            Self {
                state: state.clone(),
            },
            HookRegistry { state },
        )
    }
}

impl InterceptionProvider for FakeInterception {
    fn install(&mut self, symbol: &str, hook: Hook) -> hook::Result<HookHandle> {
        let mut state = lock(&self.state);
        if state.fail_on.contains(symbol) {
            return Err(hook::Error::InstallFailed {
                symbol: symbol.to_string(),
                reason: "refused by test".to_string(),
            });
        }

        state.next_handle += 1;
        let handle = HookHandle(state.next_handle);
        state.installed.push((handle, symbol.to_string(), hook));
        Ok(handle)
    }

    fn remove(&mut self, handle: HookHandle) -> hook::Result<()> {
        let mut state = lock(&self.state);
        let idx = state
            .installed
            .iter()
            .position(|(installed, _, _)| *installed == handle)
            .ok_or(hook::Error::UnknownHandle { handle })?;

        let (_, symbol, _) = state.installed.remove(idx);
        state.removed.push(symbol);
        Ok(())
    }
}

impl HookRegistry {
    pub fn installed(&self) -> Vec<String> {
        lock(&self.state)
            .installed
            .iter()
            .map(|(_, symbol, _)| symbol.clone())
            .collect()
    }

    pub fn removed(&self) -> Vec<String> {
        lock(&self.state).removed.clone()
    }

    pub fn fail_on(&self, symbol: &str) {
        lock(&self.state).fail_on.insert(symbol.to_string());
    }

    pub fn fire_write_fault(&self, fault: &WriteFault) {
        for (_, _, hook) in &lock(&self.state).installed {
            if let Hook::WriteFault(hook) = hook {
                hook(fault);
            }
        }
    }

    pub fn fire_new_anon_page(&self, page: &NewAnonPage) {
        for (_, _, hook) in &lock(&self.state).installed {
            if let Hook::NewAnonPage(hook) = hook {
                hook(page);
            }
        }
    }

    pub fn fire_task_exit(&self, exit: &TaskExit) {
        for (_, _, hook) in &lock(&self.state).installed {
            if let Hook::TaskExit(hook) = hook {
                hook(exit);
            }
        }
    }
}

/// Exit entry that only remembers what was published.
#[derive(Clone, Default)]
pub struct FakeExitEntry {
    trampoline: Arc<Mutex<Option<Arc<ExitTrampoline>>>>,
    retracts: Arc<AtomicUsize>,
}

impl FakeExitEntry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trampoline(&self) -> Option<Arc<ExitTrampoline>> {
        lock(&self.trampoline).clone()
    }

    pub fn retracts(&self) -> usize {
        self.retracts.load(Ordering::SeqCst)
    }
}

impl ExitEntry for FakeExitEntry {
    fn address(&self) -> usize {
        EXIT_ENTRY
    }

    fn publish(&self, trampoline: Arc<ExitTrampoline>) {
        *lock(&self.trampoline) = Some(trampoline);
    }

    fn retract(&self) {
        *lock(&self.trampoline) = None;
        self.retracts.fetch_add(1, Ordering::SeqCst);
    }
}
