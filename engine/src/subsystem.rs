use afl_snapshot_common::defs;
use snafu::{OptionExt, ResultExt, Snafu};
use std::{collections::HashMap, result, sync::Arc};

use crate::{
    device::SnapshotDevice,
    hook::{self, InterceptionProvider, ProbeSet},
    kernel::{KernelMemory, SymbolResolver},
    mm::MemoryManager,
    probes::{FaultProbes, HookTargets},
    snapshot::SnapshotEngine,
    syscall_table::{self, DispatchOverride, LocatorConfig},
    trampoline::ExitTrampoline,
};

/// Where the patched syscall slot points to.
///
/// The trampoline is published before the slot is patched and retracted
/// after the slot is restored, so the entry never runs without one except
/// for callers that were already inside it.
pub trait ExitEntry: Send {
    fn address(&self) -> usize;
    fn publish(&self, trampoline: Arc<ExitTrampoline>);
    fn retract(&self);
}

/// The host kernel, as seen by the subsystem.
pub struct Platform {
    pub memory_manager: Arc<dyn MemoryManager>,
    pub symbols: Arc<dyn SymbolResolver>,
    pub kernel_memory: Arc<dyn KernelMemory>,
    pub interception: Box<dyn InterceptionProvider>,
}

#[derive(Clone, Debug)]
pub struct SubsystemBuilder {
    exit_syscall_nr: usize,
    locator: LocatorConfig,
    hook_targets: HookTargets,
    kernel_funcs: Vec<String>,
    page_limit: Option<usize>,
}

impl Default for SubsystemBuilder {
    fn default() -> Self {
        Self {
            exit_syscall_nr: defs::NR_EXIT_GROUP,
            locator: LocatorConfig::default(),
            hook_targets: HookTargets::default(),
            kernel_funcs: vec![
                "flush_tlb_mm_range".to_string(),
                "zap_page_range".to_string(),
            ],
            page_limit: None,
        }
    }
}

impl SubsystemBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exit_syscall_nr(&mut self, nr: usize) -> &mut Self {
        self.exit_syscall_nr = nr;
        self
    }

    pub fn locator(&mut self, locator: LocatorConfig) -> &mut Self {
        self.locator = locator;
        self
    }

    pub fn scan_window(&mut self, scan_window: usize) -> &mut Self {
        self.locator.scan_window = scan_window;
        self
    }

    pub fn hook_targets(&mut self, hook_targets: HookTargets) -> &mut Self {
        self.hook_targets = hook_targets;
        self
    }

    /// Non-exported kernel functions that must resolve for the activation to
    /// succeed.
    ///
    /// This is only a check that the running kernel has what the
    /// [`MemoryManager`] glue relies on. The engine never calls them.
    pub fn kernel_funcs(&mut self, kernel_funcs: Vec<String>) -> &mut Self {
        self.kernel_funcs = kernel_funcs;
        self
    }

    pub fn page_limit(&mut self, page_limit: usize) -> &mut Self {
        self.page_limit = Some(page_limit);
        self
    }

    /// Takes over `exit_group` and hooks the fault path.
    ///
    /// Either everything is installed or, on error, everything installed so
    /// far is removed again, newest first.
    pub fn activate(
        &self,
        platform: Platform,
        exit_entry: Box<dyn ExitEntry>,
    ) -> Result<SubsystemState> {
        log::info!("Activating snapshot subsystem");

        let Platform {
            memory_manager,
            symbols,
            kernel_memory,
            interception,
        } = platform;

        let table = syscall_table::locate(&*symbols, &*kernel_memory, &self.locator)
            .context(TableNotFound)?;

        let engine = Arc::new(SnapshotEngine::new(memory_manager.clone()));

        let mut dispatch = DispatchOverride::prepare(&*kernel_memory, table, self.exit_syscall_nr)
            .context(PatchFailed)?;
        let trampoline = Arc::new(ExitTrampoline::new(
            engine.clone(),
            dispatch.original_handler(),
        ));
        exit_entry.publish(trampoline);
        if let Err(error) = dispatch.commit(&*kernel_memory, exit_entry.address()) {
            exit_entry.retract();
            return Err(error).context(PatchFailed);
        }

        let mut state = SubsystemState {
            device: SnapshotDevice::new(engine.clone()),
            engine,
            probe_set: Some(ProbeSet::new(interception)),
            dispatch: Some(dispatch),
            exit_entry: Some(exit_entry),
            kernel_memory,
            kernel_funcs: HashMap::new(),
        };

        let probes = Arc::new(
            FaultProbes::new(state.engine.clone(), memory_manager).with_page_limit(self.page_limit),
        );
        if let Err(error) = self.install_probes(&mut state, &probes, &*symbols) {
            log::error!("{}", error);
            state.teardown();
            return Err(error);
        }

        log::info!(
            "Snapshot subsystem active, {} hooks installed",
            state.hooked_symbols().len()
        );
        Ok(state)
    }

    fn install_probes(
        &self,
        state: &mut SubsystemState,
        probes: &Arc<FaultProbes>,
        symbols: &dyn SymbolResolver,
    ) -> Result<()> {
        if let Some(probe_set) = state.probe_set.as_mut() {
            for (symbol, hook) in probes.hooks(&self.hook_targets) {
                probe_set.try_hook(&symbol, hook).context(ProbeFailed)?;
            }
        }

        state.kernel_funcs = resolve_kernel_funcs(symbols, &self.kernel_funcs)?;
        Ok(())
    }
}

fn resolve_kernel_funcs(
    symbols: &dyn SymbolResolver,
    names: &[String],
) -> Result<HashMap<String, usize>> {
    names
        .iter()
        .map(|name| -> Result<(String, usize)> {
            let address = symbols
                .lookup_name(name)
                .context(KernelFuncMissing { name: name.clone() })?;
            log::trace!("{} resolved to {:#x}", name, address);
            Ok((name.clone(), address))
        })
        .collect()
}

/// One activation of the subsystem, owning everything it installed.
pub struct SubsystemState {
    engine: Arc<SnapshotEngine>,
    device: SnapshotDevice,
    probe_set: Option<ProbeSet>,
    dispatch: Option<DispatchOverride>,
    exit_entry: Option<Box<dyn ExitEntry>>,
    kernel_memory: Arc<dyn KernelMemory>,
    kernel_funcs: HashMap<String, usize>,
}

impl SubsystemState {
    pub fn engine(&self) -> &Arc<SnapshotEngine> {
        &self.engine
    }

    pub fn device(&self) -> &SnapshotDevice {
        &self.device
    }

    /// Address found for a helper named in
    /// [`SubsystemBuilder::kernel_funcs`], for logging and diagnostics.
    pub fn kernel_func(&self, name: &str) -> Option<usize> {
        self.kernel_funcs.get(name).copied()
    }

    pub fn hooked_symbols(&self) -> Vec<&str> {
        self.probe_set
            .as_ref()
            .map(|probe_set| probe_set.symbols().collect())
            .unwrap_or_default()
    }

    pub fn dispatch(&self) -> Option<&DispatchOverride> {
        self.dispatch.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.dispatch.is_some()
    }

    /// Removes every hook and puts the original `exit_group` back.
    pub fn deactivate(mut self) {
        log::info!("Deactivating snapshot subsystem");
        self.teardown();

        let armed_tasks = self.engine.armed_tasks();
        if armed_tasks > 0 {
            log::debug!("Dropping {} armed snapshots", armed_tasks);
        }
        log::info!("Snapshot stats: {}", self.engine.stats());
    }

    // Reverse order of `activate`.
    fn teardown(&mut self) {
        if let Some(mut probe_set) = self.probe_set.take() {
            probe_set.unhook_all();
        }

        if let Some(mut dispatch) = self.dispatch.take() {
            dispatch.revert(&*self.kernel_memory);
        }

        if let Some(exit_entry) = self.exit_entry.take() {
            exit_entry.retract();
        }
    }
}

impl Drop for SubsystemState {
    fn drop(&mut self) {
        self.teardown();
    }
}

pub type Result<T> = result::Result<T, Error>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Unable to locate syscall_table: {}", source))]
    TableNotFound { source: syscall_table::Error },
    #[snafu(display("Unable to patch syscall_table: {}", source))]
    PatchFailed { source: syscall_table::Error },
    #[snafu(display("{}", source))]
    ProbeFailed { source: hook::Error },
    #[snafu(display("Unable to resolve kernel function {}", name))]
    KernelFuncMissing { name: String },
}

impl Error {
    /// Value returned by module init for this error.
    pub fn errno(&self) -> libc::c_int {
        match self {
            Error::PatchFailed { .. } => libc::EFAULT,
            _ => libc::ENOENT,
        }
    }
}
