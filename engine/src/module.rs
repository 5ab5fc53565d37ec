//! Load, unload and file operation entry points.
//!
//! The host glue calls these from the module init and exit functions and from
//! the `unlocked_ioctl` of the control device. The syscall table slot of
//! `exit_group` is pointed to [`sys_exit_group`].

use afl_snapshot_common::defs;
use libc::{c_int, c_long};
use once_cell::sync::Lazy;
use std::{
    mem,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use crate::{
    lock,
    mm::TaskId,
    subsystem::{ExitEntry, Platform, SubsystemBuilder, SubsystemState},
    syscall_table::{PtRegs, SyscallHandler},
    trampoline::ExitTrampoline,
};

static MODULE: Lazy<Mutex<Option<SubsystemState>>> = Lazy::new(|| Mutex::new(None));

static PUBLISHED_EXIT: Lazy<Mutex<Option<PublishedExit>>> = Lazy::new(|| Mutex::new(None));

// Kept after unload for callers that were already inside the entry.
static ORIGINAL_EXIT: AtomicUsize = AtomicUsize::new(0);

#[derive(Clone)]
struct PublishedExit {
    trampoline: Arc<ExitTrampoline>,
    current_task: fn() -> TaskId,
}

struct ModuleExitEntry {
    current_task: fn() -> TaskId,
}

impl ExitEntry for ModuleExitEntry {
    fn address(&self) -> usize {
        sys_exit_group as SyscallHandler as usize
    }

    fn publish(&self, trampoline: Arc<ExitTrampoline>) {
        ORIGINAL_EXIT.store(trampoline.original() as usize, Ordering::SeqCst);
        *lock(&PUBLISHED_EXIT) = Some(PublishedExit {
            trampoline,
            current_task: self.current_task,
        });
    }

    fn retract(&self) {
        *lock(&PUBLISHED_EXIT) = None;
    }
}

/// Installed in the `exit_group` slot of the syscall table.
///
/// # Safety
///
/// Only to be called by the syscall dispatcher, with the register frame of
/// the current syscall.
pub unsafe extern "C" fn sys_exit_group(regs: *const PtRegs) -> c_long {
    let published = lock(&PUBLISHED_EXIT).clone();
    if let Some(exit) = published {
        return exit.trampoline.dispatch((exit.current_task)(), regs);
    }

    match ORIGINAL_EXIT.load(Ordering::SeqCst) {
        0 => -(libc::ENOSYS as c_long),
        original => {
            let original = mem::transmute::<usize, SyscallHandler>(original);
            original(regs)
        }
    }
}

/// Module init with the default configuration.
pub fn mod_init(platform: Platform, current_task: fn() -> TaskId) -> c_int {
    mod_init_with(&SubsystemBuilder::new(), platform, current_task)
}

/// Returns 0 or a negative errno.
pub fn mod_init_with(
    builder: &SubsystemBuilder,
    platform: Platform,
    current_task: fn() -> TaskId,
) -> c_int {
    let _ = env_logger::try_init();

    let mut module = lock(&MODULE);
    if module.is_some() {
        log::warn!("{} is already loaded", defs::DEVICE_NAME);
        return -libc::EEXIST;
    }

    match builder.activate(platform, Box::new(ModuleExitEntry { current_task })) {
        Ok(state) => {
            *module = Some(state);
            log::info!(
                "{} loaded, control device at {}",
                defs::DEVICE_NAME,
                defs::DEVICE_PATH
            );
            0
        }
        Err(error) => {
            log::error!("Unable to load {}: {}", defs::DEVICE_NAME, error);
            -error.errno()
        }
    }
}

pub fn mod_exit() {
    let state = lock(&MODULE).take();
    match state {
        Some(state) => {
            state.deactivate();
            log::info!("{} unloaded", defs::DEVICE_NAME);
        }
        None => log::debug!("{} is not loaded", defs::DEVICE_NAME),
    }
}

pub fn is_loaded() -> bool {
    lock(&MODULE).is_some()
}

/// `unlocked_ioctl` of the control device, on behalf of `task`.
pub fn mod_ioctl(task: TaskId, cmd: u32, arg: usize) -> c_long {
    match lock(&MODULE).as_ref() {
        Some(state) => state.device().ioctl(task, cmd, arg),
        None => -(libc::ENODEV as c_long),
    }
}
