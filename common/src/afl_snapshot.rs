use snafu::{ensure, ResultExt, Snafu};
use std::{
    ffi::CString,
    io,
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
    result,
    sync::atomic::{AtomicI32, Ordering},
};

use crate::defs;

static DEVICE_FD: AtomicI32 = AtomicI32::new(-1);

/// Initializes the snapshotting system.
///
/// # Errors
///
/// This function will return an error if the `ioctl` device created by the
/// snapshot engine cannot be opened.
pub fn init() -> Result<()> {
    init_at(defs::DEVICE_PATH)
}

/// Same as [`init`], but for a device node living somewhere else.
pub fn init_at(device_path: impl AsRef<Path>) -> Result<()> {
    let device_path = device_path.as_ref();
    let c_path = CString::new(device_path.as_os_str().as_bytes()).map_err(|_| {
        InvalidPath {
            path: device_path.to_path_buf(),
        }
        .build()
    })?;

    let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error()).context(OpenFailed {
            path: device_path.to_path_buf(),
        });
    }

    let previous_fd = DEVICE_FD.swap(fd, Ordering::AcqRel);
    if previous_fd >= 0 {
        unsafe { libc::close(previous_fd) };
    }

    log::debug!("Snapshot device opened: {}", device_path.display());
    Ok(())
}

fn send_command(command: u32) -> Result<()> {
    let fd = DEVICE_FD.load(Ordering::Acquire);
    ensure!(fd >= 0, NotInitialized);

    let res = unsafe { libc::ioctl(fd, command as _) };
    if res < 0 {
        return Err(io::Error::last_os_error()).context(CommandFailed { command });
    }

    Ok(())
}

/// Takes a snapshot of the current program.
///
/// Once the snapshot is armed, `exit_group` no longer terminates the process:
/// the memory is rolled back to this point and execution continues.
pub fn take() -> Result<()> {
    send_command(defs::IOCTL_DO)
}

/// Removes the snapshot for the current process.
///
/// It is not an error to call this function when no snapshot was taken.
pub fn clean() -> Result<()> {
    send_command(defs::IOCTL_CLEAN)
}

pub type Result<T> = result::Result<T, Error>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Could not open {}: {}", path.display(), source))]
    OpenFailed { path: PathBuf, source: io::Error },
    #[snafu(display("Device path contains a NUL byte: {}", path.display()))]
    InvalidPath { path: PathBuf },
    #[snafu(display("Snapshot device not opened, call init first"))]
    NotInitialized,
    #[snafu(display("Command {:#x} failed: {}", command, source))]
    CommandFailed { command: u32, source: io::Error },
}
