use afl_snapshot_common::defs;
use libc::c_long;
use snafu::Snafu;
use std::{convert::TryFrom, sync::Arc};

use crate::{mm::TaskId, snapshot::SnapshotEngine};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    Snapshot,
    Clean,
}

impl TryFrom<u32> for Command {
    type Error = Error;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        match code {
            defs::IOCTL_DO => Ok(Command::Snapshot),
            defs::IOCTL_CLEAN => Ok(Command::Clean),
            code => InvalidCommand { code }.fail(),
        }
    }
}

/// `ioctl` side of the control device.
///
/// Every command applies to the calling task, there is no payload.
pub struct SnapshotDevice {
    engine: Arc<SnapshotEngine>,
}

impl SnapshotDevice {
    pub fn new(engine: Arc<SnapshotEngine>) -> Self {
        Self { engine }
    }

    /// Returns 0 or a negative errno, like the file operation it backs.
    pub fn ioctl(&self, task: TaskId, cmd: u32, _arg: usize) -> c_long {
        let command = match Command::try_from(cmd) {
            Ok(command) => command,
            Err(error) => {
                log::debug!("Task {}: {}", task, error);
                return -(libc::EINVAL as c_long);
            }
        };

        match command {
            Command::Snapshot => {
                log::debug!("Calling do_snapshot for task {}", task);
                match self.engine.arm(task) {
                    Ok(()) => 0,
                    Err(error) => {
                        log::warn!("{}", error);
                        -(libc::EEXIST as c_long)
                    }
                }
            }
            Command::Clean => {
                log::debug!("Calling clean_snapshot for task {}", task);
                self.engine.clean(task);
                0
            }
        }
    }
}

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Invalid ioctl command: {:#x}", code))]
    InvalidCommand { code: u32 },
}
