// Shared between the snapshot engine and the processes that talk to it.

pub const DEVICE_NAME: &str = "afl_snapshot";
pub const DEVICE_PATH: &str = "/dev/afl_snapshot";

pub const IOCTL_MAGIC: u32 = 44313;

// Same encoding as the kernel's `_IO` macro: no direction and no payload.
const fn io(ty: u32, nr: u32) -> u32 {
    (ty << 8) | nr
}

/// Arm a snapshot for the calling process.
pub const IOCTL_DO: u32 = io(IOCTL_MAGIC, 1);
/// Drop the snapshot of the calling process without restoring it.
pub const IOCTL_CLEAN: u32 = io(IOCTL_MAGIC, 2);

/// `__NR_exit_group` on x86_64, the only supported calling convention.
pub const NR_EXIT_GROUP: usize = 231;

pub const PAGE_SIZE: usize = 4096;
pub const PAGE_MASK: usize = !(PAGE_SIZE - 1);

#[inline(always)]
pub fn page_align(address: usize) -> usize {
    address & PAGE_MASK
}
