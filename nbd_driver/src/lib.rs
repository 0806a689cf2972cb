use anyhow::{bail, Result};

/// Sector size of every device exposed through this transport, in bytes
pub const NBD_SECTOR_SIZE: usize = 512;

/// Maximum number of simultaneously locked zones on one device
pub const NBMAX_DISK_LOCKED_ZONES: usize = 32;

#[derive(Default, Debug, Clone)]
pub struct DiskStats {
    pub read_cnt: u32,
    pub write_cnt: u32,
    pub lock_cnt: u32,
}

/// A sector range `[start, end]` (inclusive) held locked on a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockedZone {
    pub start: u64,
    pub end: u64,
}

/// Network-block-device transport interface.
///
/// One handle per real device. All offsets and sizes are expressed in
/// 512-byte sectors; buffers must be a whole number of sectors.
pub trait NbdDriver {
    fn nbd_open(&mut self) -> Result<()>;
    fn nbd_close(&mut self) -> Result<()>;
    /// Device size in sectors, available once opened
    fn nbd_size(&self) -> u64;
    fn nbd_read(&mut self, rsector: u64, buf: &mut [u8]) -> Result<()>;
    fn nbd_write(&mut self, rsector: u64, buf: &[u8]) -> Result<()>;
    fn nbd_lock(&mut self, start: u64, end: u64) -> Result<()>;
    fn nbd_unlock(&mut self, start: u64, end: u64) -> Result<()>;
    fn nbd_stats(&self) -> DiskStats;
}

pub(crate) fn check_sector_buf(buf_len: usize) -> Result<usize> {
    if buf_len == 0 || buf_len % NBD_SECTOR_SIZE != 0 {
        bail!("buffer of {} bytes is not a whole number of sectors", buf_len);
    }
    Ok(buf_len / NBD_SECTOR_SIZE)
}

pub mod file;
pub mod memory;

pub use file::FileNbdDriver;
pub use memory::MemNbdDriver;
