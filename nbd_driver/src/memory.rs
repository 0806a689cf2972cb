use crate::{check_sector_buf, DiskStats, LockedZone, NbdDriver, NBD_SECTOR_SIZE,
            NBMAX_DISK_LOCKED_ZONES};
use anyhow::{bail, Result};
use log::*;

/// In-memory disk, used as the device fake in unit tests
pub struct MemNbdDriver {
    mem: Vec<u8>,
    size_sectors: u64,
    open: bool,
    locked: Vec<LockedZone>,
    stats: DiskStats,
}

impl MemNbdDriver {
    pub fn new(size_sectors: u64) -> Self {
        Self {
            mem: vec![0u8; size_sectors as usize * NBD_SECTOR_SIZE],
            size_sectors,
            open: false,
            locked: vec![],
            stats: Default::default(),
        }
    }

    fn check_range(&self, rsector: u64, nb_sectors: usize) -> Result<usize> {
        if rsector + nb_sectors as u64 > self.size_sectors {
            bail!("sector range {}+{} out of device ({} sectors)",
                  rsector, nb_sectors, self.size_sectors);
        }
        Ok(rsector as usize * NBD_SECTOR_SIZE)
    }
}

impl NbdDriver for MemNbdDriver {
    fn nbd_open(&mut self) -> Result<()> {
        self.open = true;
        Ok(())
    }

    fn nbd_close(&mut self) -> Result<()> {
        self.open = false;
        self.locked.clear();
        Ok(())
    }

    fn nbd_size(&self) -> u64 {
        self.size_sectors
    }

    fn nbd_read(&mut self, rsector: u64, buf: &mut [u8]) -> Result<()> {
        let nb = check_sector_buf(buf.len())?;
        let ofs = self.check_range(rsector, nb)?;
        buf.copy_from_slice(&self.mem[ofs..ofs + buf.len()]);
        self.stats.read_cnt += 1;
        Ok(())
    }

    fn nbd_write(&mut self, rsector: u64, buf: &[u8]) -> Result<()> {
        let nb = check_sector_buf(buf.len())?;
        let ofs = self.check_range(rsector, nb)?;
        self.mem[ofs..ofs + buf.len()].copy_from_slice(buf);
        self.stats.write_cnt += 1;
        Ok(())
    }

    fn nbd_lock(&mut self, start: u64, end: u64) -> Result<()> {
        if self.locked.len() >= NBMAX_DISK_LOCKED_ZONES {
            bail!("too many locked zones");
        }
        debug!("lock zone [{}, {}]", start, end);
        self.locked.push(LockedZone { start, end });
        self.stats.lock_cnt += 1;
        Ok(())
    }

    fn nbd_unlock(&mut self, start: u64, end: u64) -> Result<()> {
        let zone = LockedZone { start, end };
        match self.locked.iter().position(|z| *z == zone) {
            Some(i) => {
                self.locked.remove(i);
                Ok(())
            }
            None => bail!("zone [{}, {}] is not locked", start, end),
        }
    }

    fn nbd_stats(&self) -> DiskStats {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_back_written_sectors() -> Result<()> {
        let mut driver = MemNbdDriver::new(64);
        driver.nbd_open()?;
        let data = [0xABu8; NBD_SECTOR_SIZE * 2];
        driver.nbd_write(3, &data)?;
        let mut buf = [0u8; NBD_SECTOR_SIZE * 2];
        driver.nbd_read(3, &mut buf)?;
        assert_eq!(buf[..], data[..]);
        assert_eq!(driver.nbd_stats().write_cnt, 1);
        assert_eq!(driver.nbd_stats().read_cnt, 1);
        driver.nbd_close()
    }

    #[test]
    fn out_of_range_io_fails() {
        let mut driver = MemNbdDriver::new(4);
        let mut buf = [0u8; NBD_SECTOR_SIZE];
        assert!(driver.nbd_read(4, &mut buf).is_err());
        assert!(driver.nbd_write(4, &buf).is_err());
    }

    #[test]
    fn partial_sector_buffer_rejected() {
        let mut driver = MemNbdDriver::new(4);
        let mut buf = [0u8; 100];
        assert!(driver.nbd_read(0, &mut buf).is_err());
    }

    #[test]
    fn lock_unlock_zones() -> Result<()> {
        let mut driver = MemNbdDriver::new(64);
        driver.nbd_lock(0, 7)?;
        driver.nbd_lock(8, 15)?;
        driver.nbd_unlock(0, 7)?;
        assert!(driver.nbd_unlock(0, 7).is_err());
        driver.nbd_unlock(8, 15)
    }
}
