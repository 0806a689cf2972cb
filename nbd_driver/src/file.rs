use crate::{check_sector_buf, DiskStats, LockedZone, NbdDriver, NBD_SECTOR_SIZE,
            NBMAX_DISK_LOCKED_ZONES};
use anyhow::{anyhow, bail, Result};
use log::*;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};

/// File-backed disk, used by the superblock tool to work on device images
pub struct FileNbdDriver {
    path: String,
    file: Option<File>,
    size_sectors: u64,
    locked: Vec<LockedZone>,
    stats: DiskStats,
}

impl FileNbdDriver {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            file: None,
            size_sectors: 0,
            locked: vec![],
            stats: Default::default(),
        }
    }

    fn file(&mut self) -> Result<&mut File> {
        self.file.as_mut().ok_or_else(|| anyhow!("device {} is not open", self.path))
    }
}

impl NbdDriver for FileNbdDriver {
    fn nbd_open(&mut self) -> Result<()> {
        let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        let len = file.metadata()?.len();
        self.size_sectors = len / NBD_SECTOR_SIZE as u64;
        info!("opened {}: {} sectors", self.path, self.size_sectors);
        self.file = Some(file);
        Ok(())
    }

    fn nbd_close(&mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        self.locked.clear();
        Ok(())
    }

    fn nbd_size(&self) -> u64 {
        self.size_sectors
    }

    fn nbd_read(&mut self, rsector: u64, buf: &mut [u8]) -> Result<()> {
        check_sector_buf(buf.len())?;
        let file = self.file()?;
        file.seek(SeekFrom::Start(rsector * NBD_SECTOR_SIZE as u64))?;
        file.read_exact(buf)?;
        self.stats.read_cnt += 1;
        Ok(())
    }

    fn nbd_write(&mut self, rsector: u64, buf: &[u8]) -> Result<()> {
        check_sector_buf(buf.len())?;
        let file = self.file()?;
        file.seek(SeekFrom::Start(rsector * NBD_SECTOR_SIZE as u64))?;
        file.write_all(buf)?;
        self.stats.write_cnt += 1;
        Ok(())
    }

    fn nbd_lock(&mut self, start: u64, end: u64) -> Result<()> {
        if self.locked.len() >= NBMAX_DISK_LOCKED_ZONES {
            bail!("too many locked zones");
        }
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
