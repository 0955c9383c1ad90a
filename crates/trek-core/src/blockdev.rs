//! Block device abstraction.
//!
//! The translator and the NBD server only see [`BlockDevice`]. The USB
//! [`DeviceSession`](crate::session::DeviceSession) is the production
//! implementation; [`FileBlockDevice`] serves a raw disk image so the bridge
//! can run without hardware.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::info;

use crate::error::{BridgeError, Result};
use crate::protocol::constants::SECTOR_SIZE;

/// Sector-addressed storage.
pub trait BlockDevice: Send + Sync {
    /// Number of addressable sectors.
    fn total_sectors(&self) -> u64;

    fn sector_size(&self) -> usize {
        SECTOR_SIZE
    }

    /// Size in bytes.
    fn capacity(&self) -> u64 {
        self.total_sectors().saturating_mul(self.sector_size() as u64)
    }

    /// Read `count` sectors starting at `lba`.
    fn read_blocks(&self, lba: u32, count: u32) -> Result<Vec<u8>>;

    /// Write whole sectors starting at `lba`.
    fn write_blocks(&self, lba: u32, data: &[u8]) -> Result<()>;

    /// Whether the device can still serve requests.
    fn is_usable(&self) -> bool {
        true
    }

    /// Human readable description for logs and the NBD export.
    fn describe(&self) -> String;
}

/// Disk image file exposed as a block device.
///
/// Bytes past the last whole sector are not exported.
pub struct FileBlockDevice {
    path: PathBuf,
    file: Mutex<File>,
    total_sectors: u64,
    read_only: bool,
}

impl FileBlockDevice {
    pub fn open<P: AsRef<Path>>(path: P, read_only: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(&path)?;
        let len = file.metadata()?.len();
        let total_sectors = len / SECTOR_SIZE as u64;

        info!(
            path = %path.display(),
            bytes = len,
            sectors = total_sectors,
            read_only,
            "Opened disk image"
        );

        Ok(Self {
            path,
            file: Mutex::new(file),
            total_sectors,
            read_only,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check_range(&self, lba: u32, count: u64) -> Result<()> {
        if lba as u64 + count > self.total_sectors {
            return Err(BridgeError::OutOfRange {
                lba: lba as u64,
                count,
                total_sectors: self.total_sectors,
            });
        }
        Ok(())
    }
}

impl BlockDevice for FileBlockDevice {
    fn total_sectors(&self) -> u64 {
        self.total_sectors
    }

    fn read_blocks(&self, lba: u32, count: u32) -> Result<Vec<u8>> {
        self.check_range(lba, count as u64)?;
        let mut file = self.file.lock().map_err(|_| BridgeError::SessionClosed)?;
        let mut buf = vec![0u8; count as usize * SECTOR_SIZE];
        file.seek(SeekFrom::Start(lba as u64 * SECTOR_SIZE as u64))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn write_blocks(&self, lba: u32, data: &[u8]) -> Result<()> {
        if data.len() % SECTOR_SIZE != 0 {
            return Err(BridgeError::UnalignedWrite {
                len: data.len(),
                sector_size: SECTOR_SIZE,
            });
        }
        self.check_range(lba, (data.len() / SECTOR_SIZE) as u64)?;
        if self.read_only {
            return Err(BridgeError::ReadOnly);
        }
        let mut file = self.file.lock().map_err(|_| BridgeError::SessionClosed)?;
        file.seek(SeekFrom::Start(lba as u64 * SECTOR_SIZE as u64))?;
        file.write_all(data)?;
        file.flush()?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("disk image {}", self.path.display())
    }
}
