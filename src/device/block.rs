//! Block Devices - Raw fixed-size block I/O
//!
//! A [`BlockDevice`] transfers whole blocks synchronously. It is what the
//! block cache sits on, and what raw (uncached) reads and writes go to.

use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use crate::error::{Error, Result};

// ============================================================================
// Block Device Interface
// ============================================================================

/// Synchronous block device
pub trait BlockDevice: Send + Sync {
    /// Bytes per block
    fn block_size(&self) -> usize;

    /// Number of blocks on the device
    fn block_count(&self) -> u32;

    /// Read block `bno` into `buf` (exactly one block long)
    fn read_block(&self, bno: u32, buf: &mut [u8]) -> Result<()>;

    /// Write `buf` (exactly one block long) to block `bno`
    fn write_block(&self, bno: u32, buf: &[u8]) -> Result<()>;

    /// Push any buffered writes to stable storage
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Check a transfer request against the device geometry
pub fn check_transfer(dev: &dyn BlockDevice, bno: u32, len: usize) -> Result<()> {
    if bno >= dev.block_count() || len != dev.block_size() {
        return Err(Error::InvalidArgs);
    }
    Ok(())
}

// ============================================================================
// RAM Disk
// ============================================================================

/// Block device held entirely in memory
#[derive(Debug)]
pub struct RamDisk {
    block_size: usize,
    block_count: u32,
    data: Mutex<Vec<u8>>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl RamDisk {
    /// Create a zero-filled disk
    pub fn new(block_size: usize, block_count: u32) -> Self {
        Self {
            block_size,
            block_count,
            data: Mutex::new(vec![0; block_size * block_count as usize]),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Blocks read so far
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Blocks written so far
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    fn span(&self, bno: u32) -> core::ops::Range<usize> {
        let start = bno as usize * self.block_size;
        start..start + self.block_size
    }
}

impl BlockDevice for RamDisk {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u32 {
        self.block_count
    }

    fn read_block(&self, bno: u32, buf: &mut [u8]) -> Result<()> {
        check_transfer(self, bno, buf.len())?;
        buf.copy_from_slice(&self.data.lock()[self.span(bno)]);
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn write_block(&self, bno: u32, buf: &[u8]) -> Result<()> {
        check_transfer(self, bno, buf.len())?;
        let span = self.span(bno);
        self.data.lock()[span].copy_from_slice(buf);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

// ============================================================================
// File Disk
// ============================================================================

#[cfg(feature = "std")]
pub use file::FileDisk;

#[cfg(feature = "std")]
mod file {
    use super::*;
    use std::fs::{File, OpenOptions};
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::path::Path;

    /// Block device backed by a host file
    #[derive(Debug)]
    pub struct FileDisk {
        block_size: usize,
        block_count: u32,
        file: Mutex<File>,
    }

    fn io_error(what: &str, err: std::io::Error) -> Error {
        log::warn!("file disk: {} failed: {}", what, err);
        Error::Io
    }

    impl FileDisk {
        /// Create (or truncate) a zero-filled image of `block_count` blocks
        pub fn create(path: &Path, block_size: usize, block_count: u32) -> Result<Self> {
            if block_size == 0 || block_count == 0 {
                return Err(Error::InvalidArgs);
            }
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)
                .map_err(|e| io_error("create", e))?;
            file.set_len(block_size as u64 * u64::from(block_count))
                .map_err(|e| io_error("set_len", e))?;
            Ok(Self {
                block_size,
                block_count,
                file: Mutex::new(file),
            })
        }

        /// Open an existing image; its length must be a whole number of blocks
        pub fn open(path: &Path, block_size: usize) -> Result<Self> {
            if block_size == 0 {
                return Err(Error::InvalidArgs);
            }
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(path)
                .map_err(|e| io_error("open", e))?;
            let len = file.metadata().map_err(|e| io_error("stat", e))?.len();
            if len % block_size as u64 != 0 {
                return Err(Error::InvalidArgs);
            }
            let block_count =
                u32::try_from(len / block_size as u64).map_err(|_| Error::OutOfRange)?;
            Ok(Self {
                block_size,
                block_count,
                file: Mutex::new(file),
            })
        }

        fn seek(file: &mut File, bno: u32, block_size: usize) -> Result<()> {
            file.seek(SeekFrom::Start(u64::from(bno) * block_size as u64))
                .map_err(|e| io_error("seek", e))?;
            Ok(())
        }
    }

    impl BlockDevice for FileDisk {
        fn block_size(&self) -> usize {
            self.block_size
        }

        fn block_count(&self) -> u32 {
            self.block_count
        }

        fn read_block(&self, bno: u32, buf: &mut [u8]) -> Result<()> {
            check_transfer(self, bno, buf.len())?;
            let mut file = self.file.lock();
            Self::seek(&mut file, bno, self.block_size)?;
            file.read_exact(buf).map_err(|e| io_error("read", e))
        }

        fn write_block(&self, bno: u32, buf: &[u8]) -> Result<()> {
            check_transfer(self, bno, buf.len())?;
            let mut file = self.file.lock();
            Self::seek(&mut file, bno, self.block_size)?;
            file.write_all(buf).map_err(|e| io_error("write", e))
        }

        fn flush(&self) -> Result<()> {
            self.file.lock().sync_all().map_err(|e| io_error("sync", e))
        }
    }
}
