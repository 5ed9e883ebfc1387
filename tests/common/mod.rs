//! Shared test devices

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use vmkern::device::{BlockDevice, RamDisk};
use vmkern::{Error, Result};

/// Block number that never fails
pub const NONE: u32 = u32::MAX;

/// RamDisk wrapper that can fail or stall chosen blocks
pub struct TestDisk {
    inner: RamDisk,
    pub fail_read: AtomicU32,
    pub fail_write: AtomicU32,
    read_delay: Duration,
    pub reads: AtomicU64,
}

impl TestDisk {
    pub fn new(block_size: usize, blocks: u32, read_delay: Duration) -> Self {
        Self {
            inner: RamDisk::new(block_size, blocks),
            fail_read: AtomicU32::new(NONE),
            fail_write: AtomicU32::new(NONE),
            read_delay,
            reads: AtomicU64::new(0),
        }
    }

    /// Stop failing any block
    pub fn heal(&self) {
        self.fail_read.store(NONE, Ordering::SeqCst);
        self.fail_write.store(NONE, Ordering::SeqCst);
    }

    /// Block contents as the device holds them, bypassing any cache
    pub fn raw(&self, bno: u32) -> Vec<u8> {
        let mut buf = vec![0u8; self.inner.block_size()];
        self.inner.read_block(bno, &mut buf).unwrap();
        buf
    }
}

impl BlockDevice for TestDisk {
    fn block_size(&self) -> usize {
        self.inner.block_size()
    }

    fn block_count(&self) -> u32 {
        self.inner.block_count()
    }

    fn read_block(&self, bno: u32, buf: &mut [u8]) -> Result<()> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        thread::sleep(self.read_delay);
        if self.fail_read.load(Ordering::SeqCst) == bno {
            return Err(Error::Io);
        }
        self.inner.read_block(bno, buf)
    }

    fn write_block(&self, bno: u32, buf: &[u8]) -> Result<()> {
        if self.fail_write.load(Ordering::SeqCst) == bno {
            return Err(Error::Io);
        }
        self.inner.write_block(bno, buf)
    }
}
