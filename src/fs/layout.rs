//! On-disk layout - Superblock and region map of the block-cache filesystem
//!
//! The volume is a run of fixed-size blocks split into contiguous,
//! non-overlapping regions, always in this order:
//!
//! ```text
//! | 0: superblock | inode bitmap | block bitmap | inode table | data ... |
//! ```
//!
//! The block bitmap has one bit for every block on the volume, including
//! the superblock and the metadata regions. Inode 0 is never used but is
//! marked allocated. Inode `n` lives in block `ino_block + n / per_block`
//! at byte `(n % per_block) * INODE_SIZE`.
//!
//! Mount and format go through raw block I/O so metadata never lands in
//! the cache.

use alloc::vec;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::device::bcache::Bcache;
use crate::error::{Error, Result};

/// First superblock magic
pub const MAGIC0: u64 = 0x0021_5346_6e69_4d21;
/// Second superblock magic
pub const MAGIC1: u64 = 0x3850_00d3_d3d3_d304;
/// Layout version
pub const VERSION: u32 = 2;

/// Volume was cleanly unmounted
pub const FLAG_CLEAN: u32 = 1;

/// Block holding the superblock
pub const SUPERBLOCK_BNO: u32 = 0;

/// Default block size
pub const BLOCK_SIZE: u32 = 8192;

/// Bytes per on-disk inode
pub const INODE_SIZE: u32 = 256;

/// Superblock, stored at the start of block 0 in host byte order
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromZeroes, FromBytes, AsBytes)]
#[repr(C)]
pub struct Superblock {
    pub magic0: u64,
    pub magic1: u64,
    pub version: u32,
    pub flags: u32,
    /// Bytes per block
    pub block_size: u32,
    /// Bytes per inode
    pub inode_size: u32,
    /// Total number of blocks
    pub block_count: u32,
    /// Total number of inodes
    pub inode_count: u32,
    /// First block of the inode bitmap
    pub ibm_block: u32,
    /// First block of the block bitmap
    pub abm_block: u32,
    /// First block of the inode table
    pub ino_block: u32,
    /// First block available for file data
    pub dat_block: u32,
}

const _: () = assert!(core::mem::size_of::<Superblock>() == 56);

fn blocks_for(items: u64, per_block: u64) -> u64 {
    (items + per_block - 1) / per_block
}

impl Superblock {
    /// Lay out a volume of `block_count` blocks holding `inode_count` inodes
    ///
    /// Returns `NoSpace` when the metadata leaves no data block.
    pub fn format(block_size: u32, block_count: u32, inode_count: u32) -> Result<Self> {
        if block_size < INODE_SIZE || !block_size.is_power_of_two() {
            return Err(Error::InvalidArgs);
        }
        if block_count == 0 || inode_count == 0 {
            return Err(Error::InvalidArgs);
        }

        let bits = u64::from(block_size) * 8;
        let ibm_blocks = blocks_for(u64::from(inode_count), bits);
        let abm_blocks = blocks_for(u64::from(block_count), bits);
        let ino_blocks = blocks_for(
            u64::from(inode_count),
            u64::from(block_size / INODE_SIZE),
        );

        let ibm_block = u64::from(SUPERBLOCK_BNO) + 1;
        let abm_block = ibm_block + ibm_blocks;
        let ino_block = abm_block + abm_blocks;
        let dat_block = ino_block + ino_blocks;
        if dat_block >= u64::from(block_count) {
            return Err(Error::NoSpace);
        }

        Ok(Self {
            magic0: MAGIC0,
            magic1: MAGIC1,
            version: VERSION,
            flags: FLAG_CLEAN,
            block_size,
            inode_size: INODE_SIZE,
            block_count,
            inode_count,
            // All below dat_block < block_count, so they fit.
            ibm_block: ibm_block as u32,
            abm_block: abm_block as u32,
            ino_block: ino_block as u32,
            dat_block: dat_block as u32,
        })
    }

    /// Check magics, version and region ordering
    pub fn validate(&self) -> Result<()> {
        if self.magic0 != MAGIC0 || self.magic1 != MAGIC1 || self.version != VERSION {
            return Err(Error::InvalidArgs);
        }
        if self.inode_size != INODE_SIZE || self.block_size < INODE_SIZE {
            return Err(Error::InvalidArgs);
        }
        if self.inode_count == 0 {
            return Err(Error::InvalidArgs);
        }

        let bits = u64::from(self.block_size) * 8;
        let needs = [
            (self.ibm_block, self.abm_block, blocks_for(u64::from(self.inode_count), bits)),
            (self.abm_block, self.ino_block, blocks_for(u64::from(self.block_count), bits)),
            (
                self.ino_block,
                self.dat_block,
                blocks_for(
                    u64::from(self.inode_count),
                    u64::from(self.block_size / INODE_SIZE),
                ),
            ),
        ];
        if self.ibm_block <= SUPERBLOCK_BNO {
            return Err(Error::InvalidArgs);
        }
        for (start, next, len) in needs {
            if u64::from(start) + len > u64::from(next) {
                return Err(Error::InvalidArgs);
            }
        }
        if self.dat_block >= self.block_count {
            return Err(Error::InvalidArgs);
        }
        Ok(())
    }

    /// Inodes stored in one block
    pub fn inodes_per_block(&self) -> u32 {
        self.block_size / self.inode_size
    }

    /// Block and byte offset holding inode `ino`
    pub fn inode_location(&self, ino: u32) -> Result<(u32, usize)> {
        if ino >= self.inode_count {
            return Err(Error::OutOfRange);
        }
        let per_block = self.inodes_per_block();
        Ok((
            self.ino_block + ino / per_block,
            ((ino % per_block) * self.inode_size) as usize,
        ))
    }

    /// Number of data blocks
    pub fn data_blocks(&self) -> u32 {
        self.block_count - self.dat_block
    }
}

// ============================================================================
// Format / Mount
// ============================================================================

fn set_bit(map: &mut [u8], bit: u64) {
    map[(bit / 8) as usize] |= 1 << (bit % 8);
}

/// Write a fresh, empty volume through `cache`'s raw I/O
///
/// Covers every block the cache addresses. Inode 0 and all metadata blocks
/// are marked allocated; the inode table is zeroed.
pub fn mkfs(cache: &Bcache, inode_count: u32) -> Result<Superblock> {
    let bsize = u32::try_from(cache.block_size()).map_err(|_| Error::InvalidArgs)?;
    let sb = Superblock::format(bsize, cache.block_max(), inode_count)?;
    let bits = u64::from(bsize) * 8;

    let mut block = vec![0u8; cache.block_size()];
    block[..core::mem::size_of::<Superblock>()].copy_from_slice(sb.as_bytes());
    cache.write_block(SUPERBLOCK_BNO, &block)?;

    // Inode bitmap: only inode 0.
    for (i, bno) in (sb.ibm_block..sb.abm_block).enumerate() {
        block.fill(0);
        if i == 0 {
            set_bit(&mut block, 0);
        }
        cache.write_block(bno, &block)?;
    }

    // Block bitmap: everything before the data region.
    for (i, bno) in (sb.abm_block..sb.ino_block).enumerate() {
        block.fill(0);
        let first = i as u64 * bits;
        let last = (first + bits).min(u64::from(sb.dat_block));
        for bit in first..last {
            set_bit(&mut block, bit - first);
        }
        cache.write_block(bno, &block)?;
    }

    block.fill(0);
    for bno in sb.ino_block..sb.dat_block {
        cache.write_block(bno, &block)?;
    }
    cache.sync()?;

    log::debug!(
        "mkfs: {} blocks, {} inodes, data from block {}",
        sb.block_count,
        sb.inode_count,
        sb.dat_block
    );
    Ok(sb)
}

/// Read and validate the superblock of the volume under `cache`
pub fn mount(cache: &Bcache) -> Result<Superblock> {
    let mut block = vec![0u8; cache.block_size()];
    cache.read_block(SUPERBLOCK_BNO, &mut block)?;
    let sb = Superblock::read_from_prefix(&block[..]).ok_or(Error::InvalidArgs)?;

    sb.validate()?;
    if sb.block_size as usize != cache.block_size() || sb.block_count > cache.block_max() {
        log::warn!(
            "mount: volume geometry {}x{} does not fit the cache",
            sb.block_count,
            sb.block_size
        );
        return Err(Error::InvalidArgs);
    }

    log::debug!("mount: {} data blocks, {} inodes", sb.data_blocks(), sb.inode_count);
    Ok(sb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::block::RamDisk;
    use alloc::sync::Arc;

    #[test]
    fn test_format_packs_regions() {
        let sb = Superblock::format(BLOCK_SIZE, 1000, 64).unwrap();
        assert_eq!(
            (sb.ibm_block, sb.abm_block, sb.ino_block, sb.dat_block),
            (1, 2, 3, 5)
        );
        sb.validate().unwrap();
        assert_eq!(sb.inodes_per_block(), 32);
        assert_eq!(sb.inode_location(33).unwrap(), (4, 256));
        assert_eq!(sb.inode_location(64), Err(Error::OutOfRange));
    }

    #[test]
    fn test_format_no_space() {
        assert_eq!(Superblock::format(512, 4, 64), Err(Error::NoSpace));
        assert_eq!(Superblock::format(100, 64, 1), Err(Error::InvalidArgs));
    }

    #[test]
    fn test_validate_rejects_overlap() {
        let mut sb = Superblock::format(512, 64, 8).unwrap();
        sb.abm_block = sb.ibm_block;
        assert_eq!(sb.validate(), Err(Error::InvalidArgs));

        let mut sb = Superblock::format(512, 64, 8).unwrap();
        sb.magic1 ^= 1;
        assert_eq!(sb.validate(), Err(Error::InvalidArgs));
    }

    #[test]
    fn test_mkfs_then_mount() {
        let disk = Arc::new(RamDisk::new(512, 128));
        let cache = Bcache::create(disk, 128, 512, 4).unwrap();

        let sb = mkfs(&cache, 40).unwrap();
        assert_eq!(mount(&cache).unwrap(), sb);
        // Raw I/O only: nothing was cached.
        assert_eq!(cache.stats().cached, 0);

        let mut bitmap = vec![0u8; 512];
        cache.read_block(sb.abm_block, &mut bitmap).unwrap();
        let used = bitmap.iter().map(|b| b.count_ones()).sum::<u32>();
        assert_eq!(used, sb.dat_block);

        cache.read_block(sb.ibm_block, &mut bitmap).unwrap();
        assert_eq!(bitmap[0], 1);
    }

    #[test]
    fn test_mount_blank_volume_fails() {
        let disk = Arc::new(RamDisk::new(512, 16));
        let cache = Bcache::create(disk, 16, 512, 2).unwrap();
        assert_eq!(mount(&cache), Err(Error::InvalidArgs));
    }
}
