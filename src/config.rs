//! Subsystem configuration
//!
//! Plain structs with conservative defaults. Both are validated before any
//! memory is reserved, so a bad configuration never leaves a half-built pool.

use crate::error::{Error, Result};
use crate::vm::vm_page::{is_page_aligned, PAGE_SIZE};

/// Default number of page frames in the page pool
pub const DEFAULT_POOL_PAGES: usize = 1024;

/// Default ceiling on object size (1 TiB)
pub const DEFAULT_MAX_OBJECT_SIZE: u64 = 1 << 40;

/// Default block size of a cache (minfs blocks)
pub const DEFAULT_BLOCK_SIZE: usize = 8192;

/// Default number of in-memory block nodes
pub const DEFAULT_CACHE_POOL: usize = 64;

/// VM subsystem configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmConfig {
    /// Page frames reserved for paged objects
    pub page_pool_pages: usize,
    /// Largest object size accepted by create, in bytes
    pub max_object_size: u64,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            page_pool_pages: DEFAULT_POOL_PAGES,
            max_object_size: DEFAULT_MAX_OBJECT_SIZE,
        }
    }
}

impl VmConfig {
    /// Check the configuration is usable
    pub fn validate(&self) -> Result<()> {
        if self.page_pool_pages == 0 || self.page_pool_pages > u32::MAX as usize {
            return Err(Error::InvalidArgs);
        }
        if self.max_object_size == 0 || !is_page_aligned(self.max_object_size) {
            return Err(Error::InvalidArgs);
        }
        Ok(())
    }
}

/// Block cache configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BcacheConfig {
    /// Bytes per block
    pub block_size: usize,
    /// Number of blocks on the device
    pub block_max: u32,
    /// Number of in-memory block nodes
    pub pool_size: usize,
}

impl Default for BcacheConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            block_max: 0,
            pool_size: DEFAULT_CACHE_POOL,
        }
    }
}

impl BcacheConfig {
    /// Geometry for a device of `block_max` blocks with default sizing
    pub fn for_blocks(block_max: u32) -> Self {
        Self {
            block_max,
            ..Self::default()
        }
    }

    /// Check the configuration is usable
    ///
    /// Block size must be a power of two of at least 512 bytes and no larger
    /// than a page multiple the cache can buffer.
    pub fn validate(&self) -> Result<()> {
        if !self.block_size.is_power_of_two() || self.block_size < 512 {
            return Err(Error::InvalidArgs);
        }
        if self.block_size > PAGE_SIZE * 64 {
            return Err(Error::InvalidArgs);
        }
        if self.block_max == 0 || self.pool_size == 0 {
            return Err(Error::InvalidArgs);
        }
        Ok(())
    }
}
