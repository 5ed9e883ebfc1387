//! vmkern - Kernel virtual memory objects and block cache
//!
//! This crate provides the kernel-resident core behind virtual memory
//! objects: resizable byte-addressable objects backed by pages, by a fixed
//! physical range, or by a block cache; the bookkeeping that keeps address
//! space mappings consistent across resizes; a fixed-pool block cache over a
//! raw block device; and the fixed-capacity arena allocator that backs the
//! page pool.
//!
//! There are no global singletons. [`init`] builds a [`VmSubsystem`] that
//! owns the page pool and hands out objects and caches.

#![cfg_attr(not(feature = "std"), no_std)]
// Kernel-appropriate clippy configuration
// Manual ceiling division is clearer in memory allocation contexts
#![allow(clippy::manual_div_ceil)]

// Standard library replacement for no_std
extern crate alloc;

pub mod config;
pub mod device;
pub mod error;
pub mod fs;
pub mod kern;
pub mod vm;

use alloc::sync::Arc;

pub use config::{BcacheConfig, VmConfig};
pub use error::{Error, Result, Status};

use device::bcache::Bcache;
use device::block::BlockDevice;
use vm::vm_object::VmObject;
use vm::vm_page::PagePool;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = "vmkern";

// ============================================================================
// Subsystem
// ============================================================================

/// Initialized VM subsystem
///
/// Owns the page pool that every paged object draws from.
#[derive(Debug)]
pub struct VmSubsystem {
    config: VmConfig,
    pages: Arc<PagePool>,
}

impl VmSubsystem {
    /// Configuration the subsystem was built with
    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Shared page pool
    pub fn page_pool(&self) -> &Arc<PagePool> {
        &self.pages
    }

    /// Create a page-backed object of `size` bytes (rounded up to pages)
    pub fn create_vmo(&self, size: u64) -> Result<Arc<VmObject>> {
        VmObject::create_paged(&self.pages, size, self.config.max_object_size)
    }

    /// Create an object over a fixed physical range
    pub fn create_physical_vmo(&self, base: u64, size: u64) -> Result<Arc<VmObject>> {
        VmObject::create_physical(base, size, self.config.max_object_size)
    }

    /// Create an object whose contents live in `cache` from `first_block` on
    pub fn create_cached_vmo(
        &self,
        cache: &Arc<Bcache>,
        first_block: u32,
        size: u64,
    ) -> Result<Arc<VmObject>> {
        VmObject::create_cached(cache, first_block, size, self.config.max_object_size)
    }

    /// Open a block cache over `device`
    pub fn open_cache(
        &self,
        device: Arc<dyn BlockDevice>,
        config: &BcacheConfig,
    ) -> Result<Arc<Bcache>> {
        config.validate()?;
        let cache = Bcache::create(device, config.block_max, config.block_size, config.pool_size)?;
        Ok(Arc::new(cache))
    }
}

/// Initialize the VM subsystem
///
/// Reserves the page pool up front; nothing is allocated lazily afterwards.
pub fn init(config: &VmConfig) -> Result<VmSubsystem> {
    config.validate()?;
    let pages = PagePool::new(config.page_pool_pages)?;
    log::debug!(
        "{} {}: {} pages in pool, objects up to {:#x} bytes",
        NAME,
        VERSION,
        config.page_pool_pages,
        config.max_object_size
    );
    Ok(VmSubsystem {
        config: config.clone(),
        pages,
    })
}
