//! VM Object - Memory Object Abstraction
//!
//! VM objects represent a resizable, byte-addressable span of memory.
//! They can be backed by:
//! - Pages from the page pool, committed on demand (paged objects)
//! - A fixed physical range committed at creation (physical objects)
//! - Blocks of a block cache (cached objects)
//!
//! Each object carries its own lock. Size, the page table and the mapping
//! set only change with that lock held; address space regions take it
//! through [`VmObject::lock`] before adding or removing their mapping.

use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::{Mutex, MutexGuard};

use super::vm_mapping::{MappingId, MappingSet, VmMapping};
use super::vm_page::{
    is_page_aligned, page_index, round_page, trunc_page, PagePool, VmPage, PAGE_MASK, PAGE_SIZE,
};
use crate::device::bcache::{Bcache, BlockFlags};
use crate::error::{Error, Result};

// ============================================================================
// VM Object Types
// ============================================================================

/// VM Object ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VmObjectId(pub u64);

impl VmObjectId {
    /// Null object ID
    pub const NULL: Self = Self(0);
}

/// Next object ID
static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// Mask of the valid cache policy bits
pub const CACHE_POLICY_MASK: u32 = 0x3;

/// Caching applied to mappings of an object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum CachePolicy {
    #[default]
    Cached = 0,
    Uncached = 1,
    UncachedDevice = 2,
    WriteCombining = 3,
}

impl CachePolicy {
    /// Decode raw policy bits
    pub fn from_raw(bits: u32) -> Result<Self> {
        if bits & !CACHE_POLICY_MASK != 0 {
            return Err(Error::InvalidArgs);
        }
        Ok(match bits {
            0 => CachePolicy::Cached,
            1 => CachePolicy::Uncached,
            2 => CachePolicy::UncachedDevice,
            _ => CachePolicy::WriteCombining,
        })
    }
}

/// Range operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RangeOp {
    /// Commit backing storage
    Commit = 1,
    /// Release backing storage
    Decommit = 2,
    /// Pin pages
    Lock = 3,
    /// Unpin pages
    Unlock = 4,
    /// Report the address of each page
    Lookup = 5,
    CacheSync = 6,
    CacheInvalidate = 7,
    CacheClean = 8,
    CacheCleanInvalidate = 9,
}

impl RangeOp {
    /// Decode a raw operation code
    pub fn from_raw(op: u32) -> Result<Self> {
        Ok(match op {
            1 => RangeOp::Commit,
            2 => RangeOp::Decommit,
            3 => RangeOp::Lock,
            4 => RangeOp::Unlock,
            5 => RangeOp::Lookup,
            6 => RangeOp::CacheSync,
            7 => RangeOp::CacheInvalidate,
            8 => RangeOp::CacheClean,
            9 => RangeOp::CacheCleanInvalidate,
            _ => return Err(Error::InvalidArgs),
        })
    }
}

// ============================================================================
// Backing Store
// ============================================================================

/// Where an object's bytes live
enum Backing {
    /// Sparse page table, page index -> committed page
    Paged {
        pool: Arc<PagePool>,
        pages: BTreeMap<u64, VmPage>,
    },
    /// Fixed physical range; `aperture` is the kernel's view of it
    Physical { base: u64, aperture: Vec<u8> },
    /// Blocks `first_block..` of a block cache
    Cached {
        cache: Arc<Bcache>,
        first_block: u32,
        /// Bytes addressable before running off the device
        limit: u64,
        /// Bytes in `[size, stale_end)` may still hold data from before a shrink
        stale_end: u64,
    },
}

impl Backing {
    fn kind(&self) -> &'static str {
        match self {
            Backing::Paged { .. } => "paged",
            Backing::Physical { .. } => "physical",
            Backing::Cached { .. } => "cached",
        }
    }
}

/// State guarded by the object lock
pub struct VmObjectInner {
    size: u64,
    backing: Backing,
    mappings: MappingSet,
    cache_policy: CachePolicy,
}

impl VmObjectInner {
    /// Current size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Register a mapping; the caller holds the object lock
    pub fn add_mapping(&mut self, mapping: Weak<VmMapping>) -> MappingId {
        self.mappings.insert(mapping)
    }

    /// Unregister a mapping; the caller holds the object lock
    pub fn remove_mapping(&mut self, id: MappingId) -> bool {
        self.mappings.remove(id)
    }

    /// Check whether a mapping is registered
    pub fn has_mapping(&self, id: MappingId) -> bool {
        self.mappings.contains(id)
    }

    /// Number of registered mappings
    pub fn mapping_count(&self) -> usize {
        self.mappings.len()
    }
}

// ============================================================================
// VM Object
// ============================================================================

/// VM Object
pub struct VmObject {
    id: VmObjectId,
    /// Largest size set_size accepts
    max_size: u64,
    inner: Mutex<VmObjectInner>,
}

impl VmObject {
    fn new(size: u64, backing: Backing, max_size: u64) -> Arc<Self> {
        let id = VmObjectId(NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed));
        log::debug!("vmo {}: created {} object of {:#x} bytes", id.0, backing.kind(), size);
        Arc::new(Self {
            id,
            max_size,
            inner: Mutex::new(VmObjectInner {
                size,
                backing,
                mappings: MappingSet::new(),
                cache_policy: CachePolicy::default(),
            }),
        })
    }

    /// Create a zero-filled object backed by pages from `pool`
    ///
    /// `size` is rounded up to a page multiple. No pages are committed until
    /// the object is written or a commit range op runs.
    pub fn create_paged(pool: &Arc<PagePool>, size: u64, max_size: u64) -> Result<Arc<Self>> {
        let size = checked_object_size(size, max_size)?;
        Ok(Self::new(
            size,
            Backing::Paged {
                pool: Arc::clone(pool),
                pages: BTreeMap::new(),
            },
            max_size,
        ))
    }

    /// Create an object over the physical range `[base, base + size)`
    ///
    /// The whole range is committed at creation; the object cannot resize.
    pub fn create_physical(base: u64, size: u64, max_size: u64) -> Result<Arc<Self>> {
        if !is_page_aligned(base) {
            return Err(Error::InvalidArgs);
        }
        let size = checked_object_size(size, max_size)?;
        base.checked_add(size).ok_or(Error::InvalidArgs)?;

        let len = usize::try_from(size).map_err(|_| Error::NoMemory)?;
        let mut aperture = Vec::new();
        aperture.try_reserve_exact(len).map_err(|_| Error::NoMemory)?;
        aperture.resize(len, 0);

        Ok(Self::new(size, Backing::Physical { base, aperture }, max_size))
    }

    /// Create an object whose byte `n` lives in block `first_block + n / block_size`
    pub fn create_cached(
        cache: &Arc<Bcache>,
        first_block: u32,
        size: u64,
        max_size: u64,
    ) -> Result<Arc<Self>> {
        if first_block >= cache.block_max() {
            return Err(Error::InvalidArgs);
        }
        let size = checked_object_size(size, max_size)?;
        let limit = u64::from(cache.block_max() - first_block) * cache.block_size() as u64;
        if size > limit {
            return Err(Error::OutOfRange);
        }
        Ok(Self::new(
            size,
            Backing::Cached {
                cache: Arc::clone(cache),
                first_block,
                limit,
                stale_end: 0,
            },
            max_size,
        ))
    }

    /// Object identity
    pub fn id(&self) -> VmObjectId {
        self.id
    }

    /// Take the object lock
    pub fn lock(&self) -> MutexGuard<'_, VmObjectInner> {
        self.inner.lock()
    }

    /// Current size in bytes
    pub fn size(&self) -> u64 {
        self.inner.lock().size
    }

    /// Current cache policy
    pub fn cache_policy(&self) -> CachePolicy {
        self.inner.lock().cache_policy
    }

    /// Number of mappings referencing the object
    pub fn mapping_count(&self) -> usize {
        self.inner.lock().mappings.len()
    }

    /// Number of committed pages (physical objects count their whole range)
    pub fn committed_pages(&self) -> usize {
        let inner = self.inner.lock();
        match &inner.backing {
            Backing::Paged { pages, .. } => pages.len(),
            Backing::Physical { aperture, .. } => aperture.len() / PAGE_SIZE,
            Backing::Cached { .. } => 0,
        }
    }

    // ========================================================================
    // Read / Write
    // ========================================================================

    /// Read up to `dst.len()` bytes starting at `offset`
    ///
    /// The range is clipped to the object. Returns the bytes transferred,
    /// which is zero when `offset` is at or past the end. Uncommitted pages
    /// read as zeros. A cached object whose device fails partway returns
    /// the bytes read before the failure; a failure on the first block is
    /// returned as is.
    pub fn read(&self, dst: &mut [u8], offset: u64) -> Result<usize> {
        let inner = self.inner.lock();
        let mut len = clip(inner.size, offset, dst.len());
        let dst = &mut dst[..len];

        match &inner.backing {
            Backing::Paged { pages, .. } => {
                let mut done = 0;
                while done < len {
                    let pos = offset + done as u64;
                    let in_page = (pos & PAGE_MASK) as usize;
                    let chunk = (PAGE_SIZE - in_page).min(len - done);
                    let out = &mut dst[done..done + chunk];
                    match pages.get(&page_index(pos)) {
                        Some(page) => out.copy_from_slice(&page.as_slice()[in_page..in_page + chunk]),
                        None => out.fill(0),
                    }
                    done += chunk;
                }
            }
            Backing::Physical { aperture, .. } => {
                let start = offset as usize;
                dst.copy_from_slice(&aperture[start..start + len]);
            }
            Backing::Cached {
                cache, first_block, ..
            } => {
                let (done, loaded) = load_blocks(cache, *first_block, offset, dst);
                len = settle(self.id, "read", done, loaded)?;
            }
        }

        log::trace!("vmo {}: read {:#x} bytes at {:#x}", self.id.0, len, offset);
        Ok(len)
    }

    /// Write up to `src.len()` bytes starting at `offset`
    ///
    /// The range is clipped to the object. Every page the range touches is
    /// committed before any byte is copied; if that fails the write returns
    /// `NoMemory` and the object contents are unchanged.
    ///
    /// Cached objects write through block by block. If the cache or device
    /// fails after some blocks went through, the write is short and returns
    /// the bytes stored; a failure on the first block is returned as is.
    pub fn write(&self, src: &[u8], offset: u64) -> Result<usize> {
        let mut inner = self.inner.lock();
        let mut len = clip(inner.size, offset, src.len());
        let src = &src[..len];
        if len == 0 {
            return Ok(0);
        }

        match &mut inner.backing {
            Backing::Paged { pool, pages } => {
                commit_pages(self.id, pool, pages, offset, len as u64)?;
                let mut done = 0;
                while done < len {
                    let pos = offset + done as u64;
                    let in_page = (pos & PAGE_MASK) as usize;
                    let chunk = (PAGE_SIZE - in_page).min(len - done);
                    let page = pages.get_mut(&page_index(pos)).ok_or(Error::BadState)?;
                    page.as_mut_slice()[in_page..in_page + chunk]
                        .copy_from_slice(&src[done..done + chunk]);
                    done += chunk;
                }
            }
            Backing::Physical { aperture, .. } => {
                let start = offset as usize;
                aperture[start..start + len].copy_from_slice(src);
            }
            Backing::Cached {
                cache, first_block, ..
            } => {
                let (done, stored) = store_blocks(cache, *first_block, offset, len, Some(src));
                len = settle(self.id, "write", done, stored)?;
            }
        }

        log::trace!("vmo {}: wrote {:#x} bytes at {:#x}", self.id.0, len, offset);
        Ok(len)
    }

    // ========================================================================
    // Size
    // ========================================================================

    /// Resize the object
    ///
    /// `new_size` must be page aligned. Growing only moves the end; shrinking
    /// releases the pages past the new end and, before returning, has every
    /// mapping that reaches past it unmap the dropped range.
    ///
    /// Cached blocks outlive the object size. A shrink moves the end first
    /// and then zeroes the dropped blocks; if that fails the range is
    /// remembered as stale, and the grow that next exposes it zeroes it
    /// before moving the end (failing with the cache error if it cannot).
    pub fn set_size(&self, new_size: u64) -> Result<()> {
        if !is_page_aligned(new_size) || new_size > self.max_size {
            return Err(Error::InvalidArgs);
        }

        let mut inner = self.inner.lock();
        let old_size = inner.size;

        match &mut inner.backing {
            Backing::Physical { .. } => return Err(Error::NotSupported),
            Backing::Cached { limit, .. } if new_size > *limit => return Err(Error::OutOfRange),
            _ => {}
        }
        if new_size == old_size {
            return Ok(());
        }

        if new_size > old_size {
            if let Backing::Cached {
                cache,
                first_block,
                stale_end,
                ..
            } = &mut inner.backing
            {
                if *stale_end > old_size {
                    let len = (new_size.min(*stale_end) - old_size) as usize;
                    let (_, scrubbed) = store_blocks(cache, *first_block, old_size, len, None);
                    scrubbed.inspect_err(|e| {
                        log::warn!("vmo {}: stale range not zeroed, no grow: {}", self.id.0, e);
                    })?;
                    if *stale_end <= new_size {
                        *stale_end = 0;
                    }
                }
            }
            inner.size = new_size;
            log::debug!("vmo {}: grew {:#x} -> {:#x}", self.id.0, old_size, new_size);
            return Ok(());
        }

        inner.size = new_size;
        let live = inner.mappings.live();
        for mapping in &live {
            mapping.on_object_shrink(new_size);
        }

        match &mut inner.backing {
            Backing::Paged { pages, .. } => {
                let dropped = pages.split_off(&page_index(new_size));
                log::debug!("vmo {}: released {} pages", self.id.0, dropped.len());
            }
            Backing::Cached {
                cache,
                first_block,
                stale_end,
                ..
            } => {
                let len = (old_size - new_size) as usize;
                let (_, scrubbed) = store_blocks(cache, *first_block, new_size, len, None);
                if let Err(e) = scrubbed {
                    log::warn!(
                        "vmo {}: zeroing [{:#x}, {:#x}) failed: {}",
                        self.id.0,
                        new_size,
                        old_size,
                        e
                    );
                    *stale_end = (*stale_end).max(old_size);
                }
            }
            Backing::Physical { .. } => unreachable!(),
        }
        drop(inner);
        // Dropping a mapping takes the object lock.
        drop(live);

        log::debug!("vmo {}: shrank {:#x} -> {:#x}", self.id.0, old_size, new_size);
        Ok(())
    }

    // ========================================================================
    // Range Operations
    // ========================================================================

    /// Apply `op` to `[offset, offset + len)`
    ///
    /// `buffer` receives output for [`RangeOp::Lookup`]: one little-endian
    /// `u64` address per page the range touches. Other ops ignore it.
    pub fn range_op(&self, op: RangeOp, offset: u64, len: u64, buffer: &mut [u8]) -> Result<()> {
        let end = offset.checked_add(len).ok_or(Error::OutOfRange)?;
        let mut inner = self.inner.lock();
        if end > inner.size {
            return Err(Error::OutOfRange);
        }

        log::trace!("vmo {}: {:?} [{:#x}, {:#x})", self.id.0, op, offset, end);

        match op {
            RangeOp::Commit => match &mut inner.backing {
                Backing::Paged { pool, pages } => commit_pages(self.id, pool, pages, offset, len),
                Backing::Physical { .. } => Ok(()),
                Backing::Cached {
                    cache, first_block, ..
                } => {
                    if len == 0 {
                        return Ok(());
                    }
                    let bsize = cache.block_size();
                    let (first, _) = block_of(*first_block, bsize, offset);
                    let (last, _) = block_of(*first_block, bsize, end - 1);
                    for bno in first..=last {
                        let node = cache.get(bno)?;
                        cache.put(node, BlockFlags::empty())?;
                    }
                    Ok(())
                }
            },
            RangeOp::Decommit => match &mut inner.backing {
                Backing::Paged { pages, .. } => {
                    if len == 0 {
                        return Ok(());
                    }
                    let first = page_index(trunc_page(offset));
                    let last = page_index(round_page(end).ok_or(Error::OutOfRange)?);
                    let mut tail = pages.split_off(&first);
                    let mut keep = tail.split_off(&last);
                    pages.append(&mut keep);
                    log::debug!("vmo {}: decommitted {} pages", self.id.0, tail.len());
                    Ok(())
                }
                Backing::Physical { .. } | Backing::Cached { .. } => Err(Error::NotSupported),
            },
            RangeOp::Lock | RangeOp::Unlock => Err(Error::NotSupported),
            RangeOp::Lookup => {
                if len == 0 {
                    return Ok(());
                }
                let first = page_index(trunc_page(offset));
                let last = page_index(end - 1);
                let count = (last - first + 1) as usize;
                if buffer.len() < count * 8 {
                    return Err(Error::BufferTooSmall);
                }
                for (slot, index) in buffer.chunks_exact_mut(8).zip(first..=last) {
                    let addr = match &inner.backing {
                        Backing::Paged { pages, .. } => {
                            pages.get(&index).ok_or(Error::BadState)?.phys_addr()
                        }
                        Backing::Physical { base, .. } => base + index * PAGE_SIZE as u64,
                        Backing::Cached { .. } => return Err(Error::NotSupported),
                    };
                    slot.copy_from_slice(&addr.to_le_bytes());
                }
                Ok(())
            }
            RangeOp::CacheSync
            | RangeOp::CacheInvalidate
            | RangeOp::CacheClean
            | RangeOp::CacheCleanInvalidate => Ok(()),
        }
    }

    // ========================================================================
    // Cache Policy
    // ========================================================================

    /// Change the cache policy of current and future mappings
    pub fn set_mapping_cache_policy(&self, bits: u32) -> Result<()> {
        let policy = CachePolicy::from_raw(bits)?;

        let mut inner = self.inner.lock();
        inner.cache_policy = policy;
        let live = inner.mappings.live();
        for mapping in &live {
            mapping.on_cache_policy(policy);
        }
        drop(inner);
        drop(live);

        log::debug!("vmo {}: cache policy {:?}", self.id.0, policy);
        Ok(())
    }

    // ========================================================================
    // Debugging
    // ========================================================================

    /// Log the object state at debug level
    ///
    /// With `pages` set, every committed page is listed as well.
    pub fn dump(&self, pages: bool) {
        let inner = self.inner.lock();
        log::debug!(
            "vmo {}: {} size {:#x} mappings {} policy {:?}",
            self.id.0,
            inner.backing.kind(),
            inner.size,
            inner.mappings.len(),
            inner.cache_policy
        );
        match &inner.backing {
            Backing::Paged { pages: table, .. } => {
                log::debug!("  committed pages {}", table.len());
                if pages {
                    for (index, page) in table {
                        log::debug!("  page {:#x} phys {:#x}", index, page.phys_addr());
                    }
                }
            }
            Backing::Physical { base, aperture } => {
                log::debug!("  phys {:#x}..{:#x}", base, *base + aperture.len() as u64);
            }
            Backing::Cached {
                first_block,
                limit,
                stale_end,
                ..
            } => {
                log::debug!(
                    "  first block {} limit {:#x} stale to {:#x}",
                    first_block,
                    limit,
                    stale_end
                );
            }
        }
    }
}

impl Drop for VmObject {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        assert!(
            inner.mappings.is_empty(),
            "vmo {} destroyed with {} live mappings",
            self.id.0,
            inner.mappings.len()
        );
        log::debug!("vmo {}: destroyed", self.id.0);
    }
}

impl core::fmt::Debug for VmObject {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("VmObject")
            .field("id", &self.id)
            .field("kind", &inner.backing.kind())
            .field("size", &inner.size)
            .field("mappings", &inner.mappings.len())
            .finish()
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn checked_object_size(size: u64, max_size: u64) -> Result<u64> {
    match round_page(size) {
        Some(size) if size <= max_size => Ok(size),
        _ => Err(Error::InvalidArgs),
    }
}

/// Bytes of `[offset, offset + len)` that fall inside `[0, size)`
fn clip(size: u64, offset: u64, len: usize) -> usize {
    if offset >= size {
        return 0;
    }
    (size - offset).min(len as u64) as usize
}

/// Block number and in-block offset of an object byte
fn block_of(first_block: u32, block_size: usize, pos: u64) -> (u32, usize) {
    let bsize = block_size as u64;
    ((first_block as u64 + pos / bsize) as u32, (pos % bsize) as usize)
}

/// Make sure every page touching `[offset, offset + len)` is present
fn commit_pages(
    id: VmObjectId,
    pool: &Arc<PagePool>,
    pages: &mut BTreeMap<u64, VmPage>,
    offset: u64,
    len: u64,
) -> Result<()> {
    if len == 0 {
        return Ok(());
    }
    let first = page_index(offset);
    let last = page_index(offset + len - 1);
    for index in first..=last {
        if pages.contains_key(&index) {
            continue;
        }
        let page = pool.alloc_page().inspect_err(|_| {
            log::warn!("vmo {}: no page for index {}", id.0, index);
        })?;
        pages.insert(index, page);
    }
    Ok(())
}

/// Turn a block-by-block transfer into a byte count
///
/// Bytes already moved make the transfer short instead of failed.
fn settle(id: VmObjectId, what: &str, done: usize, result: Result<()>) -> Result<usize> {
    match result {
        Ok(()) => Ok(done),
        Err(e) if done == 0 => Err(e),
        Err(e) => {
            log::warn!("vmo {}: {} cut short at {:#x} bytes: {}", id.0, what, done, e);
            Ok(done)
        }
    }
}

/// Copy cached blocks into `dst` starting at object byte `offset`
///
/// Returns the bytes copied, and the error that stopped the copy if any.
fn load_blocks(
    cache: &Bcache,
    first_block: u32,
    offset: u64,
    dst: &mut [u8],
) -> (usize, Result<()>) {
    let bsize = cache.block_size();
    let len = dst.len();
    let mut done = 0;
    while done < len {
        let (bno, in_block) = block_of(first_block, bsize, offset + done as u64);
        let chunk = (bsize - in_block).min(len - done);
        if let Err(e) = cache.read(bno, in_block, &mut dst[done..done + chunk]) {
            return (done, Err(e));
        }
        done += chunk;
    }
    (done, Ok(()))
}

/// Copy `src` (or zeros) into cached blocks starting at object byte `offset`
///
/// Returns the bytes that reached the device, and the error that stopped
/// the copy if any. A block whose write failed is not counted.
fn store_blocks(
    cache: &Bcache,
    first_block: u32,
    offset: u64,
    len: usize,
    src: Option<&[u8]>,
) -> (usize, Result<()>) {
    let bsize = cache.block_size();
    let mut done = 0;
    while done < len {
        let (bno, in_block) = block_of(first_block, bsize, offset + done as u64);
        let chunk = (bsize - in_block).min(len - done);

        let whole = in_block == 0 && chunk == bsize;
        let node = if whole {
            cache.get_zero(bno)
        } else {
            cache.get(bno)
        };
        let node = match node {
            Ok(node) => node,
            Err(e) => return (done, Err(e)),
        };
        {
            let mut data = node.data();
            let out = &mut data[in_block..in_block + chunk];
            match src {
                Some(src) => out.copy_from_slice(&src[done..done + chunk]),
                None => out.fill(0),
            }
        }
        if let Err(e) = cache.put(node, BlockFlags::DIRTY) {
            return (done, Err(e));
        }
        done += chunk;
    }
    (done, Ok(()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::block::RamDisk;

    const PAGE: u64 = PAGE_SIZE as u64;
    const MAX: u64 = 1 << 40;

    fn paged(pool_pages: usize, size: u64) -> (Arc<PagePool>, Arc<VmObject>) {
        let pool = PagePool::new(pool_pages).unwrap();
        let vmo = VmObject::create_paged(&pool, size, MAX).unwrap();
        (pool, vmo)
    }

    #[test]
    fn test_create_rounds_up() {
        let (_pool, vmo) = paged(1, 1);
        assert_eq!(vmo.size(), PAGE);
        let (_pool, vmo) = paged(1, 0);
        assert_eq!(vmo.size(), 0);
        let (_pool, vmo) = paged(1, 3 * PAGE + 5);
        assert_eq!(vmo.size(), 4 * PAGE);
    }

    #[test]
    fn test_create_rejects_oversize() {
        let pool = PagePool::new(1).unwrap();
        assert_eq!(
            VmObject::create_paged(&pool, u64::MAX, MAX).unwrap_err(),
            Error::InvalidArgs
        );
        assert_eq!(
            VmObject::create_paged(&pool, 2 * PAGE, PAGE).unwrap_err(),
            Error::InvalidArgs
        );
    }

    #[test]
    fn test_ids_are_unique() {
        let (_pool, a) = paged(1, PAGE);
        let (_pool, b) = paged(1, PAGE);
        assert_ne!(a.id(), b.id());
        assert_ne!(a.id(), VmObjectId::NULL);
    }

    #[test]
    fn test_sparse_read_is_zero() {
        let (pool, vmo) = paged(4, 2 * PAGE);
        let mut buf = [0xFFu8; 64];
        assert_eq!(vmo.read(&mut buf, 100).unwrap(), 64);
        assert!(buf.iter().all(|&b| b == 0));
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn test_write_spanning_pages() {
        let (pool, vmo) = paged(4, 3 * PAGE);
        let data: Vec<u8> = (0..PAGE as usize + 100).map(|i| i as u8).collect();
        assert_eq!(vmo.write(&data, PAGE - 50).unwrap(), data.len());
        assert_eq!(vmo.committed_pages(), 3);
        assert_eq!(pool.available(), 1);

        let mut back = vec![0u8; data.len()];
        assert_eq!(vmo.read(&mut back, PAGE - 50).unwrap(), data.len());
        assert_eq!(back, data);
    }

    #[test]
    fn test_short_transfers() {
        let (_pool, vmo) = paged(2, PAGE);
        let mut buf = [0u8; 16];
        assert_eq!(vmo.write(&buf, PAGE - 4).unwrap(), 4);
        assert_eq!(vmo.read(&mut buf, PAGE - 4).unwrap(), 4);
        assert_eq!(vmo.read(&mut buf, PAGE).unwrap(), 0);
        assert_eq!(vmo.write(&buf, PAGE + 100).unwrap(), 0);
    }

    #[test]
    fn test_write_without_pages_copies_nothing() {
        let (_pool, vmo) = paged(1, 2 * PAGE);
        vmo.write(&[1u8; 8], 0).unwrap();

        let data = vec![7u8; PAGE as usize];
        assert_eq!(vmo.write(&data, 8).unwrap_err(), Error::NoMemory);

        let mut buf = [0u8; 16];
        vmo.read(&mut buf, 0).unwrap();
        assert_eq!(&buf[..8], &[1u8; 8]);
        assert_eq!(&buf[8..], &[0u8; 8]);
    }

    #[test]
    fn test_shrink_releases_pages_and_grow_reads_zero() {
        let (pool, vmo) = paged(4, 4 * PAGE);
        vmo.write(&vec![9u8; 4 * PAGE as usize], 0).unwrap();
        assert_eq!(pool.available(), 0);

        vmo.set_size(PAGE).unwrap();
        assert_eq!(vmo.size(), PAGE);
        assert_eq!(vmo.committed_pages(), 1);
        assert_eq!(pool.available(), 3);

        vmo.set_size(2 * PAGE).unwrap();
        let mut buf = [0xAAu8; 8];
        vmo.read(&mut buf, PAGE).unwrap();
        assert_eq!(buf, [0u8; 8]);
    }

    #[test]
    fn test_set_size_rejects() {
        let (_pool, vmo) = paged(1, PAGE);
        assert_eq!(vmo.set_size(100), Err(Error::InvalidArgs));
        assert_eq!(vmo.set_size(MAX + PAGE), Err(Error::InvalidArgs));
        assert_eq!(vmo.size(), PAGE);

        let phys = VmObject::create_physical(0x8000_0000, PAGE, MAX).unwrap();
        assert_eq!(phys.set_size(2 * PAGE), Err(Error::NotSupported));
    }

    #[test]
    fn test_range_op_commit_decommit() {
        let (pool, vmo) = paged(8, 4 * PAGE);
        vmo.range_op(RangeOp::Commit, 0, 3 * PAGE, &mut []).unwrap();
        assert_eq!(vmo.committed_pages(), 3);

        vmo.range_op(RangeOp::Decommit, PAGE, PAGE, &mut []).unwrap();
        assert_eq!(vmo.committed_pages(), 2);
        assert_eq!(pool.available(), 6);

        assert_eq!(
            vmo.range_op(RangeOp::Commit, 3 * PAGE, 2 * PAGE, &mut []),
            Err(Error::OutOfRange)
        );
        assert_eq!(
            vmo.range_op(RangeOp::Commit, u64::MAX, 2, &mut []),
            Err(Error::OutOfRange)
        );
        assert_eq!(
            vmo.range_op(RangeOp::Lock, 0, PAGE, &mut []),
            Err(Error::NotSupported)
        );
        vmo.range_op(RangeOp::CacheCleanInvalidate, 0, 4 * PAGE, &mut [])
            .unwrap();
    }

    #[test]
    fn test_range_op_lookup() {
        let (_pool, vmo) = paged(4, 2 * PAGE);
        let mut out = [0u8; 16];
        assert_eq!(
            vmo.range_op(RangeOp::Lookup, 0, 2 * PAGE, &mut out),
            Err(Error::BadState)
        );

        vmo.range_op(RangeOp::Commit, 0, 2 * PAGE, &mut []).unwrap();
        assert_eq!(
            vmo.range_op(RangeOp::Lookup, 0, 2 * PAGE, &mut out[..8]),
            Err(Error::BufferTooSmall)
        );
        vmo.range_op(RangeOp::Lookup, 0, 2 * PAGE, &mut out).unwrap();
        let a = u64::from_le_bytes(out[..8].try_into().unwrap());
        let b = u64::from_le_bytes(out[8..].try_into().unwrap());
        assert!(is_page_aligned(a) && is_page_aligned(b));
        assert_ne!(a, b);

        let phys = VmObject::create_physical(0x4000_0000, 2 * PAGE, MAX).unwrap();
        phys.range_op(RangeOp::Lookup, 100, PAGE, &mut out).unwrap();
        assert_eq!(u64::from_le_bytes(out[..8].try_into().unwrap()), 0x4000_0000);
        assert_eq!(
            u64::from_le_bytes(out[8..].try_into().unwrap()),
            0x4000_0000 + PAGE
        );
    }

    #[test]
    fn test_range_op_codes() {
        assert_eq!(RangeOp::from_raw(1), Ok(RangeOp::Commit));
        assert_eq!(RangeOp::from_raw(9), Ok(RangeOp::CacheCleanInvalidate));
        assert_eq!(RangeOp::from_raw(0), Err(Error::InvalidArgs));
        assert_eq!(RangeOp::from_raw(10), Err(Error::InvalidArgs));
    }

    #[test]
    fn test_cache_policy_bits() {
        let (_pool, vmo) = paged(1, PAGE);
        assert_eq!(vmo.set_mapping_cache_policy(0x4), Err(Error::InvalidArgs));
        assert_eq!(vmo.cache_policy(), CachePolicy::Cached);
        vmo.set_mapping_cache_policy(3).unwrap();
        assert_eq!(vmo.cache_policy(), CachePolicy::WriteCombining);
    }

    #[test]
    fn test_physical_object() {
        assert_eq!(
            VmObject::create_physical(0x1001, PAGE, MAX).unwrap_err(),
            Error::InvalidArgs
        );
        let phys = VmObject::create_physical(0x1000, PAGE, MAX).unwrap();
        assert_eq!(phys.committed_pages(), 1);
        phys.write(b"mmio", 16).unwrap();
        let mut buf = [0u8; 4];
        phys.read(&mut buf, 16).unwrap();
        assert_eq!(&buf, b"mmio");
        assert_eq!(
            phys.range_op(RangeOp::Decommit, 0, PAGE, &mut []),
            Err(Error::NotSupported)
        );
    }

    #[test]
    fn test_cached_object() {
        let disk = Arc::new(RamDisk::new(1024, 16));
        let cache = Arc::new(Bcache::create(disk.clone(), 16, 1024, 4).unwrap());

        assert_eq!(
            VmObject::create_cached(&cache, 16, PAGE, MAX).unwrap_err(),
            Error::InvalidArgs
        );
        assert_eq!(
            VmObject::create_cached(&cache, 14, PAGE, MAX).unwrap_err(),
            Error::OutOfRange
        );

        let vmo = VmObject::create_cached(&cache, 4, 2 * PAGE, MAX).unwrap();
        let data: Vec<u8> = (0..3000).map(|i| (i % 251) as u8).collect();
        assert_eq!(vmo.write(&data, 500).unwrap(), 3000);

        // Write-through: the device already holds the bytes.
        let mut raw = vec![0u8; 1024];
        cache.read_block(5, &mut raw).unwrap();
        assert_eq!(&raw[..], &data[524..1548]);

        let mut back = vec![0u8; 3000];
        vmo.read(&mut back, 500).unwrap();
        assert_eq!(back, data);

        vmo.set_size(0).unwrap();
        vmo.set_size(PAGE).unwrap();
        vmo.read(&mut back, 500).unwrap();
        assert!(back.iter().all(|&b| b == 0));

        assert_eq!(vmo.set_size(4 * PAGE), Err(Error::OutOfRange));
        vmo.range_op(RangeOp::Commit, 0, PAGE, &mut []).unwrap();
        assert_eq!(
            vmo.range_op(RangeOp::Lookup, 0, PAGE, &mut [0u8; 8]),
            Err(Error::NotSupported)
        );
    }

    #[test]
    fn test_dump_every_kind() {
        let (_pool, paged) = paged(4, 3 * PAGE);
        paged.write(b"x", PAGE).unwrap();
        paged.dump(false);
        paged.dump(true);
        assert_eq!(paged.committed_pages(), 1);

        let phys = VmObject::create_physical(0x8000_0000, PAGE, MAX).unwrap();
        phys.dump(true);

        let disk = Arc::new(RamDisk::new(1024, 16));
        let cache = Arc::new(Bcache::create(disk, 16, 1024, 4).unwrap());
        let cached = VmObject::create_cached(&cache, 4, PAGE, MAX).unwrap();
        cached.dump(true);
        assert_eq!(cached.size(), PAGE);
    }
}
