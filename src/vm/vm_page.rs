//! VM Page Management - Backing pages for memory objects
//!
//! Pages handed to VM objects come from a [`PagePool`], a fixed-capacity
//! arena of page-sized slots built once at subsystem initialization. A
//! [`VmPage`] owns its slot and returns it to the pool when dropped.

use alloc::sync::Arc;
use core::ptr::NonNull;

use crate::error::Result;
use crate::kern::arena::Arena;

// ============================================================================
// Constants
// ============================================================================

/// Page size (4KB on most platforms)
pub const PAGE_SIZE: usize = 4096;

/// Page shift (log2 of PAGE_SIZE)
pub const PAGE_SHIFT: usize = 12;

/// Mask of the in-page offset bits
pub const PAGE_MASK: u64 = PAGE_SIZE as u64 - 1;

/// Round up to a page boundary, `None` on overflow
#[inline]
pub const fn round_page(addr: u64) -> Option<u64> {
    match addr.checked_add(PAGE_MASK) {
        Some(v) => Some(v & !PAGE_MASK),
        None => None,
    }
}

/// Round down to a page boundary
#[inline]
pub const fn trunc_page(addr: u64) -> u64 {
    addr & !PAGE_MASK
}

/// Check page alignment
#[inline]
pub const fn is_page_aligned(addr: u64) -> bool {
    addr & PAGE_MASK == 0
}

/// Page index containing a byte offset
#[inline]
pub const fn page_index(offset: u64) -> u64 {
    offset >> PAGE_SHIFT
}

// ============================================================================
// Page Pool
// ============================================================================

/// Fixed pool of physical pages
#[derive(Debug)]
pub struct PagePool {
    arena: Arena,
}

impl PagePool {
    /// Reserve `pages` page frames
    pub fn new(pages: usize) -> Result<Arc<Self>> {
        let arena = Arena::init("vm-pages", PAGE_SIZE, pages)?;
        Ok(Arc::new(Self { arena }))
    }

    /// Allocate a zero-filled page
    pub fn alloc_page(self: &Arc<Self>) -> Result<VmPage> {
        let addr = self.arena.alloc()?;
        // Slots keep their old contents across free/alloc.
        // SAFETY: the slot is PAGE_SIZE bytes and exclusively ours.
        unsafe { core::ptr::write_bytes(addr.as_ptr(), 0, PAGE_SIZE) };
        Ok(VmPage {
            pool: Arc::clone(self),
            addr,
        })
    }

    /// Total page frames
    pub fn capacity(&self) -> usize {
        self.arena.capacity()
    }

    /// Page frames not currently owned by any object
    pub fn available(&self) -> usize {
        self.arena.available()
    }

    /// Check whether an address belongs to this pool
    pub fn contains(&self, addr: u64) -> bool {
        self.arena.in_range(addr as usize as *const u8)
    }
}

// ============================================================================
// VM Page
// ============================================================================

/// One committed page, owned by exactly one VM object
pub struct VmPage {
    pool: Arc<PagePool>,
    addr: NonNull<u8>,
}

// A VmPage is the sole owner of its slot.
unsafe impl Send for VmPage {}
unsafe impl Sync for VmPage {}

impl VmPage {
    /// Address of the page frame
    pub fn phys_addr(&self) -> u64 {
        self.addr.as_ptr() as usize as u64
    }

    /// Page contents
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the slot is PAGE_SIZE bytes and lives as long as self.
        unsafe { core::slice::from_raw_parts(self.addr.as_ptr(), PAGE_SIZE) }
    }

    /// Mutable page contents
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and &mut self guarantees exclusivity.
        unsafe { core::slice::from_raw_parts_mut(self.addr.as_ptr(), PAGE_SIZE) }
    }
}

impl Drop for VmPage {
    fn drop(&mut self) {
        // SAFETY: the slot came from this pool's arena and is released once.
        unsafe { self.pool.arena.free(self.addr) };
    }
}

impl core::fmt::Debug for VmPage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "VmPage({:#x})", self.phys_addr())
    }
}
