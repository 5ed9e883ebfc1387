//! Arena - Fixed-capacity allocator for same-sized kernel objects
//!
//! An arena hands out slots of a single size from one contiguous,
//! page-aligned data region. Allocation and free are both O(1).
//!
//! Unlike a classic zone, the free list does not live inside the free
//! elements. Bookkeeping is kept in a separate control region (one node per
//! slot), so a buffer overrun in allocated data cannot corrupt the free list.

use alloc::alloc::{alloc_zeroed, dealloc};
use alloc::vec::Vec;
use core::alloc::Layout;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use spin::Mutex;

use crate::error::{Error, Result};
use crate::vm::vm_page::{round_page, PAGE_SIZE};

/// Longest arena name kept for diagnostics
pub const ARENA_NAME_LEN: usize = 32;

/// Slots are at least this aligned
const SLOT_ALIGN: usize = core::mem::align_of::<u64>();

// ============================================================================
// Arena Statistics
// ============================================================================

/// Arena statistics for debugging and monitoring
#[derive(Debug, Default)]
pub struct ArenaStats {
    /// Total successful allocations
    pub alloc_count: AtomicU64,
    /// Total frees
    pub free_count: AtomicU64,
    /// Maximum slots ever in use at once
    pub max_in_use: AtomicU32,
    /// Allocation attempts that found the arena empty
    pub failures: AtomicU32,
}

impl ArenaStats {
    fn record_alloc(&self, in_use: u32) {
        self.alloc_count.fetch_add(1, Ordering::Relaxed);
        let _ = self.max_in_use.fetch_max(in_use, Ordering::Relaxed);
    }

    fn record_free(&self) {
        self.free_count.fetch_add(1, Ordering::Relaxed);
    }

    fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }
}

// ============================================================================
// Control Region
// ============================================================================

/// Bookkeeping for one data slot
#[derive(Debug, Clone, Copy)]
struct ControlNode {
    /// Next free slot (only meaningful while on the free list)
    next: Option<u32>,
    /// Slot is currently handed out
    allocated: bool,
}

/// Free list threaded through the control nodes
#[derive(Debug)]
struct Control {
    nodes: Vec<ControlNode>,
    free_head: Option<u32>,
    in_use: u32,
}

// ============================================================================
// Arena
// ============================================================================

/// Fixed-capacity single-object-size allocator
pub struct Arena {
    /// Arena name (for debugging)
    name: heapless::String<ARENA_NAME_LEN>,

    /// Size of each slot
    ob_size: usize,

    /// Number of slots
    max_count: usize,

    /// Start of the data region
    d_start: NonNull<u8>,

    /// Layout the data region was allocated with
    d_layout: Layout,

    /// Control region and free list
    control: Mutex<Control>,

    /// Arena statistics
    pub stats: ArenaStats,
}

// The data region is only reachable through slot pointers handed to callers;
// the arena itself touches it solely at construction and drop.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// Create an arena of `max_count` slots of `ob_size` bytes
    ///
    /// Slot size is rounded up to 8-byte alignment. The data region is
    /// page aligned and zero filled. Every slot starts on the free list, in
    /// ascending address order.
    pub fn init(name: &str, ob_size: usize, max_count: usize) -> Result<Self> {
        if ob_size == 0 || max_count == 0 || max_count > u32::MAX as usize {
            return Err(Error::InvalidArgs);
        }

        let ob_size = ob_size
            .checked_add(SLOT_ALIGN - 1)
            .ok_or(Error::InvalidArgs)?
            & !(SLOT_ALIGN - 1);
        let data_size = ob_size
            .checked_mul(max_count)
            .and_then(|sz| round_page(sz as u64))
            .ok_or(Error::InvalidArgs)? as usize;
        let d_layout =
            Layout::from_size_align(data_size, PAGE_SIZE).map_err(|_| Error::InvalidArgs)?;

        let mut nodes = Vec::new();
        nodes
            .try_reserve_exact(max_count)
            .map_err(|_| Error::NoMemory)?;
        for i in 0..max_count {
            let next = if i + 1 < max_count {
                Some((i + 1) as u32)
            } else {
                None
            };
            nodes.push(ControlNode {
                next,
                allocated: false,
            });
        }

        // SAFETY: layout has a non-zero size (ob_size and max_count are non-zero).
        let raw = unsafe { alloc_zeroed(d_layout) };
        let d_start = NonNull::new(raw).ok_or(Error::NoMemory)?;

        let mut arena_name = heapless::String::new();
        for c in name.chars() {
            if arena_name.push(c).is_err() {
                break;
            }
        }

        log::debug!(
            "arena '{}': {} slots of {} bytes, data region {:#x} bytes",
            name,
            max_count,
            ob_size,
            data_size
        );

        Ok(Self {
            name: arena_name,
            ob_size,
            max_count,
            d_start,
            d_layout,
            control: Mutex::new(Control {
                nodes,
                free_head: Some(0),
                in_use: 0,
            }),
            stats: ArenaStats::default(),
        })
    }

    /// Take a slot off the free list
    ///
    /// Returns `NoMemory` once every slot is handed out; the arena never grows.
    pub fn alloc(&self) -> Result<NonNull<u8>> {
        let mut guard = self.control.lock();
        let control = &mut *guard;

        let Some(index) = control.free_head else {
            drop(guard);
            self.stats.record_failure();
            log::warn!("arena '{}' exhausted ({} slots)", self.name, self.max_count);
            return Err(Error::NoMemory);
        };

        let node = &mut control.nodes[index as usize];
        assert!(!node.allocated, "arena '{}': free slot {} marked allocated", self.name, index);
        node.allocated = true;
        control.free_head = node.next.take();
        control.in_use += 1;
        let in_use = control.in_use;
        drop(guard);

        self.stats.record_alloc(in_use);

        // SAFETY: index < max_count, so the offset stays inside the data region.
        let slot = unsafe { self.d_start.as_ptr().add(index as usize * self.ob_size) };
        Ok(unsafe { NonNull::new_unchecked(slot) })
    }

    /// Return a slot to the free list
    ///
    /// Freed slots are reused last-in first-out.
    ///
    /// # Safety
    /// `addr` must have come from [`Arena::alloc`] on this arena, and the
    /// caller must not touch the slot afterwards. Freeing an address outside
    /// the arena, misaligned to a slot, or already free panics.
    pub unsafe fn free(&self, addr: NonNull<u8>) {
        let index = self.slot_index(addr.as_ptr());

        let mut guard = self.control.lock();
        let control = &mut *guard;
        let head = control.free_head;
        let node = &mut control.nodes[index];
        assert!(node.allocated, "arena '{}': double free of slot {}", self.name, index);
        node.allocated = false;
        node.next = head;
        control.free_head = Some(index as u32);
        control.in_use -= 1;
        drop(guard);

        self.stats.record_free();
    }

    /// Check whether `addr` lies inside the handed-out part of the data region
    pub fn in_range(&self, addr: *const u8) -> bool {
        let addr = addr as usize;
        let start = self.d_start.as_ptr() as usize;
        addr >= start && addr < start + self.ob_size * self.max_count
    }

    /// Start of the data region
    pub fn start(&self) -> *const u8 {
        self.d_start.as_ptr()
    }

    /// End of the data region (page aligned)
    pub fn end(&self) -> *const u8 {
        // SAFETY: one past the end of the allocation.
        unsafe { self.d_start.as_ptr().add(self.d_layout.size()) }
    }

    /// Arena name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Size of each slot
    pub fn object_size(&self) -> usize {
        self.ob_size
    }

    /// Total number of slots
    pub fn capacity(&self) -> usize {
        self.max_count
    }

    /// Slots currently handed out
    pub fn in_use(&self) -> usize {
        self.control.lock().in_use as usize
    }

    /// Slots still on the free list
    pub fn available(&self) -> usize {
        self.max_count - self.in_use()
    }

    fn slot_index(&self, addr: *const u8) -> usize {
        assert!(
            self.in_range(addr),
            "arena '{}': {:p} is outside the data region",
            self.name,
            addr
        );
        let offset = addr as usize - self.d_start.as_ptr() as usize;
        assert!(
            offset % self.ob_size == 0,
            "arena '{}': {:p} is not a slot boundary",
            self.name,
            addr
        );
        offset / self.ob_size
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        let in_use = self.control.get_mut().in_use;
        if in_use != 0 {
            log::warn!("arena '{}' dropped with {} slots in use", self.name, in_use);
        }
        // SAFETY: allocated in init() with this exact layout.
        unsafe { dealloc(self.d_start.as_ptr(), self.d_layout) };
    }
}

impl core::fmt::Debug for Arena {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Arena")
            .field("name", &self.name.as_str())
            .field("ob_size", &self.ob_size)
            .field("max_count", &self.max_count)
            .field("in_use", &self.in_use())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    #[test]
    fn test_arena_creation() {
        let arena = Arena::init("handles", 24, 16).expect("init failed");
        assert_eq!(arena.name(), "handles");
        assert_eq!(arena.object_size(), 24);
        assert_eq!(arena.capacity(), 16);
        assert_eq!(arena.available(), 16);
        assert_eq!(arena.start() as usize % PAGE_SIZE, 0);
        assert_eq!(arena.end() as usize % PAGE_SIZE, 0);
    }

    #[test]
    fn test_arena_rejects_bad_geometry() {
        assert_eq!(Arena::init("zero", 0, 4).unwrap_err(), Error::InvalidArgs);
        assert_eq!(Arena::init("empty", 8, 0).unwrap_err(), Error::InvalidArgs);
        assert_eq!(
            Arena::init("huge", usize::MAX / 2, 4).unwrap_err(),
            Error::InvalidArgs
        );
    }

    #[test]
    fn test_arena_odd_size_rounds_up() {
        let arena = Arena::init("odd", 13, 4).unwrap();
        assert_eq!(arena.object_size(), 16);
    }

    #[test]
    fn test_arena_exhaustion_and_reuse() {
        let arena = Arena::init("pool", 64, 8).unwrap();

        let mut slots = Vec::new();
        for _ in 0..8 {
            let slot = arena.alloc().expect("allocation failed");
            assert!(arena.in_range(slot.as_ptr()));
            assert!(!slots.contains(&slot));
            slots.push(slot);
        }
        assert_eq!(arena.alloc().unwrap_err(), Error::NoMemory);
        assert_eq!(arena.stats.failures.load(Ordering::Relaxed), 1);

        let victim = slots.remove(3);
        unsafe { arena.free(victim) };
        assert_eq!(arena.alloc().unwrap(), victim);
    }

    #[test]
    fn test_arena_first_alloc_is_region_start() {
        let arena = Arena::init("ordered", 32, 4).unwrap();
        let first = arena.alloc().unwrap();
        let second = arena.alloc().unwrap();
        assert_eq!(first.as_ptr() as *const u8, arena.start());
        assert_eq!(second.as_ptr() as usize - first.as_ptr() as usize, 32);
    }

    #[test]
    fn test_in_range() {
        let arena = Arena::init("range", 16, 4).unwrap();
        let start = arena.start();
        assert!(arena.in_range(start));
        assert!(arena.in_range(unsafe { start.add(63) }));
        assert!(!arena.in_range(unsafe { start.add(64) }));
        assert!(!arena.in_range(core::ptr::null()));
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn test_double_free_panics() {
        let arena = Arena::init("df", 16, 2).unwrap();
        let slot = arena.alloc().unwrap();
        unsafe {
            arena.free(slot);
            arena.free(slot);
        }
    }

    #[test]
    #[should_panic(expected = "not a slot boundary")]
    fn test_misaligned_free_panics() {
        let arena = Arena::init("mis", 16, 2).unwrap();
        let slot = arena.alloc().unwrap();
        unsafe { arena.free(NonNull::new_unchecked(slot.as_ptr().add(1))) };
    }
}
