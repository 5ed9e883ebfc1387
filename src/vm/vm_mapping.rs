//! VM Mapping - Links between memory objects and address space regions
//!
//! Every region that maps part of a [`VmObject`] owns a [`VmMapping`]. The
//! object keeps a [`MappingSet`] of weak references to its mappings so that
//! resizing or changing the cache policy can reach every region currently
//! looking at the object.
//!
//! The set is a slot table with generation counters. A [`MappingId`] names
//! one slot in one generation; removing the mapping bumps the generation, so
//! a stale id can never remove a later occupant of the same slot.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::vm_object::{CachePolicy, VmObject};
use super::vm_page::is_page_aligned;
use crate::error::{Error, Result};

// ============================================================================
// Address Region Interface
// ============================================================================

/// The address space side of a mapping
///
/// Callbacks run synchronously with the object lock held. Implementations
/// must not call back into the object or its mappings.
pub trait AddressRegion: Send + Sync {
    /// Remove `[base, base + len)` from the address space
    fn unmap(&self, base: u64, len: u64);

    /// Apply a new cache policy to `[base, base + len)`
    fn update_cache_policy(&self, _base: u64, _len: u64, _policy: CachePolicy) {}
}

// ============================================================================
// Mapping Set
// ============================================================================

/// Handle to one entry of a [`MappingSet`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MappingId {
    index: u32,
    generation: u32,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    entry: Option<Weak<VmMapping>>,
}

/// Mappings currently attached to one object
///
/// Insert and remove are O(1). Vacated slots are reused.
#[derive(Debug, Default)]
pub struct MappingSet {
    slots: Vec<Slot>,
    free: Vec<u32>,
    len: usize,
}

impl MappingSet {
    /// Create an empty set
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    /// Add a mapping
    pub fn insert(&mut self, mapping: Weak<VmMapping>) -> MappingId {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            debug_assert!(slot.entry.is_none());
            slot.entry = Some(mapping);
            return MappingId {
                index,
                generation: slot.generation,
            };
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            entry: Some(mapping),
        });
        MappingId {
            index,
            generation: 0,
        }
    }

    /// Remove a mapping; returns false if `id` is stale
    pub fn remove(&mut self, id: MappingId) -> bool {
        let Some(slot) = self.slots.get_mut(id.index as usize) else {
            return false;
        };
        if slot.generation != id.generation || slot.entry.is_none() {
            return false;
        }
        slot.entry = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.len -= 1;
        true
    }

    /// Check whether `id` names a live entry
    pub fn contains(&self, id: MappingId) -> bool {
        self.slots
            .get(id.index as usize)
            .is_some_and(|slot| slot.generation == id.generation && slot.entry.is_some())
    }

    /// Number of registered mappings
    pub fn len(&self) -> usize {
        self.len
    }

    /// No mappings registered
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Strong references to every mapping still alive
    ///
    /// A mapping that is mid-drop is skipped; it removes itself right after.
    pub fn live(&self) -> Vec<Arc<VmMapping>> {
        self.slots
            .iter()
            .filter_map(|slot| slot.entry.as_ref())
            .filter_map(Weak::upgrade)
            .collect()
    }
}

// ============================================================================
// VM Mapping
// ============================================================================

/// One region's view of a range of an object
pub struct VmMapping {
    id: MappingId,
    object: Arc<VmObject>,
    region: Arc<dyn AddressRegion>,
    /// Virtual base of the mapping in the region
    base: u64,
    /// Offset into the object the mapping starts at
    object_offset: u64,
    /// Mapped length; shrinks when the object does
    len: AtomicU64,
    detached: AtomicBool,
}

impl VmMapping {
    /// Map `[object_offset, object_offset + len)` of `object` at `base`
    ///
    /// The mapping is registered with the object before it is returned.
    /// All three values must be page aligned and the range must lie inside
    /// the object.
    pub fn create(
        object: &Arc<VmObject>,
        region: Arc<dyn AddressRegion>,
        base: u64,
        object_offset: u64,
        len: u64,
    ) -> Result<Arc<Self>> {
        if len == 0
            || !is_page_aligned(base)
            || !is_page_aligned(object_offset)
            || !is_page_aligned(len)
        {
            return Err(Error::InvalidArgs);
        }
        let end = object_offset.checked_add(len).ok_or(Error::OutOfRange)?;
        base.checked_add(len).ok_or(Error::InvalidArgs)?;

        let mut state = object.lock();
        if end > state.size() {
            return Err(Error::OutOfRange);
        }
        let mapping = Arc::new_cyclic(|weak| {
            let id = state.add_mapping(weak.clone());
            VmMapping {
                id,
                object: Arc::clone(object),
                region,
                base,
                object_offset,
                len: AtomicU64::new(len),
                detached: AtomicBool::new(false),
            }
        });
        drop(state);

        log::trace!(
            "vmo {}: mapped [{:#x}, {:#x}) at {:#x}",
            object.id().0,
            object_offset,
            end,
            base
        );
        Ok(mapping)
    }

    /// Id of this mapping in the object's set
    pub fn id(&self) -> MappingId {
        self.id
    }

    /// Mapped object
    pub fn object(&self) -> &Arc<VmObject> {
        &self.object
    }

    /// Virtual base address
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Offset into the object
    pub fn object_offset(&self) -> u64 {
        self.object_offset
    }

    /// Current mapped length
    pub fn len(&self) -> u64 {
        self.len.load(Ordering::Acquire)
    }

    /// Mapping has been clipped to nothing
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Detach from the object
    ///
    /// Idempotent. Called by the region when it tears the mapping down, and
    /// from drop otherwise.
    pub fn destroy(&self) {
        if self.detached.swap(true, Ordering::AcqRel) {
            return;
        }
        let removed = self.object.lock().remove_mapping(self.id);
        debug_assert!(removed, "mapping {:?} missing from its object", self.id);
    }

    /// The object shrank to `new_size`; unmap whatever now lies beyond it
    ///
    /// Called with the object lock held.
    pub(crate) fn on_object_shrink(&self, new_size: u64) {
        let len = self.len();
        let end = self.object_offset + len;
        if new_size >= end {
            return;
        }

        let keep = new_size.saturating_sub(self.object_offset);
        self.len.store(keep, Ordering::Release);
        log::debug!(
            "vmo {}: unmapping {:#x} bytes at {:#x}",
            self.object.id().0,
            len - keep,
            self.base + keep
        );
        self.region.unmap(self.base + keep, len - keep);
    }

    /// The object's cache policy changed
    ///
    /// Called with the object lock held.
    pub(crate) fn on_cache_policy(&self, policy: CachePolicy) {
        let len = self.len();
        if len != 0 {
            self.region.update_cache_policy(self.base, len, policy);
        }
    }
}

impl Drop for VmMapping {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl core::fmt::Debug for VmMapping {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VmMapping")
            .field("object", &self.object.id())
            .field("base", &self.base)
            .field("object_offset", &self.object_offset)
            .field("len", &self.len())
            .finish()
    }
}
