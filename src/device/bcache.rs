//! Block Cache - Fixed pool of in-memory disk blocks
//!
//! A [`Bcache`] keeps up to `pool_size` blocks of one device in memory.
//! Every node sits on exactly one of three lists:
//!
//! - busy: handed out by [`Bcache::get`] and not yet released
//! - lru: released, still indexed by block number, reclaimable
//! - free: unindexed, ready for any block
//!
//! The index and the three lists change together under one cache lock.
//! Block contents sit behind a per-node lock so holders can touch data
//! without taking the cache lock, and device reads run with the cache lock
//! dropped. A node being filled is flagged `LOADING`; anyone else asking for
//! that block waits for the fill instead of reading the device again.
//!
//! Writes go through: releasing a dirty node writes it to the device before
//! the node becomes reclaimable, so eviction never has to write.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::mem::ManuallyDrop;
use spin::{Mutex, MutexGuard};

use super::block::{check_transfer, BlockDevice};
use crate::error::{Error, Result};

bitflags! {
    /// Block node state
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BlockFlags: u32 {
        /// Contents differ from the device
        const DIRTY = 0x01;
        /// On the busy list
        const BUSY = 0x02;
        /// On the lru list
        const LRU = 0x04;
        /// On the free list
        const FREE = 0x08;
        /// Being filled from the device
        const LOADING = 0x10;
    }
}

const LIST_FLAGS: BlockFlags = BlockFlags::BUSY
    .union(BlockFlags::LRU)
    .union(BlockFlags::FREE);

// ============================================================================
// Node Lists
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum List {
    Busy,
    Lru,
    Free,
}

impl List {
    const fn flag(self) -> BlockFlags {
        match self {
            List::Busy => BlockFlags::BUSY,
            List::Lru => BlockFlags::LRU,
            List::Free => BlockFlags::FREE,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct ListEnds {
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

#[derive(Debug, Clone, Copy)]
struct NodeMeta {
    /// Block held, `None` while free
    bno: Option<u32>,
    flags: BlockFlags,
    /// Outstanding `get`s not yet released
    holders: u32,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Everything the cache lock protects
#[derive(Debug)]
struct CacheState {
    index: BTreeMap<u32, usize>,
    nodes: Vec<NodeMeta>,
    busy: ListEnds,
    lru: ListEnds,
    free: ListEnds,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl CacheState {
    fn ends(&mut self, list: List) -> &mut ListEnds {
        match list {
            List::Busy => &mut self.busy,
            List::Lru => &mut self.lru,
            List::Free => &mut self.free,
        }
    }

    fn push_back(&mut self, list: List, i: usize) {
        assert!(
            !self.nodes[i].flags.intersects(LIST_FLAGS),
            "block node {} is already on a list",
            i
        );
        let tail = self.ends(list).tail;
        self.nodes[i].prev = tail;
        self.nodes[i].next = None;
        match tail {
            Some(t) => self.nodes[t].next = Some(i),
            None => self.ends(list).head = Some(i),
        }
        let ends = self.ends(list);
        ends.tail = Some(i);
        ends.len += 1;
        self.nodes[i].flags.insert(list.flag());
    }

    fn erase(&mut self, list: List, i: usize) {
        assert!(
            self.nodes[i].flags.contains(list.flag()),
            "block node {} is not on the {:?} list",
            i,
            list
        );
        let prev = self.nodes[i].prev.take();
        let next = self.nodes[i].next.take();
        match prev {
            Some(p) => self.nodes[p].next = next,
            None => self.ends(list).head = next,
        }
        match next {
            Some(n) => self.nodes[n].prev = prev,
            None => self.ends(list).tail = prev,
        }
        self.ends(list).len -= 1;
        self.nodes[i].flags.remove(list.flag());
    }

    fn pop_front(&mut self, list: List) -> Option<usize> {
        let head = self.ends(list).head?;
        self.erase(list, head);
        Some(head)
    }

    /// Drop node `i` from the index and park it on the free list
    fn discard(&mut self, i: usize) {
        if let Some(bno) = self.nodes[i].bno.take() {
            let removed = self.index.remove(&bno);
            assert_eq!(removed, Some(i), "index entry for block {} points elsewhere", bno);
        }
        self.nodes[i].flags.remove(BlockFlags::DIRTY | BlockFlags::LOADING);
        self.push_back(List::Free, i);
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Snapshot of cache counters and list sizes
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BcacheStats {
    /// Gets served from memory
    pub hits: u64,
    /// Gets that went to the device (or zero-filled)
    pub misses: u64,
    /// Lru nodes reclaimed for another block
    pub evictions: u64,
    pub busy: usize,
    pub lru: usize,
    pub free: usize,
    /// Blocks present in the index
    pub cached: usize,
}

// ============================================================================
// Block Cache
// ============================================================================

/// Fixed-capacity cache of device blocks
pub struct Bcache {
    device: Arc<dyn BlockDevice>,
    block_max: u32,
    block_size: usize,
    state: Mutex<CacheState>,
    buffers: Vec<Mutex<Box<[u8]>>>,
}

impl Bcache {
    /// Build a cache of `pool_size` nodes over blocks `0..block_max` of `device`
    ///
    /// Every node buffer is allocated here; the cache never allocates again.
    pub fn create(
        device: Arc<dyn BlockDevice>,
        block_max: u32,
        block_size: usize,
        pool_size: usize,
    ) -> Result<Self> {
        if block_size == 0 || block_size != device.block_size() {
            return Err(Error::InvalidArgs);
        }
        if block_max == 0 || block_max > device.block_count() || pool_size == 0 {
            return Err(Error::InvalidArgs);
        }

        let mut buffers = Vec::new();
        buffers
            .try_reserve_exact(pool_size)
            .map_err(|_| Error::NoMemory)?;
        for _ in 0..pool_size {
            buffers.push(Mutex::new(vec![0u8; block_size].into_boxed_slice()));
        }

        let mut state = CacheState {
            index: BTreeMap::new(),
            nodes: vec![
                NodeMeta {
                    bno: None,
                    flags: BlockFlags::empty(),
                    holders: 0,
                    prev: None,
                    next: None,
                };
                pool_size
            ],
            busy: ListEnds::default(),
            lru: ListEnds::default(),
            free: ListEnds::default(),
            hits: 0,
            misses: 0,
            evictions: 0,
        };
        for i in 0..pool_size {
            state.push_back(List::Free, i);
        }

        log::debug!(
            "bcache: {} nodes of {} bytes over {} blocks",
            pool_size,
            block_size,
            block_max
        );

        Ok(Self {
            device,
            block_max,
            block_size,
            state: Mutex::new(state),
            buffers,
        })
    }

    /// Bytes per block
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Number of addressable blocks
    pub fn block_max(&self) -> u32 {
        self.block_max
    }

    /// Number of in-memory nodes
    pub fn pool_size(&self) -> usize {
        self.buffers.len()
    }

    /// Underlying device
    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    // ========================================================================
    // Get / Put
    // ========================================================================

    /// Get block `bno`, reading it from the device on a miss
    ///
    /// Returns `NoResources` when every node is busy.
    pub fn get(&self, bno: u32) -> Result<BlockNode<'_>> {
        self.acquire(bno, false)
    }

    /// Get block `bno` zero-filled, without reading the device
    ///
    /// The node comes back dirty: the caller is expected to fill it.
    pub fn get_zero(&self, bno: u32) -> Result<BlockNode<'_>> {
        self.acquire(bno, true)
    }

    /// Release a node obtained from [`get`](Self::get)
    ///
    /// `DIRTY` in `flags` says the caller changed the contents; a dirty node
    /// is written to the device before it can be reclaimed.
    pub fn put(&self, node: BlockNode<'_>, flags: BlockFlags) -> Result<()> {
        let node = ManuallyDrop::new(node);
        self.release(node.slot, flags)
    }

    fn acquire(&self, bno: u32, zero: bool) -> Result<BlockNode<'_>> {
        if bno >= self.block_max {
            return Err(Error::InvalidArgs);
        }

        let slot = loop {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            if let Some(&slot) = state.index.get(&bno) {
                if state.nodes[slot].flags.contains(BlockFlags::LOADING) {
                    drop(guard);
                    relax();
                    continue;
                }
                if state.nodes[slot].flags.contains(BlockFlags::LRU) {
                    state.erase(List::Lru, slot);
                    state.push_back(List::Busy, slot);
                }
                state.nodes[slot].holders += 1;
                if zero {
                    state.nodes[slot].flags.insert(BlockFlags::DIRTY);
                }
                state.hits += 1;
                drop(guard);

                log::trace!("bcache: hit block {}", bno);
                if zero {
                    self.buffers[slot].lock().fill(0);
                }
                return Ok(BlockNode::new(self, slot, bno));
            }

            let slot = match state.pop_front(List::Free) {
                Some(slot) => slot,
                None => match state.pop_front(List::Lru) {
                    Some(slot) => {
                        let node = &state.nodes[slot];
                        assert!(
                            node.holders == 0 && !node.flags.contains(BlockFlags::DIRTY),
                            "reclaiming block node {} still in use",
                            slot
                        );
                        if let Some(old) = state.nodes[slot].bno.take() {
                            state.index.remove(&old);
                            log::debug!("bcache: evicting block {} for {}", old, bno);
                        }
                        state.evictions += 1;
                        slot
                    }
                    None => {
                        drop(guard);
                        log::warn!("bcache: every node busy, cannot load block {}", bno);
                        return Err(Error::NoResources);
                    }
                },
            };

            let node = &mut state.nodes[slot];
            node.bno = Some(bno);
            node.holders = 1;
            node.flags.insert(BlockFlags::LOADING);
            state.index.insert(bno, slot);
            state.push_back(List::Busy, slot);
            state.misses += 1;
            break slot;
        };

        let loaded = if zero {
            self.buffers[slot].lock().fill(0);
            Ok(())
        } else {
            let mut data = self.buffers[slot].lock();
            self.device.read_block(bno, &mut data)
        };

        let mut guard = self.state.lock();
        let state = &mut *guard;
        match loaded {
            Ok(()) => {
                state.nodes[slot].flags.remove(BlockFlags::LOADING);
                if zero {
                    state.nodes[slot].flags.insert(BlockFlags::DIRTY);
                }
                drop(guard);
                log::trace!("bcache: loaded block {}", bno);
                Ok(BlockNode::new(self, slot, bno))
            }
            Err(e) => {
                state.nodes[slot].holders = 0;
                state.erase(List::Busy, slot);
                state.discard(slot);
                drop(guard);
                log::warn!("bcache: reading block {} failed: {}", bno, e);
                Err(e)
            }
        }
    }

    fn release(&self, slot: usize, flags: BlockFlags) -> Result<()> {
        let mut guard = self.state.lock();
        let node = &mut guard.nodes[slot];
        assert!(
            node.flags.contains(BlockFlags::BUSY) && node.holders > 0,
            "releasing block node {} that is not held",
            slot
        );
        if flags.contains(BlockFlags::DIRTY) {
            node.flags.insert(BlockFlags::DIRTY);
        }
        let dirty = node.flags.contains(BlockFlags::DIRTY);
        let Some(bno) = node.bno else {
            panic!("busy block node {} has no block number", slot);
        };
        drop(guard);

        let written = if dirty {
            let data = self.buffers[slot].lock();
            self.device.write_block(bno, &data)
        } else {
            Ok(())
        };
        if let Err(e) = written {
            log::warn!("bcache: writing block {} failed: {}", bno, e);
        }

        let mut guard = self.state.lock();
        let state = &mut *guard;
        if dirty && written.is_ok() {
            state.nodes[slot].flags.remove(BlockFlags::DIRTY);
        }
        state.nodes[slot].holders -= 1;
        if state.nodes[slot].holders == 0 {
            state.erase(List::Busy, slot);
            if state.nodes[slot].flags.contains(BlockFlags::DIRTY) {
                // Never hand out contents the device does not have.
                state.discard(slot);
            } else {
                state.push_back(List::Lru, slot);
            }
        }
        written
    }

    // ========================================================================
    // Convenience and Maintenance
    // ========================================================================

    /// Copy `dst.len()` bytes of block `bno` starting at byte `off`
    pub fn read(&self, bno: u32, off: usize, dst: &mut [u8]) -> Result<()> {
        let end = off.checked_add(dst.len()).ok_or(Error::InvalidArgs)?;
        if end > self.block_size {
            return Err(Error::InvalidArgs);
        }
        let node = self.get(bno)?;
        dst.copy_from_slice(&node.data()[off..end]);
        self.put(node, BlockFlags::empty())
    }

    /// Forget every released block; busy blocks are left alone
    pub fn invalidate(&self) {
        let mut state = self.state.lock();
        let mut dropped = 0;
        while let Some(slot) = state.pop_front(List::Lru) {
            state.discard(slot);
            dropped += 1;
        }
        drop(state);
        log::debug!("bcache: invalidated {} blocks", dropped);
    }

    /// Flush the device
    ///
    /// Released blocks are already on the device; this only pushes the
    /// device's own buffering out.
    pub fn sync(&self) -> Result<()> {
        self.device.flush()
    }

    /// Read block `bno` straight from the device, bypassing the cache
    pub fn read_block(&self, bno: u32, buf: &mut [u8]) -> Result<()> {
        self.check_raw(bno, buf.len())?;
        self.device.read_block(bno, buf)
    }

    /// Write block `bno` straight to the device, bypassing the cache
    ///
    /// A cached copy of the block is not updated.
    pub fn write_block(&self, bno: u32, buf: &[u8]) -> Result<()> {
        self.check_raw(bno, buf.len())?;
        self.device.write_block(bno, buf)
    }

    fn check_raw(&self, bno: u32, len: usize) -> Result<()> {
        if bno >= self.block_max {
            return Err(Error::InvalidArgs);
        }
        check_transfer(self.device.as_ref(), bno, len)
    }

    /// Counters and list sizes
    pub fn stats(&self) -> BcacheStats {
        let state = self.state.lock();
        BcacheStats {
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            busy: state.busy.len,
            lru: state.lru.len,
            free: state.free.len,
            cached: state.index.len(),
        }
    }

    /// Check the list and index invariants, panicking on the first violation
    pub fn verify(&self) {
        let state = self.state.lock();
        let pool = state.nodes.len();
        assert_eq!(
            state.busy.len + state.lru.len + state.free.len,
            pool,
            "list lengths do not cover the pool"
        );
        assert_eq!(
            state.index.len(),
            state.busy.len + state.lru.len,
            "index size disagrees with busy + lru"
        );

        for (list, ends) in [
            (List::Busy, state.busy),
            (List::Lru, state.lru),
            (List::Free, state.free),
        ] {
            let mut count = 0;
            let mut prev = None;
            let mut cursor = ends.head;
            while let Some(i) = cursor {
                let node = &state.nodes[i];
                assert_eq!(node.prev, prev, "broken back link at node {}", i);
                assert_eq!(
                    node.flags & LIST_FLAGS,
                    list.flag(),
                    "node {} on the {:?} list has flags {:?}",
                    i,
                    list,
                    node.flags
                );
                match list {
                    List::Free => {
                        assert!(node.bno.is_none() && node.holders == 0);
                    }
                    List::Busy | List::Lru => {
                        let bno = node.bno.unwrap_or_else(|| {
                            panic!("indexed node {} has no block number", i)
                        });
                        assert_eq!(state.index.get(&bno), Some(&i));
                        assert_eq!(list == List::Busy, node.holders > 0);
                    }
                }
                count += 1;
                assert!(count <= pool, "cycle in the {:?} list", list);
                prev = cursor;
                cursor = node.next;
            }
            assert_eq!(prev, ends.tail, "{:?} list tail mismatch", list);
            assert_eq!(count, ends.len, "{:?} list length mismatch", list);
        }
    }
}

impl core::fmt::Debug for Bcache {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Bcache")
            .field("block_size", &self.block_size)
            .field("block_max", &self.block_max)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Back off while another thread fills a block
fn relax() {
    #[cfg(feature = "std")]
    std::thread::yield_now();
    #[cfg(not(feature = "std"))]
    core::hint::spin_loop();
}

// ============================================================================
// Block Node
// ============================================================================

/// A held block
///
/// Dropping the node releases it with no flags; use [`Bcache::put`] to mark
/// it dirty or to observe write errors.
pub struct BlockNode<'a> {
    cache: &'a Bcache,
    slot: usize,
    bno: u32,
}

impl<'a> BlockNode<'a> {
    fn new(cache: &'a Bcache, slot: usize, bno: u32) -> Self {
        Self { cache, slot, bno }
    }

    /// Block number held
    pub fn bno(&self) -> u32 {
        self.bno
    }

    /// Lock and borrow the block contents
    pub fn data(&self) -> MutexGuard<'_, Box<[u8]>> {
        self.cache.buffers[self.slot].lock()
    }
}

impl Drop for BlockNode<'_> {
    fn drop(&mut self) {
        let _ = self.cache.release(self.slot, BlockFlags::empty());
    }
}

impl core::fmt::Debug for BlockNode<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "BlockNode(block {}, node {})", self.bno, self.slot)
    }
}
