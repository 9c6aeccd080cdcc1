//! Write-back block cache.
//!
//! Sits between file systems and block devices, caching page-frame-sized
//! chunks of device content keyed by `(device id, aligned block id)`. Each
//! slot holds one frame's worth of consecutive device blocks; requests for
//! any block inside the frame resolve to the same slot at a byte offset.
//!
//! Slots are reference-counted reservations: a slot with outstanding
//! reservations sits on the in-use list, an idle one on the available list
//! in least-recently-used order (most recent at the tail), and — orthogonal
//! to both — a slot with unwritten modifications is also on the dirty list.
//! Misses recycle the head of the available list, writing dirty victims
//! back to their own device first.
//!
//! The index is a B-tree whose nodes come from a dedicated kernel-pool
//! frame reservation sized for the worst case, so index growth can never
//! starve the cache's data frames (or anything else) and never fails for
//! lack of unrelated memory.
//!
//! Cache operations are not interrupt-safe; callers serialize access by
//! confining I/O submission to one thread of execution.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cmp::Ordering;
use core::fmt;
use core::mem;
use core::ptr::NonNull;

use crate::btree::{worst_case_node_count, BTree, BTreeError, NodeAllocator};
use crate::memory::{Frame, FrameAllocator, ReservationId, FRAME_SIZE};

use super::{BlockDevice, DeviceId};

/// Errors returned by cache operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheError {
    /// No slot, data frame or index node could be obtained. The caller may
    /// retry after releasing reservations or freeing memory.
    OutOfMemory,
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::OutOfMemory => write!(f, "out of memory"),
        }
    }
}

/// Index into the cache's slot arena.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct SlotId(u32);

/// Intrusive list links stored inside each slot.
#[derive(Clone, Copy, Default)]
struct Links {
    prev: Option<SlotId>,
    next: Option<SlotId>,
}

/// Which of a slot's two link pairs a list threads through.
#[derive(Clone, Copy)]
enum LinkSet {
    Lru,
    Dirty,
}

/// Doubly linked list threaded through the slot arena.
struct SlotList {
    link_set: LinkSet,
    first: Option<SlotId>,
    last: Option<SlotId>,
    len: usize,
}

impl SlotList {
    fn new(link_set: LinkSet) -> SlotList {
        SlotList {
            link_set,
            first: None,
            last: None,
            len: 0,
        }
    }

    fn links<'a>(&self, slot: &'a mut Slot) -> &'a mut Links {
        match self.link_set {
            LinkSet::Lru => &mut slot.lru,
            LinkSet::Dirty => &mut slot.dirty_links,
        }
    }

    fn push_back(&mut self, slots: &mut [Slot], id: SlotId) {
        let old_last = self.last;
        *self.links(&mut slots[id.0 as usize]) = Links {
            prev: old_last,
            next: None,
        };
        match old_last {
            Some(last) => self.links(&mut slots[last.0 as usize]).next = Some(id),
            None => self.first = Some(id),
        }
        self.last = Some(id);
        self.len += 1;
    }

    fn push_front(&mut self, slots: &mut [Slot], id: SlotId) {
        let old_first = self.first;
        *self.links(&mut slots[id.0 as usize]) = Links {
            prev: None,
            next: old_first,
        };
        match old_first {
            Some(first) => self.links(&mut slots[first.0 as usize]).prev = Some(id),
            None => self.last = Some(id),
        }
        self.first = Some(id);
        self.len += 1;
    }

    fn unlink(&mut self, slots: &mut [Slot], id: SlotId) {
        let Links { prev, next } = *self.links(&mut slots[id.0 as usize]);
        match prev {
            Some(prev) => self.links(&mut slots[prev.0 as usize]).next = next,
            None => {
                debug_assert_eq!(self.first, Some(id));
                self.first = next;
            }
        }
        match next {
            Some(next) => self.links(&mut slots[next.0 as usize]).prev = prev,
            None => {
                debug_assert_eq!(self.last, Some(id));
                self.last = prev;
            }
        }
        *self.links(&mut slots[id.0 as usize]) = Links::default();
        self.len -= 1;
    }

    fn pop_front(&mut self, slots: &mut [Slot]) -> Option<SlotId> {
        let id = self.first?;
        self.unlink(slots, id);
        Some(id)
    }
}

/// Identity a slot is currently registered (or pending write-back) under.
struct SlotKey {
    device: Arc<dyn BlockDevice>,
    block_id: u64,
}

/// One cache slot: a descriptor plus, after first use, its data frame.
struct Slot {
    key: Option<SlotKey>,
    data: Option<Frame>,
    usage_count: u16,
    dirty: bool,
    lru: Links,
    dirty_links: Links,
}

impl Slot {
    fn new() -> Slot {
        Slot {
            key: None,
            data: None,
            usage_count: 0,
            dirty: false,
            lru: Links::default(),
            dirty_links: Links::default(),
        }
    }
}

/// Index element: cache key plus the slot that holds the data.
#[derive(Clone, Copy)]
struct IndexEntry {
    device_id: DeviceId,
    block_id: u64,
    slot: SlotId,
}

fn compare_index_entries(a: &IndexEntry, b: &IndexEntry) -> Ordering {
    (a.device_id, a.block_id).cmp(&(b.device_id, b.block_id))
}

/// Feeds the index tree from the cache's kernel-pool reservation, one frame
/// per node.
struct CacheNodeAllocator {
    allocator: Arc<FrameAllocator>,
    reservation: ReservationId,
}

impl NodeAllocator for CacheNodeAllocator {
    type Token = Frame;

    fn acquire(&mut self, node_size: usize) -> Option<Frame> {
        debug_assert!(node_size <= FRAME_SIZE);
        self.allocator.acquire(true, Some(self.reservation))
    }

    fn release(&mut self, token: Frame) {
        self.allocator.release(token, Some(self.reservation));
    }
}

/// A held cache reservation: a window onto the slot's frame at the
/// requested block offset.
///
/// Overlapping reservations of the same frame deliberately alias — the
/// cache guarantees one copy per `(device, aligned block)` pair — so the
/// bytes are exposed as a raw pointer with checked copy helpers. Access is
/// single-threaded by the cache's concurrency contract, and the underlying
/// frame stays attached to its slot for the cache's lifetime.
#[derive(Debug)]
pub struct ReservedBlock {
    ptr: NonNull<u8>,
    len: usize,
}

impl ReservedBlock {
    /// First byte of the requested blocks.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Bytes covered by the request (`count * block_size`).
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy the first `dst.len()` reserved bytes out.
    pub fn copy_out(&self, dst: &mut [u8]) {
        assert!(dst.len() <= self.len);
        unsafe { core::ptr::copy_nonoverlapping(self.ptr.as_ptr(), dst.as_mut_ptr(), dst.len()) }
    }

    /// Overwrite the first `src.len()` reserved bytes.
    pub fn copy_in(&mut self, src: &[u8]) {
        assert!(src.len() <= self.len);
        unsafe { core::ptr::copy_nonoverlapping(src.as_ptr(), self.ptr.as_ptr(), src.len()) }
    }
}

/// Cache occupancy counters for diagnostics.
pub struct CacheStats {
    pub cached_blocks: usize,
    pub available_slots: usize,
    pub slots_in_use: usize,
    pub dirty_blocks: usize,
}

/// The block cache manager.
pub struct BlockCache {
    index: BTree<IndexEntry, CacheNodeAllocator>,
    slots: Vec<Slot>,
    available: SlotList,
    in_use: SlotList,
    dirty: SlotList,
    allocator: Arc<FrameAllocator>,
    frame_size: usize,
}

impl BlockCache {
    /// Create a cache with `max_slots` frame-sized slots.
    ///
    /// Reserves the worst-case node count for the index tree from the
    /// kernel pool up front; fails if the reservation cannot be granted.
    /// Data frames are attached to slots lazily on first use.
    pub fn new(allocator: Arc<FrameAllocator>, max_slots: usize) -> Result<BlockCache, CacheError> {
        assert!(max_slots > 0);

        let index_nodes =
            worst_case_node_count(FRAME_SIZE, mem::size_of::<IndexEntry>(), max_slots);
        log::debug!(
            "block cache: reserving {} frames for the index of {} slots",
            index_nodes,
            max_slots
        );
        let reservation = allocator
            .reserve_kernel(index_nodes)
            .ok_or(CacheError::OutOfMemory)?;

        let index = BTree::new(
            FRAME_SIZE,
            mem::size_of::<IndexEntry>(),
            CacheNodeAllocator {
                allocator: allocator.clone(),
                reservation,
            },
            compare_index_entries,
        );

        let mut slots = Vec::with_capacity(max_slots);
        let mut available = SlotList::new(LinkSet::Lru);
        for i in 0..max_slots {
            slots.push(Slot::new());
            available.push_back(&mut slots, SlotId(i as u32));
        }

        Ok(BlockCache {
            index,
            slots,
            available,
            in_use: SlotList::new(LinkSet::Lru),
            dirty: SlotList::new(LinkSet::Dirty),
            allocator,
            frame_size: FRAME_SIZE,
        })
    }

    /// Coarsen a block id to frame granularity: the aligned id keys the
    /// cache, the byte offset locates the block within the frame.
    fn align_block_id(&self, device: &dyn BlockDevice, block_id: u64) -> (u64, usize) {
        let block_size = device.block_size();
        if block_size < self.frame_size {
            let blocks_per_frame = self.frame_size / block_size;
            assert!(blocks_per_frame.is_power_of_two());
            let mask = (blocks_per_frame - 1) as u64;
            let offset = ((block_id & mask) as usize) * block_size;
            (block_id & !mask, offset)
        } else {
            assert_eq!(block_size, self.frame_size);
            (block_id, 0)
        }
    }

    fn probe(device_id: DeviceId, block_id: u64) -> IndexEntry {
        IndexEntry {
            device_id,
            block_id,
            slot: SlotId(u32::MAX),
        }
    }

    /// Pointer to the requested offset within a slot's data frame.
    fn slot_data_ptr(&self, id: SlotId, offset: usize) -> NonNull<u8> {
        let frame = self.slots[id.0 as usize]
            .data
            .as_ref()
            .expect("cached slot without data frame");
        debug_assert!(offset < self.frame_size);
        // In bounds of the frame, hence non-null.
        unsafe { NonNull::new_unchecked(frame.as_ptr().add(offset)) }
    }

    /// Write a slot's frame back to the device it is registered under.
    /// Fatal on device failure; there is no file-system-level recovery.
    fn write_slot_back(&self, id: SlotId) {
        let slot = &self.slots[id.0 as usize];
        let key = slot.key.as_ref().expect("write-back of unregistered slot");
        let frame = slot.data.as_ref().expect("write-back of detached slot");

        let blocks_per_frame = self.frame_size / key.device.block_size();
        let bytes = unsafe { core::slice::from_raw_parts(frame.as_ptr(), self.frame_size) };
        if let Err(error) = key
            .device
            .write_blocks(key.block_id, blocks_per_frame, bytes)
        {
            log::error!(
                "block cache: write-back of block {} on {} failed: {}",
                key.block_id,
                key.device.id(),
                error
            );
            panic!("fatal error while writing back cached blocks");
        }
    }

    fn common_reserve(
        &mut self,
        device: &Arc<dyn BlockDevice>,
        first_block: u64,
        count: usize,
        read: bool,
    ) -> Result<ReservedBlock, CacheError> {
        let block_size = device.block_size();
        assert!(count * block_size <= self.frame_size);

        let (aligned_id, offset) = self.align_block_id(device.as_ref(), first_block);
        let length = count * block_size;
        // The request must stay within its enclosing frame.
        assert!(offset + length <= self.frame_size);

        if let Some(entry) = self.index.get(&Self::probe(device.id(), aligned_id)) {
            // Hit: bump the usage count and relink at the in-use tail.
            let id = entry.slot;
            if self.slots[id.0 as usize].usage_count == 0 {
                self.available.unlink(&mut self.slots, id);
            } else {
                self.in_use.unlink(&mut self.slots, id);
            }
            self.slots[id.0 as usize].usage_count += 1;
            self.in_use.push_back(&mut self.slots, id);
            let ptr = self.slot_data_ptr(id, offset);
            return Ok(ReservedBlock { ptr, len: length });
        }

        // Miss: recycle the least recently used idle slot.
        let id = match self.available.pop_front(&mut self.slots) {
            Some(id) => id,
            None => return Err(CacheError::OutOfMemory),
        };
        debug_assert_eq!(self.slots[id.0 as usize].usage_count, 0);

        // Detach the victim from its old identity, writing back first.
        let old_probe = self.slots[id.0 as usize]
            .key
            .as_ref()
            .map(|key| Self::probe(key.device.id(), key.block_id));
        if let Some(old_probe) = old_probe {
            match self.index.remove(&old_probe) {
                Ok(()) => {}
                // The index may have been cleared since this slot was
                // registered.
                Err(BTreeError::NotFound) => {}
                Err(error) => panic!("block cache index remove failed: {}", error),
            }
            if self.slots[id.0 as usize].dirty {
                self.dirty.unlink(&mut self.slots, id);
                self.slots[id.0 as usize].dirty = false;
                self.write_slot_back(id);
            }
            self.slots[id.0 as usize].key = None;
        }

        // Attach a data frame on first use. Frames stay attached for the
        // cache's lifetime; only their contents are ever evicted.
        if self.slots[id.0 as usize].data.is_none() {
            match self.allocator.acquire(true, None) {
                Some(frame) => self.slots[id.0 as usize].data = Some(frame),
                None => {
                    // Keep the slot first in line for the next attempt.
                    self.available.push_front(&mut self.slots, id);
                    return Err(CacheError::OutOfMemory);
                }
            }
        }

        let blocks_per_frame = self.frame_size / block_size;
        if read || length < self.frame_size {
            // A partial request still fetches the whole frame: a later
            // request for a sibling block in this frame will hit the cache
            // and must not find stale bytes.
            assert!(device.max_blocks_per_read() >= blocks_per_frame);
            let frame_ptr = self.slot_data_ptr(id, 0).as_ptr();
            let bytes = unsafe { core::slice::from_raw_parts_mut(frame_ptr, self.frame_size) };
            if let Err(error) = device.read_blocks(aligned_id, blocks_per_frame, bytes) {
                log::error!(
                    "block cache: read of block {} on {} failed: {}",
                    aligned_id,
                    device.id(),
                    error
                );
                panic!("fatal error while reading blocks into the cache");
            }
        }

        // Register under the new key.
        let entry = IndexEntry {
            device_id: device.id(),
            block_id: aligned_id,
            slot: id,
        };
        match self.index.insert(entry) {
            Ok(()) => {}
            Err(BTreeError::NotEnoughMemory) => {
                self.available.push_front(&mut self.slots, id);
                return Err(CacheError::OutOfMemory);
            }
            // A duplicate key is impossible right after a miss.
            Err(error) => panic!("block cache index insert failed: {}", error),
        }

        let slot = &mut self.slots[id.0 as usize];
        slot.key = Some(SlotKey {
            device: device.clone(),
            block_id: aligned_id,
        });
        slot.usage_count = 1;
        slot.dirty = false;
        self.in_use.push_back(&mut self.slots, id);
        let ptr = self.slot_data_ptr(id, offset);

        Ok(ReservedBlock { ptr, len: length })
    }

    /// Reserve `count` blocks starting at `first_block` without reading
    /// them from the device — the caller will overwrite them. A request
    /// covering less than a whole frame still triggers a full-frame read.
    pub fn reserve(
        &mut self,
        device: &Arc<dyn BlockDevice>,
        first_block: u64,
        count: usize,
    ) -> Result<ReservedBlock, CacheError> {
        self.common_reserve(device, first_block, count, false)
    }

    /// Reserve `count` blocks starting at `first_block`, reading the
    /// enclosing frame from the device on a miss.
    pub fn read_and_reserve(
        &mut self,
        device: &Arc<dyn BlockDevice>,
        first_block: u64,
        count: usize,
    ) -> Result<ReservedBlock, CacheError> {
        self.common_reserve(device, first_block, count, true)
    }

    /// Release a reservation taken on `block_id` of `device`.
    ///
    /// `modified` marks the block dirty; the data is written back at
    /// eviction time or during [`BlockCache::flush`]. When the last
    /// reservation goes away the slot moves to the available-list tail.
    pub fn release(&mut self, device: &dyn BlockDevice, block_id: u64, modified: bool) {
        let (aligned_id, _) = self.align_block_id(device, block_id);
        let entry = self
            .index
            .get(&Self::probe(device.id(), aligned_id))
            .expect("releasing a block that is not cached");
        let id = entry.slot;

        assert!(self.slots[id.0 as usize].usage_count > 0);

        if modified && !self.slots[id.0 as usize].dirty {
            self.slots[id.0 as usize].dirty = true;
            self.dirty.push_back(&mut self.slots, id);
        }

        self.slots[id.0 as usize].usage_count -= 1;
        if self.slots[id.0 as usize].usage_count == 0 {
            self.in_use.unlink(&mut self.slots, id);
            self.available.push_back(&mut self.slots, id);
        }
    }

    /// Write every dirty block back to its device and clear the dirty list.
    pub fn flush(&mut self) {
        let count = self.dirty.len;
        while let Some(id) = self.dirty.pop_front(&mut self.slots) {
            debug_assert!(self.slots[id.0 as usize].dirty);
            self.write_slot_back(id);
            self.slots[id.0 as usize].dirty = false;
        }
        log::debug!("block cache: flushed {} dirty blocks", count);

        if cfg!(debug_assertions) {
            for slot in &self.slots {
                debug_assert!(!slot.dirty);
            }
        }
    }

    /// Drop every cached identity. All reservations must have been released
    /// and all modifications flushed; data frames stay attached to their
    /// slots.
    pub fn clear(&mut self) {
        assert_eq!(self.in_use.len, 0);
        debug_assert_eq!(self.dirty.len, 0);
        self.index.clear();
        for slot in &mut self.slots {
            slot.key = None;
        }
    }

    /// Current occupancy counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            cached_blocks: self.index.len(),
            available_slots: self.available.len,
            slots_in_use: self.in_use.len,
            dirty_blocks: self.dirty.len,
        }
    }

    /// Human-readable occupancy report. The format is diagnostic output,
    /// not a stable interface.
    pub fn debug_report(&self) -> String {
        let stats = self.stats();
        alloc::format!(
            "Block cache report:\n  cached blocks: {}\n  available slots: {}\n  slots in use: {}\n  dirty blocks: {}\n",
            stats.cached_blocks,
            stats.available_slots,
            stats.slots_in_use,
            stats.dirty_blocks,
        )
    }
}
