//! Two-pool page-frame allocator with reservations.
//!
//! Physical memory is split into a kernel-space pool (low frame indices,
//! below the kernel/user boundary) and a user-space pool (everything above).
//! Frames are handed out one at a time; user-pool requests fall back to the
//! kernel pool when the user pool runs dry, never the other way around.
//!
//! A subsystem that must not be starved by unrelated allocations can pin a
//! frame budget up front with [`FrameAllocator::reserve_kernel`]. Acquires
//! against a reservation are served from that budget; unreserved kernel
//! acquires fail once only pinned frames remain. The block cache uses this
//! to guarantee its index B-tree can always grow to its worst case.

use alloc::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use alloc::vec::Vec;
use core::ptr::NonNull;
use spin::Mutex;

/// Size of one physical page frame in bytes.
pub const FRAME_SIZE: usize = 4096;

/// Maximum number of live reservations per allocator.
const MAX_RESERVATIONS: usize = 64;

/// An owned page frame.
///
/// The handle is opaque; the frame's memory is reachable through
/// [`Frame::as_ptr`] and its identity through [`Frame::index`]. Dropping a
/// `Frame` without releasing it leaks the frame, so holders hand it back
/// with [`FrameAllocator::release`] when done.
pub struct Frame {
    index: u32,
    ptr: NonNull<u8>,
}

impl Frame {
    /// Index of this frame within its allocator's arena.
    pub fn index(&self) -> usize {
        self.index as usize
    }

    /// Base address of the frame's `FRAME_SIZE` bytes.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

// The holder has exclusive ownership of the frame's memory.
unsafe impl Send for Frame {}

/// Identifies a kernel-pool reservation created by `reserve_kernel`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ReservationId(u32);

struct ReservationEntry {
    available: usize,
    total: usize,
}

struct Pools {
    /// Free kernel-pool frame indices; last entry is handed out next.
    kernel_free: Vec<u32>,
    /// Free user-pool frame indices.
    user_free: Vec<u32>,
    reservations: Vec<ReservationEntry>,
    /// Sum of every reservation's currently available count. Frames backing
    /// this total are invisible to unreserved kernel acquires.
    reserved_frames: usize,
}

/// Availability counters for diagnostics.
pub struct FrameAllocatorStats {
    pub kernel_available: usize,
    pub user_available: usize,
    pub reserved_frames: usize,
}

/// The process-wide page-frame allocator.
///
/// Shared as `Arc<FrameAllocator>`; all mutation happens under an internal
/// spinlock. Acquire/release and reserve/release pairs must stay on the
/// same thread of execution.
pub struct FrameAllocator {
    arena: NonNull<u8>,
    layout: Layout,
    frame_count: usize,
    /// Frames with index below this belong to the kernel pool.
    kernel_frames: usize,
    pools: Mutex<Pools>,
}

// The arena pointer is only dereferenced through owned `Frame` handles.
unsafe impl Send for FrameAllocator {}
unsafe impl Sync for FrameAllocator {}

impl FrameAllocator {
    /// Create an allocator managing `kernel_frames + user_frames` frames.
    ///
    /// The backing arena is one frame-aligned allocation; a frame's address
    /// is derived from its index, so handles stay valid for the allocator's
    /// lifetime regardless of how often the frame changes hands.
    pub fn new(kernel_frames: usize, user_frames: usize) -> FrameAllocator {
        let frame_count = kernel_frames + user_frames;
        assert!(frame_count > 0);

        let layout = Layout::from_size_align(frame_count * FRAME_SIZE, FRAME_SIZE)
            .expect("frame arena layout");
        let arena = unsafe { alloc_zeroed(layout) };
        let arena = match NonNull::new(arena) {
            Some(ptr) => ptr,
            None => handle_alloc_error(layout),
        };

        // Populate the free lists so the lowest index is handed out first.
        let kernel_free: Vec<u32> = (0..kernel_frames as u32).rev().collect();
        let user_free: Vec<u32> = (kernel_frames as u32..frame_count as u32).rev().collect();

        log::info!(
            "Frame allocator initialized: {} kernel frames, {} user frames ({} KiB)",
            kernel_frames,
            user_frames,
            frame_count * FRAME_SIZE / 1024
        );

        FrameAllocator {
            arena,
            layout,
            frame_count,
            kernel_frames,
            pools: Mutex::new(Pools {
                kernel_free,
                user_free,
                reservations: Vec::new(),
                reserved_frames: 0,
            }),
        }
    }

    fn frame(&self, index: u32) -> Frame {
        debug_assert!((index as usize) < self.frame_count);
        let ptr = unsafe { self.arena.as_ptr().add(index as usize * FRAME_SIZE) };
        Frame {
            index,
            // Non-null because `arena` is and the offset stays in bounds.
            ptr: unsafe { NonNull::new_unchecked(ptr) },
        }
    }

    /// Acquire one frame.
    ///
    /// With `reservation` present the frame is charged against that
    /// reservation's remaining budget; `kernel_space` must be true in that
    /// case. A user-pool request falls back to the kernel pool when the
    /// user pool is empty.
    ///
    /// Returns `None` when the selected pool cannot serve the request.
    pub fn acquire(
        &self,
        kernel_space: bool,
        reservation: Option<ReservationId>,
    ) -> Option<Frame> {
        assert!(reservation.is_none() || kernel_space);

        let mut pools = self.pools.lock();
        let index = if kernel_space {
            Self::acquire_kernel(&mut pools, reservation)
        } else {
            match pools.user_free.pop() {
                Some(index) => Some(index),
                None => Self::acquire_kernel(&mut pools, None),
            }
        }?;
        drop(pools);

        log::trace!("frame allocator: acquired frame #{}", index);
        Some(self.frame(index))
    }

    fn acquire_kernel(pools: &mut Pools, reservation: Option<ReservationId>) -> Option<u32> {
        match reservation {
            Some(ReservationId(id)) => {
                let id = id as usize;
                if pools.reservations[id].available > 0 && !pools.kernel_free.is_empty() {
                    pools.reservations[id].available -= 1;
                    pools.reserved_frames -= 1;
                    pools.kernel_free.pop()
                } else {
                    None
                }
            }
            None => {
                // Frames backing outstanding reservations are off limits.
                if pools.kernel_free.len() > pools.reserved_frames {
                    pools.kernel_free.pop()
                } else {
                    None
                }
            }
        }
    }

    /// Return a frame to its origin pool.
    ///
    /// If the frame came from the kernel pool and a reservation is passed,
    /// the reservation's available budget is restored, capped at its total.
    pub fn release(&self, frame: Frame, reservation: Option<ReservationId>) {
        let index = frame.index;
        assert!((index as usize) < self.frame_count);

        let mut pools = self.pools.lock();
        if (index as usize) < self.kernel_frames {
            if let Some(ReservationId(id)) = reservation {
                let id = id as usize;
                debug_assert!(
                    pools.reservations[id].available <= pools.reservations[id].total
                );
                if pools.reservations[id].available < pools.reservations[id].total {
                    pools.reservations[id].available += 1;
                    pools.reserved_frames += 1;
                }
            }
            pools.kernel_free.push(index);
        } else {
            debug_assert!(reservation.is_none());
            pools.user_free.push(index);
        }
    }

    /// Pin `count` kernel-pool frames for the caller's exclusive use.
    ///
    /// Succeeds only if the kernel pool currently holds at least the sum of
    /// all outstanding reservations plus `count` frames, so reservations
    /// never promise more than the pool can deliver.
    pub fn reserve_kernel(&self, count: usize) -> Option<ReservationId> {
        let mut pools = self.pools.lock();
        if pools.kernel_free.len() >= pools.reserved_frames + count
            && pools.reservations.len() < MAX_RESERVATIONS
        {
            let id = pools.reservations.len() as u32;
            pools.reservations.push(ReservationEntry {
                available: count,
                total: count,
            });
            pools.reserved_frames += count;
            log::debug!("frame allocator: reservation {} pins {} frames", id, count);
            Some(ReservationId(id))
        } else {
            None
        }
    }

    /// Current availability counters.
    pub fn stats(&self) -> FrameAllocatorStats {
        let pools = self.pools.lock();
        FrameAllocatorStats {
            kernel_available: pools.kernel_free.len(),
            user_available: pools.user_free.len(),
            reserved_frames: pools.reserved_frames,
        }
    }

    /// Number of frames currently free in the kernel pool.
    pub fn kernel_available(&self) -> usize {
        self.pools.lock().kernel_free.len()
    }

    /// Number of frames currently free in the user pool.
    pub fn user_available(&self) -> usize {
        self.pools.lock().user_free.len()
    }
}

impl Drop for FrameAllocator {
    fn drop(&mut self) {
        unsafe { dealloc(self.arena.as_ptr(), self.layout) }
    }
}
