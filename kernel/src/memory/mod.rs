//! Physical page-frame management.

pub mod frame_allocator;

pub use frame_allocator::{
    Frame, FrameAllocator, FrameAllocatorStats, ReservationId, FRAME_SIZE,
};
