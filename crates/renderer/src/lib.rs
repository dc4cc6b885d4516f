//! Frame pipelining and GPU resource lifecycle.
//!
//! This crate is the core every render loop of vkpipe runs through:
//! - [`FrameRing`]: N frame slots, so the host records ahead of the device
//! - [`DeletionQueue`]: LIFO teardown scoped to a frame slot or the process
//! - [`BindingTableAllocator`]: growable binding-table pools
//! - [`ImmediateChannel`]: blocking one-off submissions
//! - [`PresentationSet`]: the presentable image chain and its recreation
//! - [`GpuContext`]: all of the above behind one explicitly built object
//!
//! Everything is generic over [`vkpipe_rhi::GpuBackend`], so the same code
//! drives Vulkan and the headless [`vkpipe_rhi::null::NullDevice`].

pub mod binding_allocator;
pub mod context;
pub mod culling;
pub mod deletion_queue;
pub mod frame_ring;
pub mod immediate;
pub mod presentation;
pub mod upload;

pub use binding_allocator::{
    BindingPoolSettings, BindingTableAllocator, descriptor_type, grow_capacity, pool_ratios,
};
pub use context::{ActiveFrame, FrameOutcome, GpuContext};
pub use deletion_queue::DeletionQueue;
pub use frame_ring::{Frame, FrameRing, SlotState, SubmittedFrame};
pub use immediate::ImmediateChannel;
pub use presentation::PresentationSet;
