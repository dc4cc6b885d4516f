//! Device layer of vkpipe.
//!
//! [`backend`] names the device capabilities the frame pipeline relies on.
//! Two backends implement them:
//! - [`vulkan::VulkanBackend`], built from the RAII wrappers in this crate
//!   (instance, surface, device, sync objects, command contexts, descriptor
//!   pools, timestamp queries, swapchain, buffers) on top of `ash` and `gpu-allocator`
//! - [`null::NullDevice`], a headless software timeline with controllable
//!   completion

mod error;

pub mod backend;
pub mod buffer;
pub mod command;
pub mod descriptor;
pub mod device;
pub mod instance;
pub mod null;
pub mod physical_device;
pub mod query;
pub mod surface;
pub mod swapchain;
pub mod sync;
pub mod vulkan;

pub use backend::{
    GpuBackend, ImageAcquire, PoolSizeRatio, PresentBackend, PresentStatus, SubmitSync,
};
pub use error::{RhiError, RhiResult};

// Re-export ash types that users might need
pub use ash::vk;
