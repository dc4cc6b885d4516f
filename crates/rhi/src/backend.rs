//! Device backend abstraction.
//!
//! The frame pipeline only needs a handful of device capabilities: completion
//! signals the host can wait on, ordering signals the device uses to sequence
//! its own work, recording contexts, binding-table pools, and a presentation
//! chain. [`GpuBackend`] and [`PresentBackend`] name exactly those, so the
//! pipeline runs unchanged on [`crate::vulkan::VulkanBackend`] and on the
//! software timeline of [`crate::null::NullDevice`].
//!
//! Every backend object releases its device storage when dropped.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use vkpipe_rhi::backend::{GpuBackend, SubmitSync};
//! use vkpipe_rhi::null::NullDevice;
//!
//! # fn main() -> vkpipe_rhi::RhiResult<()> {
//! let device = NullDevice::new();
//! let fence = device.create_fence(false)?;
//! let mut commands = device.create_command_context()?;
//!
//! device.begin_commands(&mut commands)?;
//! device.end_commands(&mut commands)?;
//! device.submit(&commands, SubmitSync::none(), &fence)?;
//! device.wait_for_fence(&fence, Duration::from_secs(1))?;
//! # Ok(())
//! # }
//! ```

use std::fmt::Debug;
use std::time::Duration;

use ash::vk;

use crate::error::RhiResult;

/// Weight of one descriptor category in a binding-table pool.
///
/// A pool created for `max_tables` tables holds
/// `max(1, floor(ratio * max_tables))` descriptors of type `ty`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PoolSizeRatio {
    pub ty: vk::DescriptorType,
    pub ratio: f32,
}

impl PoolSizeRatio {
    #[inline]
    pub const fn new(ty: vk::DescriptorType, ratio: f32) -> Self {
        Self { ty, ratio }
    }

    /// Descriptor count this ratio contributes to a pool of `max_tables`.
    #[inline]
    pub fn descriptor_count(&self, max_tables: u32) -> u32 {
        ((self.ratio * max_tables as f32) as u32).max(1)
    }
}

/// Ordering signals attached to one submission.
#[derive(Debug)]
pub struct SubmitSync<'a, S> {
    /// Signal the device waits on, and the first stage that must wait for it.
    pub wait: Option<(&'a S, vk::PipelineStageFlags)>,
    /// Signal the device raises when the submitted work finishes.
    pub signal: Option<&'a S>,
}

impl<S> SubmitSync<'_, S> {
    /// No ordering signals; only the completion signal is raised.
    #[inline]
    pub fn none() -> Self {
        Self {
            wait: None,
            signal: None,
        }
    }
}

// Manual impls: derives would require S: Clone
impl<S> Clone for SubmitSync<'_, S> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S> Copy for SubmitSync<'_, S> {}

/// Result of asking the presentation chain for an image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageAcquire {
    /// Image `index` will be ready once the signal passed to the acquire fires.
    /// `suboptimal` images can still be rendered and presented, but the chain
    /// should be rebuilt afterwards.
    Ready { index: u32, suboptimal: bool },
    /// The chain no longer matches the surface; nothing was signalled.
    Stale,
}

/// Result of presenting an image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresentStatus {
    Presented,
    /// The image was consumed but the chain must be rebuilt.
    Stale,
}

/// Device capabilities the frame pipeline is built on.
pub trait GpuBackend: Send + Sync + 'static {
    /// Host-observable completion signal.
    type Fence: Send;
    /// Device-side ordering signal, never waited on by the host.
    type Semaphore: Send;
    /// Single-use command recording context.
    type CommandContext: Send;
    /// Fixed-capacity binding-table pool.
    type BindingPool: Send;
    /// Shape of a binding table.
    type BindingLayout;
    /// Handle to an allocated binding table, valid until its pool is reset.
    type BindingTable: Copy + Debug;
    /// Device timestamp queries, used in pairs to time a span of work.
    type TimestampPool: Send;

    fn create_fence(&self, signaled: bool) -> RhiResult<Self::Fence>;

    /// Block until `fence` is signalled.
    ///
    /// # Errors
    ///
    /// Returns [`crate::RhiError::Timeout`] when `timeout` expires first. Callers
    /// treat this as device loss.
    fn wait_for_fence(&self, fence: &Self::Fence, timeout: Duration) -> RhiResult<()>;

    fn reset_fence(&self, fence: &Self::Fence) -> RhiResult<()>;

    fn create_semaphore(&self) -> RhiResult<Self::Semaphore>;

    fn create_command_context(&self) -> RhiResult<Self::CommandContext>;

    /// Discard previous contents and open the context for one-time recording.
    fn begin_commands(&self, commands: &mut Self::CommandContext) -> RhiResult<()>;

    fn end_commands(&self, commands: &mut Self::CommandContext) -> RhiResult<()>;

    /// Queue recorded work. Never blocks on device progress; `fence` is raised
    /// once everything in `commands` has executed.
    fn submit(
        &self,
        commands: &Self::CommandContext,
        sync: SubmitSync<'_, Self::Semaphore>,
        fence: &Self::Fence,
    ) -> RhiResult<()>;

    fn create_binding_pool(
        &self,
        max_tables: u32,
        ratios: &[PoolSizeRatio],
    ) -> RhiResult<Self::BindingPool>;

    /// Allocate one table from `pool`.
    ///
    /// # Errors
    ///
    /// Exhaustion is reported as [`crate::RhiError::PoolExhausted`] or
    /// [`crate::RhiError::PoolFragmented`].
    fn allocate_binding_table(
        &self,
        pool: &mut Self::BindingPool,
        layout: &Self::BindingLayout,
    ) -> RhiResult<Self::BindingTable>;

    /// Return every table of `pool` to it at once.
    fn reset_binding_pool(&self, pool: &mut Self::BindingPool) -> RhiResult<()>;

    /// Create `count` timestamp queries, or `None` when the queue cannot
    /// write timestamps.
    fn create_timestamp_pool(&self, count: u32) -> RhiResult<Option<Self::TimestampPool>>;

    /// Record a reset of queries `first` and `first + 1`, then a start stamp
    /// into `first` ahead of every later command.
    fn begin_timestamps(
        &self,
        commands: &mut Self::CommandContext,
        pool: &Self::TimestampPool,
        first: u32,
    ) -> RhiResult<()>;

    /// Record an end stamp into `first + 1` once every earlier command is done.
    fn end_timestamps(
        &self,
        commands: &mut Self::CommandContext,
        pool: &Self::TimestampPool,
        first: u32,
    ) -> RhiResult<()>;

    /// Device time between the stamps at `first` and `first + 1`.
    ///
    /// Only meaningful after the submission that wrote them has completed;
    /// `None` when no result is available.
    fn read_timestamps(&self, pool: &Self::TimestampPool, first: u32)
    -> RhiResult<Option<Duration>>;

    /// Block until the device has finished all submitted work.
    fn wait_idle(&self) -> RhiResult<()>;
}

/// A backend that can also drive a presentation surface.
pub trait PresentBackend: GpuBackend {
    type Swapchain: Send;

    /// Build a chain of presentable images sized to `extent`.
    fn create_swapchain(&self, extent: vk::Extent2D, image_count: u32)
    -> RhiResult<Self::Swapchain>;

    fn swapchain_extent(&self, chain: &Self::Swapchain) -> vk::Extent2D;

    fn swapchain_image_count(&self, chain: &Self::Swapchain) -> u32;

    /// Request the next image, arranging for `signal` to fire once it is safe
    /// to render into.
    fn acquire_image(
        &self,
        chain: &Self::Swapchain,
        signal: &Self::Semaphore,
        timeout: Duration,
    ) -> RhiResult<ImageAcquire>;

    /// Queue image `index` for display once `wait` fires.
    fn present(
        &self,
        chain: &Self::Swapchain,
        index: u32,
        wait: &Self::Semaphore,
    ) -> RhiResult<PresentStatus>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_size_ratio_descriptor_count() {
        let ratio = PoolSizeRatio::new(vk::DescriptorType::STORAGE_IMAGE, 3.0);
        assert_eq!(ratio.descriptor_count(1000), 3000);
        assert_eq!(ratio.descriptor_count(10), 30);

        let sparse = PoolSizeRatio::new(vk::DescriptorType::SAMPLER, 0.25);
        assert_eq!(sparse.descriptor_count(10), 2);
        assert_eq!(sparse.descriptor_count(1), 1);
    }

    #[test]
    fn test_submit_sync_none() {
        let sync = SubmitSync::<u64>::none();
        assert!(sync.wait.is_none());
        assert!(sync.signal.is_none());
    }
}
