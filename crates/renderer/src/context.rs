//! Device context.
//!
//! [`GpuContext`] is the one object a render loop holds. It is built
//! explicitly from a backend and a [`RendererConfig`] and owns every part of
//! the frame pipeline:
//!
//! - the [`FrameRing`] of per-frame slots
//! - the [`ImmediateChannel`] for blocking one-off work
//! - the [`PresentationSet`] for the output surface
//! - a process-wide [`DeletionQueue`] and [`BindingTableAllocator`]
//!
//! # Frame loop
//!
//! ```
//! use std::sync::Arc;
//! use vkpipe_core::RendererConfig;
//! use vkpipe_rhi::vk;
//! use vkpipe_rhi::null::NullDevice;
//! use vkpipe_renderer::{FrameOutcome, GpuContext};
//!
//! # fn main() -> vkpipe_rhi::RhiResult<()> {
//! let device = Arc::new(NullDevice::new());
//! let extent = vk::Extent2D { width: 640, height: 480 };
//! let mut context = GpuContext::new(device, &RendererConfig::default(), extent)?;
//!
//! for _ in 0..3 {
//!     if let FrameOutcome::Ready(mut frame) = context.begin_frame()? {
//!         frame.record(|commands| commands.push("clear"))?;
//!         GpuContext::end_frame(frame)?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Shutdown
//!
//! Dropping the context waits for the device to go idle, then tears down in
//! dependency order: slot queues and pools, the presentation chain, the
//! global allocator, the global deletion queue, and finally the sync
//! objects and the backend itself.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use ash::vk;
use tracing::{debug, error, info};

use vkpipe_core::{FrameStats, RendererConfig};
use vkpipe_rhi::{ImageAcquire, PoolSizeRatio, PresentBackend, PresentStatus, RhiError, RhiResult};

use crate::binding_allocator::{BindingPoolSettings, BindingTableAllocator};
use crate::deletion_queue::DeletionQueue;
use crate::frame_ring::{Frame, FrameRing};
use crate::immediate::ImmediateChannel;
use crate::presentation::{PresentationSet, is_zero_area};

/// Tables in the process-wide allocator's first pool.
pub const GLOBAL_BINDING_TABLES: u32 = 10;

/// Descriptor ratios of the process-wide allocator.
pub const GLOBAL_BINDING_RATIOS: [PoolSizeRatio; 1] =
    [PoolSizeRatio::new(vk::DescriptorType::STORAGE_IMAGE, 1.0)];

/// Result of [`GpuContext::begin_frame`].
pub enum FrameOutcome<'a, B: PresentBackend> {
    /// A slot and a presentable image are ready for recording.
    Ready(ActiveFrame<'a, B>),
    /// Nothing to render this time: the surface has no area, or the chain
    /// went stale and was rebuilt.
    Skipped,
}

/// Frame pipeline bound to one device and one surface.
pub struct GpuContext<B: PresentBackend> {
    ring: FrameRing<B>,
    immediate: ImmediateChannel<B>,
    presentation: PresentationSet<B>,
    global_bindings: BindingTableAllocator<B>,
    deletion_queue: DeletionQueue,
    stats: FrameStats,
    stats_interval: u64,
    pending_extent: Option<vk::Extent2D>,
    backend: Arc<B>,
}

impl<B: PresentBackend> GpuContext<B> {
    /// Build the frame pipeline and the first presentation chain.
    ///
    /// # Errors
    ///
    /// An invalid configuration is a [`RhiError::ContractViolation`]; backend
    /// failures while creating slots, pools, or the chain are returned as is.
    pub fn new(backend: Arc<B>, config: &RendererConfig, extent: vk::Extent2D) -> RhiResult<Self> {
        config
            .validate()
            .map_err(|e| RhiError::ContractViolation(e.to_string()))?;

        let timeout = config.frames.fence_timeout();
        let ring = FrameRing::new(
            Arc::clone(&backend),
            config.frames.frames_in_flight,
            &BindingPoolSettings::from_config(&config.bindings),
            timeout,
        )?;
        let immediate = ImmediateChannel::new(Arc::clone(&backend), timeout)?;
        let mut presentation = PresentationSet::new(
            Arc::clone(&backend),
            config.presentation.image_count,
            timeout,
        );
        presentation.create(extent)?;
        let global_bindings = BindingTableAllocator::new(
            Arc::clone(&backend),
            GLOBAL_BINDING_TABLES,
            config.bindings.max_tables.max(GLOBAL_BINDING_TABLES),
            &GLOBAL_BINDING_RATIOS,
        )?;

        info!(
            "GPU context ready: {} frames in flight, {}x{} surface",
            config.frames.frames_in_flight, extent.width, extent.height
        );

        Ok(Self {
            ring,
            immediate,
            presentation,
            global_bindings,
            deletion_queue: DeletionQueue::new(),
            stats: FrameStats::new(),
            stats_interval: config.frames.stats_interval,
            pending_extent: None,
            backend,
        })
    }

    /// Claim a frame slot and a presentable image.
    ///
    /// A pending resize is applied first. A stale chain is rebuilt here and
    /// the frame skipped, as is every frame while the surface has no area.
    ///
    /// # Errors
    ///
    /// [`RhiError::Timeout`] when a slot never comes free (device loss), or
    /// any backend failure.
    pub fn begin_frame(&mut self) -> RhiResult<FrameOutcome<'_, B>> {
        if let Some(extent) = self.pending_extent.take() {
            self.presentation.recreate(extent)?;
        }
        if !self.presentation.is_ready() {
            return Ok(FrameOutcome::Skipped);
        }

        self.stats.tick();
        let mut frame = self.ring.acquire_next()?;
        self.stats.record_blocked(frame.waited());
        if let Some(elapsed) = frame.device_time() {
            self.stats.record_device_time(elapsed);
        }

        match frame.acquire_image(&self.presentation)? {
            ImageAcquire::Ready { suboptimal, .. } => {
                if suboptimal {
                    self.pending_extent = Some(self.presentation.extent());
                }
                Ok(FrameOutcome::Ready(ActiveFrame {
                    frame,
                    presentation: &mut self.presentation,
                    stats: &self.stats,
                    stats_interval: self.stats_interval,
                }))
            }
            ImageAcquire::Stale => {
                frame.cancel();
                let extent = self.presentation.extent();
                self.presentation.recreate(extent)?;
                Ok(FrameOutcome::Skipped)
            }
        }
    }

    /// Submit and present a frame from [`begin_frame`](Self::begin_frame).
    pub fn end_frame(frame: ActiveFrame<'_, B>) -> RhiResult<PresentStatus> {
        frame.end()
    }

    /// Rebuild the presentation chain at `extent` before the next frame.
    ///
    /// A zero-area extent pauses rendering until a later resize.
    pub fn resize(&mut self, extent: vk::Extent2D) {
        debug!("Resize requested: {}x{}", extent.width, extent.height);
        self.pending_extent = Some(extent);
    }

    /// Whether frames are currently skipped for lack of a drawable surface.
    pub fn is_paused(&self) -> bool {
        match self.pending_extent {
            Some(extent) => is_zero_area(extent),
            None => !self.presentation.is_ready(),
        }
    }

    #[inline]
    pub fn immediate(&mut self) -> &mut ImmediateChannel<B> {
        &mut self.immediate
    }

    /// Process-wide teardown, flushed once at shutdown.
    #[inline]
    pub fn deletion_queue(&mut self) -> &mut DeletionQueue {
        &mut self.deletion_queue
    }

    /// Process-wide binding tables, never reclaimed per frame.
    #[inline]
    pub fn global_bindings(&mut self) -> &mut BindingTableAllocator<B> {
        &mut self.global_bindings
    }

    #[inline]
    pub fn stats(&self) -> &FrameStats {
        &self.stats
    }

    #[inline]
    pub fn ring(&self) -> &FrameRing<B> {
        &self.ring
    }

    #[inline]
    pub fn presentation(&self) -> &PresentationSet<B> {
        &self.presentation
    }

    #[inline]
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Block until every in-flight frame has completed.
    pub fn drain(&mut self) -> RhiResult<()> {
        self.ring.drain()
    }
}

impl<B: PresentBackend> Drop for GpuContext<B> {
    fn drop(&mut self) {
        if let Err(e) = self.backend.wait_idle() {
            error!("Device wait failed during shutdown: {}", e);
        }
        self.ring.release_slots();
        self.presentation.destroy();
        self.global_bindings.destroy_all();
        self.deletion_queue.flush();
        info!(
            "GPU context destroyed after {} frames",
            self.stats.frames()
        );
    }
}

/// A frame with a slot and an image, ready for recording.
///
/// Dereferences to the underlying [`Frame`] for recording, binding tables,
/// and the slot's deletion queue.
pub struct ActiveFrame<'a, B: PresentBackend> {
    frame: Frame<'a, B>,
    presentation: &'a mut PresentationSet<B>,
    stats: &'a FrameStats,
    stats_interval: u64,
}

impl<B: PresentBackend> ActiveFrame<'_, B> {
    /// Image being rendered this frame.
    pub fn image_index(&self) -> RhiResult<u32> {
        self.frame
            .image_index()
            .ok_or_else(|| RhiError::ContractViolation("active frame without an image".into()))
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.presentation.extent()
    }

    #[inline]
    pub fn presentation(&self) -> &PresentationSet<B> {
        self.presentation
    }

    /// Submit the frame, present its image, and rebuild a stale chain.
    pub fn end(self) -> RhiResult<PresentStatus> {
        let ActiveFrame {
            frame,
            presentation,
            stats,
            stats_interval,
        } = self;

        let submitted = frame.submit()?;
        let frame_number = submitted.frame_number();
        let status = submitted.present(presentation)?;
        if status == PresentStatus::Stale {
            let extent = presentation.extent();
            presentation.recreate(extent)?;
        }

        if stats_interval > 0 && (frame_number + 1) % stats_interval == 0 {
            let device_ms = stats
                .average_device_time()
                .map_or(f64::NAN, |t| t.as_secs_f64() * 1000.0);
            debug!(
                "Frame {}: {:.2} ms avg, {:.1} fps, {:.3} ms blocked, {:.2} ms on device",
                frame_number + 1,
                stats.average_frame_time().as_secs_f64() * 1000.0,
                stats.fps(),
                stats.blocked().as_secs_f64() * 1000.0,
                device_ms
            );
        }

        Ok(status)
    }
}

impl<'a, B: PresentBackend> Deref for ActiveFrame<'a, B> {
    type Target = Frame<'a, B>;

    fn deref(&self) -> &Self::Target {
        &self.frame
    }
}

impl<B: PresentBackend> DerefMut for ActiveFrame<'_, B> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vkpipe_rhi::null::NullDevice;

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    #[test]
    fn test_invalid_config_rejected() {
        let device = Arc::new(NullDevice::new());
        let mut config = RendererConfig::default();
        config.frames.frames_in_flight = 0;
        assert!(matches!(
            GpuContext::new(device, &config, extent(64, 64)),
            Err(RhiError::ContractViolation(_))
        ));
    }

    #[test]
    fn test_frames_render_and_present() {
        let device = Arc::new(NullDevice::new());
        let mut context =
            GpuContext::new(Arc::clone(&device), &RendererConfig::default(), extent(64, 64))
                .unwrap();

        for _ in 0..5 {
            let FrameOutcome::Ready(frame) = context.begin_frame().unwrap() else {
                panic!("frame skipped on a live surface");
            };
            assert_eq!(GpuContext::end_frame(frame).unwrap(), PresentStatus::Presented);
        }
        assert_eq!(device.submitted(), 5);
        assert_eq!(context.stats().frames(), 5);
    }

    #[test]
    fn test_device_time_reaches_stats_once_slots_wrap() {
        let device = Arc::new(NullDevice::new());
        let config = RendererConfig::default();
        let mut context =
            GpuContext::new(Arc::clone(&device), &config, extent(64, 64)).unwrap();

        let frames = config.frames.frames_in_flight as u64 + 2;
        for _ in 0..frames {
            let FrameOutcome::Ready(frame) = context.begin_frame().unwrap() else {
                panic!("frame skipped on a live surface");
            };
            GpuContext::end_frame(frame).unwrap();
        }
        assert_eq!(context.stats().device_frames(), 2);
        assert!(context.stats().average_device_time().is_some());
    }

    #[test]
    fn test_zero_extent_skips_until_resized() {
        let device = Arc::new(NullDevice::new());
        let mut context =
            GpuContext::new(Arc::clone(&device), &RendererConfig::default(), extent(64, 64))
                .unwrap();

        context.resize(extent(0, 0));
        assert!(context.is_paused());
        assert!(matches!(context.begin_frame().unwrap(), FrameOutcome::Skipped));
        assert!(matches!(context.begin_frame().unwrap(), FrameOutcome::Skipped));

        context.resize(extent(32, 32));
        assert!(!context.is_paused());
        assert!(matches!(
            context.begin_frame().unwrap(),
            FrameOutcome::Ready(_)
        ));
    }

    #[test]
    fn test_global_allocator_shape() {
        let device = Arc::new(NullDevice::new());
        let mut context =
            GpuContext::new(device, &RendererConfig::default(), extent(64, 64)).unwrap();
        assert_eq!(context.global_bindings().capacities(), [GLOBAL_BINDING_TABLES]);
        assert_eq!(context.global_bindings().ratios(), GLOBAL_BINDING_RATIOS);
    }
}
