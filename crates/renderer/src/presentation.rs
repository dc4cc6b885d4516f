//! Surface presentation set.
//!
//! [`PresentationSet`] owns the chain of presentable images for the output
//! surface. The chain is never resized in place: when it goes stale, or the
//! window is resized, [`PresentationSet::recreate`] waits for the device to
//! go idle, destroys the old chain, and builds a new one.
//!
//! A zero-area extent (a minimized window) leaves the set without a chain.
//! Acquiring from it reports [`ImageAcquire::Stale`] until a later recreate
//! gets a drawable extent.

use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use tracing::{debug, info, warn};

use vkpipe_rhi::{ImageAcquire, PresentBackend, PresentStatus, RhiError, RhiResult};

/// Presentable image chain tied to one surface.
pub struct PresentationSet<B: PresentBackend> {
    backend: Arc<B>,
    chain: Option<B::Swapchain>,
    /// Extent requested by the last create.
    requested: vk::Extent2D,
    image_count: u32,
    acquire_timeout: Duration,
    recreations: u64,
}

impl<B: PresentBackend> PresentationSet<B> {
    /// An empty set; call [`create`](Self::create) to build the chain.
    pub fn new(backend: Arc<B>, image_count: u32, acquire_timeout: Duration) -> Self {
        Self {
            backend,
            chain: None,
            requested: vk::Extent2D::default(),
            image_count,
            acquire_timeout,
            recreations: 0,
        }
    }

    /// Build the image chain sized to `extent`.
    ///
    /// # Errors
    ///
    /// Creating over a live chain is a [`RhiError::ContractViolation`];
    /// [`destroy`](Self::destroy) it first.
    pub fn create(&mut self, extent: vk::Extent2D) -> RhiResult<()> {
        if self.chain.is_some() {
            return Err(RhiError::ContractViolation(
                "presentation chain created twice without destroy".to_string(),
            ));
        }

        self.requested = extent;
        if is_zero_area(extent) {
            debug!("Presentation paused: surface is {}x{}", extent.width, extent.height);
            return Ok(());
        }

        let chain = self.backend.create_swapchain(extent, self.image_count)?;
        let actual = self.backend.swapchain_extent(&chain);
        info!(
            "Presentation chain created: {}x{}, {} images",
            actual.width,
            actual.height,
            self.backend.swapchain_image_count(&chain)
        );
        self.chain = Some(chain);
        Ok(())
    }

    /// Release the chain and its image views.
    pub fn destroy(&mut self) {
        if self.chain.take().is_some() {
            debug!("Presentation chain destroyed");
        }
    }

    /// Drain the device, destroy the chain, and build a new one at `extent`.
    pub fn recreate(&mut self, extent: vk::Extent2D) -> RhiResult<()> {
        self.backend.wait_idle()?;
        self.destroy();
        self.create(extent)?;
        self.recreations += 1;
        Ok(())
    }

    /// Request the next image, with `signal` raised once it can be rendered
    /// into.
    ///
    /// A suboptimal image is still handed out; the caller is expected to
    /// recreate after presenting it.
    pub fn acquire_image(&self, signal: &B::Semaphore) -> RhiResult<ImageAcquire> {
        let Some(chain) = &self.chain else {
            return Ok(ImageAcquire::Stale);
        };
        let acquire = self
            .backend
            .acquire_image(chain, signal, self.acquire_timeout)?;
        if acquire == ImageAcquire::Stale {
            warn!("Presentation chain is stale on acquire");
        }
        Ok(acquire)
    }

    /// Queue image `index` for display once `wait` fires.
    ///
    /// # Errors
    ///
    /// Presenting without a chain is a [`RhiError::ContractViolation`].
    pub fn present(&self, index: u32, wait: &B::Semaphore) -> RhiResult<PresentStatus> {
        let Some(chain) = &self.chain else {
            return Err(RhiError::ContractViolation(format!(
                "present of image {index} with no presentation chain"
            )));
        };
        let status = self.backend.present(chain, index, wait)?;
        if status == PresentStatus::Stale {
            warn!("Presentation chain is stale on present");
        }
        Ok(status)
    }

    /// Whether a chain exists.
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.chain.is_some()
    }

    /// Extent of the live chain, or the last requested extent without one.
    pub fn extent(&self) -> vk::Extent2D {
        self.chain
            .as_ref()
            .map_or(self.requested, |chain| self.backend.swapchain_extent(chain))
    }

    /// Images in the live chain, 0 without one.
    pub fn image_count(&self) -> u32 {
        self.chain
            .as_ref()
            .map_or(0, |chain| self.backend.swapchain_image_count(chain))
    }

    /// Number of completed [`recreate`](Self::recreate) calls.
    #[inline]
    pub fn recreations(&self) -> u64 {
        self.recreations
    }

    #[inline]
    pub fn swapchain(&self) -> Option<&B::Swapchain> {
        self.chain.as_ref()
    }
}

impl<B: PresentBackend> Drop for PresentationSet<B> {
    fn drop(&mut self) {
        if self.chain.is_some() {
            if let Err(e) = self.backend.wait_idle() {
                warn!("Device wait failed before presentation teardown: {}", e);
            }
            self.destroy();
        }
    }
}

#[inline]
pub(crate) fn is_zero_area(extent: vk::Extent2D) -> bool {
    extent.width == 0 || extent.height == 0
}
