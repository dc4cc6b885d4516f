//! Presentation surface.

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use tracing::{debug, info};

use crate::error::{RhiError, RhiResult};
use crate::instance::Instance;

/// RAII wrapper for a Vulkan surface.
///
/// The instance must outlive the surface.
pub struct Surface {
    handle: vk::SurfaceKHR,
    loader: ash::khr::surface::Instance,
}

impl Surface {
    /// Create a surface for `window`.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::SurfaceError`] if the window handles are unavailable
    /// or the platform surface cannot be created.
    pub fn new(
        instance: &Instance,
        window: &(impl HasDisplayHandle + HasWindowHandle),
    ) -> RhiResult<Self> {
        let display = window
            .display_handle()
            .map_err(|e| RhiError::SurfaceError(format!("no display handle: {e}")))?;
        let window = window
            .window_handle()
            .map_err(|e| RhiError::SurfaceError(format!("no window handle: {e}")))?;

        // SAFETY: the handles come from a live window, and the surface is
        // destroyed in Drop before the instance.
        let handle = unsafe {
            ash_window::create_surface(
                instance.entry(),
                instance.handle(),
                display.as_raw(),
                window.as_raw(),
                None,
            )
            .map_err(|e| RhiError::SurfaceError(format!("surface creation failed: {e}")))?
        };

        let loader = ash::khr::surface::Instance::new(instance.entry(), instance.handle());

        info!("Vulkan surface created");

        Ok(Self { handle, loader })
    }

    #[inline]
    pub fn handle(&self) -> vk::SurfaceKHR {
        self.handle
    }

    #[inline]
    pub fn loader(&self) -> &ash::khr::surface::Instance {
        &self.loader
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        unsafe {
            self.loader.destroy_surface(self.handle, None);
        }
        debug!("Vulkan surface destroyed");
    }
}
