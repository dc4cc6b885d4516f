//! Vulkan completion and ordering signals.
//!
//! - [`Fence`] is a completion signal: the host waits on it to learn that
//!   submitted work has finished.
//! - [`Semaphore`] is an ordering signal: the device waits on it before
//!   running dependent work. The host never waits on a semaphore.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use vkpipe_rhi::device::Device;
//! use vkpipe_rhi::sync::{Fence, Semaphore};
//!
//! # fn example(device: Arc<Device>) -> Result<(), vkpipe_rhi::RhiError> {
//! let acquired = Semaphore::new(device.clone())?;
//! let idle = Fence::new(device, true)?;
//!
//! // Block until the work guarded by the fence has finished
//! idle.wait(Duration::from_secs(1))?;
//! idle.reset()?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use ash::vk;
use tracing::trace;

use crate::device::Device;
use crate::error::{RhiError, RhiResult};

/// Vulkan semaphore wrapper.
///
/// Created unsignalled. A binary semaphore alternates between exactly one
/// pending signal and the one wait that consumes it.
pub struct Semaphore {
    device: Arc<Device>,
    semaphore: vk::Semaphore,
}

impl Semaphore {
    pub fn new(device: Arc<Device>) -> RhiResult<Self> {
        let create_info = vk::SemaphoreCreateInfo::default();
        let semaphore = unsafe { device.handle().create_semaphore(&create_info, None)? };
        trace!("Created semaphore {:?}", semaphore);
        Ok(Self { device, semaphore })
    }

    #[inline]
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe {
            self.device.handle().destroy_semaphore(self.semaphore, None);
        }
        trace!("Destroyed semaphore {:?}", self.semaphore);
    }
}

/// Vulkan fence wrapper.
///
/// A fence must not be reset while a submission that signals it is pending,
/// and must be unsignalled when passed to a submission.
pub struct Fence {
    device: Arc<Device>,
    fence: vk::Fence,
}

impl Fence {
    /// Creates a new fence.
    ///
    /// # Arguments
    ///
    /// * `device` - The logical device
    /// * `signaled` - Create the fence already signalled, for fences that are
    ///   waited on before the first submission that would signal them.
    pub fn new(device: Arc<Device>, signaled: bool) -> RhiResult<Self> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let create_info = vk::FenceCreateInfo::default().flags(flags);
        let fence = unsafe { device.handle().create_fence(&create_info, None)? };

        trace!(
            "Created fence {:?} ({})",
            fence,
            if signaled { "signaled" } else { "unsignaled" }
        );

        Ok(Self { device, fence })
    }

    #[inline]
    pub fn handle(&self) -> vk::Fence {
        self.fence
    }

    /// Block until the fence is signalled.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::Timeout`] if `timeout` expires first, and
    /// [`RhiError::DeviceLost`] if the device was lost while waiting.
    pub fn wait(&self, timeout: Duration) -> RhiResult<()> {
        let started = Instant::now();
        let nanos = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        let fences = [self.fence];
        let result = unsafe { self.device.handle().wait_for_fences(&fences, true, nanos) };
        match result {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => Err(RhiError::Timeout {
                what: "fence",
                waited: started.elapsed(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    /// Return the fence to the unsignalled state.
    pub fn reset(&self) -> RhiResult<()> {
        let fences = [self.fence];
        unsafe { self.device.handle().reset_fences(&fences)? };
        Ok(())
    }

    /// Non-blocking status query.
    pub fn is_signaled(&self) -> bool {
        let result = unsafe { self.device.handle().get_fence_status(self.fence) };
        matches!(result, Ok(true))
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        unsafe {
            self.device.handle().destroy_fence(self.fence, None);
        }
        trace!("Destroyed fence {:?}", self.fence);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_semaphore_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Semaphore>();
    }

    #[test]
    fn test_fence_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Fence>();
    }
}
