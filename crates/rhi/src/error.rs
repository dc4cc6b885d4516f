//! RHI-specific error types.
//!
//! Errors fall into four groups that callers treat differently:
//! pool exhaustion is recovered inside the binding-table allocator, stale
//! presentation chains are rebuilt by the caller, device loss ends the
//! session, and contract violations are defects in the calling code.

use std::time::Duration;

use ash::vk;
use thiserror::Error;

/// RHI-specific error type.
#[derive(Error, Debug)]
pub enum RhiError {
    /// Vulkan API error not covered by a more specific variant
    #[error("Vulkan error: {0}")]
    VulkanError(vk::Result),

    /// Failed to load Vulkan library
    #[error("Failed to load Vulkan: {0}")]
    LoadingError(#[from] ash::LoadingError),

    /// GPU allocator error
    #[error("Allocator error: {0}")]
    AllocatorError(#[from] gpu_allocator::AllocationError),

    /// No suitable GPU found
    #[error("No suitable GPU found")]
    NoSuitableGpu,

    /// Surface creation error
    #[error("Surface error: {0}")]
    SurfaceError(String),

    /// Swapchain error
    #[error("Swapchain error: {0}")]
    SwapchainError(String),

    /// Invalid handle error
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    /// A binding-table pool has no capacity left for the request
    #[error("Binding-table pool exhausted")]
    PoolExhausted,

    /// A binding-table pool has capacity but not in one piece
    #[error("Binding-table pool fragmented")]
    PoolFragmented,

    /// A bounded wait on a completion signal expired
    #[error("Timed out after {waited:?} waiting for {what}; device presumed lost")]
    Timeout { what: &'static str, waited: Duration },

    /// The device reported itself lost
    #[error("Device lost")]
    DeviceLost,

    /// The caller broke an API contract
    #[error("Contract violation: {0}")]
    ContractViolation(String),
}

impl RhiError {
    /// Exhaustion or fragmentation of a binding-table pool.
    #[inline]
    pub fn is_pool_exhaustion(&self) -> bool {
        matches!(self, Self::PoolExhausted | Self::PoolFragmented)
    }

    /// Conditions after which no in-flight device state can be trusted.
    #[inline]
    pub fn is_device_loss(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::DeviceLost)
    }
}

impl From<vk::Result> for RhiError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_POOL_MEMORY => Self::PoolExhausted,
            vk::Result::ERROR_FRAGMENTED_POOL => Self::PoolFragmented,
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost,
            other => Self::VulkanError(other),
        }
    }
}

/// Result type alias for RHI operations.
pub type RhiResult<T> = std::result::Result<T, RhiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_errors_are_classified() {
        assert!(RhiError::from(vk::Result::ERROR_OUT_OF_POOL_MEMORY).is_pool_exhaustion());
        assert!(RhiError::from(vk::Result::ERROR_FRAGMENTED_POOL).is_pool_exhaustion());
        assert!(!RhiError::from(vk::Result::ERROR_OUT_OF_HOST_MEMORY).is_pool_exhaustion());
    }

    #[test]
    fn test_device_loss_classification() {
        assert!(RhiError::from(vk::Result::ERROR_DEVICE_LOST).is_device_loss());
        let timeout = RhiError::Timeout {
            what: "frame slot",
            waited: Duration::from_secs(1),
        };
        assert!(timeout.is_device_loss());
        assert!(!timeout.is_pool_exhaustion());
        assert!(!RhiError::PoolExhausted.is_device_loss());
    }

    #[test]
    fn test_unclassified_result_is_preserved() {
        match RhiError::from(vk::Result::ERROR_INITIALIZATION_FAILED) {
            RhiError::VulkanError(r) => assert_eq!(r, vk::Result::ERROR_INITIALIZATION_FAILED),
            other => panic!("unexpected {other:?}"),
        }
    }
}
