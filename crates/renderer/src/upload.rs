//! Device-local buffer uploads over the immediate channel.

use std::sync::Arc;

use ash::vk;
use tracing::debug;

use vkpipe_rhi::RhiResult;
use vkpipe_rhi::buffer::{Buffer, BufferUsage};
use vkpipe_rhi::device::Device;
use vkpipe_rhi::vulkan::VulkanBackend;

use crate::immediate::ImmediateChannel;

/// Copy `data` into a new device-local buffer of `usage`.
///
/// The data goes through a host-visible staging buffer that is released
/// once the copy has completed.
pub fn upload_buffer(
    immediate: &mut ImmediateChannel<VulkanBackend>,
    device: &Arc<Device>,
    usage: BufferUsage,
    data: &[u8],
) -> RhiResult<Buffer> {
    let staging = Buffer::new_with_data(Arc::clone(device), BufferUsage::Staging, data)?;
    let target = Buffer::new(Arc::clone(device), usage, staging.size())?;

    let region = vk::BufferCopy::default().size(staging.size());
    immediate.run(|commands| {
        commands
            .buffer()
            .copy_buffer(staging.handle(), target.handle(), &[region]);
        Ok(())
    })?;

    debug!("Uploaded {} bytes to a {} buffer", data.len(), usage.name());
    Ok(target)
}
