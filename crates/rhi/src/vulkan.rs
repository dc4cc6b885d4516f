//! The Vulkan implementation of [`GpuBackend`] and [`PresentBackend`].
//!
//! [`VulkanBackend`] owns the instance, the window surface, and the logical
//! device, and maps each backend capability onto the RAII wrappers of this
//! crate. Driver results are translated into [`RhiError`] variants so the
//! frame pipeline can tell pool exhaustion, stale chains, timeouts, and
//! device loss apart.

use std::mem::ManuallyDrop;
use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use tracing::{info, warn};

use crate::backend::{
    GpuBackend, ImageAcquire, PoolSizeRatio, PresentBackend, PresentStatus, SubmitSync,
};
use crate::command::CommandContext;
use crate::descriptor::DescriptorPool;
use crate::device::Device;
use crate::error::{RhiError, RhiResult};
use crate::instance::Instance;
use crate::physical_device::{PhysicalDeviceInfo, select_physical_device};
use crate::query::TimestampPool;
use crate::surface::Surface;
use crate::swapchain::Swapchain;
use crate::sync::{Fence, Semaphore};

/// Vulkan device bound to one window surface.
pub struct VulkanBackend {
    swapchain_loader: ash::khr::swapchain::Device,
    // Destroyed by hand in Drop: device, then surface, then instance
    device: ManuallyDrop<Arc<Device>>,
    surface: ManuallyDrop<Surface>,
    instance: ManuallyDrop<Instance>,
    gpu: PhysicalDeviceInfo,
    graphics_family: u32,
    /// Valid bits of graphics-queue timestamps; 0 when the queue cannot write them.
    timestamp_bits: u32,
}

impl VulkanBackend {
    /// Bring up Vulkan for `window`: instance, surface, GPU selection, and
    /// logical device.
    ///
    /// # Errors
    ///
    /// Fails when Vulkan cannot be loaded, the window exposes no handles, or
    /// no GPU can render to and present on the surface.
    pub fn new(
        window: &(impl HasDisplayHandle + HasWindowHandle),
        app_name: &str,
        enable_validation: bool,
    ) -> RhiResult<Self> {
        let display = window
            .display_handle()
            .map_err(|e| RhiError::SurfaceError(format!("no display handle: {e}")))?
            .as_raw();

        let instance = Instance::new(app_name, display, enable_validation)?;
        let surface = Surface::new(&instance, window)?;
        let gpu = select_physical_device(instance.handle(), surface.handle(), surface.loader())?;
        let device = Device::new(&instance, &gpu)?;
        let graphics_family = gpu
            .queue_families
            .graphics_family
            .ok_or(RhiError::NoSuitableGpu)?;
        let swapchain_loader = ash::khr::swapchain::Device::new(instance.handle(), device.handle());
        let timestamp_bits = unsafe {
            instance
                .handle()
                .get_physical_device_queue_family_properties(gpu.device)
        }
        .get(graphics_family as usize)
        .map_or(0, |family| family.timestamp_valid_bits);

        info!("Vulkan backend ready on '{}'", gpu.device_name());

        Ok(Self {
            swapchain_loader,
            device: ManuallyDrop::new(device),
            surface: ManuallyDrop::new(surface),
            instance: ManuallyDrop::new(instance),
            gpu,
            graphics_family,
            timestamp_bits,
        })
    }

    #[inline]
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    #[inline]
    pub fn gpu(&self) -> &PhysicalDeviceInfo {
        &self.gpu
    }

    #[inline]
    pub fn has_validation(&self) -> bool {
        self.instance.has_validation()
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        if let Err(e) = self.device.wait_idle() {
            warn!("Device wait failed during backend teardown: {}", e);
        }
        if Arc::strong_count(self.device()) > 1 {
            warn!(
                "{} device reference(s) outlive the backend",
                Arc::strong_count(self.device()) - 1
            );
        }
        unsafe {
            ManuallyDrop::drop(&mut self.device);
            ManuallyDrop::drop(&mut self.surface);
            ManuallyDrop::drop(&mut self.instance);
        }
        info!("Vulkan backend destroyed");
    }
}

// Safety: every wrapped object is either immutable after creation or guards
// its mutable state (queues, allocator) behind locks inside Device.
unsafe impl Send for VulkanBackend {}
unsafe impl Sync for VulkanBackend {}

impl GpuBackend for VulkanBackend {
    type Fence = Fence;
    type Semaphore = Semaphore;
    type CommandContext = CommandContext;
    type BindingPool = DescriptorPool;
    type BindingLayout = vk::DescriptorSetLayout;
    type BindingTable = vk::DescriptorSet;
    type TimestampPool = TimestampPool;

    fn create_fence(&self, signaled: bool) -> RhiResult<Fence> {
        Fence::new(Arc::clone(self.device()), signaled)
    }

    fn wait_for_fence(&self, fence: &Fence, timeout: Duration) -> RhiResult<()> {
        fence.wait(timeout)
    }

    fn reset_fence(&self, fence: &Fence) -> RhiResult<()> {
        fence.reset()
    }

    fn create_semaphore(&self) -> RhiResult<Semaphore> {
        Semaphore::new(Arc::clone(self.device()))
    }

    fn create_command_context(&self) -> RhiResult<CommandContext> {
        CommandContext::new(Arc::clone(self.device()), self.graphics_family)
    }

    fn begin_commands(&self, commands: &mut CommandContext) -> RhiResult<()> {
        commands.buffer().reset()?;
        commands.buffer().begin()
    }

    fn end_commands(&self, commands: &mut CommandContext) -> RhiResult<()> {
        commands.buffer().end()
    }

    fn submit(
        &self,
        commands: &CommandContext,
        sync: SubmitSync<'_, Semaphore>,
        fence: &Fence,
    ) -> RhiResult<()> {
        let buffers = [commands.buffer().handle()];
        let (wait_semaphores, wait_stages) = match sync.wait {
            Some((semaphore, stage)) => (vec![semaphore.handle()], vec![stage]),
            None => (Vec::new(), Vec::new()),
        };
        let signal_semaphores: Vec<vk::Semaphore> =
            sync.signal.iter().map(|s| s.handle()).collect();

        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&buffers)
            .signal_semaphores(&signal_semaphores);

        // SAFETY: the buffer was ended by end_commands and the fence is reset
        // by the caller before every submission.
        unsafe { self.device.submit_graphics(&[submit_info], fence.handle()) }
    }

    fn create_binding_pool(
        &self,
        max_tables: u32,
        ratios: &[PoolSizeRatio],
    ) -> RhiResult<DescriptorPool> {
        DescriptorPool::new(Arc::clone(self.device()), max_tables, ratios)
    }

    fn allocate_binding_table(
        &self,
        pool: &mut DescriptorPool,
        layout: &vk::DescriptorSetLayout,
    ) -> RhiResult<vk::DescriptorSet> {
        pool.allocate(*layout)
    }

    fn reset_binding_pool(&self, pool: &mut DescriptorPool) -> RhiResult<()> {
        pool.reset()
    }

    fn create_timestamp_pool(&self, count: u32) -> RhiResult<Option<TimestampPool>> {
        if self.timestamp_bits == 0 {
            info!("Graphics queue cannot write timestamps; device frame time unavailable");
            return Ok(None);
        }
        TimestampPool::new(
            Arc::clone(self.device()),
            count,
            self.gpu.properties.limits.timestamp_period,
            self.timestamp_bits,
        )
        .map(Some)
    }

    fn begin_timestamps(
        &self,
        commands: &mut CommandContext,
        pool: &TimestampPool,
        first: u32,
    ) -> RhiResult<()> {
        let cmd = commands.buffer();
        cmd.reset_queries(pool.handle(), first, 2);
        cmd.write_timestamp(vk::PipelineStageFlags::TOP_OF_PIPE, pool.handle(), first);
        Ok(())
    }

    fn end_timestamps(
        &self,
        commands: &mut CommandContext,
        pool: &TimestampPool,
        first: u32,
    ) -> RhiResult<()> {
        commands.buffer().write_timestamp(
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            pool.handle(),
            first + 1,
        );
        Ok(())
    }

    fn read_timestamps(&self, pool: &TimestampPool, first: u32) -> RhiResult<Option<Duration>> {
        pool.elapsed(first)
    }

    fn wait_idle(&self) -> RhiResult<()> {
        self.device.wait_idle()
    }
}

impl PresentBackend for VulkanBackend {
    type Swapchain = Swapchain;

    fn create_swapchain(&self, extent: vk::Extent2D, image_count: u32) -> RhiResult<Swapchain> {
        Swapchain::new(
            Arc::clone(self.device()),
            &self.swapchain_loader,
            &self.surface,
            extent,
            image_count,
        )
    }

    fn swapchain_extent(&self, chain: &Swapchain) -> vk::Extent2D {
        chain.extent()
    }

    fn swapchain_image_count(&self, chain: &Swapchain) -> u32 {
        chain.image_count()
    }

    fn acquire_image(
        &self,
        chain: &Swapchain,
        signal: &Semaphore,
        timeout: Duration,
    ) -> RhiResult<ImageAcquire> {
        match chain.acquire_next_image(signal.handle(), timeout) {
            Ok((index, suboptimal)) => Ok(ImageAcquire::Ready { index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(ImageAcquire::Stale),
            Err(vk::Result::TIMEOUT | vk::Result::NOT_READY) => Err(RhiError::Timeout {
                what: "swapchain image",
                waited: timeout,
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn present(
        &self,
        chain: &Swapchain,
        index: u32,
        wait: &Semaphore,
    ) -> RhiResult<PresentStatus> {
        match chain.present(index, wait.handle()) {
            Ok(false) => Ok(PresentStatus::Presented),
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentStatus::Stale),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vulkan_backend_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<VulkanBackend>();
    }

    #[test]
    fn test_backend_objects_are_send() {
        fn assert_send<T: Send>() {}
        assert_send::<<VulkanBackend as GpuBackend>::Fence>();
        assert_send::<<VulkanBackend as GpuBackend>::CommandContext>();
        assert_send::<<VulkanBackend as PresentBackend>::Swapchain>();
    }
}
