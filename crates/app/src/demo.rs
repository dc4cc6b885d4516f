//! Windowed clear-screen demo on Vulkan.
//!
//! Every frame clears the acquired image to a color cycling through a
//! palette, and binds that frame's globals through a binding table from the
//! slot's pool. Per-frame buffers ride the slot's deletion queue; the
//! palette and the table layout live in the process-wide queue.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec4};
use tracing::{debug, info};

use vkpipe_core::RendererConfig;
use vkpipe_platform::Window;
use vkpipe_renderer::upload::upload_buffer;
use vkpipe_renderer::{FrameOutcome, GpuContext};
use vkpipe_rhi::buffer::{Buffer, BufferUsage};
use vkpipe_rhi::descriptor::{DescriptorLayoutBuilder, DescriptorWriter};
use vkpipe_rhi::vulkan::VulkanBackend;
use vkpipe_rhi::{PresentStatus, vk};

/// Seconds spent fading from one palette entry to the next.
const FADE_SECONDS: f32 = 2.0;

const PALETTE: [Vec4; 4] = [
    Vec4::new(0.05, 0.05, 0.12, 1.0),
    Vec4::new(0.10, 0.25, 0.45, 1.0),
    Vec4::new(0.45, 0.15, 0.30, 1.0),
    Vec4::new(0.10, 0.35, 0.20, 1.0),
];

/// Per-frame values exposed at binding 0.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct FrameGlobals {
    clear_color: Vec4,
    resolution: Vec2,
    time: f32,
    frame: u32,
}

pub struct Demo {
    context: GpuContext<VulkanBackend>,
    layout: vk::DescriptorSetLayout,
    palette: vk::Buffer,
    palette_size: vk::DeviceSize,
    start: Instant,
}

impl Demo {
    pub fn new(window: &Window, config: &RendererConfig) -> Result<Self> {
        let backend = Arc::new(
            VulkanBackend::new(window, &config.presentation.title, config.debug.validation)
                .context("bringing up Vulkan")?,
        );
        let device = Arc::clone(backend.device());

        let (width, height) = window.size();
        let mut context = GpuContext::new(backend, config, vk::Extent2D { width, height })
            .context("creating the frame pipeline")?;

        let layout = DescriptorLayoutBuilder::new()
            .add_binding(0, vk::DescriptorType::UNIFORM_BUFFER)
            .add_binding(1, vk::DescriptorType::STORAGE_BUFFER)
            .build(Arc::clone(&device), vk::ShaderStageFlags::ALL)?;
        let layout_handle = layout.handle();
        context.deletion_queue().push_drop(layout);

        let palette = upload_buffer(
            context.immediate(),
            &device,
            BufferUsage::Storage,
            bytemuck::cast_slice(&PALETTE),
        )
        .context("uploading the palette")?;
        let (palette_handle, palette_size) = (palette.handle(), palette.size());
        context.deletion_queue().push_drop(palette);

        info!(
            "Demo ready: {}x{}, {} palette entries",
            width,
            height,
            PALETTE.len()
        );

        Ok(Self {
            context,
            layout: layout_handle,
            palette: palette_handle,
            palette_size,
            start: Instant::now(),
        })
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        self.context.resize(vk::Extent2D { width, height });
    }

    /// Clear and present one frame. Paused and stale frames are skipped.
    pub fn render_frame(&mut self) -> Result<()> {
        let time = self.start.elapsed().as_secs_f32();
        let device = Arc::clone(self.context.backend().device());

        let mut frame = match self.context.begin_frame()? {
            FrameOutcome::Ready(frame) => frame,
            FrameOutcome::Skipped => return Ok(()),
        };

        let index = frame.image_index()?;
        let image = frame
            .presentation()
            .swapchain()
            .and_then(|chain| chain.image(index))
            .context("acquired image is not in the chain")?;
        let extent = frame.extent();

        let globals = FrameGlobals {
            clear_color: palette_color(time),
            resolution: Vec2::new(extent.width as f32, extent.height as f32),
            time,
            frame: frame.frame_number() as u32,
        };
        let staging = Buffer::new_with_data(
            Arc::clone(&device),
            BufferUsage::Staging,
            bytemuck::bytes_of(&globals),
        )?;
        let uniform = Buffer::new(Arc::clone(&device), BufferUsage::Uniform, staging.size())?;

        let color = vk::ClearColorValue {
            float32: globals.clear_color.to_array(),
        };
        frame.record(|commands| {
            let cmd = commands.buffer();
            let region = vk::BufferCopy::default().size(staging.size());
            cmd.copy_buffer(staging.handle(), uniform.handle(), &[region]);
            cmd.transition_color_image(
                image,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            );
            cmd.clear_color_image(image, vk::ImageLayout::TRANSFER_DST_OPTIMAL, &color);
            cmd.transition_color_image(
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::PRESENT_SRC_KHR,
            );
        });

        let set = frame.binding_pool().allocate(&self.layout)?;
        DescriptorWriter::new()
            .write_buffer(
                0,
                uniform.handle(),
                uniform.size(),
                0,
                vk::DescriptorType::UNIFORM_BUFFER,
            )
            .write_buffer(
                1,
                self.palette,
                self.palette_size,
                0,
                vk::DescriptorType::STORAGE_BUFFER,
            )
            .update_set(&device, set);

        // Released once this slot's fence proves the copy has run
        frame.deletion_queue().push_drop(staging);
        frame.deletion_queue().push_drop(uniform);

        if GpuContext::end_frame(frame)? == PresentStatus::Stale {
            debug!("Chain rebuilt after present");
        }
        Ok(())
    }
}

/// Clear color at `time` seconds, fading linearly around the palette.
fn palette_color(time: f32) -> Vec4 {
    let position = time / FADE_SECONDS;
    let from = position.floor() as usize % PALETTE.len();
    let to = (from + 1) % PALETTE.len();
    PALETTE[from].lerp(PALETTE[to], position.fract())
}
