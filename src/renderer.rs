// =============================================================================
// RENDERER - Owns every Vulkan object and drives one frame at a time
// =============================================================================
//
// FRAME FLOW:
// 1. Acquire a swapchain image (semaphore from the rolling frame slot)
// 2. Wait for the last submission that used that image, reset its fence
// 3. Record the image's command buffer
// 4. Submit, signaling the image's fence
// 5. Present
// 6. Release staging uploads whose copies have finished
//
// =============================================================================

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;
use winit::dpi::PhysicalSize;
use winit::window::Window;

use crate::backend::buffer::{create_static_vertex_buffer, GpuBuffer};
use crate::backend::pipeline::{
    create_framebuffers, create_render_pass, destroy_framebuffers, GraphicsPipeline, Vertex,
};
use crate::backend::shader::ShaderWatcher;
use crate::backend::staging::StagingUploads;
use crate::backend::swapchain::Acquire;
use crate::backend::texture::{checkerboard, Texture};
use crate::backend::{Swapchain, VulkanDevice};
use crate::config::Config;

const TRIANGLE: [Vertex; 3] = [
    Vertex::new(-0.8, 0.8, [255, 0, 0, 255]),
    Vertex::new(0.8, 0.8, [0, 255, 0, 255]),
    Vertex::new(0.0, -0.8, [0, 0, 255, 255]),
];

const TEXTURE_SIZE: u32 = 64;
const TEXTURE_CELL: u32 = 8;

/// All GPU state.
///
/// Resources are destroyed by hand in `Drop`; `swapchain` and `device`
/// are declared last so they go after everything built on them.
pub struct Renderer {
    clear_color: [f32; 4],
    vertex_shader: std::path::PathBuf,
    fragment_shader: std::path::PathBuf,

    render_pass: vk::RenderPass,
    pipeline: GraphicsPipeline,
    framebuffers: Vec<vk::Framebuffer>,

    command_pool: vk::CommandPool,
    /// One per swapchain image, re-recorded every frame
    command_buffers: Vec<vk::CommandBuffer>,

    staging: StagingUploads,
    vertex_buffer: GpuBuffer,
    texture: Texture,

    shader_watcher: Option<ShaderWatcher>,

    /// Rolling index for acquire semaphores
    frame_slot: usize,
    /// Set when the swapchain no longer matches the window
    pub needs_recreate: bool,

    swapchain: Swapchain,
    device: Arc<VulkanDevice>,
}

impl Renderer {
    /// Initialize all Vulkan resources for `window`.
    pub fn new(config: &Config, window: &Window) -> Result<Self> {
        log::info!("Initializing Vulkan...");

        let enable_validation = cfg!(debug_assertions) && config.debug.validation_layers;
        let device = VulkanDevice::new(&config.window.title, window, enable_validation)?;

        let size = window.inner_size();
        let swapchain = Swapchain::new(
            device.clone(),
            config.graphics.min_image_count,
            config.present_mode(),
            size.width,
            size.height,
        )?;

        // Everything below is torn down through Drop once the struct exists,
        // so build it in stages with null handles first.
        let staging = StagingUploads::new(&device)?;
        let mut renderer = Self {
            clear_color: config.graphics.clear_color,
            vertex_shader: config.shaders.vertex.clone(),
            fragment_shader: config.shaders.fragment.clone(),
            render_pass: vk::RenderPass::null(),
            pipeline: GraphicsPipeline::null(),
            framebuffers: Vec::new(),
            command_pool: vk::CommandPool::null(),
            command_buffers: Vec::new(),
            staging,
            vertex_buffer: GpuBuffer::null(),
            texture: Texture::null(),
            shader_watcher: None,
            frame_slot: 0,
            needs_recreate: false,
            swapchain,
            device,
        };
        renderer.init_resources(config)?;

        log::info!("Vulkan initialized successfully!");
        Ok(renderer)
    }

    fn init_resources(&mut self, config: &Config) -> Result<()> {
        let device = self.device.clone();

        self.render_pass = create_render_pass(&device, self.swapchain.format.format)?;
        self.pipeline = GraphicsPipeline::new(
            &device,
            self.render_pass,
            &self.vertex_shader,
            &self.fragment_shader,
        )?;
        self.framebuffers = create_framebuffers(
            &device,
            &self.swapchain.image_views,
            self.render_pass,
            self.swapchain.extent,
        )?;

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        self.command_pool = unsafe { device.device.create_command_pool(&pool_info, None) }
            .context("Failed to create command pool")?;
        self.allocate_command_buffers()?;

        self.vertex_buffer =
            create_static_vertex_buffer(&device, &mut self.staging, bytemuck::cast_slice(&TRIANGLE))?;

        let texels = checkerboard(
            TEXTURE_SIZE,
            TEXTURE_CELL,
            [255, 255, 255, 255],
            [96, 96, 96, 255],
        );
        self.texture = Texture::new(
            &device,
            &mut self.staging,
            self.pipeline.set_layout,
            vk::Extent2D {
                width: TEXTURE_SIZE,
                height: TEXTURE_SIZE,
            },
            &texels,
        )?;

        if config.debug.hot_reload {
            match ShaderWatcher::new(&[&self.vertex_shader, &self.fragment_shader]) {
                Ok(watcher) => self.shader_watcher = Some(watcher),
                Err(e) => log::warn!("Shader hot reload disabled: {:#}", e),
            }
        }

        Ok(())
    }

    fn allocate_command_buffers(&mut self) -> Result<()> {
        let device = &self.device.device;
        if !self.command_buffers.is_empty() {
            unsafe { device.free_command_buffers(self.command_pool, &self.command_buffers) };
            self.command_buffers.clear();
        }

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(self.swapchain.image_count() as u32);
        self.command_buffers = unsafe { device.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate command buffers")?;
        Ok(())
    }

    /// Uploads still waiting on the GPU
    pub fn pending_uploads(&self) -> usize {
        self.staging.in_flight()
    }

    /// Rebuild swapchain, framebuffers and command buffers for `size`.
    fn recreate_swapchain(&mut self, size: PhysicalSize<u32>) -> Result<()> {
        let device = self.device.clone();
        device.wait_idle()?;

        let old_format = self.swapchain.format.format;
        self.swapchain.recreate(size.width, size.height)?;

        destroy_framebuffers(&device, &mut self.framebuffers);

        // A new surface format needs a compatible render pass and pipeline
        if self.swapchain.format.format != old_format {
            log::info!(
                "Surface format changed {:?} -> {:?}",
                old_format,
                self.swapchain.format.format
            );
            let render_pass = create_render_pass(&device, self.swapchain.format.format)?;
            if let Err(e) =
                self.pipeline
                    .reload(&device, render_pass, &self.vertex_shader, &self.fragment_shader)
            {
                unsafe { device.device.destroy_render_pass(render_pass, None) };
                return Err(e);
            }
            unsafe { device.device.destroy_render_pass(self.render_pass, None) };
            self.render_pass = render_pass;
        }

        self.framebuffers = create_framebuffers(
            &device,
            &self.swapchain.image_views,
            self.render_pass,
            self.swapchain.extent,
        )?;
        self.allocate_command_buffers()?;

        self.frame_slot = 0;
        self.needs_recreate = false;
        Ok(())
    }

    fn reload_shaders_if_changed(&mut self) {
        let Some(watcher) = &self.shader_watcher else {
            return;
        };
        if !watcher.changed() {
            return;
        }

        log::info!("Shader change detected, rebuilding pipeline");
        if let Err(e) = self.device.wait_idle() {
            log::error!("Shader reload skipped: {:#}", e);
            return;
        }
        match self.pipeline.reload(
            &self.device,
            self.render_pass,
            &self.vertex_shader,
            &self.fragment_shader,
        ) {
            Ok(()) => log::info!("Pipeline rebuilt"),
            Err(e) => log::error!("Shader reload failed, keeping previous pipeline: {:#}", e),
        }
    }

    /// Render a single frame.
    ///
    /// Returns false when nothing was drawn (minimized window or a swapchain
    /// that has to be rebuilt first).
    pub fn render_frame(&mut self, size: PhysicalSize<u32>) -> Result<bool> {
        if size.width == 0 || size.height == 0 {
            return Ok(false);
        }

        self.reload_shaders_if_changed();

        if self.needs_recreate {
            self.recreate_swapchain(size)?;
        }

        let device = self.device.clone();
        let slot = self.frame_slot % self.swapchain.image_count();
        let image_available = self.swapchain.sync[slot].image_available;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 1: Acquire next swapchain image
        // ─────────────────────────────────────────────────────────────────────
        let image_index = match self.swapchain.acquire_next_image(image_available)? {
            Acquire::Image { index, suboptimal } => {
                if suboptimal {
                    self.needs_recreate = true;
                }
                index
            }
            Acquire::OutOfDate => {
                self.needs_recreate = true;
                return Ok(false);
            }
        };
        let image = image_index as usize;
        let render_finished = self.swapchain.sync[image].render_finished;
        let work_finished = self.swapchain.sync[image].work_finished;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 2: Wait for the previous submission on this image
        // ─────────────────────────────────────────────────────────────────────
        unsafe {
            device
                .device
                .wait_for_fences(&[work_finished], true, u64::MAX)
                .context("Failed to wait for frame fence")?;
            device
                .device
                .reset_fences(&[work_finished])
                .context("Failed to reset frame fence")?;
        }

        // ─────────────────────────────────────────────────────────────────────
        // STEP 3: Record
        // ─────────────────────────────────────────────────────────────────────
        let cmd = self.command_buffers[image];
        self.record_command_buffer(cmd, image)?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 4: Submit
        // ─────────────────────────────────────────────────────────────────────
        let wait_semaphores = [image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semaphores = [render_finished];
        let command_buffers = [cmd];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            device
                .device
                .queue_submit(device.queue, &[submit_info.build()], work_finished)
                .context("Failed to submit frame")?;
        }

        // ─────────────────────────────────────────────────────────────────────
        // STEP 5: Present
        // ─────────────────────────────────────────────────────────────────────
        if self
            .swapchain
            .present(device.queue, image_index, &signal_semaphores)?
        {
            self.needs_recreate = true;
        }

        // ─────────────────────────────────────────────────────────────────────
        // STEP 6: Release finished uploads, advance
        // ─────────────────────────────────────────────────────────────────────
        self.staging.poll(&device)?;

        self.frame_slot = (slot + 1) % self.swapchain.image_count();
        Ok(true)
    }

    fn record_command_buffer(&self, cmd: vk::CommandBuffer, image: usize) -> Result<()> {
        let device = &self.device.device;
        let extent = self.swapchain.extent;

        let clear_values = [vk::ClearValue {
            color: vk::ClearColorValue {
                float32: self.clear_color,
            },
        }];
        let render_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };

        unsafe {
            let begin_info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device
                .begin_command_buffer(cmd, &begin_info)
                .context("Failed to begin command buffer")?;

            let rp_begin_info = vk::RenderPassBeginInfo::builder()
                .render_pass(self.render_pass)
                .framebuffer(self.framebuffers[image])
                .render_area(render_area)
                .clear_values(&clear_values);
            device.cmd_begin_render_pass(cmd, &rp_begin_info, vk::SubpassContents::INLINE);

            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.pipeline.pipeline);

            let viewport = vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: extent.width as f32,
                height: extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            };
            device.cmd_set_viewport(cmd, 0, &[viewport]);
            device.cmd_set_scissor(cmd, 0, &[render_area]);

            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipeline.layout,
                0,
                &[self.texture.descriptor_set],
                &[],
            );
            device.cmd_bind_vertex_buffers(cmd, 0, &[self.vertex_buffer.buffer], &[0]);
            device.cmd_draw(cmd, TRIANGLE.len() as u32, 1, 0, 0);

            device.cmd_end_render_pass(cmd);

            device
                .end_command_buffer(cmd)
                .context("Failed to end command buffer")?;
        }

        Ok(())
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        log::info!("Cleaning up Vulkan resources...");

        let device = self.device.clone();
        if let Err(e) = device.wait_idle() {
            log::error!("{:#}", e);
        }

        // Reverse order of creation
        self.shader_watcher = None;
        self.texture.destroy(&device);
        self.vertex_buffer.destroy(&device);
        self.staging.destroy(&device);

        unsafe {
            if self.command_pool != vk::CommandPool::null() {
                // Also frees the command buffers
                device.device.destroy_command_pool(self.command_pool, None);
            }
        }
        destroy_framebuffers(&device, &mut self.framebuffers);
        self.pipeline.destroy(&device);
        unsafe {
            if self.render_pass != vk::RenderPass::null() {
                device.device.destroy_render_pass(self.render_pass, None);
            }
        }

        // Swapchain, then device, drop with the fields
        log::info!("Cleanup complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn triangle_faces_the_camera() {
        // Counter-clockwise in framebuffer space (y down) is front-facing
        let [a, b, c] = TRIANGLE.map(|v| v.pos);
        let doubled_area = (b - a).perp_dot(c - a);
        assert!(doubled_area < 0.0, "triangle would be culled");
    }

    #[test]
    fn triangle_upload_size() {
        let bytes: &[u8] = bytemuck::cast_slice(&TRIANGLE);
        assert_eq!(bytes.len(), 36);
    }
}
