// prism - a small Vulkan renderer
//
// Draws one colored triangle to a resizable window. The parts worth reading
// live in `backend`: swapchain lifecycle, the two-semaphore frame loop, and
// memory-type selection. This file owns every handle and runs the loop.
//
// FRAME FLOW:
// 1. Poll surface capabilities; rebuild the swapchain on an extent change
// 2. Wait for the device to go idle (single frame outstanding)
// 3. Acquire the next swapchain image
// 4. Submit the pre-recorded commands for that image
// 5. Present, then handle staleness reported by either step

mod backend;
mod config;

use anyhow::{Context, Result};
use ash::vk;
use backend::buffer;
use backend::memory::MemoryBlock;
use backend::pipeline::{self, Vertex};
use backend::shader;
use backend::swapchain::{self, AcquireOutcome, PresentOutcome};
use backend::sync::FrameSync;
use backend::{Swapchain, VulkanDevice};
use config::Config;
use glam::{Mat4, Vec3, Vec4};
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Window, WindowAttributes},
};

const VERTICES: [Vertex; 3] = [
    Vertex { position: [1.0, -1.0], color: [1.0, 0.0, 0.0] },
    Vertex { position: [1.0, 1.0], color: [0.0, 1.0, 0.0] },
    Vertex { position: [-1.0, 1.0], color: [0.0, 0.0, 1.0] },
];

/// Uniform block consumed by the vertex shader, std140-compatible.
#[repr(C)]
#[derive(Clone, Copy)]
struct SceneUniforms {
    projection: Mat4,
    model: Mat4,
    view_pos: Vec4,
}

fn scene_uniforms(extent: vk::Extent2D) -> SceneUniforms {
    let zoom = -2.5f32;
    let aspect = extent.width as f32 / extent.height.max(1) as f32;

    let view = Mat4::from_translation(Vec3::new(0.5, 0.5, zoom));
    let model = view * Mat4::from_rotation_z(180f32.to_radians());

    SceneUniforms {
        projection: Mat4::perspective_rh(60f32.to_radians(), aspect, 0.001, 256.0),
        model,
        view_pos: Vec4::new(0.0, 0.0, -zoom, 0.0),
    }
}

fn main() -> Result<()> {
    let config = Config::load();

    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    log::info!(
        "Starting {} ({}x{})",
        config.window.title, config.window.width, config.window.height
    );

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    Ok(())
}

/// Command state for one swapchain slot. Indices match slot indices.
struct FrameResources {
    command_buffer: vk::CommandBuffer,
    recorded: bool,
}

/// Owner of every Vulkan handle in the process.
///
/// Teardown runs explicitly in Drop, in reverse order of acquisition, so a
/// failed startup or a fatal frame error still unwinds cleanly.
pub struct App {
    config: Config,

    // Window & surface
    window: Option<Arc<Window>>,
    surface: vk::SurfaceKHR,
    surface_loader: Option<ash::extensions::khr::Surface>,

    // Vulkan core
    device: Option<Arc<VulkanDevice>>,
    swapchain: Option<Swapchain>,
    render_pass: vk::RenderPass,

    // Pipeline & descriptors
    descriptor_set_layout: vk::DescriptorSetLayout,
    pipeline_layout: vk::PipelineLayout,
    pipeline_cache: vk::PipelineCache,
    pipeline: vk::Pipeline,
    descriptor_pool: vk::DescriptorPool,
    descriptor_set: vk::DescriptorSet,

    // Geometry & uniforms
    vertex_buffer: vk::Buffer,
    vertex_memory: Option<MemoryBlock>,
    uniform_buffer: vk::Buffer,
    uniform_memory: Option<MemoryBlock>,

    // Commands & synchronization
    command_pool: vk::CommandPool,
    frames: Vec<FrameResources>,
    sync: Option<FrameSync>,
    wait_stages: [vk::PipelineStageFlags; 1],

    is_minimized: bool,

    // FPS tracking
    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl App {
    pub fn new(config: Config) -> Self {
        let now = Instant::now();
        Self {
            config,
            window: None,
            surface: vk::SurfaceKHR::null(),
            surface_loader: None,
            device: None,
            swapchain: None,
            render_pass: vk::RenderPass::null(),
            descriptor_set_layout: vk::DescriptorSetLayout::null(),
            pipeline_layout: vk::PipelineLayout::null(),
            pipeline_cache: vk::PipelineCache::null(),
            pipeline: vk::Pipeline::null(),
            descriptor_pool: vk::DescriptorPool::null(),
            descriptor_set: vk::DescriptorSet::null(),
            vertex_buffer: vk::Buffer::null(),
            vertex_memory: None,
            uniform_buffer: vk::Buffer::null(),
            uniform_memory: None,
            command_pool: vk::CommandPool::null(),
            frames: Vec::new(),
            sync: None,
            wait_stages: [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT],
            is_minimized: false,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    // =========================================================================
    // INITIALIZATION
    // =========================================================================

    fn init_vulkan(&mut self, window: Arc<Window>) -> Result<()> {
        log::info!("Initializing Vulkan...");

        let enable_validation = cfg!(debug_assertions) && self.config.debug.validation_layers;
        let (device, surface_loader, surface) =
            VulkanDevice::new(&self.config.window.title, enable_validation, &window)?;

        // Stored up front so Drop can release them if a later step fails
        self.surface = surface;
        self.surface_loader = Some(surface_loader.clone());
        self.device = Some(device.clone());

        // Formats are fixed for the life of the process; only the extent
        // and derived resources change on resize
        let formats = unsafe {
            surface_loader.get_physical_device_surface_formats(device.physical_device, surface)
        }?;
        let surface_format = swapchain::select_surface_format(&formats);
        let depth_format = swapchain::select_depth_format(&device.instance, device.physical_device)?;

        let render_pass =
            pipeline::create_render_pass(&device, surface_format.format, depth_format)?;
        self.render_pass = render_pass;

        let size = window.inner_size();
        let swapchain = Swapchain::create(
            device.clone(),
            surface_loader,
            surface,
            surface_format,
            depth_format,
            render_pass,
            size.width,
            size.height,
            self.config.present_mode_hint(),
        )?;
        let extent = swapchain.extent;
        let image_count = swapchain.image_count();
        self.swapchain = Some(swapchain);

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.graphics_queue_family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        self.command_pool = unsafe { device.device.create_command_pool(&pool_info, None)? };
        self.allocate_frames(image_count)?;

        self.sync = Some(FrameSync::new(&device)?);

        let (vertex_buffer, vertex_memory) =
            buffer::create_buffer_with_data(&device, vk::BufferUsageFlags::VERTEX_BUFFER, &VERTICES)?;
        self.vertex_buffer = vertex_buffer;
        self.vertex_memory = Some(vertex_memory);

        let uniforms = scene_uniforms(extent);
        let (uniform_buffer, uniform_memory) = buffer::create_buffer_with_data(
            &device,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            std::slice::from_ref(&uniforms),
        )?;
        self.uniform_buffer = uniform_buffer;
        self.uniform_memory = Some(uniform_memory);

        self.descriptor_set_layout = pipeline::create_descriptor_set_layout(&device)?;
        self.pipeline_layout = pipeline::create_pipeline_layout(&device, self.descriptor_set_layout)?;

        let cache_info = vk::PipelineCacheCreateInfo::builder();
        self.pipeline_cache = unsafe { device.device.create_pipeline_cache(&cache_info, None)? };

        let compiler = shaderc::Compiler::new().context("failed to initialize shader compiler")?;
        let vert_spirv = shader::compile_glsl(
            &compiler,
            include_str!("../shaders/triangle.vert"),
            "triangle.vert",
            vk::ShaderStageFlags::VERTEX,
            "main",
        )?;
        let frag_spirv = shader::compile_glsl(
            &compiler,
            include_str!("../shaders/triangle.frag"),
            "triangle.frag",
            vk::ShaderStageFlags::FRAGMENT,
            "main",
        )?;
        let vert_module = shader::create_shader_module(&device, &vert_spirv)?;
        let frag_module = shader::create_shader_module(&device, &frag_spirv)?;

        let pipeline_result = pipeline::create_graphics_pipeline(
            &device,
            render_pass,
            self.pipeline_layout,
            self.pipeline_cache,
            vert_module,
            frag_module,
        );

        // Modules are baked into the pipeline either way
        unsafe {
            device.device.destroy_shader_module(vert_module, None);
            device.device.destroy_shader_module(frag_module, None);
        }
        self.pipeline = pipeline_result?;

        let (descriptor_pool, descriptor_set) =
            pipeline::create_descriptor_set(&device, self.descriptor_set_layout, uniform_buffer)?;
        self.descriptor_pool = descriptor_pool;
        self.descriptor_set = descriptor_set;

        self.record_command_buffers()?;

        log::info!("Vulkan initialized");
        Ok(())
    }

    /// Allocate one primary command buffer per swapchain slot.
    fn allocate_frames(&mut self, image_count: u32) -> Result<()> {
        let device = self.device.as_ref().context("device not initialized")?;

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(image_count);

        let buffers = unsafe { device.device.allocate_command_buffers(&alloc_info)? };
        self.frames = buffers
            .into_iter()
            .map(|command_buffer| FrameResources { command_buffer, recorded: false })
            .collect();

        Ok(())
    }

    // =========================================================================
    // COMMAND RECORDING
    // =========================================================================

    /// Record the static draw into every slot's command buffer. Runs at
    /// startup and again after each swapchain rebuild.
    fn record_command_buffers(&mut self) -> Result<()> {
        let device = self.device.as_ref().context("device not initialized")?;
        let swapchain = self.swapchain.as_ref().context("swapchain not initialized")?;

        anyhow::ensure!(
            self.frames.len() == swapchain.slots.len(),
            "command buffer count {} does not match swapchain image count {}",
            self.frames.len(),
            swapchain.slots.len()
        );

        let extent = swapchain.extent;
        let clear_values = [
            vk::ClearValue {
                color: vk::ClearColorValue { float32: self.config.graphics.clear_color },
            },
            // reversed depth: cleared to 0.0, GREATER wins
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue { depth: 0.0, stencil: 0 },
            },
        ];

        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D { offset: vk::Offset2D { x: 0, y: 0 }, extent };

        for (frame, slot) in self.frames.iter_mut().zip(&swapchain.slots) {
            let cmd = frame.command_buffer;

            unsafe {
                device.device.begin_command_buffer(cmd, &vk::CommandBufferBeginInfo::builder())?;

                let render_pass_begin = vk::RenderPassBeginInfo::builder()
                    .render_pass(self.render_pass)
                    .framebuffer(slot.framebuffer)
                    .render_area(scissor)
                    .clear_values(&clear_values);

                device.device.cmd_begin_render_pass(
                    cmd,
                    &render_pass_begin,
                    vk::SubpassContents::INLINE,
                );

                device.device.cmd_set_viewport(cmd, 0, &[viewport]);
                device.device.cmd_set_scissor(cmd, 0, &[scissor]);

                device.device.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    self.pipeline_layout,
                    0,
                    &[self.descriptor_set],
                    &[],
                );
                device.device.cmd_bind_pipeline(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    self.pipeline,
                );
                device.device.cmd_bind_vertex_buffers(cmd, 0, &[self.vertex_buffer], &[0]);
                device.device.cmd_draw(cmd, VERTICES.len() as u32, 1, 0, 0);

                device.device.cmd_end_render_pass(cmd);
                device.device.end_command_buffer(cmd)?;
            }

            frame.recorded = true;
        }

        Ok(())
    }

    // =========================================================================
    // RESIZE
    // =========================================================================

    /// Route every staleness signal through the swapchain rebuild, then
    /// refresh the per-slot command buffers when anything actually changed.
    fn rebuild_swapchain(&mut self, width: u32, height: u32) -> Result<()> {
        let rebuilt = self
            .swapchain
            .as_mut()
            .context("swapchain not initialized")?
            .rebuild(width, height)?;
        if !rebuilt {
            return Ok(());
        }

        {
            let device = self.device.as_ref().context("device not initialized")?;
            unsafe {
                device.device.reset_command_pool(
                    self.command_pool,
                    vk::CommandPoolResetFlags::empty(),
                )
                .context("failed to reset command pool")?;
            }
        }

        // The image count only moves when the surface's own limits changed
        let image_count = self
            .swapchain
            .as_ref()
            .context("swapchain not initialized")?
            .image_count();
        if image_count as usize != self.frames.len() {
            let device = self.device.as_ref().context("device not initialized")?.clone();
            let old: Vec<_> = self.frames.iter().map(|f| f.command_buffer).collect();
            unsafe {
                device.device.free_command_buffers(self.command_pool, &old);
            }
            self.allocate_frames(image_count)?;
        } else {
            for frame in &mut self.frames {
                frame.recorded = false;
            }
        }

        self.record_command_buffers()
    }

    // =========================================================================
    // RENDER LOOP
    // =========================================================================

    /// One tick: poll extent, acquire, submit, present. Returns false when
    /// nothing reached the screen this tick.
    pub fn render_frame(&mut self) -> Result<bool> {
        if self.is_minimized || self.swapchain.is_none() {
            return Ok(false);
        }

        // Resize is detected by polling the surface each tick, not from
        // window events
        let caps = {
            let device = self.device.as_ref().context("device not initialized")?;
            let surface_loader = self
                .surface_loader
                .as_ref()
                .context("surface not initialized")?;
            unsafe {
                surface_loader.get_physical_device_surface_capabilities(
                    device.physical_device,
                    self.surface,
                )
            }?
        };
        let stored = self.swapchain.as_ref().context("swapchain not initialized")?.extent;
        if caps.current_extent.width != u32::MAX
            && (caps.current_extent.width != stored.width
                || caps.current_extent.height != stored.height)
        {
            if caps.current_extent.width == 0 || caps.current_extent.height == 0 {
                // zero-area surface, nothing to present to
                return Ok(false);
            }
            self.rebuild_swapchain(caps.current_extent.width, caps.current_extent.height)?;
        }

        let device = self.device.as_ref().context("device not initialized")?.clone();

        // Single frame outstanding: serialize against all previous GPU work
        // before touching the semaphores again
        device.wait_idle()?;

        let (image_acquired, render_complete) = {
            let sync = self.sync.as_ref().context("sync primitives not initialized")?;
            (sync.image_acquired, sync.render_complete)
        };

        let outcome = self
            .swapchain
            .as_ref()
            .context("swapchain not initialized")?
            .acquire_next_image(image_acquired)?;
        let image_index = match outcome {
            AcquireOutcome::Acquired { index, suboptimal } => {
                if suboptimal {
                    log::debug!("acquired suboptimal swapchain image {}", index);
                }
                index
            }
            AcquireOutcome::OutOfDate => {
                let extent = self.swapchain.as_ref().context("swapchain not initialized")?.extent;
                self.rebuild_swapchain(extent.width, extent.height)?;
                return Ok(false);
            }
        };

        let frame = self
            .frames
            .get(image_index as usize)
            .with_context(|| format!("acquired image index {} out of range", image_index))?;
        anyhow::ensure!(
            frame.recorded,
            "command buffer for image {} was never recorded",
            image_index
        );

        let command_buffers = [frame.command_buffer];
        let wait_semaphores = [image_acquired];
        let signal_semaphores = [render_complete];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&self.wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            device.device.queue_submit(
                device.graphics_queue,
                &[submit_info.build()],
                vk::Fence::null(),
            )
            .context("failed to submit frame commands")?;
        }

        let outcome = self
            .swapchain
            .as_ref()
            .context("swapchain not initialized")?
            .present(device.graphics_queue, image_index, render_complete)?;

        if let PresentOutcome::OutOfDate = outcome {
            let extent = self.swapchain.as_ref().context("swapchain not initialized")?.extent;
            self.rebuild_swapchain(extent.width, extent.height)?;
        }

        Ok(true)
    }

    // =========================================================================
    // FPS TRACKING
    // =========================================================================

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        // Update title every second
        if now.duration_since(self.last_fps_update).as_secs_f32() >= 1.0 {
            let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
            let fps = self.frame_count as f32 / elapsed;

            if let Some(ref window) = self.window {
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms)",
                    self.config.window.title,
                    fps,
                    frame_time * 1000.0
                ));
            }

            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        if let Err(e) = self.init_vulkan(window.clone()) {
            log::error!("Failed to initialize Vulkan: {:?}", e);
            event_loop.exit();
            return;
        }

        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                if let Some(ref device) = self.device {
                    let _ = device.wait_idle();
                }
                event_loop.exit();
            }

            // Extent changes are picked up by polling the surface; the
            // event only tracks minimization
            WindowEvent::Resized(size) => {
                self.is_minimized = size.width == 0 || size.height == 0;
            }

            WindowEvent::RedrawRequested => match self.render_frame() {
                Ok(rendered) => {
                    if rendered {
                        self.update_fps();
                    }
                }
                Err(e) => {
                    log::error!("Render error: {:?}", e);
                    event_loop.exit();
                }
            },

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() {
                    if let PhysicalKey::Code(KeyCode::Escape) = event.physical_key {
                        log::info!("ESC pressed, exiting...");
                        event_loop.exit();
                    }
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}

// =============================================================================
// CLEANUP
// =============================================================================

impl Drop for App {
    fn drop(&mut self) {
        log::info!("Cleaning up Vulkan resources...");

        let Some(device) = self.device.clone() else {
            return;
        };
        let _ = device.wait_idle();

        if let Some(sync) = self.sync.take() {
            sync.destroy(&device.device);
        }

        unsafe {
            if self.pipeline != vk::Pipeline::null() {
                device.device.destroy_pipeline(self.pipeline, None);
            }
            if self.pipeline_cache != vk::PipelineCache::null() {
                device.device.destroy_pipeline_cache(self.pipeline_cache, None);
            }
            if self.pipeline_layout != vk::PipelineLayout::null() {
                device.device.destroy_pipeline_layout(self.pipeline_layout, None);
            }
            // Destroying the pool releases the set allocated from it
            if self.descriptor_pool != vk::DescriptorPool::null() {
                device.device.destroy_descriptor_pool(self.descriptor_pool, None);
            }
            if self.descriptor_set_layout != vk::DescriptorSetLayout::null() {
                device.device.destroy_descriptor_set_layout(self.descriptor_set_layout, None);
            }

            if self.uniform_buffer != vk::Buffer::null() {
                device.device.destroy_buffer(self.uniform_buffer, None);
            }
            if let Some(block) = self.uniform_memory.take() {
                block.destroy(&device.device);
            }
            if self.vertex_buffer != vk::Buffer::null() {
                device.device.destroy_buffer(self.vertex_buffer, None);
            }
            if let Some(block) = self.vertex_memory.take() {
                block.destroy(&device.device);
            }

            // Frees the per-slot command buffers with it
            if self.command_pool != vk::CommandPool::null() {
                device.device.destroy_command_pool(self.command_pool, None);
            }
        }
        self.frames.clear();

        // Swapchain resources go before the surface they were built on
        self.swapchain = None;

        unsafe {
            if self.render_pass != vk::RenderPass::null() {
                device.device.destroy_render_pass(self.render_pass, None);
            }
            if let Some(ref surface_loader) = self.surface_loader {
                if self.surface != vk::SurfaceKHR::null() {
                    surface_loader.destroy_surface(self.surface, None);
                }
            }
        }

        // Device and instance go last
        self.device = None;

        log::info!("Cleanup complete");
    }
}
