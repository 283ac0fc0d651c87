// Swapchain - Window presentation
//
// Owns the ring of presentable images together with everything derived from
// it: one view and framebuffer per image, and the shared depth/stencil
// attachment. Rebuilds the whole set when the surface extent changes.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::memory::{self, MemoryBlock};
use super::VulkanDevice;

const SURFACE_FORMAT_PRIORITY: [vk::SurfaceFormatKHR; 2] = [
    vk::SurfaceFormatKHR {
        format: vk::Format::R8G8B8A8_SRGB,
        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
    },
    vk::SurfaceFormatKHR {
        format: vk::Format::B8G8R8A8_SRGB,
        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
    },
];

const PRESENT_MODE_PRIORITY: [vk::PresentModeKHR; 3] = [
    vk::PresentModeKHR::MAILBOX,
    vk::PresentModeKHR::FIFO,
    vk::PresentModeKHR::IMMEDIATE,
];

const COMPOSITE_ALPHA_PRIORITY: [vk::CompositeAlphaFlagsKHR; 4] = [
    vk::CompositeAlphaFlagsKHR::OPAQUE,
    vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED,
    vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED,
    vk::CompositeAlphaFlagsKHR::INHERIT,
];

const DEPTH_FORMAT_PRIORITY: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D24_UNORM_S8_UINT,
    vk::Format::D16_UNORM,
];

/// First priority-list entry supported by the surface, else the surface's
/// first reported pair. Both the format and the color space must match.
pub fn select_surface_format(available: &[vk::SurfaceFormatKHR]) -> vk::SurfaceFormatKHR {
    for candidate in &SURFACE_FORMAT_PRIORITY {
        let supported = available
            .iter()
            .any(|f| f.format == candidate.format && f.color_space == candidate.color_space);
        if supported {
            return *candidate;
        }
    }
    available[0]
}

/// The hint if the surface supports it, else the first supported entry of
/// the priority list. FIFO is the guaranteed fallback.
pub fn select_present_mode(
    available: &[vk::PresentModeKHR],
    hint: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if available.contains(&hint) {
        return hint;
    }
    for mode in PRESENT_MODE_PRIORITY {
        if available.contains(&mode) {
            return mode;
        }
    }
    vk::PresentModeKHR::FIFO
}

/// INHERIT when the surface offers it, otherwise the first supported entry
/// of the priority list. `None` means the surface supports nothing we can
/// use, which is a hard failure at the call site.
pub fn select_composite_alpha(
    supported: vk::CompositeAlphaFlagsKHR,
) -> Option<vk::CompositeAlphaFlagsKHR> {
    if supported.contains(vk::CompositeAlphaFlagsKHR::INHERIT) {
        return Some(vk::CompositeAlphaFlagsKHR::INHERIT);
    }
    COMPOSITE_ALPHA_PRIORITY
        .into_iter()
        .find(|&alpha| supported.contains(alpha))
}

/// One more image than the surface minimum, capped by the maximum when the
/// surface reports one (0 means unbounded).
pub fn select_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let mut count = caps.min_image_count + 1;
    if caps.max_image_count > 0 && count > caps.max_image_count {
        count = caps.max_image_count;
    }
    count
}

pub fn select_array_layers(requested: u32, caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    requested.max(1).min(caps.max_image_array_layers)
}

/// The surface dictates the extent unless it reports the "undefined" width
/// sentinel, in which case the requested size is used verbatim.
pub fn select_extent(caps: &vk::SurfaceCapabilitiesKHR, width: u32, height: u32) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D { width, height }
    }
}

/// First format in the priority list usable as an optimal-tiling
/// depth/stencil attachment. Chosen once at startup; resizes keep it.
pub fn select_depth_format(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<vk::Format> {
    for format in DEPTH_FORMAT_PRIORITY {
        let properties =
            unsafe { instance.get_physical_device_format_properties(physical_device, format) };
        if properties
            .optimal_tiling_features
            .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
        {
            return Ok(format);
        }
    }
    anyhow::bail!("no supported depth/stencil format")
}

fn has_stencil(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

/// Everything tied to one presentable image. Keeping the three handles in a
/// single record keeps their indices aligned by construction.
pub struct SwapchainSlot {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub framebuffer: vk::Framebuffer,
}

/// Depth/stencil attachment shared by every framebuffer. Recreated at the
/// new extent on every resize.
pub struct DepthStencil {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub format: vk::Format,
    memory: MemoryBlock,
}

impl DepthStencil {
    fn create(device: &VulkanDevice, extent: vk::Extent2D, format: vk::Format) -> Result<Self> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT);

        let image = unsafe {
            device.device.create_image(&image_info, None)
                .context("failed to create depth/stencil image")?
        };

        let memory = memory::allocate_and_bind_image(
            device,
            image,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::empty(),
        )?;

        let mut aspect_mask = vk::ImageAspectFlags::DEPTH;
        if has_stencil(format) {
            aspect_mask |= vk::ImageAspectFlags::STENCIL;
        }

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        let view = unsafe {
            device.device.create_image_view(&view_info, None)
                .context("failed to create depth/stencil view")?
        };

        Ok(Self { image, view, format, memory })
    }

    fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_image_view(self.view, None);
            device.destroy_image(self.image, None);
        }
        self.memory.destroy(device);
    }
}

pub struct Swapchain {
    pub handle: vk::SwapchainKHR,
    pub loader: ash::extensions::khr::Swapchain,
    pub slots: Vec<SwapchainSlot>,
    pub surface_format: vk::SurfaceFormatKHR,
    pub extent: vk::Extent2D,
    pub present_mode: vk::PresentModeKHR,
    pub depth: DepthStencil,
    render_pass: vk::RenderPass,
    surface: vk::SurfaceKHR,
    surface_loader: ash::extensions::khr::Surface,
    device: Arc<VulkanDevice>,
}

/// Result of a blocking acquire. Out-of-date is an expected state of the
/// surface, not an error; callers route it into `rebuild`.
pub enum AcquireOutcome {
    Acquired { index: u32, suboptimal: bool },
    OutOfDate,
}

/// Result of queueing a present. A suboptimal present still reached the
/// screen and counts as `Presented`.
pub enum PresentOutcome {
    Presented,
    OutOfDate,
}

impl Swapchain {
    pub fn create(
        device: Arc<VulkanDevice>,
        surface_loader: ash::extensions::khr::Surface,
        surface: vk::SurfaceKHR,
        surface_format: vk::SurfaceFormatKHR,
        depth_format: vk::Format,
        render_pass: vk::RenderPass,
        width: u32,
        height: u32,
        present_mode_hint: vk::PresentModeKHR,
    ) -> Result<Self> {
        let caps = unsafe {
            surface_loader
                .get_physical_device_surface_capabilities(device.physical_device, surface)
        }?;
        let present_modes = unsafe {
            surface_loader
                .get_physical_device_surface_present_modes(device.physical_device, surface)
        }?;

        let extent = select_extent(&caps, width, height);
        let present_mode = select_present_mode(&present_modes, present_mode_hint);
        let composite_alpha = select_composite_alpha(caps.supported_composite_alpha)
            .context("surface supports no usable composite alpha mode")?;
        let image_count = select_image_count(&caps);

        log::info!(
            "Creating swapchain: {}x{}, {:?}, present mode {:?}",
            extent.width, extent.height, surface_format.format, present_mode
        );

        let loader = ash::extensions::khr::Swapchain::new(&device.instance, &device.device);

        let handle = create_swapchain_handle(
            &loader,
            surface,
            &caps,
            surface_format,
            extent,
            present_mode,
            composite_alpha,
            image_count,
            vk::SwapchainKHR::null(),
        )?;

        let depth = DepthStencil::create(&device, extent, depth_format)?;
        let slots = create_slots(
            &device,
            &loader,
            handle,
            surface_format.format,
            depth.view,
            render_pass,
            extent,
        )?;

        log::info!("Swapchain ready with {} images", slots.len());

        Ok(Self {
            handle,
            loader,
            slots,
            surface_format,
            extent,
            present_mode,
            depth,
            render_pass,
            surface,
            surface_loader,
            device,
        })
    }

    /// Rebuild everything derived from the surface at a new extent.
    ///
    /// Returns `false` without touching the device when `(width, height)`
    /// matches the stored extent. The color format is fixed for the life of
    /// the swapchain; present mode and image count follow whatever the
    /// surface currently supports. Callers must reset the command pool and
    /// re-record per-slot command buffers after a `true` return.
    pub fn rebuild(&mut self, width: u32, height: u32) -> Result<bool> {
        if width == self.extent.width && height == self.extent.height {
            return Ok(false);
        }
        self.extent = vk::Extent2D { width, height };

        log::info!("Rebuilding swapchain: {}x{}", width, height);

        self.device.wait_idle()?;

        let caps = unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(self.device.physical_device, self.surface)
        }?;
        let present_modes = unsafe {
            self.surface_loader
                .get_physical_device_surface_present_modes(self.device.physical_device, self.surface)
        }?;

        self.present_mode = select_present_mode(&present_modes, self.present_mode);
        let composite_alpha = select_composite_alpha(caps.supported_composite_alpha)
            .context("surface supports no usable composite alpha mode")?;
        let image_count = select_image_count(&caps);

        // The previous handle rides along as the "old swapchain" so the
        // presentation engine can hand over outstanding images.
        let new_handle = create_swapchain_handle(
            &self.loader,
            self.surface,
            &caps,
            self.surface_format,
            self.extent,
            self.present_mode,
            composite_alpha,
            image_count,
            self.handle,
        )?;

        // Old views, then the old swapchain, then the old framebuffers. The
        // images themselves belong to the presentation engine and are never
        // destroyed here.
        unsafe {
            for slot in &self.slots {
                self.device.device.destroy_image_view(slot.view, None);
            }
            self.loader.destroy_swapchain(self.handle, None);
            for slot in &self.slots {
                self.device.device.destroy_framebuffer(slot.framebuffer, None);
            }
        }
        self.handle = new_handle;

        let depth_format = self.depth.format;
        self.depth.destroy(&self.device.device);
        self.depth = DepthStencil::create(&self.device, self.extent, depth_format)?;

        self.slots = create_slots(
            &self.device,
            &self.loader,
            self.handle,
            self.surface_format.format,
            self.depth.view,
            self.render_pass,
            self.extent,
        )?;

        log::info!("Swapchain rebuilt with {} images", self.slots.len());
        Ok(true)
    }

    pub fn image_count(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Block until the presentation engine hands over an image, signaling
    /// `signal` when it is ready for rendering.
    pub fn acquire_next_image(&self, signal: vk::Semaphore) -> Result<AcquireOutcome> {
        let result = unsafe {
            self.loader
                .acquire_next_image(self.handle, u64::MAX, signal, vk::Fence::null())
        };

        match result {
            Ok((index, suboptimal)) => Ok(AcquireOutcome::Acquired { index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(e) => Err(e).context("failed to acquire swapchain image"),
        }
    }

    /// Queue image `image_index` for presentation once `wait` signals.
    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> Result<PresentOutcome> {
        let swapchains = [self.handle];
        let image_indices = [image_index];
        let wait_semaphores = [wait];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe { self.loader.queue_present(queue, &present_info) };

        match result {
            Ok(_) => Ok(PresentOutcome::Presented),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(e) => Err(e).context("failed to present swapchain image"),
        }
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        unsafe {
            for slot in &self.slots {
                self.device.device.destroy_framebuffer(slot.framebuffer, None);
                self.device.device.destroy_image_view(slot.view, None);
            }
        }
        self.depth.destroy(&self.device.device);
        unsafe {
            self.loader.destroy_swapchain(self.handle, None);
        }
    }
}

fn create_swapchain_handle(
    loader: &ash::extensions::khr::Swapchain,
    surface: vk::SurfaceKHR,
    caps: &vk::SurfaceCapabilitiesKHR,
    surface_format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
    present_mode: vk::PresentModeKHR,
    composite_alpha: vk::CompositeAlphaFlagsKHR,
    image_count: u32,
    old_swapchain: vk::SwapchainKHR,
) -> Result<vk::SwapchainKHR> {
    let create_info = vk::SwapchainCreateInfoKHR::builder()
        .surface(surface)
        .min_image_count(image_count)
        .image_format(surface_format.format)
        .image_color_space(surface_format.color_space)
        .image_extent(extent)
        .image_array_layers(select_array_layers(1, caps))
        .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
        .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        .pre_transform(caps.current_transform)
        .composite_alpha(composite_alpha)
        .present_mode(present_mode)
        .clipped(true)
        .old_swapchain(old_swapchain);

    unsafe {
        loader.create_swapchain(&create_info, None)
            .context("failed to create swapchain")
    }
}

fn create_slots(
    device: &VulkanDevice,
    loader: &ash::extensions::khr::Swapchain,
    handle: vk::SwapchainKHR,
    format: vk::Format,
    depth_view: vk::ImageView,
    render_pass: vk::RenderPass,
    extent: vk::Extent2D,
) -> Result<Vec<SwapchainSlot>> {
    let images = unsafe { loader.get_swapchain_images(handle) }?;

    images
        .into_iter()
        .map(|image| {
            let view_info = vk::ImageViewCreateInfo::builder()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(format)
                .components(vk::ComponentMapping {
                    r: vk::ComponentSwizzle::R,
                    g: vk::ComponentSwizzle::G,
                    b: vk::ComponentSwizzle::B,
                    a: vk::ComponentSwizzle::A,
                })
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });

            let view = unsafe {
                device.device.create_image_view(&view_info, None)
                    .context("failed to create swapchain image view")?
            };

            let attachments = [view, depth_view];
            let framebuffer_info = vk::FramebufferCreateInfo::builder()
                .render_pass(render_pass)
                .attachments(&attachments)
                .width(extent.width)
                .height(extent.height)
                .layers(1);

            let framebuffer = unsafe {
                device.device.create_framebuffer(&framebuffer_info, None)
                    .context("failed to create framebuffer")?
            };

            Ok(SwapchainSlot { image, view, framebuffer })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(min_image_count: u32, max_image_count: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count,
            max_image_count,
            ..Default::default()
        }
    }

    fn pair(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR { format, color_space }
    }

    #[test]
    fn rgba_srgb_wins_when_both_candidates_supported() {
        let available = [
            pair(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            pair(vk::Format::R8G8B8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        let chosen = select_surface_format(&available);
        assert_eq!(chosen.format, vk::Format::R8G8B8A8_SRGB);
    }

    #[test]
    fn bgra_srgb_selected_when_rgba_is_missing() {
        let available = [
            pair(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            pair(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        let chosen = select_surface_format(&available);
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_SRGB);
    }

    #[test]
    fn falls_back_to_first_reported_format() {
        let available = [
            pair(vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            pair(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        let chosen = select_surface_format(&available);
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_UNORM);
    }

    #[test]
    fn color_space_mismatch_disqualifies_a_candidate() {
        let available = [pair(
            vk::Format::R8G8B8A8_SRGB,
            vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT,
        )];
        let chosen = select_surface_format(&available);
        assert_eq!(chosen.color_space, vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT);
    }

    #[test]
    fn present_mode_hint_wins_when_available() {
        let available = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE];
        let chosen = select_present_mode(&available, vk::PresentModeKHR::IMMEDIATE);
        assert_eq!(chosen, vk::PresentModeKHR::IMMEDIATE);
    }

    #[test]
    fn unavailable_hint_falls_through_priority_order() {
        let available = [vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::FIFO];
        let chosen = select_present_mode(&available, vk::PresentModeKHR::MAILBOX);
        assert_eq!(chosen, vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn present_mode_defaults_to_fifo() {
        let available = [vk::PresentModeKHR::SHARED_DEMAND_REFRESH];
        let chosen = select_present_mode(&available, vk::PresentModeKHR::MAILBOX);
        assert_eq!(chosen, vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn image_count_is_min_plus_one_clamped_to_max() {
        assert_eq!(select_image_count(&caps(2, 3)), 3);
        assert_eq!(select_image_count(&caps(2, 2)), 2);
        // max of 0 means the surface reports no upper bound
        assert_eq!(select_image_count(&caps(5, 0)), 6);
    }

    #[test]
    fn array_layers_clamp_to_surface_limit() {
        let mut c = caps(2, 3);
        c.max_image_array_layers = 4;
        assert_eq!(select_array_layers(1, &c), 1);
        assert_eq!(select_array_layers(0, &c), 1);
        assert_eq!(select_array_layers(9, &c), 4);
    }

    #[test]
    fn composite_alpha_prefers_inherit() {
        let supported = vk::CompositeAlphaFlagsKHR::OPAQUE | vk::CompositeAlphaFlagsKHR::INHERIT;
        assert_eq!(
            select_composite_alpha(supported),
            Some(vk::CompositeAlphaFlagsKHR::INHERIT)
        );
    }

    #[test]
    fn composite_alpha_falls_through_priority_list() {
        assert_eq!(
            select_composite_alpha(vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED),
            Some(vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED)
        );
        assert_eq!(select_composite_alpha(vk::CompositeAlphaFlagsKHR::empty()), None);
    }

    #[test]
    fn surface_dictated_extent_overrides_request() {
        let mut c = caps(2, 3);
        c.current_extent = vk::Extent2D { width: 1024, height: 768 };
        let extent = select_extent(&c, 800, 600);
        assert_eq!((extent.width, extent.height), (1024, 768));
    }

    #[test]
    fn extent_sentinel_uses_requested_size_verbatim() {
        let mut c = caps(2, 3);
        c.current_extent = vk::Extent2D { width: u32::MAX, height: u32::MAX };
        let extent = select_extent(&c, 800, 600);
        assert_eq!((extent.width, extent.height), (800, 600));
    }
}
