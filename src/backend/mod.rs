// Backend module - Vulkan abstraction layer
//
// Thin wrappers around ash: device/queue setup, swapchain lifecycle,
// memory-type selection, and the mechanical pipeline configuration.

pub mod buffer;
pub mod device;
pub mod memory;
pub mod pipeline;
pub mod shader;
pub mod swapchain;
pub mod sync;

pub use device::VulkanDevice;
pub use swapchain::Swapchain;
