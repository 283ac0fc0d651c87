// Synchronization primitives
//
// Two semaphores order the acquire -> submit -> present chain. The loop
// keeps a single frame outstanding, so one pair is reused every tick.

use ash::vk;
use anyhow::Result;
use std::sync::Arc;
use super::VulkanDevice;

pub struct FrameSync {
    /// Signaled by the presentation engine when the acquired image is ours.
    pub image_acquired: vk::Semaphore,
    /// Signaled by the graphics queue when rendering finished; presentation
    /// waits on it.
    pub render_complete: vk::Semaphore,
}

impl FrameSync {
    pub fn new(device: &Arc<VulkanDevice>) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();

        unsafe {
            Ok(Self {
                image_acquired: device.device.create_semaphore(&semaphore_info, None)?,
                render_complete: device.device.create_semaphore(&semaphore_info, None)?,
            })
        }
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_semaphore(self.image_acquired, None);
            device.destroy_semaphore(self.render_complete, None);
        }
    }
}
