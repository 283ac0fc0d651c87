// Buffer utilities for vertex and uniform data
//
// Buffer handles are created here; their backing storage goes through the
// memory-type selection in `memory`.

use anyhow::{Context, Result};
use ash::vk;
use super::memory::{self, MemoryBlock};
use super::VulkanDevice;

pub fn create_buffer(
    device: &VulkanDevice,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
) -> Result<vk::Buffer> {
    let buffer_info = vk::BufferCreateInfo::builder()
        .size(size)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    unsafe {
        device.device.create_buffer(&buffer_info, None)
            .context("failed to create buffer")
    }
}

/// Create a buffer, bind host-visible memory (device-local preferred) and
/// copy `data` into it.
pub fn create_buffer_with_data<T: Copy>(
    device: &VulkanDevice,
    usage: vk::BufferUsageFlags,
    data: &[T],
) -> Result<(vk::Buffer, MemoryBlock)> {
    let size = std::mem::size_of_val(data) as vk::DeviceSize;

    let buffer = create_buffer(device, size, usage)?;
    let block = memory::allocate_and_bind_buffer(
        device,
        buffer,
        size,
        vk::MemoryPropertyFlags::HOST_VISIBLE,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
    )?;
    memory::upload(device, &block, 0, data)?;

    Ok((buffer, block))
}
