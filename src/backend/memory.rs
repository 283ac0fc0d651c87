// Device memory selection and binding
//
// Every buffer and image gets its backing storage through here. The memory
// type is picked by a required/preferred flag heuristic; binding happens
// exactly once per resource, at offset 0.

use anyhow::{Context, Result};
use ash::vk;
use super::VulkanDevice;

/// One device allocation, owned by the buffer or image it was bound to.
pub struct MemoryBlock {
    pub memory: vk::DeviceMemory,
    pub size: vk::DeviceSize,
    pub type_index: u32,
}

impl MemoryBlock {
    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.free_memory(self.memory, None);
        }
    }
}

/// Pick the cheapest memory type compatible with `type_bits` that carries
/// every `required` flag.
///
/// Cost of a candidate is the number of `preferred` flags it lacks. The
/// first zero-cost candidate wins outright; otherwise the lowest-index
/// minimum-cost candidate is kept.
pub fn pick_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
    preferred: vk::MemoryPropertyFlags,
) -> Option<u32> {
    let mut best = None;
    let mut min_cost = u32::MAX;

    for type_index in 0..memory_properties.memory_type_count {
        if type_bits & (1 << type_index) == 0 {
            continue;
        }

        let flags = memory_properties.memory_types[type_index as usize].property_flags;
        if !flags.contains(required) {
            continue;
        }

        let cost = (preferred & !flags).as_raw().count_ones();
        if cost < min_cost {
            best = Some(type_index);
            if cost == 0 {
                break;
            }
            min_cost = cost;
        }
    }

    best
}

/// Allocate `size` bytes for a buffer and bind them at offset 0.
///
/// The underlying API allows a single bind per resource; callers must not
/// route the same buffer through here twice.
pub fn allocate_and_bind_buffer(
    device: &VulkanDevice,
    buffer: vk::Buffer,
    size: vk::DeviceSize,
    required: vk::MemoryPropertyFlags,
    preferred: vk::MemoryPropertyFlags,
) -> Result<MemoryBlock> {
    let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

    let type_index = pick_memory_type(
        &device.memory_properties,
        requirements.memory_type_bits,
        required,
        preferred,
    )
    .context("no compatible memory type for buffer")?;

    let alloc_info = vk::MemoryAllocateInfo::builder()
        .allocation_size(size)
        .memory_type_index(type_index);

    let memory = unsafe {
        device.device.allocate_memory(&alloc_info, None)
            .context("failed to allocate buffer memory")?
    };

    unsafe {
        device.device.bind_buffer_memory(buffer, memory, 0)
            .context("failed to bind buffer memory")?;
    }

    Ok(MemoryBlock { memory, size, type_index })
}

/// Allocate backing storage for an image and bind it at offset 0.
pub fn allocate_and_bind_image(
    device: &VulkanDevice,
    image: vk::Image,
    required: vk::MemoryPropertyFlags,
    preferred: vk::MemoryPropertyFlags,
) -> Result<MemoryBlock> {
    let requirements = unsafe { device.device.get_image_memory_requirements(image) };

    let type_index = pick_memory_type(
        &device.memory_properties,
        requirements.memory_type_bits,
        required,
        preferred,
    )
    .context("no compatible memory type for image")?;

    let alloc_info = vk::MemoryAllocateInfo::builder()
        .allocation_size(requirements.size)
        .memory_type_index(type_index);

    let memory = unsafe {
        device.device.allocate_memory(&alloc_info, None)
            .context("failed to allocate image memory")?
    };

    unsafe {
        device.device.bind_image_memory(image, memory, 0)
            .context("failed to bind image memory")?;
    }

    Ok(MemoryBlock { memory, size: requirements.size, type_index })
}

/// Copy `data` into a host-visible block via map/copy/unmap.
pub fn upload<T: Copy>(
    device: &VulkanDevice,
    block: &MemoryBlock,
    offset: vk::DeviceSize,
    data: &[T],
) -> Result<()> {
    let size = std::mem::size_of_val(data) as vk::DeviceSize;

    unsafe {
        let ptr = device.device.map_memory(block.memory, offset, size, vk::MemoryMapFlags::empty())
            .context("failed to map memory for upload")? as *mut T;

        ptr.copy_from_nonoverlapping(data.as_ptr(), data.len());
        device.device.unmap_memory(block.memory);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_properties(flags: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut properties = vk::PhysicalDeviceMemoryProperties::default();
        properties.memory_type_count = flags.len() as u32;
        for (i, &f) in flags.iter().enumerate() {
            properties.memory_types[i].property_flags = f;
        }
        properties
    }

    #[test]
    fn zero_cost_type_beats_cheaper_index() {
        // Type 1 satisfies required but lacks the preferred flag (cost 1);
        // type 2 carries both (cost 0) and must win despite the higher index.
        let properties = memory_properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ]);

        let picked = pick_memory_type(
            &properties,
            0b0110,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        );
        assert_eq!(picked, Some(2));
    }

    #[test]
    fn required_flags_must_be_superset() {
        let properties = memory_properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
        ]);

        let picked = pick_memory_type(
            &properties,
            0b11,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            vk::MemoryPropertyFlags::empty(),
        );
        assert_eq!(picked, None);
    }

    #[test]
    fn lowest_index_wins_ties() {
        let flags = vk::MemoryPropertyFlags::HOST_VISIBLE;
        let properties = memory_properties(&[flags, flags, flags]);

        let picked = pick_memory_type(
            &properties,
            0b111,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        );
        assert_eq!(picked, Some(0));
    }

    #[test]
    fn type_bitmask_excludes_candidates() {
        let flags = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::DEVICE_LOCAL;
        let properties = memory_properties(&[flags, flags]);

        let picked = pick_memory_type(
            &properties,
            0b10,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::MemoryPropertyFlags::empty(),
        );
        assert_eq!(picked, Some(1));
    }

    #[test]
    fn preferred_absence_count_orders_candidates() {
        let properties = memory_properties(&[
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        ]);

        // Neither type reaches cost 0; type 1 misses one preferred flag,
        // type 0 misses two.
        let picked = pick_memory_type(
            &properties,
            0b11,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::MemoryPropertyFlags::HOST_COHERENT | vk::MemoryPropertyFlags::HOST_CACHED,
        );
        assert_eq!(picked, Some(1));
    }

    #[test]
    fn no_eligible_type_yields_none() {
        let properties = memory_properties(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);

        let picked = pick_memory_type(
            &properties,
            0b0,
            vk::MemoryPropertyFlags::empty(),
            vk::MemoryPropertyFlags::empty(),
        );
        assert_eq!(picked, None);
    }
}
