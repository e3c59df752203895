// Copyright (c) 2026 The vk-rtas developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Device-memory selection and allocation.
//!
//! Every buffer in this crate gets a dedicated `VkDeviceMemory` allocation.
//! The framework creates few, large buffers (the pool exists precisely to keep
//! the count down), so suballocation machinery would buy nothing here.

use crate::{device::RayTracingDevice, DeviceSize, NotSupportedError, VulkanError};
use ash::vk;

/// Picks the first memory type that is allowed by `type_bits` and has all of
/// `required` property flags, mirroring the selection order the Vulkan spec
/// recommends.
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..memory_properties.memory_type_count).find(|&index| {
        let supported = type_bits & (1 << index) != 0;
        let flags = memory_properties.memory_types[index as usize].property_flags;
        supported && flags.contains(required)
    })
}

/// A dedicated device-memory allocation, mapped for the whole of its lifetime
/// when host-visible.
pub struct Allocation {
    device: ash::Device,
    memory: vk::DeviceMemory,
    size: DeviceSize,
    mapped: *mut std::ffi::c_void,
}

impl std::fmt::Debug for Allocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocation")
            .field("memory", &self.memory)
            .field("size", &self.size)
            .field("mapped", &self.mapped)
            .finish_non_exhaustive()
    }
}

// The mapped pointer aliases device memory owned by this allocation only.
unsafe impl Send for Allocation {}
unsafe impl Sync for Allocation {}

impl Allocation {
    /// Allocates `size` bytes from a memory type matching `type_bits` and
    /// `properties`, and maps it when `properties` contains `HOST_VISIBLE`.
    ///
    /// `device_address` must be set when the memory will back a buffer created
    /// with `SHADER_DEVICE_ADDRESS` usage.
    ///
    /// Returns [`NotSupportedError`] when no memory type matches; callers that
    /// asked for `HOST_CACHED` as an optimization retry without it.
    pub fn new(
        device: &RayTracingDevice,
        requirements: vk::MemoryRequirements,
        properties: vk::MemoryPropertyFlags,
        device_address: bool,
    ) -> Result<Self, crate::Error> {
        let memory_type_index = find_memory_type(
            device.memory_properties(),
            requirements.memory_type_bits,
            properties,
        )
        .ok_or(NotSupportedError {
            reason: "no memory type with the requested properties",
        })?;

        let mut flags_info = vk::MemoryAllocateFlagsInfo::default()
            .flags(vk::MemoryAllocateFlags::DEVICE_ADDRESS);
        let mut allocate_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);
        if device_address {
            allocate_info = allocate_info.push_next(&mut flags_info);
        }

        let fns = device.fns();
        let memory = unsafe { fns.allocate_memory(&allocate_info, None) }
            .map_err(VulkanError::from)?;

        let mapped = if properties.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            match unsafe {
                fns.map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
            } {
                Ok(ptr) => ptr,
                Err(err) => {
                    unsafe { fns.free_memory(memory, None) };
                    return Err(VulkanError::from(err).into());
                }
            }
        } else {
            std::ptr::null_mut()
        };

        Ok(Self {
            device: fns.clone(),
            memory,
            size: requirements.size,
            mapped,
        })
    }

    #[inline]
    pub fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    #[inline]
    pub fn size(&self) -> DeviceSize {
        self.size
    }

    /// Host pointer to the start of the allocation.
    ///
    /// Panics if the allocation is not host-visible.
    #[inline]
    pub fn host_ptr(&self) -> *mut u8 {
        assert!(!self.mapped.is_null(), "allocation is not host-visible");
        self.mapped.cast()
    }

    /// Flushes the whole allocation.
    ///
    /// Partial flushes would have to honor `nonCoherentAtomSize`, which this
    /// crate does not track; the full range is always valid.
    pub fn flush(&self) -> Result<(), VulkanError> {
        let range = vk::MappedMemoryRange::default()
            .memory(self.memory)
            .offset(0)
            .size(vk::WHOLE_SIZE);
        unsafe { self.device.flush_mapped_memory_ranges(&[range]) }.map_err(VulkanError::from)
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        unsafe {
            if !self.mapped.is_null() {
                self.device.unmap_memory(self.memory);
            }
            self.device.free_memory(self.memory, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn properties(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties::default();
        props.memory_type_count = types.len() as u32;
        for (index, &flags) in types.iter().enumerate() {
            props.memory_types[index].property_flags = flags;
        }
        props
    }

    const HV: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::HOST_VISIBLE;
    const HC: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::HOST_COHERENT;
    const CACHED: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::HOST_CACHED;
    const DL: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::DEVICE_LOCAL;

    #[test]
    fn selects_first_matching_type() {
        let props = properties(&[DL, HV | HC, HV | HC | CACHED]);

        assert_eq!(find_memory_type(&props, 0b111, HV | HC), Some(1));
        assert_eq!(
            find_memory_type(&props, 0b111, HV | HC | CACHED),
            Some(2)
        );
        assert_eq!(find_memory_type(&props, 0b111, DL), Some(0));
    }

    #[test]
    fn respects_type_bits() {
        let props = properties(&[HV | HC, HV | HC]);

        assert_eq!(find_memory_type(&props, 0b10, HV), Some(1));
        assert_eq!(find_memory_type(&props, 0b01, HV), Some(0));
    }

    #[test]
    fn reports_missing_type() {
        let props = properties(&[DL, HV | HC]);

        assert_eq!(find_memory_type(&props, 0b11, CACHED), None);
        assert_eq!(find_memory_type(&props, 0b00, HV), None);
    }
}
