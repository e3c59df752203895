// Copyright (c) 2026 The vk-rtas developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Device-level entry points used by the acceleration-structure framework.

use ash::vk;

/// The Vulkan device plus the extension function tables this crate calls into.
///
/// The wrapper does not own the underlying `VkDevice`; the test harness that
/// created the device is responsible for destroying it after every object
/// created from this wrapper has been dropped. The device must have been
/// created with the `VK_KHR_acceleration_structure` and
/// `VK_KHR_deferred_host_operations` extensions enabled and a Vulkan 1.2 (or
/// `VK_KHR_buffer_device_address`) feature set.
pub struct RayTracingDevice {
    device: ash::Device,
    acceleration_structure_fns: ash::khr::acceleration_structure::Device,
    deferred_operation_fns: ash::khr::deferred_host_operations::Device,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    queue_family_index: u32,
    queue: vk::Queue,
}

impl RayTracingDevice {
    /// Wraps an existing device and its queue.
    ///
    /// `queue` must belong to `queue_family_index` on `device`, and the queue
    /// family must support compute operations (acceleration-structure build
    /// commands require it).
    pub fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
        queue_family_index: u32,
        queue: vk::Queue,
    ) -> Self {
        let acceleration_structure_fns =
            ash::khr::acceleration_structure::Device::new(instance, &device);
        let deferred_operation_fns =
            ash::khr::deferred_host_operations::Device::new(instance, &device);
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        Self {
            device,
            acceleration_structure_fns,
            deferred_operation_fns,
            memory_properties,
            queue_family_index,
            queue,
        }
    }

    #[inline]
    pub fn handle(&self) -> vk::Device {
        self.device.handle()
    }

    #[inline]
    pub fn fns(&self) -> &ash::Device {
        &self.device
    }

    #[inline]
    pub fn acceleration_structure_fns(&self) -> &ash::khr::acceleration_structure::Device {
        &self.acceleration_structure_fns
    }

    #[inline]
    pub fn deferred_operation_fns(&self) -> &ash::khr::deferred_host_operations::Device {
        &self.deferred_operation_fns
    }

    #[inline]
    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    #[inline]
    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    #[inline]
    pub fn queue(&self) -> vk::Queue {
        self.queue
    }
}

impl std::fmt::Debug for RayTracingDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RayTracingDevice")
            .field("handle", &self.device.handle())
            .field("queue_family_index", &self.queue_family_index)
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}
