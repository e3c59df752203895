// Copyright (c) 2026 The vk-rtas developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Buffers with dedicated memory allocations.

use crate::{
    device::RayTracingDevice,
    memory::Allocation,
    DeviceAddress, DeviceSize, Error, VulkanError,
};
use ash::vk;

/// A `VkBuffer` bound to its own [`Allocation`].
///
/// Acceleration-structure storage buffers are allocated host-visible and
/// coherent so serialized blobs and instance data can be inspected and patched
/// from the host; `HOST_CACHED` is requested first as an optimization and
/// dropped when the device has no such memory type.
pub struct BufferWithMemory {
    device: ash::Device,
    buffer: vk::Buffer,
    allocation: Allocation,
    size: DeviceSize,
}

impl std::fmt::Debug for BufferWithMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferWithMemory")
            .field("buffer", &self.buffer)
            .field("allocation", &self.allocation)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

impl BufferWithMemory {
    /// Creates a buffer of `size` bytes with `usage` and binds fresh memory
    /// with `memory_properties` to it.
    pub fn new(
        device: &RayTracingDevice,
        size: DeviceSize,
        usage: vk::BufferUsageFlags,
        memory_properties: vk::MemoryPropertyFlags,
    ) -> Result<Self, Error> {
        assert!(size > 0, "buffer size must be nonzero");

        let create_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let fns = device.fns();
        let buffer =
            unsafe { fns.create_buffer(&create_info, None) }.map_err(VulkanError::from)?;
        let requirements = unsafe { fns.get_buffer_memory_requirements(buffer) };
        let device_address = usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS);

        let allocation =
            match Allocation::new(device, requirements, memory_properties, device_address) {
                Ok(allocation) => allocation,
                Err(err) => {
                    unsafe { fns.destroy_buffer(buffer, None) };
                    return Err(err);
                }
            };

        if let Err(err) = unsafe { fns.bind_buffer_memory(buffer, allocation.memory(), 0) } {
            unsafe { fns.destroy_buffer(buffer, None) };
            return Err(VulkanError::from(err).into());
        }

        Ok(Self {
            device: fns.clone(),
            buffer,
            allocation,
            size,
        })
    }

    /// Creates a host-visible, coherent buffer, first trying the host-cached
    /// memory type and silently retrying without it when the allocator turns
    /// the combination down.
    pub fn new_host_cached(
        device: &RayTracingDevice,
        size: DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> Result<Self, Error> {
        let base = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;

        match Self::new(device, size, usage, base | vk::MemoryPropertyFlags::HOST_CACHED) {
            Err(Error::NotSupported(_)) => Self::new(device, size, usage, base),
            result => result,
        }
    }

    /// Creates a host-visible, coherent buffer.
    pub fn new_host(
        device: &RayTracingDevice,
        size: DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> Result<Self, Error> {
        Self::new(
            device,
            size,
            usage,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )
    }

    #[inline]
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Size the buffer was created with (the bound allocation may be larger).
    #[inline]
    pub fn size(&self) -> DeviceSize {
        self.size
    }

    #[inline]
    pub fn allocation(&self) -> &Allocation {
        &self.allocation
    }

    /// Queries the buffer's device address. The buffer must have been created
    /// with `SHADER_DEVICE_ADDRESS` usage.
    ///
    /// Addresses are requeried on every use; they go stale when a buffer is
    /// recreated, so callers never cache them.
    pub fn device_address(&self, device: &RayTracingDevice) -> DeviceAddress {
        debug_assert_eq!(device.handle(), self.device.handle());
        let info = vk::BufferDeviceAddressInfo::default().buffer(self.buffer);
        unsafe { device.fns().get_buffer_device_address(&info) }
    }

    /// Host pointer to byte `offset` of the buffer.
    ///
    /// Panics if the memory is not host-visible or `offset` is out of bounds.
    pub fn host_ptr(&self, offset: DeviceSize) -> *mut u8 {
        assert!(offset < self.size, "offset {} out of bounds", offset);
        unsafe { self.allocation.host_ptr().add(offset as usize) }
    }

    /// Flushes the entire backing allocation.
    pub fn flush(&self) -> Result<(), VulkanError> {
        self.allocation.flush()
    }
}

impl Drop for BufferWithMemory {
    fn drop(&mut self) {
        // The buffer must go before the memory backing it.
        unsafe { self.device.destroy_buffer(self.buffer, None) };
    }
}
