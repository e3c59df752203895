// Copyright (c) 2026 The vk-rtas developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Device-or-host address construction.
//!
//! The `VK_KHR_acceleration_structure` entry points take
//! `VkDeviceOrHostAddress(Const)KHR` unions: a device address for device-side
//! builds, a host pointer for host-side builds. Which member is active is
//! implied by the build type of the operation, never stored. Addresses are
//! produced immediately before the call that consumes them and are not kept
//! around, since a reallocated buffer invalidates them.

use crate::{buffer::BufferWithMemory, device::RayTracingDevice, DeviceSize};
use ash::vk;

/// Device address of `buffer` plus `offset`.
///
/// The buffer must have been created with `SHADER_DEVICE_ADDRESS` usage;
/// this performs one `vkGetBufferDeviceAddress` query.
pub fn device_address(
    device: &RayTracingDevice,
    buffer: &BufferWithMemory,
    offset: DeviceSize,
) -> vk::DeviceOrHostAddressKHR {
    vk::DeviceOrHostAddressKHR {
        device_address: buffer.device_address(device) + offset,
    }
}

/// Const flavor of [`device_address`].
pub fn device_address_const(
    device: &RayTracingDevice,
    buffer: &BufferWithMemory,
    offset: DeviceSize,
) -> vk::DeviceOrHostAddressConstKHR {
    vk::DeviceOrHostAddressConstKHR {
        device_address: buffer.device_address(device) + offset,
    }
}

/// Wraps a host pointer for a host-side build destination.
pub fn host_address(ptr: *mut u8) -> vk::DeviceOrHostAddressKHR {
    vk::DeviceOrHostAddressKHR {
        host_address: ptr.cast(),
    }
}

/// Wraps a host pointer for a host-side build source.
pub fn host_address_const(ptr: *const u8) -> vk::DeviceOrHostAddressConstKHR {
    vk::DeviceOrHostAddressConstKHR {
        host_address: ptr.cast(),
    }
}

/// The null address, used in the descriptors passed to size queries where
/// data addresses are ignored.
pub fn null_address_const() -> vk::DeviceOrHostAddressConstKHR {
    vk::DeviceOrHostAddressConstKHR { device_address: 0 }
}

/// Mutable flavor of [`null_address_const`].
pub fn null_address() -> vk::DeviceOrHostAddressKHR {
    vk::DeviceOrHostAddressKHR { device_address: 0 }
}
