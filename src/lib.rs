// Copyright (c) 2026 The vk-rtas developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Lifecycle management for Vulkan ray-tracing acceleration structures.
//!
//! This crate provides the object model used to exercise the
//! `VK_KHR_acceleration_structure` and `VK_KHR_deferred_host_operations`
//! extensions across many feature combinations:
//!
//! - [`GeometryData`](geometry::GeometryData) describes one piece of triangle
//!   or AABB geometry in any of the vertex formats the extension accepts.
//! - [`BottomLevelAccelerationStructure`] and [`TopLevelAccelerationStructure`]
//!   own the buffers and backend handle of one structure and expose its whole
//!   lifecycle: `create`, `build`, `copy_from` (clone or compact),
//!   `serialize` and `deserialize`.
//! - [`SerialStorage`] holds the portable serialized form of a structure,
//!   including recursive sub-storages for the bottom-level structures a
//!   top-level structure references.
//! - [`BottomLevelAccelerationStructurePool`] batches many bottom-level
//!   structures into a few shared buffers with packed offsets.
//! - [`deferred`] drives the join/poll protocol of deferred host operations,
//!   optionally from multiple worker threads.
//!
//! Builds can run on the device (commands recorded and submitted through a
//! short-lived [`CommandContext`](command::CommandContext)) or on the host
//! (synchronously or through a deferred operation); every operation supports
//! both paths.
//!
//! # Error model
//!
//! Recoverable failures are either [`VulkanError`] (an error code reported by
//! the implementation) or [`NotSupportedError`] (a capability the current
//! device does not have; callers normally skip rather than fail). Misuse of
//! the API itself, such as handing a structure a triangle list whose length is
//! not a multiple of three, panics.

use std::{error::Error as StdError, fmt};

#[cfg(test)]
#[macro_use]
pub mod tests;

pub mod acceleration_structure;
pub mod address;
pub mod buffer;
pub mod command;
pub mod deferred;
pub mod device;
pub mod geometry;
pub mod memory;
pub mod query;

pub use acceleration_structure::{
    identity_transform, AccelerationStructureBuildType, BottomLevelAccelerationStructure,
    BottomLevelAccelerationStructurePool, IndirectBuildParameters, InstanceData, SerialInfo,
    SerialStorage, TopLevelAccelerationStructure,
};
pub use ash::vk::{DeviceAddress, DeviceSize};

/// An error code reported by the Vulkan implementation.
///
/// Only codes that the entry points used by this crate are allowed to return
/// are named; anything else lands in [`VulkanError::Unnamed`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VulkanError {
    OutOfHostMemory,
    OutOfDeviceMemory,
    InitializationFailed,
    DeviceLost,
    MemoryMapFailed,
    InvalidOpaqueCaptureAddress,
    Unnamed(ash::vk::Result),
}

impl From<ash::vk::Result> for VulkanError {
    fn from(result: ash::vk::Result) -> Self {
        match result {
            ash::vk::Result::ERROR_OUT_OF_HOST_MEMORY => VulkanError::OutOfHostMemory,
            ash::vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => VulkanError::OutOfDeviceMemory,
            ash::vk::Result::ERROR_INITIALIZATION_FAILED => VulkanError::InitializationFailed,
            ash::vk::Result::ERROR_DEVICE_LOST => VulkanError::DeviceLost,
            ash::vk::Result::ERROR_MEMORY_MAP_FAILED => VulkanError::MemoryMapFailed,
            ash::vk::Result::ERROR_INVALID_OPAQUE_CAPTURE_ADDRESS => {
                VulkanError::InvalidOpaqueCaptureAddress
            }
            result => VulkanError::Unnamed(result),
        }
    }
}

impl StdError for VulkanError {}

impl fmt::Display for VulkanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VulkanError::OutOfHostMemory => write!(f, "a host memory allocation has failed"),
            VulkanError::OutOfDeviceMemory => write!(f, "a device memory allocation has failed"),
            VulkanError::InitializationFailed => {
                write!(f, "initialization of an object could not be completed")
            }
            VulkanError::DeviceLost => write!(f, "the logical or physical device has been lost"),
            VulkanError::MemoryMapFailed => write!(f, "mapping of a memory object has failed"),
            VulkanError::InvalidOpaqueCaptureAddress => {
                write!(f, "the requested opaque capture address is not available")
            }
            VulkanError::Unnamed(result) => {
                write!(f, "unnamed error, VkResult value {}", result.as_raw())
            }
        }
    }
}

/// The device lacks a capability this operation needs.
///
/// This is an environment condition, not a failure: tests normally report
/// "not supported" and exit early when they see it. The one case this crate
/// handles internally is host-cached memory, which is retried without the
/// cached hint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NotSupportedError {
    pub reason: &'static str,
}

impl StdError for NotSupportedError {}

impl fmt::Display for NotSupportedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "not supported: {}", self.reason)
    }
}

/// Error type returned by the fallible operations of this crate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Error {
    Vulkan(VulkanError),
    NotSupported(NotSupportedError),
}

impl From<VulkanError> for Error {
    fn from(err: VulkanError) -> Self {
        Error::Vulkan(err)
    }
}

impl From<NotSupportedError> for Error {
    fn from(err: NotSupportedError) -> Self {
        Error::NotSupported(err)
    }
}

impl From<ash::vk::Result> for Error {
    fn from(result: ash::vk::Result) -> Self {
        Error::Vulkan(VulkanError::from(result))
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Vulkan(err) => Some(err),
            Error::NotSupported(err) => Some(err),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Vulkan(err) => write!(f, "{}", err),
            Error::NotSupported(err) => write!(f, "{}", err),
        }
    }
}

pub(crate) fn align_up(value: DeviceSize, alignment: DeviceSize) -> DeviceSize {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod lib_tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_next_multiple() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(8, 8), 8);
        assert_eq!(align_up(9, 8), 16);
        assert_eq!(align_up(255, 256), 256);
        assert_eq!(align_up(257, 256), 512);
    }

    #[test]
    fn vulkan_error_from_result() {
        assert_eq!(
            VulkanError::from(ash::vk::Result::ERROR_OUT_OF_HOST_MEMORY),
            VulkanError::OutOfHostMemory
        );
        assert_eq!(
            VulkanError::from(ash::vk::Result::TIMEOUT),
            VulkanError::Unnamed(ash::vk::Result::TIMEOUT)
        );
    }
}
