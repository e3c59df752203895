// Copyright (c) 2026 The vk-rtas developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Size queries against built acceleration structures.
//!
//! Compacted and serialization sizes can only be learned from the
//! implementation after a build. On the device timeline that takes a query
//! pool round trip; on the host timeline it is a direct synchronous call.

use crate::{
    acceleration_structure::AccelerationStructureBuildType, command::CommandContext,
    device::RayTracingDevice, VulkanError,
};
use ash::vk;

/// Queries one property for each of `structures`, in order.
///
/// `query_type` must be `ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR` or
/// `ACCELERATION_STRUCTURE_SERIALIZATION_SIZE_KHR`. Every structure must
/// have been built before the call.
pub fn query_acceleration_structure_sizes(
    device: &RayTracingDevice,
    context: &CommandContext,
    build_type: AccelerationStructureBuildType,
    structures: &[vk::AccelerationStructureKHR],
    query_type: vk::QueryType,
) -> Result<Vec<vk::DeviceSize>, VulkanError> {
    match build_type {
        AccelerationStructureBuildType::Device => {
            query_sizes_device(device, context, structures, query_type)
        }
        AccelerationStructureBuildType::Host => query_sizes_host(device, structures, query_type),
    }
}

fn query_sizes_device(
    device: &RayTracingDevice,
    context: &CommandContext,
    structures: &[vk::AccelerationStructureKHR],
    query_type: vk::QueryType,
) -> Result<Vec<vk::DeviceSize>, VulkanError> {
    let query_count = structures.len() as u32;
    let create_info = vk::QueryPoolCreateInfo::default()
        .query_type(query_type)
        .query_count(query_count);

    let query_pool = unsafe { device.fns().create_query_pool(&create_info, None) }
        .map_err(VulkanError::from)?;

    let submit_result = context.one_shot(|command_buffer| {
        unsafe {
            device
                .fns()
                .cmd_reset_query_pool(command_buffer, query_pool, 0, query_count);
            device
                .acceleration_structure_fns()
                .cmd_write_acceleration_structures_properties(
                    command_buffer,
                    structures,
                    query_type,
                    query_pool,
                    0,
                );
        }
        Ok(())
    });

    let results = submit_result.and_then(|()| {
        let mut sizes = vec![0 as vk::DeviceSize; structures.len()];
        unsafe {
            device.fns().get_query_pool_results(
                query_pool,
                0,
                &mut sizes,
                vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WAIT,
            )
        }
        .map_err(VulkanError::from)?;
        Ok(sizes)
    });

    unsafe { device.fns().destroy_query_pool(query_pool, None) };

    results
}

fn query_sizes_host(
    device: &RayTracingDevice,
    structures: &[vk::AccelerationStructureKHR],
    query_type: vk::QueryType,
) -> Result<Vec<vk::DeviceSize>, VulkanError> {
    let stride = std::mem::size_of::<vk::DeviceSize>();
    let mut sizes = vec![0 as vk::DeviceSize; structures.len()];

    unsafe {
        device
            .acceleration_structure_fns()
            .write_acceleration_structures_properties(
                structures,
                query_type,
                bytemuck::cast_slice_mut(&mut sizes),
                stride,
            )
    }
    .map_err(VulkanError::from)?;

    Ok(sizes)
}
