// Copyright (c) 2026 The vk-rtas developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Command recording and submission helpers.

use crate::{device::RayTracingDevice, VulkanError};
use ash::vk;

/// A command pool on the framework's queue family, with a one-shot
/// record-submit-wait helper.
///
/// All recording and submission in this crate is single-threaded; the context
/// hands out one command buffer at a time.
pub struct CommandContext {
    device: ash::Device,
    pool: vk::CommandPool,
    queue: vk::Queue,
}

impl std::fmt::Debug for CommandContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandContext")
            .field("pool", &self.pool)
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

impl CommandContext {
    pub fn new(device: &RayTracingDevice) -> Result<Self, VulkanError> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT)
            .queue_family_index(device.queue_family_index());
        let pool = unsafe { device.fns().create_command_pool(&create_info, None) }
            .map_err(VulkanError::from)?;

        Ok(Self {
            device: device.fns().clone(),
            pool,
            queue: device.queue(),
        })
    }

    /// Records commands through `record` into a fresh primary command buffer,
    /// submits it to the queue, and blocks until execution completes.
    pub fn one_shot(
        &self,
        record: impl FnOnce(vk::CommandBuffer) -> Result<(), VulkanError>,
    ) -> Result<(), VulkanError> {
        let allocate_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cmd = unsafe { self.device.allocate_command_buffers(&allocate_info) }
            .map_err(VulkanError::from)?[0];

        let result = self.record_and_submit(cmd, record);
        unsafe { self.device.free_command_buffers(self.pool, &[cmd]) };
        result
    }

    fn record_and_submit(
        &self,
        cmd: vk::CommandBuffer,
        record: impl FnOnce(vk::CommandBuffer) -> Result<(), VulkanError>,
    ) -> Result<(), VulkanError> {
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.begin_command_buffer(cmd, &begin_info) }
            .map_err(VulkanError::from)?;
        record(cmd)?;
        unsafe { self.device.end_command_buffer(cmd) }.map_err(VulkanError::from)?;

        let fence = unsafe {
            self.device
                .create_fence(&vk::FenceCreateInfo::default(), None)
        }
        .map_err(VulkanError::from)?;

        let buffers = [cmd];
        let submit_info = vk::SubmitInfo::default().command_buffers(&buffers);
        let result = unsafe { self.device.queue_submit(self.queue, &[submit_info], fence) }
            .map_err(VulkanError::from)
            .and_then(|()| {
                unsafe { self.device.wait_for_fences(&[fence], true, u64::MAX) }
                    .map_err(VulkanError::from)
            });
        unsafe { self.device.destroy_fence(fence, None) };
        result
    }
}

impl Drop for CommandContext {
    fn drop(&mut self) {
        unsafe { self.device.destroy_command_pool(self.pool, None) };
    }
}

/// Records the barrier that orders an acceleration-structure build, copy or
/// deserialize against any later consumer of the structure: AS write/read
/// access at the AS-build stage, made visible to all subsequent commands.
pub fn cmd_acceleration_structure_barrier(device: &RayTracingDevice, cmd: vk::CommandBuffer) {
    let access = vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR
        | vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR;
    let barrier = vk::MemoryBarrier::default()
        .src_access_mask(access)
        .dst_access_mask(access);

    unsafe {
        device.fns().cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::DependencyFlags::empty(),
            &[barrier],
            &[],
            &[],
        )
    };
}
