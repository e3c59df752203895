// Copyright (c) 2026 The vk-rtas developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Bottom-level and top-level acceleration structures.
//!
//! Both structure kinds share one lifecycle: `create` queries (or accepts)
//! the required sizes and allocates backing storage, `build` populates the
//! structure from geometry or instances, and `copy_from`, `serialize` and
//! `deserialize` move already-built contents between structures and portable
//! byte blobs. Every populate operation dispatches on the build type: device
//! builds record commands and end with a barrier, host builds call the host
//! entry point directly or through a deferred operation.

use crate::{
    buffer::BufferWithMemory,
    deferred::{self, DeferredOperation},
    device::RayTracingDevice,
    VulkanError,
};
use ash::vk;
use std::sync::Arc;

mod bottom_level;
mod pool;
mod serial;
mod top_level;

pub use bottom_level::{BottomLevelAccelerationStructure, IndirectBuildParameters};
pub use pool::BottomLevelAccelerationStructurePool;
pub use serial::{SerialInfo, SerialStorage};
pub use top_level::{identity_transform, InstanceData, TopLevelAccelerationStructure};

/// Which timeline a structure is built on.
///
/// The build type decides where buffers must live, how addresses are formed
/// (device addresses vs. host pointers) and which entry points the populate
/// operations use.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccelerationStructureBuildType {
    /// Builds run on the device timeline via recorded commands.
    Device,
    /// Builds run synchronously on the host, optionally deferred.
    Host,
}

impl AccelerationStructureBuildType {
    pub fn to_vk(self) -> vk::AccelerationStructureBuildTypeKHR {
        match self {
            Self::Device => vk::AccelerationStructureBuildTypeKHR::DEVICE,
            Self::Host => vk::AccelerationStructureBuildTypeKHR::HOST,
        }
    }
}

/// How a host-side populate operation should be finished.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum HostDispatch {
    /// Call the entry point with a null deferred operation.
    Direct,
    /// Run through a deferred operation, finished by this many worker
    /// threads (0 = single-threaded on the calling thread).
    Deferred { worker_thread_count: u32 },
}

/// Runs one deferrable host entry point and drives it to completion.
///
/// `call` receives the deferred-operation handle to pass to the entry point
/// (null for a direct dispatch) and returns the raw status code. The allowed
/// codes form a closed set; anything outside it that is not a plain error
/// code is a contract violation and panics.
pub(crate) fn run_host_operation(
    device: &RayTracingDevice,
    dispatch: HostDispatch,
    call: impl FnOnce(vk::DeferredOperationKHR) -> vk::Result,
) -> Result<(), VulkanError> {
    match dispatch {
        HostDispatch::Direct => match call(vk::DeferredOperationKHR::null()) {
            vk::Result::SUCCESS => Ok(()),
            error => Err(VulkanError::from(error)),
        },
        HostDispatch::Deferred {
            worker_thread_count,
        } => {
            let operation = DeferredOperation::new(device)?;
            let status = call(operation.handle());

            match status {
                vk::Result::SUCCESS
                | vk::Result::OPERATION_DEFERRED_KHR
                | vk::Result::OPERATION_NOT_DEFERRED_KHR => deferred::finish(
                    &operation,
                    worker_thread_count,
                    status == vk::Result::OPERATION_NOT_DEFERRED_KHR,
                ),
                error if error.as_raw() < 0 => Err(VulkanError::from(error)),
                other => panic!(
                    "unexpected result from deferrable host operation: {:?}",
                    other
                ),
            }
        }
    }
}

/// Collapses an `ash` result back into the raw status code, so deferral
/// statuses and errors can be told apart in one place.
pub(crate) fn raw_status(result: Result<(), vk::Result>) -> vk::Result {
    match result {
        Ok(()) => vk::Result::SUCCESS,
        Err(code) => code,
    }
}

/// Buffer sizes a structure needs before its backend handle can exist.
///
/// A zero size means the structure has no use for that buffer kind (host
/// builds keep vertex data in host memory, copies need no scratch).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferRequirements {
    pub structure_size: vk::DeviceSize,
    pub scratch_size: vk::DeviceSize,
    pub vertex_size: vk::DeviceSize,
    pub index_size: vk::DeviceSize,
}

/// Where a structure's buffers come from.
///
/// A freestanding structure owns private buffers created during `create`; a
/// pooled structure reads offsets into buffers shared across the whole pool.
/// This is the only behavior that differs between the two, so it is injected
/// at construction instead of baked into separate structure types.
pub(crate) trait BufferSource: std::fmt::Debug + Send + Sync {
    /// Creates or checks the backing buffers for `requirements`.
    fn provision(
        &mut self,
        device: &RayTracingDevice,
        requirements: &BufferRequirements,
    ) -> Result<(), crate::Error>;

    fn structure_buffer(&self) -> (&BufferWithMemory, vk::DeviceSize);

    fn scratch_buffer(&self) -> Option<(&BufferWithMemory, vk::DeviceSize)>;

    fn vertex_buffer(&self) -> Option<(&BufferWithMemory, vk::DeviceSize)>;

    fn index_buffer(&self) -> Option<(&BufferWithMemory, vk::DeviceSize)>;
}

/// Privately owned buffers, created on demand during `provision`.
#[derive(Debug, Default)]
pub(crate) struct OwnedBufferSource {
    structure: Option<BufferWithMemory>,
    scratch: Option<BufferWithMemory>,
    vertex: Option<BufferWithMemory>,
    index: Option<BufferWithMemory>,
}

impl BufferSource for OwnedBufferSource {
    fn provision(
        &mut self,
        device: &RayTracingDevice,
        requirements: &BufferRequirements,
    ) -> Result<(), crate::Error> {
        assert!(requirements.structure_size > 0);

        self.structure = Some(BufferWithMemory::new_host_cached(
            device,
            requirements.structure_size,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        )?);

        if requirements.scratch_size > 0 {
            self.scratch = Some(BufferWithMemory::new_host(
                device,
                requirements.scratch_size,
                vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            )?);
        }

        if requirements.vertex_size > 0 {
            self.vertex = Some(BufferWithMemory::new_host(
                device,
                requirements.vertex_size,
                vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            )?);
        }

        if requirements.index_size > 0 {
            self.index = Some(BufferWithMemory::new_host(
                device,
                requirements.index_size,
                vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            )?);
        }

        Ok(())
    }

    fn structure_buffer(&self) -> (&BufferWithMemory, vk::DeviceSize) {
        let buffer = self
            .structure
            .as_ref()
            .expect("structure buffer is not provisioned, create the structure first");
        (buffer, 0)
    }

    fn scratch_buffer(&self) -> Option<(&BufferWithMemory, vk::DeviceSize)> {
        self.scratch.as_ref().map(|buffer| (buffer, 0))
    }

    fn vertex_buffer(&self) -> Option<(&BufferWithMemory, vk::DeviceSize)> {
        self.vertex.as_ref().map(|buffer| (buffer, 0))
    }

    fn index_buffer(&self) -> Option<(&BufferWithMemory, vk::DeviceSize)> {
        self.index.as_ref().map(|buffer| (buffer, 0))
    }
}

/// Sub-regions of a pool's shared buffers, assigned during `batch_create`.
#[derive(Debug)]
pub(crate) struct PoolBufferSource {
    pub structure: (Arc<BufferWithMemory>, vk::DeviceSize),
    pub scratch: Option<(Arc<BufferWithMemory>, vk::DeviceSize)>,
    pub vertex: Option<(Arc<BufferWithMemory>, vk::DeviceSize)>,
    pub index: Option<(Arc<BufferWithMemory>, vk::DeviceSize)>,
}

impl BufferSource for PoolBufferSource {
    fn provision(
        &mut self,
        _device: &RayTracingDevice,
        requirements: &BufferRequirements,
    ) -> Result<(), crate::Error> {
        // The pool already created the shared buffers; just check the
        // assigned regions cover what the structure needs.
        let (buffer, offset) = &self.structure;
        assert!(offset + requirements.structure_size <= buffer.size());
        assert!(requirements.scratch_size == 0 || self.scratch.is_some());
        assert!(requirements.vertex_size == 0 || self.vertex.is_some());
        assert!(requirements.index_size == 0 || self.index.is_some());
        Ok(())
    }

    fn structure_buffer(&self) -> (&BufferWithMemory, vk::DeviceSize) {
        (&self.structure.0, self.structure.1)
    }

    fn scratch_buffer(&self) -> Option<(&BufferWithMemory, vk::DeviceSize)> {
        self.scratch.as_ref().map(|(buffer, offset)| (&**buffer, *offset))
    }

    fn vertex_buffer(&self) -> Option<(&BufferWithMemory, vk::DeviceSize)> {
        self.vertex.as_ref().map(|(buffer, offset)| (&**buffer, *offset))
    }

    fn index_buffer(&self) -> Option<(&BufferWithMemory, vk::DeviceSize)> {
        self.index.as_ref().map(|(buffer, offset)| (&**buffer, *offset))
    }
}
