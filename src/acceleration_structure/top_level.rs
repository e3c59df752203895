// Copyright (c) 2026 The vk-rtas developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Top-level acceleration structures over instanced bottom levels.

use super::{
    raw_status, run_host_operation, AccelerationStructureBuildType,
    BottomLevelAccelerationStructure, HostDispatch, IndirectBuildParameters, SerialStorage,
};
use crate::{
    address, buffer::BufferWithMemory,
    command::{cmd_acceleration_structure_barrier, CommandContext},
    device::RayTracingDevice,
    query::query_acceleration_structure_sizes,
    DeviceAddress, DeviceSize, Error, VulkanError,
};
use ash::vk;
use std::sync::Arc;

/// Per-instance shading parameters, expanded into one
/// `VkAccelerationStructureInstanceKHR` record at build time.
#[derive(Clone, Copy)]
pub struct InstanceData {
    pub transform: vk::TransformMatrixKHR,
    pub custom_index: u32,
    pub mask: u32,
    pub shader_binding_table_record_offset: u32,
    pub flags: vk::GeometryInstanceFlagsKHR,
}

impl Default for InstanceData {
    fn default() -> Self {
        Self {
            transform: identity_transform(),
            custom_index: 0,
            mask: 0xff,
            shader_binding_table_record_offset: 0,
            flags: vk::GeometryInstanceFlagsKHR::empty(),
        }
    }
}

impl std::fmt::Debug for InstanceData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceData")
            .field("transform", &self.transform.matrix)
            .field("custom_index", &self.custom_index)
            .field("mask", &self.mask)
            .field(
                "shader_binding_table_record_offset",
                &self.shader_binding_table_record_offset,
            )
            .field("flags", &self.flags)
            .finish()
    }
}

pub fn identity_transform() -> vk::TransformMatrixKHR {
    vk::TransformMatrixKHR {
        matrix: [
            1.0, 0.0, 0.0, 0.0, //
            0.0, 1.0, 0.0, 0.0, //
            0.0, 0.0, 1.0, 0.0,
        ],
    }
}

const INSTANCE_RECORD_SIZE: DeviceSize =
    std::mem::size_of::<vk::AccelerationStructureInstanceKHR>() as DeviceSize;

/// A top-level acceleration structure, the instance records it builds from,
/// and shared ownership of the bottom levels those records reference.
pub struct TopLevelAccelerationStructure {
    build_type: AccelerationStructureBuildType,
    create_flags: vk::AccelerationStructureCreateFlagsKHR,
    build_flags: vk::BuildAccelerationStructureFlagsKHR,
    create_generic: bool,
    build_without_geometries: bool,
    build_without_primitives: bool,
    inactive_instances: bool,
    deferred_operation: bool,
    worker_thread_count: u32,
    use_array_of_pointers: bool,
    indirect: Option<IndirectBuildParameters>,
    instances: Vec<(Arc<BottomLevelAccelerationStructure>, InstanceData)>,
    structure_size: DeviceSize,
    update_scratch_size: DeviceSize,
    build_scratch_size: DeviceSize,
    structure_buffer: Option<BufferWithMemory>,
    scratch_buffer: Option<BufferWithMemory>,
    host_scratch: Vec<u8>,
    instance_buffer: Option<BufferWithMemory>,
    instance_address_buffer: Option<BufferWithMemory>,
    handle: Option<vk::AccelerationStructureKHR>,
    fns: Option<ash::khr::acceleration_structure::Device>,
}

impl TopLevelAccelerationStructure {
    pub fn new(build_type: AccelerationStructureBuildType) -> Self {
        Self {
            build_type,
            create_flags: vk::AccelerationStructureCreateFlagsKHR::empty(),
            build_flags: vk::BuildAccelerationStructureFlagsKHR::empty(),
            create_generic: false,
            build_without_geometries: false,
            build_without_primitives: false,
            inactive_instances: false,
            deferred_operation: false,
            worker_thread_count: 0,
            use_array_of_pointers: false,
            indirect: None,
            instances: Vec::new(),
            structure_size: 0,
            update_scratch_size: 0,
            build_scratch_size: 0,
            structure_buffer: None,
            scratch_buffer: None,
            host_scratch: Vec::new(),
            instance_buffer: None,
            instance_address_buffer: None,
            handle: None,
            fns: None,
        }
    }

    pub fn set_create_flags(&mut self, create_flags: vk::AccelerationStructureCreateFlagsKHR) {
        self.create_flags = create_flags;
    }

    pub fn set_build_flags(&mut self, build_flags: vk::BuildAccelerationStructureFlagsKHR) {
        self.build_flags = build_flags;
    }

    pub fn set_create_generic(&mut self, create_generic: bool) {
        self.create_generic = create_generic;
    }

    pub fn set_build_without_geometries(&mut self, build_without_geometries: bool) {
        self.build_without_geometries = build_without_geometries;
    }

    pub fn set_build_without_primitives(&mut self, build_without_primitives: bool) {
        self.build_without_primitives = build_without_primitives;
    }

    /// Writes a null structure reference into every instance record, making
    /// all instances inactive for traversal.
    pub fn set_inactive_instances(&mut self, inactive_instances: bool) {
        self.inactive_instances = inactive_instances;
    }

    pub fn set_deferred_operation(&mut self, deferred: bool, worker_thread_count: u32) {
        self.deferred_operation = deferred;
        self.worker_thread_count = worker_thread_count;
    }

    pub fn set_use_array_of_pointers(&mut self, use_array_of_pointers: bool) {
        self.use_array_of_pointers = use_array_of_pointers;
    }

    pub fn set_indirect_build_parameters(&mut self, parameters: IndirectBuildParameters) {
        self.indirect = Some(parameters);
    }

    pub fn add_instance(
        &mut self,
        structure: Arc<BottomLevelAccelerationStructure>,
        data: InstanceData,
    ) {
        self.instances.push((structure, data));
    }

    pub fn build_type(&self) -> AccelerationStructureBuildType {
        self.build_type
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    pub fn instance(&self, index: usize) -> &Arc<BottomLevelAccelerationStructure> {
        &self.instances[index].0
    }

    pub fn structure_size(&self) -> DeviceSize {
        self.structure_size
    }

    pub fn build_scratch_size(&self) -> DeviceSize {
        self.build_scratch_size
    }

    pub fn update_scratch_size(&self) -> DeviceSize {
        self.update_scratch_size
    }

    pub fn handle(&self) -> vk::AccelerationStructureKHR {
        self.handle
            .expect("acceleration structure has not been created")
    }

    pub fn device_address(&self, device: &RayTracingDevice) -> DeviceAddress {
        let info = vk::AccelerationStructureDeviceAddressInfoKHR::default()
            .acceleration_structure(self.handle());
        unsafe {
            device
                .acceleration_structure_fns()
                .get_acceleration_structure_device_address(&info)
        }
    }

    /// Allocates buffers and creates the backend object.
    ///
    /// As for bottom levels, either the instances are set and `size_override`
    /// is 0, or a nonzero override sizes a copy/deserialize target.
    pub fn create(
        &mut self,
        device: &RayTracingDevice,
        size_override: DeviceSize,
        device_address: DeviceAddress,
    ) -> Result<(), Error> {
        assert!(
            self.instances.is_empty() == (size_override != 0),
            "a structure is created either from instances or from a known size, not both"
        );

        if size_override != 0 {
            self.structure_size = size_override;
            self.update_scratch_size = 0;
            self.build_scratch_size = 0;
        } else {
            let geometry = self.prepare_instances(device, true);
            let max_primitive_counts = [self.instances.len() as u32];
            let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
                .ty(self.structure_type())
                .flags(self.build_flags)
                .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
                .geometries(std::slice::from_ref(&geometry))
                .scratch_data(address::null_address());

            let mut size_info = vk::AccelerationStructureBuildSizesInfoKHR::default();
            unsafe {
                device
                    .acceleration_structure_fns()
                    .get_acceleration_structure_build_sizes(
                        self.build_type.to_vk(),
                        &build_info,
                        &max_primitive_counts,
                        &mut size_info,
                    )
            };
            self.structure_size = size_info.acceleration_structure_size;
            self.update_scratch_size = size_info.update_scratch_size;
            self.build_scratch_size = size_info.build_scratch_size;
        }

        let structure_buffer = BufferWithMemory::new_host_cached(
            device,
            self.structure_size,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        )?;

        let create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .create_flags(self.create_flags)
            .buffer(structure_buffer.handle())
            .offset(0)
            .size(self.structure_size)
            .ty(self.structure_type())
            .device_address(device_address);

        let fns = device.acceleration_structure_fns().clone();
        let handle = unsafe { fns.create_acceleration_structure(&create_info, None) }
            .map_err(VulkanError::from)?;
        self.structure_buffer = Some(structure_buffer);
        self.handle = Some(handle);
        self.fns = Some(fns);

        if self.build_scratch_size > 0 {
            match self.build_type {
                AccelerationStructureBuildType::Device => {
                    self.scratch_buffer = Some(BufferWithMemory::new_host(
                        device,
                        self.build_scratch_size,
                        vk::BufferUsageFlags::STORAGE_BUFFER
                            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                    )?);
                }
                AccelerationStructureBuildType::Host => {
                    self.host_scratch = vec![0; self.build_scratch_size as usize];
                }
            }
        }

        if !self.instances.is_empty() {
            self.instance_buffer = Some(BufferWithMemory::new_host_cached(
                device,
                self.instances.len() as DeviceSize * INSTANCE_RECORD_SIZE,
                vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            )?);
            if self.use_array_of_pointers {
                self.instance_address_buffer = Some(BufferWithMemory::new_host(
                    device,
                    self.instances.len() as DeviceSize * 8,
                    vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                        | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                )?);
            }
        }

        Ok(())
    }

    /// Populates the structure from its instance records.
    pub fn build(
        &mut self,
        device: &RayTracingDevice,
        context: &CommandContext,
    ) -> Result<(), Error> {
        assert!(!self.instances.is_empty(), "no instances to build from");
        assert!(self.handle.is_some(), "create the structure before building");
        assert!(self.build_scratch_size > 0);

        self.update_instance_buffer(device)?;

        let geometry = self.prepare_instances(device, false);
        let geometry_ptr = std::ptr::from_ref(&geometry);

        let scratch_data = match self.build_type {
            AccelerationStructureBuildType::Device => {
                let scratch = self
                    .scratch_buffer
                    .as_ref()
                    .expect("device build requires a scratch buffer");
                address::device_address(device, scratch, 0)
            }
            AccelerationStructureBuildType::Host => {
                address::host_address(self.host_scratch.as_mut_ptr())
            }
        };

        let mut build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
            .flags(self.build_flags)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .dst_acceleration_structure(self.handle())
            .scratch_data(scratch_data);
        build_info.geometry_count = if self.build_without_geometries { 0 } else { 1 };
        if self.use_array_of_pointers {
            build_info.pp_geometries = &geometry_ptr;
        } else {
            build_info.p_geometries = geometry_ptr;
        }

        let primitive_count = if self.build_without_primitives {
            0
        } else {
            self.instances.len() as u32
        };
        let all_ranges = [vk::AccelerationStructureBuildRangeInfoKHR::default()
            .primitive_count(primitive_count)];
        let all_max_counts = [self.instances.len() as u32];
        // A degenerate build advertises zero geometries, so the per-info
        // arrays have to shrink to match.
        let build_ranges = &all_ranges[..build_info.geometry_count as usize];
        let max_primitive_counts = &all_max_counts[..build_info.geometry_count as usize];

        match self.build_type {
            AccelerationStructureBuildType::Device => {
                let fns = device.acceleration_structure_fns();
                context
                    .one_shot(|cmd| {
                        match self.indirect {
                            None => unsafe {
                                fns.cmd_build_acceleration_structures(
                                    cmd,
                                    std::slice::from_ref(&build_info),
                                    &[build_ranges],
                                );
                            },
                            Some(indirect) => {
                                let info = vk::BufferDeviceAddressInfo::default()
                                    .buffer(indirect.buffer);
                                let indirect_address =
                                    unsafe { device.fns().get_buffer_device_address(&info) }
                                        + indirect.offset;
                                unsafe {
                                    fns.cmd_build_acceleration_structures_indirect(
                                        cmd,
                                        std::slice::from_ref(&build_info),
                                        &[indirect_address],
                                        &[indirect.stride],
                                        &[max_primitive_counts],
                                    );
                                }
                            }
                        }
                        cmd_acceleration_structure_barrier(device, cmd);
                        Ok(())
                    })
                    .map_err(Error::from)
            }
            AccelerationStructureBuildType::Host => {
                run_host_operation(device, self.host_dispatch(), |operation| unsafe {
                    raw_status(device.acceleration_structure_fns().build_acceleration_structures(
                        operation,
                        std::slice::from_ref(&build_info),
                        &[build_ranges],
                    ))
                })
                .map_err(Error::from)
            }
        }
    }

    /// Rewrites every instance record (and, with array-of-pointers builds,
    /// the per-record address table) and flushes.
    pub fn update_instance_buffer(&self, device: &RayTracingDevice) -> Result<(), VulkanError> {
        for index in 0..self.instances.len() {
            self.write_instance_record(device, index);
        }
        let instance_buffer = self
            .instance_buffer
            .as_ref()
            .expect("instance buffer is allocated at create time");
        instance_buffer.flush()?;

        if let Some(address_buffer) = &self.instance_address_buffer {
            let base = match self.build_type {
                AccelerationStructureBuildType::Device => {
                    instance_buffer.device_address(device)
                }
                AccelerationStructureBuildType::Host => instance_buffer.host_ptr(0) as u64,
            };
            for index in 0..self.instances.len() {
                let entry = base + index as u64 * INSTANCE_RECORD_SIZE;
                unsafe {
                    address_buffer
                        .host_ptr(index as DeviceSize * 8)
                        .cast::<u64>()
                        .write_unaligned(entry)
                };
            }
            address_buffer.flush()?;
        }

        Ok(())
    }

    /// Rewrites one instance record in place and flushes, without a rebuild.
    /// Only meaningful for device builds, where the implementation reads the
    /// records from the buffer.
    pub fn update_instance_matrix(
        &mut self,
        device: &RayTracingDevice,
        index: usize,
        transform: vk::TransformMatrixKHR,
    ) -> Result<(), VulkanError> {
        assert_eq!(self.build_type, AccelerationStructureBuildType::Device);
        self.instances[index].1.transform = transform;
        self.write_instance_record(device, index);
        self.instance_buffer
            .as_ref()
            .expect("instance buffer is allocated at create time")
            .flush()
    }

    fn write_instance_record(&self, device: &RayTracingDevice, index: usize) {
        let (structure, data) = &self.instances[index];
        let reference = if self.inactive_instances {
            0
        } else {
            structure.structure_reference(device)
        };

        let record = vk::AccelerationStructureInstanceKHR {
            transform: data.transform,
            instance_custom_index_and_mask: vk::Packed24_8::new(data.custom_index, data.mask as u8),
            instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(
                data.shader_binding_table_record_offset,
                data.flags.as_raw() as u8,
            ),
            acceleration_structure_reference: vk::AccelerationStructureReferenceKHR {
                device_handle: reference,
            },
        };

        let buffer = self
            .instance_buffer
            .as_ref()
            .expect("instance buffer is allocated at create time");
        unsafe {
            buffer
                .host_ptr(index as DeviceSize * INSTANCE_RECORD_SIZE)
                .cast::<vk::AccelerationStructureInstanceKHR>()
                .write_unaligned(record)
        };
    }

    pub fn copy_from(
        &self,
        device: &RayTracingDevice,
        context: &CommandContext,
        source: &TopLevelAccelerationStructure,
        compact: bool,
    ) -> Result<(), Error> {
        let mode = if compact {
            vk::CopyAccelerationStructureModeKHR::COMPACT
        } else {
            vk::CopyAccelerationStructureModeKHR::CLONE
        };
        let copy_info = vk::CopyAccelerationStructureInfoKHR::default()
            .src(source.handle())
            .dst(self.handle())
            .mode(mode);

        match self.build_type {
            AccelerationStructureBuildType::Device => context
                .one_shot(|cmd| {
                    unsafe {
                        device
                            .acceleration_structure_fns()
                            .cmd_copy_acceleration_structure(cmd, &copy_info)
                    };
                    cmd_acceleration_structure_barrier(device, cmd);
                    Ok(())
                })
                .map_err(Error::from),
            AccelerationStructureBuildType::Host => {
                run_host_operation(device, self.host_dispatch(), |operation| unsafe {
                    raw_status(
                        device
                            .acceleration_structure_fns()
                            .copy_acceleration_structure(operation, &copy_info),
                    )
                })
                .map_err(Error::from)
            }
        }
    }

    pub fn serialize(
        &self,
        device: &RayTracingDevice,
        context: &CommandContext,
        storage: &SerialStorage,
    ) -> Result<(), Error> {
        let copy_info = vk::CopyAccelerationStructureToMemoryInfoKHR::default()
            .src(self.handle())
            .dst(storage.address(device))
            .mode(vk::CopyAccelerationStructureModeKHR::SERIALIZE);

        match self.build_type {
            AccelerationStructureBuildType::Device => context
                .one_shot(|cmd| {
                    unsafe {
                        device
                            .acceleration_structure_fns()
                            .cmd_copy_acceleration_structure_to_memory(cmd, &copy_info)
                    };
                    Ok(())
                })
                .map_err(Error::from),
            AccelerationStructureBuildType::Host => {
                run_host_operation(device, self.host_dispatch(), |operation| unsafe {
                    raw_status(
                        device
                            .acceleration_structure_fns()
                            .copy_acceleration_structure_to_memory(operation, &copy_info),
                    )
                })
                .map_err(Error::from)
            }
        }
    }

    pub fn deserialize(
        &self,
        device: &RayTracingDevice,
        context: &CommandContext,
        storage: &SerialStorage,
    ) -> Result<(), Error> {
        let copy_info = vk::CopyMemoryToAccelerationStructureInfoKHR::default()
            .src(storage.address_const(device))
            .dst(self.handle())
            .mode(vk::CopyAccelerationStructureModeKHR::DESERIALIZE);

        match self.build_type {
            AccelerationStructureBuildType::Device => context
                .one_shot(|cmd| {
                    unsafe {
                        device
                            .acceleration_structure_fns()
                            .cmd_copy_memory_to_acceleration_structure(cmd, &copy_info)
                    };
                    cmd_acceleration_structure_barrier(device, cmd);
                    Ok(())
                })
                .map_err(Error::from),
            AccelerationStructureBuildType::Host => {
                run_host_operation(device, self.host_dispatch(), |operation| unsafe {
                    raw_status(
                        device
                            .acceleration_structure_fns()
                            .copy_memory_to_acceleration_structure(operation, &copy_info),
                    )
                })
                .map_err(Error::from)
            }
        }
    }

    pub fn create_and_build(
        &mut self,
        device: &RayTracingDevice,
        context: &CommandContext,
        device_address: DeviceAddress,
    ) -> Result<(), Error> {
        self.create(device, 0, device_address)?;
        self.build(device, context)
    }

    pub fn create_and_copy_from(
        &mut self,
        device: &RayTracingDevice,
        context: &CommandContext,
        source: &TopLevelAccelerationStructure,
        compact_copy_size: DeviceSize,
        device_address: DeviceAddress,
    ) -> Result<(), Error> {
        let copied_size = if compact_copy_size > 0 {
            compact_copy_size
        } else {
            source.structure_size()
        };
        assert!(copied_size != 0, "source structure has no size yet");

        self.create(device, copied_size, device_address)?;
        self.copy_from(device, context, source, compact_copy_size > 0)
    }

    pub fn create_and_deserialize_from(
        &mut self,
        device: &RayTracingDevice,
        context: &CommandContext,
        storage: &SerialStorage,
        device_address: DeviceAddress,
    ) -> Result<(), Error> {
        assert!(
            storage.storage_size() >= SerialStorage::SERIAL_STORAGE_SIZE_MIN,
            "serialized blob is smaller than its fixed header"
        );
        self.create(device, storage.deserialized_size(), device_address)?;
        self.deserialize(device, context, storage)
    }

    /// Serialization sizes for this structure and every instance's bottom
    /// level, in the order [`serializing_addresses`](Self::serializing_addresses)
    /// reports them.
    pub fn serializing_sizes(
        &self,
        device: &RayTracingDevice,
        context: &CommandContext,
    ) -> Result<Vec<DeviceSize>, VulkanError> {
        let mut structures = Vec::with_capacity(1 + self.instances.len());
        structures.push(self.handle());
        structures.extend(self.instances.iter().map(|(blas, _)| blas.handle()));

        query_acceleration_structure_sizes(
            device,
            context,
            self.build_type,
            &structures,
            vk::QueryType::ACCELERATION_STRUCTURE_SERIALIZATION_SIZE_KHR,
        )
    }

    /// This structure's reference followed by every instance's bottom-level
    /// reference. Instances sharing a bottom level repeat its address, which
    /// is what lets a deserializing run recover the sharing pattern.
    pub fn serializing_addresses(&self, device: &RayTracingDevice) -> Vec<DeviceAddress> {
        let mut addresses = Vec::with_capacity(1 + self.instances.len());
        addresses.push(match self.build_type {
            AccelerationStructureBuildType::Device => self.device_address(device),
            AccelerationStructureBuildType::Host => vk::Handle::as_raw(self.handle()),
        });
        addresses.extend(
            self.instances
                .iter()
                .map(|(blas, _)| blas.structure_reference(device)),
        );
        addresses
    }

    /// Serializes each distinct bottom level into its child storage. The
    /// storage must have been created with
    /// [`SerialStorage::with_info`] from this structure's serializing info.
    pub fn serialize_bottoms(
        &self,
        device: &RayTracingDevice,
        context: &CommandContext,
        storage: &SerialStorage,
    ) -> Result<(), Error> {
        let slots = storage.instance_slots();
        assert_eq!(slots.len(), self.instances.len());

        let mut serialized = vec![false; storage.bottoms().len()];
        for (index, &slot) in slots.iter().enumerate() {
            if !serialized[slot] {
                self.instances[index]
                    .0
                    .serialize(device, context, &storage.bottoms()[slot])?;
                serialized[slot] = true;
            }
        }
        Ok(())
    }

    /// Rebuilds the bottom levels a serialized top level referenced, one per
    /// child storage, re-sharing them across instances the way the original
    /// run did, and patches the blob's header references to point at the
    /// rebuilt structures. Call before deserializing the top level itself.
    pub fn create_and_deserialize_bottoms(
        &mut self,
        device: &RayTracingDevice,
        context: &CommandContext,
        storage: &SerialStorage,
    ) -> Result<(), Error> {
        let mut rebuilt = Vec::with_capacity(storage.bottoms().len());
        for bottom_storage in storage.bottoms() {
            let mut structure = BottomLevelAccelerationStructure::new(self.build_type);
            structure.create_and_deserialize_from(device, context, bottom_storage, 0)?;
            rebuilt.push(Arc::new(structure));
        }

        assert_eq!(storage.handles_count(), storage.instance_slots().len() as u64);
        for (index, &slot) in storage.instance_slots().iter().enumerate() {
            storage.set_handle(index, rebuilt[slot].structure_reference(device));
            self.instances
                .push((rebuilt[slot].clone(), InstanceData::default()));
        }
        Ok(())
    }

    /// Instance geometry descriptor for size queries (`null_data_addresses`)
    /// and builds.
    fn prepare_instances(
        &self,
        device: &RayTracingDevice,
        null_data_addresses: bool,
    ) -> vk::AccelerationStructureGeometryKHR<'static> {
        let data = if null_data_addresses || self.instance_buffer.is_none() {
            address::null_address_const()
        } else {
            let source = if self.use_array_of_pointers {
                self.instance_address_buffer
                    .as_ref()
                    .expect("address buffer is allocated at create time")
            } else {
                self.instance_buffer.as_ref().unwrap()
            };
            match self.build_type {
                AccelerationStructureBuildType::Device => {
                    address::device_address_const(device, source, 0)
                }
                AccelerationStructureBuildType::Host => {
                    address::host_address_const(source.host_ptr(0).cast_const())
                }
            }
        };

        let instances_data = vk::AccelerationStructureGeometryInstancesDataKHR::default()
            .array_of_pointers(self.use_array_of_pointers)
            .data(data);

        vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::INSTANCES)
            .geometry(vk::AccelerationStructureGeometryDataKHR {
                instances: instances_data,
            })
            .flags(vk::GeometryFlagsKHR::empty())
    }

    fn host_dispatch(&self) -> HostDispatch {
        if self.deferred_operation {
            HostDispatch::Deferred {
                worker_thread_count: self.worker_thread_count,
            }
        } else {
            HostDispatch::Direct
        }
    }

    fn structure_type(&self) -> vk::AccelerationStructureTypeKHR {
        if self.create_generic {
            vk::AccelerationStructureTypeKHR::GENERIC
        } else {
            vk::AccelerationStructureTypeKHR::TOP_LEVEL
        }
    }
}

impl Drop for TopLevelAccelerationStructure {
    fn drop(&mut self) {
        if let (Some(handle), Some(fns)) = (self.handle.take(), self.fns.take()) {
            unsafe { fns.destroy_acceleration_structure(handle, None) };
        }
    }
}

impl std::fmt::Debug for TopLevelAccelerationStructure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopLevelAccelerationStructure")
            .field("build_type", &self.build_type)
            .field("instances", &self.instances.len())
            .field("structure_size", &self.structure_size)
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acceleration_structure::SerialInfo;

    #[test]
    fn default_instance_data_hits_every_group() {
        let data = InstanceData::default();
        assert_eq!(data.mask, 0xff);
        assert_eq!(data.custom_index, 0);
        assert_eq!(data.transform.matrix[0], 1.0);
        assert_eq!(data.transform.matrix[5], 1.0);
        assert_eq!(data.transform.matrix[10], 1.0);
    }

    #[test]
    fn instance_records_are_tightly_packed() {
        assert_eq!(INSTANCE_RECORD_SIZE, 64);
    }

    #[test]
    fn instance_data_debug_lists_the_transform_rows() {
        let printed = format!("{:?}", InstanceData::default());
        assert!(printed.contains("InstanceData"));
        assert!(printed.contains("transform"));
        assert!(printed.contains("mask"));
        assert!(printed.contains("flags"));
    }

    #[test]
    fn packed_fields_split_at_24_bits() {
        let packed = vk::Packed24_8::new(0x00ab_cdef, 0x12);
        assert_eq!(packed.low_24(), 0x00ab_cdef);
        assert_eq!(packed.high_8(), 0x12);
    }

    fn built_bottom_level(
        device: &RayTracingDevice,
        context: &CommandContext,
    ) -> Arc<BottomLevelAccelerationStructure> {
        let mut structure =
            BottomLevelAccelerationStructure::new(AccelerationStructureBuildType::Device);
        structure.set_geometry(
            &[[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
            true,
            vk::GeometryFlagsKHR::OPAQUE,
        );
        structure.create_and_build(device, context, 0).unwrap();
        Arc::new(structure)
    }

    #[test]
    fn device_build_with_instances() {
        let harness = ray_tracing_harness!();
        let device = harness.device();
        let context = CommandContext::new(device).unwrap();

        let bottom = built_bottom_level(device, &context);
        let mut top = TopLevelAccelerationStructure::new(AccelerationStructureBuildType::Device);
        top.add_instance(bottom.clone(), InstanceData::default());
        top.add_instance(
            bottom,
            InstanceData {
                custom_index: 1,
                ..InstanceData::default()
            },
        );
        top.create_and_build(device, &context, 0).unwrap();

        assert!(top.structure_size() > 0);
        assert_ne!(top.device_address(device), 0);
    }

    fn instance_reference(top: &TopLevelAccelerationStructure, index: u64) -> u64 {
        let ptr = top
            .instance_buffer
            .as_ref()
            .unwrap()
            .host_ptr(index * INSTANCE_RECORD_SIZE + 56);
        unsafe { ptr.cast::<u64>().read_unaligned() }
    }

    #[test]
    fn inactive_instances_write_a_null_reference() {
        let harness = ray_tracing_harness!();
        let device = harness.device();
        let context = CommandContext::new(device).unwrap();
        let bottom = built_bottom_level(device, &context);

        let mut active = TopLevelAccelerationStructure::new(AccelerationStructureBuildType::Device);
        active.add_instance(bottom.clone(), InstanceData::default());
        active.create_and_build(device, &context, 0).unwrap();
        assert_ne!(instance_reference(&active, 0), 0);

        let mut inactive =
            TopLevelAccelerationStructure::new(AccelerationStructureBuildType::Device);
        inactive.set_inactive_instances(true);
        inactive.add_instance(bottom, InstanceData::default());
        inactive.create_and_build(device, &context, 0).unwrap();
        assert_eq!(instance_reference(&inactive, 0), 0);
    }

    #[test]
    fn shared_instances_collapse_to_one_bottom_storage() {
        let harness = ray_tracing_harness!();
        let device = harness.device();
        let context = CommandContext::new(device).unwrap();

        let bottom = built_bottom_level(device, &context);
        let mut top = TopLevelAccelerationStructure::new(AccelerationStructureBuildType::Device);
        top.add_instance(bottom.clone(), InstanceData::default());
        top.add_instance(bottom, InstanceData::default());
        top.create_and_build(device, &context, 0).unwrap();

        let addresses = top.serializing_addresses(device);
        assert_eq!(addresses.len(), 3);
        assert_eq!(addresses[1], addresses[2]);

        let sizes = top.serializing_sizes(device, &context).unwrap();
        let info = SerialInfo::new(sizes, addresses);
        let storage =
            SerialStorage::with_info(device, AccelerationStructureBuildType::Device, info)
                .unwrap();
        assert_eq!(storage.bottoms().len(), 1);
        assert_eq!(storage.instance_slots(), &[0, 0]);

        top.serialize_bottoms(device, &context, &storage).unwrap();
        top.serialize(device, &context, &storage).unwrap();
        assert!(storage.deserialized_size() > 0);
    }

    #[test]
    fn instance_matrix_updates_in_place() {
        let harness = ray_tracing_harness!();
        let device = harness.device();
        let context = CommandContext::new(device).unwrap();

        let bottom = built_bottom_level(device, &context);
        let mut top = TopLevelAccelerationStructure::new(AccelerationStructureBuildType::Device);
        top.add_instance(bottom, InstanceData::default());
        top.create_and_build(device, &context, 0).unwrap();

        let mut transform = identity_transform();
        transform.matrix[3] = 5.0;
        top.update_instance_matrix(device, 0, transform).unwrap();
    }
}
