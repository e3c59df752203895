// Copyright (c) 2026 The vk-rtas developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Bottom-level acceleration structures over triangle or AABB geometry.

use super::{
    raw_status, run_host_operation, AccelerationStructureBuildType, BufferRequirements,
    BufferSource, HostDispatch, OwnedBufferSource, PoolBufferSource, SerialStorage,
};
use crate::{
    address, align_up,
    command::{cmd_acceleration_structure_barrier, CommandContext},
    device::RayTracingDevice,
    geometry::GeometryData,
    DeviceAddress, DeviceSize, Error, VulkanError,
};
use ash::vk;
use smallvec::SmallVec;

/// Parameters for an indirect device build, read from a caller-provided
/// buffer at submission time.
#[derive(Clone, Copy, Debug)]
pub struct IndirectBuildParameters {
    pub buffer: vk::Buffer,
    pub offset: DeviceSize,
    pub stride: u32,
}

/// One bottom-level acceleration structure and everything it owns.
///
/// The lifecycle is `add_geometry`/`set_geometry` → [`create`](Self::create) →
/// exactly one of [`build`](Self::build), [`copy_from`](Self::copy_from) or
/// [`deserialize`](Self::deserialize) → optionally
/// [`serialize`](Self::serialize). A structure is created either from its
/// geometry (sizes queried from the implementation) or with an explicit size
/// and no geometry (the copy/deserialize target case); mixing the two is a
/// usage bug and panics.
pub struct BottomLevelAccelerationStructure {
    build_type: AccelerationStructureBuildType,
    create_flags: vk::AccelerationStructureCreateFlagsKHR,
    build_flags: vk::BuildAccelerationStructureFlagsKHR,
    create_generic: bool,
    build_without_geometries: bool,
    build_without_primitives: bool,
    deferred_operation: bool,
    worker_thread_count: u32,
    use_array_of_pointers: bool,
    indirect: Option<IndirectBuildParameters>,
    geometries: Vec<GeometryData>,
    structure_size: DeviceSize,
    update_scratch_size: DeviceSize,
    build_scratch_size: DeviceSize,
    buffers: Box<dyn BufferSource>,
    host_scratch: Vec<u8>,
    handle: Option<vk::AccelerationStructureKHR>,
    fns: Option<ash::khr::acceleration_structure::Device>,
}

impl BottomLevelAccelerationStructure {
    pub fn new(build_type: AccelerationStructureBuildType) -> Self {
        Self {
            build_type,
            create_flags: vk::AccelerationStructureCreateFlagsKHR::empty(),
            build_flags: vk::BuildAccelerationStructureFlagsKHR::empty(),
            create_generic: false,
            build_without_geometries: false,
            build_without_primitives: false,
            deferred_operation: false,
            worker_thread_count: 0,
            use_array_of_pointers: false,
            indirect: None,
            geometries: Vec::new(),
            structure_size: 0,
            update_scratch_size: 0,
            build_scratch_size: 0,
            buffers: Box::new(OwnedBufferSource::default()),
            host_scratch: Vec::new(),
            handle: None,
            fns: None,
        }
    }

    /// Replaces all geometry with one triangle or AABB geometry built from
    /// `vertices`. Panics on malformed input, see
    /// [`GeometryData::triangles`] and [`GeometryData::aabbs`].
    pub fn set_geometry(
        &mut self,
        vertices: &[[f32; 3]],
        triangles: bool,
        flags: vk::GeometryFlagsKHR,
    ) {
        self.geometries.clear();
        self.geometries.push(if triangles {
            GeometryData::triangles(vertices, flags)
        } else {
            GeometryData::aabbs(vertices, flags)
        });
    }

    pub fn add_geometry(&mut self, geometry: GeometryData) {
        self.geometries.push(geometry);
    }

    pub fn set_create_flags(&mut self, create_flags: vk::AccelerationStructureCreateFlagsKHR) {
        self.create_flags = create_flags;
    }

    pub fn set_build_flags(&mut self, build_flags: vk::BuildAccelerationStructureFlagsKHR) {
        self.build_flags = build_flags;
    }

    /// Creates the backend object with type GENERIC instead of BOTTOM_LEVEL.
    pub fn set_create_generic(&mut self, create_generic: bool) {
        self.create_generic = create_generic;
    }

    /// Makes `build` pass a geometry count of zero while still supplying
    /// the descriptors, exercising the degenerate-build path.
    pub fn set_build_without_geometries(&mut self, build_without_geometries: bool) {
        self.build_without_geometries = build_without_geometries;
    }

    /// Makes `build` report zero primitives for every geometry.
    pub fn set_build_without_primitives(&mut self, build_without_primitives: bool) {
        self.build_without_primitives = build_without_primitives;
    }

    /// Routes host-side operations through a deferred operation finished by
    /// `worker_thread_count` threads (0 = the calling thread only).
    pub fn set_deferred_operation(&mut self, deferred: bool, worker_thread_count: u32) {
        self.deferred_operation = deferred;
        self.worker_thread_count = worker_thread_count;
    }

    /// Passes the geometry descriptors through `ppGeometries` instead of the
    /// flat `pGeometries` array.
    pub fn set_use_array_of_pointers(&mut self, use_array_of_pointers: bool) {
        self.use_array_of_pointers = use_array_of_pointers;
    }

    pub fn set_indirect_build_parameters(&mut self, parameters: IndirectBuildParameters) {
        self.indirect = Some(parameters);
    }

    pub fn build_type(&self) -> AccelerationStructureBuildType {
        self.build_type
    }

    pub fn geometry_count(&self) -> usize {
        self.geometries.len()
    }

    pub fn build_flags(&self) -> vk::BuildAccelerationStructureFlagsKHR {
        self.build_flags
    }

    /// Size of the structure's storage, known after `create`.
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

    /// The value written into instance records that reference this
    /// structure: its device address for device builds, or the raw handle
    /// for host builds.
    pub fn structure_reference(&self, device: &RayTracingDevice) -> u64 {
        match self.build_type {
            AccelerationStructureBuildType::Device => self.device_address(device),
            AccelerationStructureBuildType::Host => vk::Handle::as_raw(self.handle()),
        }
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

    /// Queries or adopts the structure's sizes.
    ///
    /// With `size_override == 0` the geometry must be set and the sizes come
    /// from `vkGetAccelerationStructureBuildSizesKHR`; a nonzero override is
    /// for copy/deserialize targets and forbids geometry. Exactly one of the
    /// two must hold.
    pub(crate) fn compute_sizes(
        &mut self,
        device: &RayTracingDevice,
        size_override: DeviceSize,
    ) -> Result<(), VulkanError> {
        assert!(
            self.geometries.is_empty() == (size_override != 0),
            "a structure is created either from geometry or from a known size, not both"
        );

        if size_override != 0 {
            self.structure_size = size_override;
            self.update_scratch_size = 0;
            self.build_scratch_size = 0;
            return Ok(());
        }

        let prepared = self.prepare_geometries(device, true);
        let geometry_ptrs: SmallVec<[*const vk::AccelerationStructureGeometryKHR<'_>; 4]> =
            prepared.geometries.iter().map(|g| std::ptr::from_ref(g)).collect();

        let mut build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(self.structure_type())
            .flags(self.build_flags)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .scratch_data(address::null_address());
        if self.use_array_of_pointers {
            build_info.geometry_count = prepared.geometries.len() as u32;
            build_info.pp_geometries = geometry_ptrs.as_ptr();
        } else {
            build_info = build_info.geometries(&prepared.geometries);
        }

        let mut size_info = vk::AccelerationStructureBuildSizesInfoKHR::default();
        unsafe {
            device
                .acceleration_structure_fns()
                .get_acceleration_structure_build_sizes(
                    self.build_type.to_vk(),
                    &build_info,
                    &prepared.max_primitive_counts,
                    &mut size_info,
                )
        };

        self.structure_size = size_info.acceleration_structure_size;
        self.update_scratch_size = size_info.update_scratch_size;
        self.build_scratch_size = size_info.build_scratch_size;
        Ok(())
    }

    /// Buffer space this structure needs, valid after `compute_sizes`.
    pub(crate) fn buffer_requirements(&self) -> BufferRequirements {
        let needs_upload = self.build_type == AccelerationStructureBuildType::Device
            && !self.geometries.is_empty();

        BufferRequirements {
            structure_size: self.structure_size,
            scratch_size: if self.build_type == AccelerationStructureBuildType::Device {
                self.build_scratch_size
            } else {
                0
            },
            vertex_size: if needs_upload {
                self.geometries
                    .iter()
                    .map(|g| align_up(g.vertex_data().len() as DeviceSize, 8))
                    .sum()
            } else {
                0
            },
            index_size: if needs_upload {
                self.geometries
                    .iter()
                    .filter(|g| g.uses_indices())
                    .map(|g| align_up(g.index_data().len() as DeviceSize, 8))
                    .sum()
            } else {
                0
            },
        }
    }

    /// Swaps in pool-assigned buffer regions in place of owned buffers.
    pub(crate) fn assign_pool_buffers(&mut self, source: PoolBufferSource) {
        assert!(
            self.handle.is_none(),
            "buffers cannot be reassigned after the structure is created"
        );
        self.buffers = Box::new(source);
    }

    /// Creates the backend object at the structure buffer region, and the
    /// host scratch area for host builds.
    pub(crate) fn create_handle(
        &mut self,
        device: &RayTracingDevice,
        device_address: DeviceAddress,
    ) -> Result<(), Error> {
        let requirements = self.buffer_requirements();
        self.buffers.provision(device, &requirements)?;

        let (buffer, offset) = self.buffers.structure_buffer();
        let create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .create_flags(self.create_flags)
            .buffer(buffer.handle())
            .offset(offset)
            .size(self.structure_size)
            .ty(self.structure_type())
            .device_address(device_address);

        let fns = device.acceleration_structure_fns().clone();
        let handle = unsafe { fns.create_acceleration_structure(&create_info, None) }
            .map_err(VulkanError::from)?;
        self.handle = Some(handle);
        self.fns = Some(fns);

        if self.build_type == AccelerationStructureBuildType::Host && self.build_scratch_size > 0 {
            self.host_scratch = vec![0; self.build_scratch_size as usize];
        }

        Ok(())
    }

    /// Allocates buffers and creates the backend object.
    ///
    /// `size_override` and `device_address` are normally 0; a nonzero size
    /// skips the geometry size query (copy/deserialize targets), a nonzero
    /// address requests opaque-capture replay at that address.
    pub fn create(
        &mut self,
        device: &RayTracingDevice,
        size_override: DeviceSize,
        device_address: DeviceAddress,
    ) -> Result<(), Error> {
        self.compute_sizes(device, size_override)?;
        self.create_handle(device, device_address)
    }

    /// Populates the structure from its geometry.
    pub fn build(&mut self, device: &RayTracingDevice, context: &CommandContext) -> Result<(), Error> {
        assert!(!self.geometries.is_empty(), "no geometry to build from");
        assert!(self.handle.is_some(), "create the structure before building");
        assert!(self.build_scratch_size > 0);

        if self.build_type == AccelerationStructureBuildType::Device {
            self.upload_geometry_data()?;
        }

        let prepared = self.prepare_geometries(device, false);
        let geometry_ptrs: SmallVec<[*const vk::AccelerationStructureGeometryKHR<'_>; 4]> =
            prepared.geometries.iter().map(|g| std::ptr::from_ref(g)).collect();

        let scratch_data = match self.build_type {
            AccelerationStructureBuildType::Device => {
                let (buffer, offset) = self
                    .buffers
                    .scratch_buffer()
                    .expect("device build requires a scratch buffer");
                address::device_address(device, buffer, offset)
            }
            AccelerationStructureBuildType::Host => {
                address::host_address(self.host_scratch.as_mut_ptr())
            }
        };

        let geometry_count = if self.build_without_geometries {
            0
        } else {
            prepared.geometries.len() as u32
        };

        let mut build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
            .flags(self.build_flags)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .dst_acceleration_structure(self.handle())
            .scratch_data(scratch_data);
        build_info.geometry_count = geometry_count;
        if self.use_array_of_pointers {
            build_info.pp_geometries = geometry_ptrs.as_ptr();
        } else {
            build_info.p_geometries = prepared.geometries.as_ptr();
        }

        // A degenerate build advertises zero geometries, so the per-info
        // arrays have to shrink to match.
        let build_ranges = &prepared.build_ranges[..geometry_count as usize];
        let max_primitive_counts = &prepared.max_primitive_counts[..geometry_count as usize];

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

    /// Copies `source` into this structure, compacting when `compact` is set.
    ///
    /// The structure must have been created with a size that fits the copy
    /// (the source's size, or its queried compacted size).
    pub fn copy_from(
        &self,
        device: &RayTracingDevice,
        context: &CommandContext,
        source: &BottomLevelAccelerationStructure,
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

    /// Writes the structure's serialized form into `storage`.
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

    /// Restores the structure's contents from `storage`.
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

    /// `create` followed by `build`.
    pub fn create_and_build(
        &mut self,
        device: &RayTracingDevice,
        context: &CommandContext,
        device_address: DeviceAddress,
    ) -> Result<(), Error> {
        self.create(device, 0, device_address)?;
        self.build(device, context)
    }

    /// Creates this structure sized for a copy of `source` and copies it.
    ///
    /// A nonzero `compact_copy_size` (normally the source's queried compacted
    /// size) selects a compacting copy; zero clones at the source's full size.
    pub fn create_and_copy_from(
        &mut self,
        device: &RayTracingDevice,
        context: &CommandContext,
        source: &BottomLevelAccelerationStructure,
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

    /// Creates this structure sized from the blob's deserialized-size header
    /// field and deserializes into it.
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
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL
        }
    }

    /// Copies every geometry's packed vertex and index bytes into the build
    /// input buffers, each region 8-byte aligned, and flushes the whole
    /// allocations. Sub-range flushes would need the non-coherent atom size,
    /// which is not tracked.
    fn upload_geometry_data(&self) -> Result<(), VulkanError> {
        let (vertex_buffer, base_offset) = self
            .buffers
            .vertex_buffer()
            .expect("device build requires a vertex buffer");
        let mut offset = base_offset;
        for geometry in &self.geometries {
            let data = geometry.vertex_data();
            unsafe {
                std::ptr::copy_nonoverlapping(data.as_ptr(), vertex_buffer.host_ptr(offset), data.len())
            };
            offset += align_up(data.len() as DeviceSize, 8);
        }
        vertex_buffer.flush()?;

        if let Some((index_buffer, base_offset)) = self.buffers.index_buffer() {
            let mut offset = base_offset;
            for geometry in self.geometries.iter().filter(|g| g.uses_indices()) {
                let data = geometry.index_data();
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        data.as_ptr(),
                        index_buffer.host_ptr(offset),
                        data.len(),
                    )
                };
                offset += align_up(data.len() as DeviceSize, 8);
            }
            index_buffer.flush()?;
        }

        Ok(())
    }

    /// Builds the per-geometry descriptors, range infos and primitive counts.
    ///
    /// With `null_data_addresses` (the size-query path) all data addresses
    /// are left null; the query only reads counts and formats. Otherwise
    /// addresses point into the build input buffers (device) or straight at
    /// the packed host data (host).
    fn prepare_geometries(
        &self,
        device: &RayTracingDevice,
        null_data_addresses: bool,
    ) -> PreparedGeometries {
        let mut geometries = SmallVec::new();
        let mut build_ranges = SmallVec::new();
        let mut max_primitive_counts = SmallVec::new();

        let vertex_region = self.buffers.vertex_buffer();
        let index_region = self.buffers.index_buffer();
        let mut vertex_offset = vertex_region.map(|(_, offset)| offset).unwrap_or(0);
        let mut index_offset = index_region.map(|(_, offset)| offset).unwrap_or(0);

        for geometry in &self.geometries {
            let (vertex_data, index_data) = if null_data_addresses {
                (address::null_address_const(), address::null_address_const())
            } else {
                match self.build_type {
                    AccelerationStructureBuildType::Device => {
                        let (vertex_buffer, _) =
                            vertex_region.expect("device build requires a vertex buffer");
                        let vertex_data =
                            address::device_address_const(device, vertex_buffer, vertex_offset);
                        vertex_offset += align_up(geometry.vertex_data().len() as DeviceSize, 8);

                        let index_data = match (index_region, geometry.uses_indices()) {
                            (Some((index_buffer, _)), true) => {
                                let data = address::device_address_const(
                                    device,
                                    index_buffer,
                                    index_offset,
                                );
                                index_offset +=
                                    align_up(geometry.index_data().len() as DeviceSize, 8);
                                data
                            }
                            _ => address::null_address_const(),
                        };
                        (vertex_data, index_data)
                    }
                    AccelerationStructureBuildType::Host => {
                        let vertex_data =
                            address::host_address_const(geometry.vertex_data().as_ptr());
                        let index_data = if geometry.uses_indices() {
                            address::host_address_const(geometry.index_data().as_ptr())
                        } else {
                            address::null_address_const()
                        };
                        (vertex_data, index_data)
                    }
                }
            };

            let geometry_data = if geometry.is_triangles() {
                vk::AccelerationStructureGeometryDataKHR {
                    triangles: vk::AccelerationStructureGeometryTrianglesDataKHR::default()
                        .vertex_format(geometry.vertex_format().to_vk())
                        .vertex_data(vertex_data)
                        .vertex_stride(geometry.vertex_stride())
                        .max_vertex(geometry.vertex_count())
                        .index_type(geometry.index_type().to_vk())
                        .index_data(index_data)
                        .transform_data(address::null_address_const()),
                }
            } else {
                vk::AccelerationStructureGeometryDataKHR {
                    aabbs: vk::AccelerationStructureGeometryAabbsDataKHR::default()
                        .data(vertex_data)
                        .stride(geometry.aabb_stride()),
                }
            };

            let geometry_type = if geometry.is_triangles() {
                vk::GeometryTypeKHR::TRIANGLES
            } else {
                vk::GeometryTypeKHR::AABBS
            };

            geometries.push(
                vk::AccelerationStructureGeometryKHR::default()
                    .geometry_type(geometry_type)
                    .geometry(geometry_data)
                    .flags(geometry.flags()),
            );

            let primitive_count = if self.build_without_primitives {
                0
            } else {
                geometry.primitive_count()
            };
            build_ranges.push(
                vk::AccelerationStructureBuildRangeInfoKHR::default()
                    .primitive_count(primitive_count),
            );
            max_primitive_counts.push(geometry.primitive_count());
        }

        PreparedGeometries {
            geometries,
            build_ranges,
            max_primitive_counts,
        }
    }
}

impl Drop for BottomLevelAccelerationStructure {
    fn drop(&mut self) {
        if let (Some(handle), Some(fns)) = (self.handle.take(), self.fns.take()) {
            unsafe { fns.destroy_acceleration_structure(handle, None) };
        }
    }
}

impl std::fmt::Debug for BottomLevelAccelerationStructure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BottomLevelAccelerationStructure")
            .field("build_type", &self.build_type)
            .field("geometries", &self.geometries.len())
            .field("structure_size", &self.structure_size)
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

struct PreparedGeometries {
    geometries: SmallVec<[vk::AccelerationStructureGeometryKHR<'static>; 4]>,
    build_ranges: SmallVec<[vk::AccelerationStructureBuildRangeInfoKHR; 4]>,
    max_primitive_counts: SmallVec<[u32; 4]>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::query_acceleration_structure_sizes;

    fn unit_triangle() -> Vec<[f32; 3]> {
        vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]
    }

    #[test]
    fn device_build_from_triangles() {
        let harness = ray_tracing_harness!();
        let device = harness.device();
        let context = CommandContext::new(device).unwrap();

        let mut structure =
            BottomLevelAccelerationStructure::new(AccelerationStructureBuildType::Device);
        structure.set_geometry(&unit_triangle(), true, vk::GeometryFlagsKHR::OPAQUE);
        structure.create_and_build(device, &context, 0).unwrap();

        assert!(structure.structure_size() > 0);
        assert_ne!(structure.device_address(device), 0);
    }

    #[test]
    fn device_build_from_aabbs() {
        let harness = ray_tracing_harness!();
        let device = harness.device();
        let context = CommandContext::new(device).unwrap();

        let mut structure =
            BottomLevelAccelerationStructure::new(AccelerationStructureBuildType::Device);
        structure.set_geometry(
            &[[0.0, 0.0, 0.0], [1.0, 1.0, 1.0]],
            false,
            vk::GeometryFlagsKHR::empty(),
        );
        structure.create_and_build(device, &context, 0).unwrap();

        assert!(structure.structure_size() > 0);
    }

    #[test]
    fn host_build_from_triangles() {
        let harness = ray_tracing_harness!();
        if !harness.host_commands {
            return;
        }
        let device = harness.device();
        let context = CommandContext::new(device).unwrap();

        let mut structure =
            BottomLevelAccelerationStructure::new(AccelerationStructureBuildType::Host);
        structure.set_geometry(&unit_triangle(), true, vk::GeometryFlagsKHR::OPAQUE);
        structure.create_and_build(device, &context, 0).unwrap();

        assert!(structure.structure_size() > 0);
    }

    #[test]
    fn clone_copy_matches_source_size() {
        let harness = ray_tracing_harness!();
        let device = harness.device();
        let context = CommandContext::new(device).unwrap();

        let mut source =
            BottomLevelAccelerationStructure::new(AccelerationStructureBuildType::Device);
        source.set_geometry(&unit_triangle(), true, vk::GeometryFlagsKHR::OPAQUE);
        source.create_and_build(device, &context, 0).unwrap();

        let mut copy =
            BottomLevelAccelerationStructure::new(AccelerationStructureBuildType::Device);
        copy.create_and_copy_from(device, &context, &source, 0, 0)
            .unwrap();

        assert_eq!(copy.structure_size(), source.structure_size());
    }

    #[test]
    fn serialize_then_deserialize_round_trips() {
        let harness = ray_tracing_harness!();
        let device = harness.device();
        let context = CommandContext::new(device).unwrap();

        let mut source =
            BottomLevelAccelerationStructure::new(AccelerationStructureBuildType::Device);
        source.set_geometry(&unit_triangle(), true, vk::GeometryFlagsKHR::OPAQUE);
        source.create_and_build(device, &context, 0).unwrap();

        let sizes = query_acceleration_structure_sizes(
            device,
            &context,
            AccelerationStructureBuildType::Device,
            &[source.handle()],
            vk::QueryType::ACCELERATION_STRUCTURE_SERIALIZATION_SIZE_KHR,
        )
        .unwrap();
        assert!(sizes[0] >= SerialStorage::SERIAL_STORAGE_SIZE_MIN);

        let storage =
            SerialStorage::new(device, AccelerationStructureBuildType::Device, sizes[0]).unwrap();
        source.serialize(device, &context, &storage).unwrap();
        assert!(storage.deserialized_size() > 0);

        let mut restored =
            BottomLevelAccelerationStructure::new(AccelerationStructureBuildType::Device);
        restored
            .create_and_deserialize_from(device, &context, &storage, 0)
            .unwrap();
        assert_eq!(restored.structure_size(), storage.deserialized_size());
    }

    #[test]
    fn compact_copy_shrinks_to_the_queried_size() {
        let harness = ray_tracing_harness!();
        let device = harness.device();
        let context = CommandContext::new(device).unwrap();

        let mut source =
            BottomLevelAccelerationStructure::new(AccelerationStructureBuildType::Device);
        source.set_build_flags(
            vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE
                | vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION,
        );
        source.set_geometry(&unit_triangle(), true, vk::GeometryFlagsKHR::OPAQUE);
        source.create_and_build(device, &context, 0).unwrap();

        let compacted = query_acceleration_structure_sizes(
            device,
            &context,
            AccelerationStructureBuildType::Device,
            &[source.handle()],
            vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR,
        )
        .unwrap()[0];
        assert!(compacted > 0);
        assert!(compacted <= source.structure_size());

        let mut compact =
            BottomLevelAccelerationStructure::new(AccelerationStructureBuildType::Device);
        compact
            .create_and_copy_from(device, &context, &source, compacted, 0)
            .unwrap();
        assert_eq!(compact.structure_size(), compacted);
    }

    fn serialized_blob(
        device: &RayTracingDevice,
        context: &CommandContext,
        structure: &BottomLevelAccelerationStructure,
    ) -> SerialStorage {
        let sizes = query_acceleration_structure_sizes(
            device,
            context,
            AccelerationStructureBuildType::Device,
            &[structure.handle()],
            vk::QueryType::ACCELERATION_STRUCTURE_SERIALIZATION_SIZE_KHR,
        )
        .unwrap();
        let storage =
            SerialStorage::new(device, AccelerationStructureBuildType::Device, sizes[0]).unwrap();
        structure.serialize(device, context, &storage).unwrap();
        storage
    }

    #[test]
    fn compact_blob_deserializes_no_larger_than_the_full_one() {
        let harness = ray_tracing_harness!();
        let device = harness.device();
        let context = CommandContext::new(device).unwrap();

        let mut source =
            BottomLevelAccelerationStructure::new(AccelerationStructureBuildType::Device);
        source.set_build_flags(
            vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE
                | vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION,
        );
        source.set_geometry(&unit_triangle(), true, vk::GeometryFlagsKHR::OPAQUE);
        source.create_and_build(device, &context, 0).unwrap();

        let compacted = query_acceleration_structure_sizes(
            device,
            &context,
            AccelerationStructureBuildType::Device,
            &[source.handle()],
            vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR,
        )
        .unwrap()[0];
        let mut compact =
            BottomLevelAccelerationStructure::new(AccelerationStructureBuildType::Device);
        compact
            .create_and_copy_from(device, &context, &source, compacted, 0)
            .unwrap();

        let full_blob = serialized_blob(device, &context, &source);
        let compact_blob = serialized_blob(device, &context, &compact);
        assert!(compact_blob.deserialized_size() > 0);
        assert!(compact_blob.deserialized_size() <= full_blob.deserialized_size());
    }

    #[test]
    fn host_build_runs_through_a_deferred_operation() {
        let harness = ray_tracing_harness!();
        if !harness.host_commands {
            return;
        }
        let device = harness.device();
        let context = CommandContext::new(device).unwrap();

        let mut structure =
            BottomLevelAccelerationStructure::new(AccelerationStructureBuildType::Host);
        structure.set_deferred_operation(true, 0);
        structure.set_geometry(&unit_triangle(), true, vk::GeometryFlagsKHR::OPAQUE);
        structure.create_and_build(device, &context, 0).unwrap();
        assert!(structure.structure_size() > 0);

        let mut threaded =
            BottomLevelAccelerationStructure::new(AccelerationStructureBuildType::Host);
        threaded.set_deferred_operation(true, 2);
        threaded.set_geometry(&unit_triangle(), true, vk::GeometryFlagsKHR::OPAQUE);
        threaded.create_and_build(device, &context, 0).unwrap();
        assert!(threaded.structure_size() > 0);
    }

    #[test]
    fn build_without_geometries_produces_an_empty_structure() {
        let harness = ray_tracing_harness!();
        let device = harness.device();
        let context = CommandContext::new(device).unwrap();

        let mut structure =
            BottomLevelAccelerationStructure::new(AccelerationStructureBuildType::Device);
        structure.set_build_without_geometries(true);
        structure.set_geometry(&unit_triangle(), true, vk::GeometryFlagsKHR::OPAQUE);
        structure.create_and_build(device, &context, 0).unwrap();

        assert!(structure.structure_size() > 0);
    }

    #[test]
    fn build_without_primitives_produces_an_empty_structure() {
        let harness = ray_tracing_harness!();
        let device = harness.device();
        let context = CommandContext::new(device).unwrap();

        let mut structure =
            BottomLevelAccelerationStructure::new(AccelerationStructureBuildType::Device);
        structure.set_build_without_primitives(true);
        structure.set_geometry(&unit_triangle(), true, vk::GeometryFlagsKHR::OPAQUE);
        structure.create_and_build(device, &context, 0).unwrap();

        assert!(structure.structure_size() > 0);
    }

    #[test]
    fn create_rejects_geometry_with_size_override() {
        let harness = ray_tracing_harness!();
        let device = harness.device();

        let mut structure =
            BottomLevelAccelerationStructure::new(AccelerationStructureBuildType::Device);
        structure.set_geometry(&unit_triangle(), true, vk::GeometryFlagsKHR::OPAQUE);
        assert_should_panic!("not both", {
            let _ = structure.create(device, 128, 0);
        });
    }
}
