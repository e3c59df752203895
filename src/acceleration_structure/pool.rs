// Copyright (c) 2026 The vk-rtas developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Batched creation of many bottom-level structures over shared buffers.
//!
//! Creating hundreds of small structures one by one costs one allocation per
//! buffer per structure. The pool instead sizes every member first, packs
//! their structure, scratch, vertex and index regions into a few large
//! shared buffers, and only then creates the backend objects at their
//! assigned offsets.

use super::{BottomLevelAccelerationStructure, BufferRequirements, PoolBufferSource};
use crate::{
    align_up, buffer::BufferWithMemory, command::CommandContext, device::RayTracingDevice,
    DeviceAddress, DeviceSize, Error,
};
use ash::vk;
use std::sync::Arc;

/// Minimum offset alignment for structure storage and scratch regions.
const STRUCTURE_REGION_ALIGNMENT: DeviceSize = 256;
/// Alignment for packed vertex and index regions.
const GEOMETRY_REGION_ALIGNMENT: DeviceSize = 8;

const DEFAULT_BATCH_STRUCT_COUNT: usize = 4;

/// The buffer kinds the pool packs, each with its own batch rollover.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RegionKind {
    Structure,
    Scratch,
    Vertex,
    Index,
}

impl RegionKind {
    fn alignment(self) -> DeviceSize {
        match self {
            Self::Structure | Self::Scratch => STRUCTURE_REGION_ALIGNMENT,
            Self::Vertex | Self::Index => GEOMETRY_REGION_ALIGNMENT,
        }
    }
}

/// Packs one kind's regions into consecutive batches.
///
/// A batch accepts up to `capacity` regions; the next region after a full
/// batch starts a new one at offset 0. Members whose requirement for this
/// kind is zero do not consume a slot.
#[derive(Debug)]
struct RegionPacker {
    kind: RegionKind,
    capacity: usize,
    batch_index: usize,
    count_in_batch: usize,
    offset: DeviceSize,
    /// Total bytes used in each closed or open batch.
    batch_sizes: Vec<DeviceSize>,
}

impl RegionPacker {
    fn new(kind: RegionKind, capacity: usize) -> Self {
        assert!(capacity > 0);
        Self {
            kind,
            capacity,
            batch_index: 0,
            count_in_batch: 0,
            offset: 0,
            batch_sizes: Vec::new(),
        }
    }

    fn place(&mut self, size: DeviceSize) -> (usize, DeviceSize) {
        debug_assert!(size > 0);
        if self.count_in_batch == self.capacity {
            self.batch_index += 1;
            self.count_in_batch = 0;
            self.offset = 0;
        }

        let placed = (self.batch_index, self.offset);
        self.offset += align_up(size, self.kind.alignment());
        self.count_in_batch += 1;

        if self.batch_sizes.len() <= self.batch_index {
            self.batch_sizes.push(0);
        }
        self.batch_sizes[self.batch_index] = self.offset;
        placed
    }
}

/// Where each member's regions landed, plus the size of every shared buffer
/// to allocate.
#[derive(Debug)]
struct PoolLayout {
    members: Vec<MemberLayout>,
    structure_batches: Vec<DeviceSize>,
    scratch_batches: Vec<DeviceSize>,
    vertex_batches: Vec<DeviceSize>,
    index_batches: Vec<DeviceSize>,
}

#[derive(Debug, Default)]
struct MemberLayout {
    structure: (usize, DeviceSize),
    scratch: Option<(usize, DeviceSize)>,
    vertex: Option<(usize, DeviceSize)>,
    index: Option<(usize, DeviceSize)>,
}

/// Assigns every member a region per kind it needs.
///
/// Structure and scratch regions share the `batch_struct_count` capacity;
/// vertex and index regions use `batch_geom_count`. The four kinds roll
/// over independently, so a member's regions can land in different batch
/// indices per kind.
fn compute_layout(
    requirements: &[BufferRequirements],
    batch_struct_count: usize,
    batch_geom_count: usize,
) -> PoolLayout {
    let mut structure = RegionPacker::new(RegionKind::Structure, batch_struct_count);
    let mut scratch = RegionPacker::new(RegionKind::Scratch, batch_struct_count);
    let mut vertex = RegionPacker::new(RegionKind::Vertex, batch_geom_count);
    let mut index = RegionPacker::new(RegionKind::Index, batch_geom_count);

    let members = requirements
        .iter()
        .map(|requirement| {
            assert!(requirement.structure_size > 0);
            MemberLayout {
                structure: structure.place(requirement.structure_size),
                scratch: (requirement.scratch_size > 0)
                    .then(|| scratch.place(requirement.scratch_size)),
                vertex: (requirement.vertex_size > 0)
                    .then(|| vertex.place(requirement.vertex_size)),
                index: (requirement.index_size > 0)
                    .then(|| index.place(requirement.index_size)),
            }
        })
        .collect();

    PoolLayout {
        members,
        structure_batches: structure.batch_sizes,
        scratch_batches: scratch.batch_sizes,
        vertex_batches: vertex.batch_sizes,
        index_batches: index.batch_sizes,
    }
}

/// A pool of bottom-level structures created and built as one batch.
///
/// Members are added first, then [`batch_create`] sizes all of them, packs
/// their buffer regions and creates every backend object, and
/// [`batch_build`] populates them. Both batch operations are one-shot;
/// adding after creation or creating twice is a usage bug and panics.
///
/// [`batch_create`]: Self::batch_create
/// [`batch_build`]: Self::batch_build
#[derive(Debug)]
pub struct BottomLevelAccelerationStructurePool {
    batch_struct_count: usize,
    batch_geom_count: usize,
    structures: Vec<Arc<BottomLevelAccelerationStructure>>,
    overrides: Vec<(DeviceSize, DeviceAddress)>,
    structure_buffers: Vec<Arc<BufferWithMemory>>,
    scratch_buffers: Vec<Arc<BufferWithMemory>>,
    vertex_buffers: Vec<Arc<BufferWithMemory>>,
    index_buffers: Vec<Arc<BufferWithMemory>>,
    created: bool,
    built: bool,
}

impl Default for BottomLevelAccelerationStructurePool {
    fn default() -> Self {
        Self::new()
    }
}

impl BottomLevelAccelerationStructurePool {
    pub fn new() -> Self {
        Self {
            batch_struct_count: DEFAULT_BATCH_STRUCT_COUNT,
            batch_geom_count: 0,
            structures: Vec::new(),
            overrides: Vec::new(),
            structure_buffers: Vec::new(),
            scratch_buffers: Vec::new(),
            vertex_buffers: Vec::new(),
            index_buffers: Vec::new(),
            created: false,
            built: false,
        }
    }

    /// Structure and scratch regions packed per shared buffer.
    pub fn set_batch_struct_count(&mut self, count: usize) {
        assert!(!self.created, "the pool's buffers are already laid out");
        assert!(count > 0);
        self.batch_struct_count = count;
    }

    /// Vertex and index regions packed per shared buffer. Defaults to the
    /// struct count when left at zero.
    pub fn set_batch_geom_count(&mut self, count: usize) {
        assert!(!self.created, "the pool's buffers are already laid out");
        self.batch_geom_count = count;
    }

    /// Adds a member and returns its index. The member keeps its own build
    /// settings and geometry; only its buffers come from the pool.
    pub fn add(&mut self, structure: BottomLevelAccelerationStructure) -> usize {
        self.add_with_overrides(structure, 0, 0)
    }

    /// Adds a member with an explicit structure size (a copy or deserialize
    /// target carrying no geometry) and an optional capture-replay device
    /// address for its backend handle.
    pub fn add_with_overrides(
        &mut self,
        structure: BottomLevelAccelerationStructure,
        size_override: DeviceSize,
        device_address: DeviceAddress,
    ) -> usize {
        assert!(!self.created, "members cannot be added after batch_create");
        self.structures.push(Arc::new(structure));
        self.overrides.push((size_override, device_address));
        self.structures.len() - 1
    }

    pub fn structure_count(&self) -> usize {
        self.structures.len()
    }

    pub fn structure(&self, index: usize) -> &Arc<BottomLevelAccelerationStructure> {
        &self.structures[index]
    }

    pub fn structures(&self) -> &[Arc<BottomLevelAccelerationStructure>] {
        &self.structures
    }

    /// Sizes every member, allocates the shared buffers and creates every
    /// backend object at its assigned region.
    pub fn batch_create(&mut self, device: &RayTracingDevice) -> Result<(), Error> {
        assert!(!self.created, "the pool is already created");
        self.created = true;

        let mut requirements = Vec::with_capacity(self.structures.len());
        for (structure, &(size_override, _)) in self.structures.iter_mut().zip(&self.overrides) {
            let structure = Arc::get_mut(structure).expect("pool member is shared");
            structure.compute_sizes(device, size_override)?;
            requirements.push(structure.buffer_requirements());
        }

        let geom_count = if self.batch_geom_count > 0 {
            self.batch_geom_count
        } else {
            self.batch_struct_count
        };
        let layout = compute_layout(&requirements, self.batch_struct_count, geom_count);

        for &size in &layout.structure_batches {
            self.structure_buffers
                .push(Arc::new(BufferWithMemory::new_host_cached(
                    device,
                    size,
                    vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                        | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                )?));
        }
        for &size in &layout.scratch_batches {
            self.scratch_buffers
                .push(Arc::new(BufferWithMemory::new_host(
                    device,
                    size,
                    vk::BufferUsageFlags::STORAGE_BUFFER
                        | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                )?));
        }
        for &size in &layout.vertex_batches {
            self.vertex_buffers
                .push(Arc::new(BufferWithMemory::new_host(
                    device,
                    size,
                    vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                        | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                )?));
        }
        for &size in &layout.index_batches {
            self.index_buffers
                .push(Arc::new(BufferWithMemory::new_host(
                    device,
                    size,
                    vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                        | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                )?));
        }

        for ((structure, member), &(_, device_address)) in self
            .structures
            .iter_mut()
            .zip(&layout.members)
            .zip(&self.overrides)
        {
            let source = PoolBufferSource {
                structure: (
                    self.structure_buffers[member.structure.0].clone(),
                    member.structure.1,
                ),
                scratch: member
                    .scratch
                    .map(|(batch, offset)| (self.scratch_buffers[batch].clone(), offset)),
                vertex: member
                    .vertex
                    .map(|(batch, offset)| (self.vertex_buffers[batch].clone(), offset)),
                index: member
                    .index
                    .map(|(batch, offset)| (self.index_buffers[batch].clone(), offset)),
            };

            let structure = Arc::get_mut(structure).expect("pool member is shared");
            structure.assign_pool_buffers(source);
            structure.create_handle(device, device_address)?;
        }

        Ok(())
    }

    /// Builds every member that carries geometry, in registration order.
    /// Members added with a size override are copy or deserialize targets
    /// and get populated individually. Call after
    /// [`batch_create`](Self::batch_create).
    pub fn batch_build(
        &mut self,
        device: &RayTracingDevice,
        context: &CommandContext,
    ) -> Result<(), Error> {
        assert!(self.created, "create the pool before building");
        assert!(!self.built, "the pool is already built");
        self.built = true;

        for structure in &mut self.structures {
            let structure = Arc::get_mut(structure).expect("pool member is shared");
            if structure.geometry_count() > 0 {
                structure.build(device, context)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn requirement(
        structure_size: DeviceSize,
        scratch_size: DeviceSize,
        vertex_size: DeviceSize,
        index_size: DeviceSize,
    ) -> BufferRequirements {
        BufferRequirements {
            structure_size,
            scratch_size,
            vertex_size,
            index_size,
        }
    }

    #[test]
    fn default_pool_packs_four_structures_per_batch() {
        let pool = BottomLevelAccelerationStructurePool::default();
        assert_eq!(pool.batch_struct_count, DEFAULT_BATCH_STRUCT_COUNT);
        assert_eq!(pool.batch_struct_count, 4);
    }

    #[test]
    fn regions_are_aligned_within_a_batch() {
        let layout = compute_layout(
            &[requirement(100, 60, 24, 12), requirement(100, 60, 24, 12)],
            4,
            4,
        );

        assert_eq!(layout.members[0].structure, (0, 0));
        assert_eq!(layout.members[1].structure, (0, 256));
        assert_eq!(layout.members[0].scratch, Some((0, 0)));
        assert_eq!(layout.members[1].scratch, Some((0, 256)));
        assert_eq!(layout.members[0].vertex, Some((0, 0)));
        assert_eq!(layout.members[1].vertex, Some((0, 24)));
        assert_eq!(layout.members[0].index, Some((0, 0)));
        assert_eq!(layout.members[1].index, Some((0, 16)));
        assert_eq!(layout.structure_batches, vec![512]);
        assert_eq!(layout.vertex_batches, vec![48]);
        assert_eq!(layout.index_batches, vec![32]);
    }

    #[test]
    fn batches_roll_over_at_capacity() {
        let reqs = vec![requirement(100, 60, 24, 0); 5];
        let layout = compute_layout(&reqs, 2, 2);

        let batches: Vec<usize> = layout.members.iter().map(|m| m.structure.0).collect();
        assert_eq!(batches, vec![0, 0, 1, 1, 2]);
        // A fresh batch starts packing at offset zero again.
        assert_eq!(layout.members[2].structure.1, 0);
        assert_eq!(layout.structure_batches, vec![512, 512, 256]);
    }

    #[test]
    fn kinds_roll_over_independently() {
        // Members 0 and 2 have no index data, so the index packer lags the
        // structure packer and their batch indices diverge.
        let reqs = vec![
            requirement(100, 60, 24, 0),
            requirement(100, 60, 24, 12),
            requirement(100, 60, 24, 0),
            requirement(100, 60, 24, 12),
            requirement(100, 60, 24, 12),
        ];
        let layout = compute_layout(&reqs, 2, 2);

        assert_eq!(layout.members[4].structure.0, 2);
        assert_eq!(layout.members[0].index, None);
        assert_eq!(layout.members[1].index, Some((0, 0)));
        assert_eq!(layout.members[3].index, Some((0, 16)));
        assert_eq!(layout.members[4].index, Some((1, 0)));
        assert_eq!(layout.index_batches, vec![32, 16]);
    }

    #[test]
    fn regions_in_a_batch_never_overlap() {
        let reqs = vec![
            requirement(300, 100, 40, 20),
            requirement(17, 1, 3, 2),
            requirement(1000, 512, 96, 48),
        ];
        let layout = compute_layout(&reqs, 8, 8);

        let mut previous_end = 0;
        for (member, req) in layout.members.iter().zip(&reqs) {
            let (batch, offset) = member.structure;
            assert_eq!(batch, 0);
            assert!(offset >= previous_end);
            previous_end = offset + req.structure_size;
        }
        assert!(previous_end <= layout.structure_batches[0]);
    }

    #[test]
    #[should_panic]
    fn members_require_a_structure_size() {
        let _ = compute_layout(&[requirement(0, 0, 0, 0)], 4, 4);
    }

    #[test]
    fn batch_create_and_build_many_structures() {
        let harness = ray_tracing_harness!();
        let device = harness.device();
        let context = CommandContext::new(device).unwrap();

        let mut pool = BottomLevelAccelerationStructurePool::new();
        pool.set_batch_struct_count(2);
        for index in 0..5 {
            let offset = index as f32;
            let mut structure = BottomLevelAccelerationStructure::new(
                crate::AccelerationStructureBuildType::Device,
            );
            structure.set_geometry(
                &[
                    [offset, 0.0, 0.0],
                    [offset + 1.0, 0.0, 0.0],
                    [offset, 1.0, 0.0],
                ],
                true,
                vk::GeometryFlagsKHR::OPAQUE,
            );
            assert_eq!(pool.add(structure), index);
        }

        pool.batch_create(device).unwrap();
        pool.batch_build(device, &context).unwrap();

        for structure in pool.structures() {
            assert!(structure.structure_size() > 0);
            assert_ne!(structure.device_address(device), 0);
        }
    }
}
