// Copyright (c) 2026 The vk-rtas developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Typed triangle and bounding-box geometry for bottom-level builds.
//!
//! Geometry is accepted as `[f32; 3]` positions and re-encoded into the
//! vertex format the structure will be built with, so one scene definition
//! can exercise every format the implementation supports. Vertices are
//! stored pre-packed in the exact byte layout handed to the build, including
//! any requested inter-vertex padding.

use crate::{Error, NotSupportedError};
use ash::vk;
use half::f16;

/// Vertex formats accepted for triangle geometry.
///
/// The three-component 32-bit float format is additionally the only format
/// valid for AABB geometry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum VertexFormat {
    R32G32Sfloat,
    R32G32B32Sfloat,
    R32G32B32A32Sfloat,
    R16G16Sfloat,
    R16G16B16Sfloat,
    R16G16B16A16Sfloat,
    R16G16Snorm,
    R16G16B16Snorm,
    R16G16B16A16Snorm,
    R64G64Sfloat,
    R64G64B64Sfloat,
    R64G64B64A64Sfloat,
    R8G8Snorm,
    R8G8B8Snorm,
    R8G8B8A8Snorm,
}

impl VertexFormat {
    pub fn to_vk(self) -> vk::Format {
        match self {
            Self::R32G32Sfloat => vk::Format::R32G32_SFLOAT,
            Self::R32G32B32Sfloat => vk::Format::R32G32B32_SFLOAT,
            Self::R32G32B32A32Sfloat => vk::Format::R32G32B32A32_SFLOAT,
            Self::R16G16Sfloat => vk::Format::R16G16_SFLOAT,
            Self::R16G16B16Sfloat => vk::Format::R16G16B16_SFLOAT,
            Self::R16G16B16A16Sfloat => vk::Format::R16G16B16A16_SFLOAT,
            Self::R16G16Snorm => vk::Format::R16G16_SNORM,
            Self::R16G16B16Snorm => vk::Format::R16G16B16_SNORM,
            Self::R16G16B16A16Snorm => vk::Format::R16G16B16A16_SNORM,
            Self::R64G64Sfloat => vk::Format::R64G64_SFLOAT,
            Self::R64G64B64Sfloat => vk::Format::R64G64B64_SFLOAT,
            Self::R64G64B64A64Sfloat => vk::Format::R64G64B64A64_SFLOAT,
            Self::R8G8Snorm => vk::Format::R8G8_SNORM,
            Self::R8G8B8Snorm => vk::Format::R8G8B8_SNORM,
            Self::R8G8B8A8Snorm => vk::Format::R8G8B8A8_SNORM,
        }
    }

    pub fn component_count(self) -> usize {
        match self {
            Self::R32G32Sfloat
            | Self::R16G16Sfloat
            | Self::R16G16Snorm
            | Self::R64G64Sfloat
            | Self::R8G8Snorm => 2,
            Self::R32G32B32Sfloat
            | Self::R16G16B16Sfloat
            | Self::R16G16B16Snorm
            | Self::R64G64B64Sfloat
            | Self::R8G8B8Snorm => 3,
            Self::R32G32B32A32Sfloat
            | Self::R16G16B16A16Sfloat
            | Self::R16G16B16A16Snorm
            | Self::R64G64B64A64Sfloat
            | Self::R8G8B8A8Snorm => 4,
        }
    }

    pub fn component_size(self) -> usize {
        match self {
            Self::R8G8Snorm | Self::R8G8B8Snorm | Self::R8G8B8A8Snorm => 1,
            Self::R16G16Sfloat
            | Self::R16G16B16Sfloat
            | Self::R16G16B16A16Sfloat
            | Self::R16G16Snorm
            | Self::R16G16B16Snorm
            | Self::R16G16B16A16Snorm => 2,
            Self::R32G32Sfloat | Self::R32G32B32Sfloat | Self::R32G32B32A32Sfloat => 4,
            Self::R64G64Sfloat | Self::R64G64B64Sfloat | Self::R64G64B64A64Sfloat => 8,
        }
    }

    /// Size in bytes of one encoded vertex.
    pub fn vertex_size(self) -> usize {
        self.component_count() * self.component_size()
    }

    /// Whether acceleration-structure vertex-buffer use of this format is
    /// mandatory for every conformant implementation.
    pub fn is_mandatory(self) -> bool {
        matches!(
            self,
            Self::R32G32Sfloat
                | Self::R32G32B32Sfloat
                | Self::R16G16Sfloat
                | Self::R16G16B16A16Sfloat
                | Self::R16G16Snorm
                | Self::R16G16B16A16Snorm
        )
    }

    /// Encodes one position into this format, appending to `out`.
    ///
    /// Components beyond the third are written as zero; components beyond
    /// the format's width are dropped.
    fn encode(self, vertex: [f32; 3], out: &mut Vec<u8>) {
        let components = self.component_count();
        let padded = [vertex[0], vertex[1], vertex[2], 0.0];

        for &component in &padded[..components] {
            match self.component_size() {
                1 => out.push(f32_to_snorm8(component) as u8),
                2 if self.is_snorm() => {
                    out.extend_from_slice(&f32_to_snorm16(component).to_ne_bytes())
                }
                2 => out.extend_from_slice(&f16::from_f32(component).to_ne_bytes()),
                4 => out.extend_from_slice(&component.to_ne_bytes()),
                8 => out.extend_from_slice(&f64::from(component).to_ne_bytes()),
                _ => unreachable!(),
            }
        }
    }

    fn is_snorm(self) -> bool {
        matches!(
            self,
            Self::R16G16Snorm
                | Self::R16G16B16Snorm
                | Self::R16G16B16A16Snorm
                | Self::R8G8Snorm
                | Self::R8G8B8Snorm
                | Self::R8G8B8A8Snorm
        )
    }
}

/// Converts a float in [-1, 1] to a signed normalized integer, rounding to
/// nearest-even and saturating. The result is clamped to the symmetric range
/// `[-MAX, MAX]`, never `MIN`.
fn f32_to_snorm16(value: f32) -> i16 {
    let range = i16::MAX as f32;
    (value * range).round_ties_even().clamp(-range, range) as i16
}

fn f32_to_snorm8(value: f32) -> i8 {
    let range = i8::MAX as f32;
    (value * range).round_ties_even().clamp(-range, range) as i8
}

/// Index element type of a triangle geometry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IndexType {
    /// Unindexed geometry: every three consecutive vertices form a triangle.
    None,
    Uint16,
    Uint32,
}

impl IndexType {
    pub fn to_vk(self) -> vk::IndexType {
        match self {
            Self::None => vk::IndexType::NONE_KHR,
            Self::Uint16 => vk::IndexType::UINT16,
            Self::Uint32 => vk::IndexType::UINT32,
        }
    }

    /// Size in bytes of one index, or 0 for unindexed geometry.
    pub fn index_size(self) -> usize {
        match self {
            Self::None => 0,
            Self::Uint16 => 2,
            Self::Uint32 => 4,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GeometryType {
    Triangles,
    Aabbs,
}

/// AABB vertex pairs sit before their padding in blocks that are multiples
/// of this base size.
const AABB_PAD_BASE_SIZE: usize = 8;

/// One piece of geometry destined for a bottom-level acceleration structure.
///
/// Vertices are stored pre-encoded in `vertex_format`. For triangles, each
/// vertex occupies one block of `vertex_size * (1 + padding_blocks)` bytes.
/// For AABBs, vertices are stored in min/max pairs followed by
/// `padding_blocks * 8` bytes of padding, and the stride reported to the
/// build covers the whole block.
#[derive(Clone, Debug)]
pub struct GeometryData {
    geometry_type: GeometryType,
    vertex_format: VertexFormat,
    index_type: IndexType,
    flags: vk::GeometryFlagsKHR,
    padding_blocks: usize,
    vertex_count: usize,
    vertices: Vec<u8>,
    index_count: usize,
    indices: Vec<u8>,
}

impl GeometryData {
    /// Creates empty geometry.
    ///
    /// Panics if `geometry_type` is [`GeometryType::Aabbs`] and
    /// `vertex_format` is not [`VertexFormat::R32G32B32Sfloat`], the only
    /// format valid for AABB data.
    pub fn new(
        geometry_type: GeometryType,
        vertex_format: VertexFormat,
        index_type: IndexType,
    ) -> Self {
        Self::with_padding(geometry_type, vertex_format, index_type, 0)
    }

    /// Like [`new`](Self::new), with `padding_blocks` blocks of zero padding
    /// between vertices (triangles) or vertex pairs (AABBs).
    pub fn with_padding(
        geometry_type: GeometryType,
        vertex_format: VertexFormat,
        index_type: IndexType,
        padding_blocks: usize,
    ) -> Self {
        if geometry_type == GeometryType::Aabbs {
            assert_eq!(
                vertex_format,
                VertexFormat::R32G32B32Sfloat,
                "AABB geometry requires the R32G32B32_SFLOAT vertex format"
            );
            assert_eq!(
                index_type,
                IndexType::None,
                "AABB geometry cannot be indexed"
            );
        }

        Self {
            geometry_type,
            vertex_format,
            index_type,
            flags: vk::GeometryFlagsKHR::empty(),
            padding_blocks,
            vertex_count: 0,
            vertices: Vec::new(),
            index_count: 0,
            indices: Vec::new(),
        }
    }

    /// Unindexed triangle geometry from a flat vertex list.
    ///
    /// Panics unless the vertex count is a multiple of 3.
    pub fn triangles(vertices: &[[f32; 3]], flags: vk::GeometryFlagsKHR) -> Self {
        assert!(
            vertices.len() % 3 == 0,
            "triangle vertex count must be a multiple of 3"
        );

        let mut geometry = Self::new(
            GeometryType::Triangles,
            VertexFormat::R32G32B32Sfloat,
            IndexType::None,
        );
        geometry.flags = flags;
        for &vertex in vertices {
            geometry.add_vertex(vertex);
        }
        geometry
    }

    /// AABB geometry from a flat list of (min, max) corner pairs.
    ///
    /// Panics unless the vertex count is even and every pair satisfies
    /// min ≤ max on all three axes.
    pub fn aabbs(corners: &[[f32; 3]], flags: vk::GeometryFlagsKHR) -> Self {
        assert!(
            corners.len() % 2 == 0,
            "AABB corner count must be a multiple of 2"
        );
        for pair in corners.chunks_exact(2) {
            for axis in 0..3 {
                assert!(
                    pair[0][axis] <= pair[1][axis],
                    "AABB min corner must not exceed max corner"
                );
            }
        }

        let mut geometry = Self::new(
            GeometryType::Aabbs,
            VertexFormat::R32G32B32Sfloat,
            IndexType::None,
        );
        geometry.flags = flags;
        for &corner in corners {
            geometry.add_vertex(corner);
        }
        geometry
    }

    pub fn add_vertex(&mut self, vertex: [f32; 3]) {
        let block_size = self.block_size();

        match self.geometry_type {
            GeometryType::Triangles => {
                let offset = self.vertices.len();
                self.vertex_format.encode(vertex, &mut self.vertices);
                self.vertices.resize(offset + block_size, 0);
            }
            GeometryType::Aabbs => {
                if self.vertex_count % 2 == 0 {
                    let offset = self.vertices.len();
                    self.vertex_format.encode(vertex, &mut self.vertices);
                    self.vertices.resize(offset + block_size, 0);
                } else {
                    // Second corner goes right after the first, inside the
                    // block opened by the previous vertex.
                    let vertex_size = self.vertex_format.vertex_size();
                    let offset = self.vertices.len() - block_size + vertex_size;
                    let mut encoded = Vec::with_capacity(vertex_size);
                    self.vertex_format.encode(vertex, &mut encoded);
                    self.vertices[offset..offset + vertex_size].copy_from_slice(&encoded);
                }
            }
        }

        self.vertex_count += 1;
    }

    /// Appends one index, encoded in the geometry's index type.
    ///
    /// Panics for unindexed geometry.
    pub fn add_index(&mut self, index: u32) {
        match self.index_type {
            IndexType::None => panic!("cannot add an index to unindexed geometry"),
            IndexType::Uint16 => self.indices.extend_from_slice(&(index as u16).to_ne_bytes()),
            IndexType::Uint32 => self.indices.extend_from_slice(&index.to_ne_bytes()),
        }
        self.index_count += 1;
    }

    pub fn set_flags(&mut self, flags: vk::GeometryFlagsKHR) {
        self.flags = flags;
    }

    fn block_size(&self) -> usize {
        let vertex_size = self.vertex_format.vertex_size();
        match self.geometry_type {
            GeometryType::Triangles => vertex_size * (1 + self.padding_blocks),
            GeometryType::Aabbs => 2 * vertex_size + self.padding_blocks * AABB_PAD_BASE_SIZE,
        }
    }

    pub fn geometry_type(&self) -> GeometryType {
        self.geometry_type
    }

    pub fn is_triangles(&self) -> bool {
        self.geometry_type == GeometryType::Triangles
    }

    pub fn vertex_format(&self) -> VertexFormat {
        self.vertex_format
    }

    pub fn index_type(&self) -> IndexType {
        self.index_type
    }

    pub fn flags(&self) -> vk::GeometryFlagsKHR {
        self.flags
    }

    pub fn vertex_count(&self) -> u32 {
        self.vertex_count as u32
    }

    /// Distance in bytes between consecutive triangle vertices, or 0 for
    /// AABB geometry.
    pub fn vertex_stride(&self) -> vk::DeviceSize {
        if self.is_triangles() {
            self.block_size() as vk::DeviceSize
        } else {
            0
        }
    }

    /// Distance in bytes between consecutive AABB records, or 0 for
    /// triangle geometry.
    pub fn aabb_stride(&self) -> vk::DeviceSize {
        if self.is_triangles() {
            0
        } else {
            self.block_size() as vk::DeviceSize
        }
    }

    pub fn vertex_data(&self) -> &[u8] {
        &self.vertices
    }

    pub fn index_count(&self) -> u32 {
        if self.is_triangles() {
            self.index_count as u32
        } else {
            0
        }
    }

    pub fn uses_indices(&self) -> bool {
        self.index_type != IndexType::None && self.index_count > 0
    }

    pub fn index_data(&self) -> &[u8] {
        &self.indices
    }

    pub fn index_stride(&self) -> vk::DeviceSize {
        self.index_type.index_size() as vk::DeviceSize
    }

    /// Number of primitives the build will consume: triangles from indices
    /// or vertices, or min/max pairs for AABBs.
    pub fn primitive_count(&self) -> u32 {
        let count = match self.geometry_type {
            GeometryType::Triangles => {
                if self.uses_indices() {
                    self.index_count / 3
                } else {
                    self.vertex_count / 3
                }
            }
            GeometryType::Aabbs => self.vertex_count / 2,
        };
        count as u32
    }
}

/// Checks that `format` can feed acceleration-structure vertex buffers on
/// this physical device.
///
/// An unsupported optional format is reported as [`Error::NotSupported`] so
/// the caller can skip; a missing mandatory format panics, since conformant
/// implementations must provide it.
pub fn check_vertex_format_support(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    format: VertexFormat,
) -> Result<(), Error> {
    let properties =
        unsafe { instance.get_physical_device_format_properties(physical_device, format.to_vk()) };

    if !properties
        .buffer_features
        .contains(vk::FormatFeatureFlags::ACCELERATION_STRUCTURE_VERTEX_BUFFER_KHR)
    {
        assert!(
            !format.is_mandatory(),
            "implementation is missing a mandatory acceleration structure vertex format"
        );
        return Err(NotSupportedError {
            reason: "format not supported for acceleration structure vertex buffers",
        }
        .into());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snorm_conversion_rounds_to_even_and_saturates() {
        assert_eq!(f32_to_snorm16(1.0), i16::MAX);
        assert_eq!(f32_to_snorm16(-1.0), -i16::MAX);
        assert_eq!(f32_to_snorm16(0.0), 0);
        assert_eq!(f32_to_snorm16(2.0), i16::MAX);
        assert_eq!(f32_to_snorm16(-2.0), -i16::MAX);
        assert_eq!(f32_to_snorm8(1.0), i8::MAX);
        assert_eq!(f32_to_snorm8(-1.0), -i8::MAX);

        // 0.5 scaled by 127 is 63.5, which rounds to the even 64.
        assert_eq!(f32_to_snorm8(0.5), 64);
    }

    #[test]
    fn triangle_vertices_pack_with_padding_blocks() {
        let mut geometry = GeometryData::with_padding(
            GeometryType::Triangles,
            VertexFormat::R32G32B32Sfloat,
            IndexType::None,
            1,
        );
        for vertex in [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]] {
            geometry.add_vertex(vertex);
        }

        // One vertex-sized padding block doubles the stride.
        assert_eq!(geometry.vertex_stride(), 24);
        assert_eq!(geometry.vertex_data().len(), 3 * 24);
        assert_eq!(geometry.primitive_count(), 1);

        // Padding bytes are zeroed.
        assert!(geometry.vertex_data()[12..24].iter().all(|&b| b == 0));
    }

    #[test]
    fn aabb_pairs_share_a_block() {
        let corners = [[0.0, 0.0, 0.0], [1.0, 1.0, 1.0], [2.0, 2.0, 2.0], [3.0, 3.0, 3.0]];
        let geometry = GeometryData::aabbs(&corners, vk::GeometryFlagsKHR::empty());

        assert_eq!(geometry.aabb_stride(), 24);
        assert_eq!(geometry.vertex_stride(), 0);
        assert_eq!(geometry.vertex_data().len(), 2 * 24);
        assert_eq!(geometry.primitive_count(), 2);

        let second = &geometry.vertex_data()[12..24];
        let expected: Vec<u8> = [1.0f32, 1.0, 1.0]
            .iter()
            .flat_map(|f| f.to_ne_bytes())
            .collect();
        assert_eq!(second, &expected[..]);
    }

    #[test]
    #[should_panic(expected = "min corner")]
    fn aabb_with_inverted_corners_is_rejected() {
        let corners = [[1.0, 0.0, 0.0], [0.0, 1.0, 1.0]];
        let _ = GeometryData::aabbs(&corners, vk::GeometryFlagsKHR::empty());
    }

    #[test]
    #[should_panic(expected = "multiple of 3")]
    fn partial_triangle_is_rejected() {
        let _ = GeometryData::triangles(&[[0.0; 3]; 4], vk::GeometryFlagsKHR::empty());
    }

    #[test]
    fn half_float_vertices_encode_at_half_width() {
        let mut geometry = GeometryData::new(
            GeometryType::Triangles,
            VertexFormat::R16G16B16A16Sfloat,
            IndexType::Uint16,
        );
        geometry.add_vertex([1.0, -1.0, 0.5]);
        for index in [0, 0, 0] {
            geometry.add_index(index);
        }

        assert_eq!(geometry.vertex_stride(), 8);
        let data = geometry.vertex_data();
        assert_eq!(data.len(), 8);
        assert_eq!(f16::from_ne_bytes([data[0], data[1]]), f16::from_f32(1.0));
        assert_eq!(f16::from_ne_bytes([data[2], data[3]]), f16::from_f32(-1.0));
        assert_eq!(f16::from_ne_bytes([data[6], data[7]]), f16::from_f32(0.0));

        assert_eq!(geometry.index_count(), 3);
        assert_eq!(geometry.index_stride(), 2);
        assert_eq!(geometry.primitive_count(), 1);
    }

    #[test]
    fn unindexed_primitive_count_comes_from_vertices() {
        let vertices = [[0.0f32; 3]; 6];
        let geometry = GeometryData::triangles(&vertices, vk::GeometryFlagsKHR::empty());
        assert_eq!(geometry.primitive_count(), 2);
        assert_eq!(geometry.vertex_count(), 6);
        assert!(!geometry.uses_indices());
    }
}
