// Copyright (c) 2026 The vk-rtas developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Host-visible storage for serialized acceleration structures.
//!
//! A serialized blob starts with a fixed header laid out by the
//! implementation: the driver and compatibility UUIDs, the serialized and
//! deserialized sizes, then a count of bottom-level references followed by
//! one 64-bit reference per entry. The constants below mirror that layout
//! so the header can be inspected and, for cross-run replay, patched.

use super::AccelerationStructureBuildType;
use crate::{
    buffer::BufferWithMemory, device::RayTracingDevice, DeviceAddress, DeviceSize, Error,
};
use ash::vk;
use foldhash::{HashMap, HashMapExt};

/// The size and device address (or host handle) of a serialized top-level
/// structure and of every instance it referenced, in instance order.
/// Entry 0 is always the top level itself.
#[derive(Clone, Debug)]
pub struct SerialInfo {
    sizes: Vec<DeviceSize>,
    addresses: Vec<DeviceAddress>,
}

impl SerialInfo {
    pub fn new(sizes: Vec<DeviceSize>, addresses: Vec<DeviceAddress>) -> Self {
        assert!(!sizes.is_empty(), "at least the top-level entry is required");
        assert_eq!(
            sizes.len(),
            addresses.len(),
            "every serialized structure needs both a size and an address"
        );
        Self { sizes, addresses }
    }

    pub fn sizes(&self) -> &[DeviceSize] {
        &self.sizes
    }

    pub fn addresses(&self) -> &[DeviceAddress] {
        &self.addresses
    }
}

/// Maps the instance entries (`addresses[1..]`) onto distinct bottom-level
/// structures by address equality, preserving first-appearance order.
///
/// Returns the entry index of each distinct address's first appearance, and
/// for every instance entry the slot of the structure it references.
fn assign_bottom_slots(addresses: &[DeviceAddress]) -> (Vec<usize>, Vec<usize>) {
    let mut slot_by_address = HashMap::new();
    let mut first_entries = Vec::new();
    let mut instance_slots = Vec::with_capacity(addresses.len().saturating_sub(1));

    for (entry, &addr) in addresses.iter().enumerate().skip(1) {
        let next_slot = first_entries.len();
        let slot = *slot_by_address.entry(addr).or_insert_with(|| {
            first_entries.push(entry);
            next_slot
        });
        instance_slots.push(slot);
    }

    (first_entries, instance_slots)
}

/// A host-visible buffer holding one serialized acceleration structure,
/// optionally with child storages for the bottom levels a serialized top
/// level refers to.
#[derive(Debug)]
pub struct SerialStorage {
    build_type: AccelerationStructureBuildType,
    buffer: BufferWithMemory,
    storage_size: DeviceSize,
    serial_info: Option<SerialInfo>,
    instance_slots: Vec<usize>,
    bottoms: Vec<SerialStorage>,
}

impl SerialStorage {
    pub const DRIVER_UUID_OFFSET: usize = 0;
    pub const COMPATIBILITY_UUID_OFFSET: usize = 16;
    pub const SERIALIZED_SIZE_OFFSET: usize = 32;
    pub const DESERIALIZED_SIZE_OFFSET: usize = 40;
    pub const HANDLES_COUNT_OFFSET: usize = 48;
    pub const HANDLES_OFFSET: usize = 56;

    /// Smallest blob that still contains the fixed header.
    pub const SERIAL_STORAGE_SIZE_MIN: DeviceSize = Self::HANDLES_OFFSET as DeviceSize;

    /// Allocates storage for a single serialized structure.
    pub fn new(
        device: &RayTracingDevice,
        build_type: AccelerationStructureBuildType,
        storage_size: DeviceSize,
    ) -> Result<Self, Error> {
        assert!(storage_size > 0, "serialized storage must have a size");
        let buffer = BufferWithMemory::new_host_cached(
            device,
            storage_size,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        )?;

        Ok(Self {
            build_type,
            buffer,
            storage_size,
            serial_info: None,
            instance_slots: Vec::new(),
            bottoms: Vec::new(),
        })
    }

    /// Allocates storage for a serialized top level plus one child storage
    /// per distinct bottom level it referenced.
    ///
    /// Instances sharing an address in `info` share a child storage, so a
    /// deserializing run can rebuild the same sharing pattern.
    pub fn with_info(
        device: &RayTracingDevice,
        build_type: AccelerationStructureBuildType,
        info: SerialInfo,
    ) -> Result<Self, Error> {
        let mut storage = Self::new(device, build_type, info.sizes()[0])?;

        let (first_entries, instance_slots) = assign_bottom_slots(info.addresses());
        for &entry in &first_entries {
            storage
                .bottoms
                .push(Self::new(device, build_type, info.sizes()[entry])?);
        }
        storage.instance_slots = instance_slots;
        storage.serial_info = Some(info);
        Ok(storage)
    }

    pub fn build_type(&self) -> AccelerationStructureBuildType {
        self.build_type
    }

    pub fn storage_size(&self) -> DeviceSize {
        self.storage_size
    }

    pub fn serial_info(&self) -> Option<&SerialInfo> {
        self.serial_info.as_ref()
    }

    /// Child storages for the distinct bottom levels, in first-appearance
    /// order. Empty unless built with [`with_info`](Self::with_info).
    pub fn bottoms(&self) -> &[SerialStorage] {
        &self.bottoms
    }

    /// For each instance entry of the serial info, the index into
    /// [`bottoms`](Self::bottoms) of the structure it referenced.
    pub fn instance_slots(&self) -> &[usize] {
        &self.instance_slots
    }

    pub fn buffer(&self) -> &BufferWithMemory {
        &self.buffer
    }

    /// Write address for serialization, matching the storage's build type.
    pub fn address(&self, device: &RayTracingDevice) -> vk::DeviceOrHostAddressKHR {
        match self.build_type {
            AccelerationStructureBuildType::Device => vk::DeviceOrHostAddressKHR {
                device_address: self.buffer.device_address(device),
            },
            AccelerationStructureBuildType::Host => vk::DeviceOrHostAddressKHR {
                host_address: self.buffer.host_ptr(0).cast(),
            },
        }
    }

    /// Read address for deserialization.
    pub fn address_const(&self, device: &RayTracingDevice) -> vk::DeviceOrHostAddressConstKHR {
        match self.build_type {
            AccelerationStructureBuildType::Device => vk::DeviceOrHostAddressConstKHR {
                device_address: self.buffer.device_address(device),
            },
            AccelerationStructureBuildType::Host => vk::DeviceOrHostAddressConstKHR {
                host_address: self.buffer.host_ptr(0).cast_const().cast(),
            },
        }
    }

    /// Pointer into the mapped blob at `offset`, for inspecting serialized
    /// bytes directly.
    pub fn host_address(&self, offset: DeviceSize) -> *const u8 {
        assert!(offset < self.storage_size);
        self.buffer.host_ptr(offset).cast_const()
    }

    /// The structure size recorded in the blob's header. Only meaningful
    /// after something has been serialized into this storage.
    pub fn deserialized_size(&self) -> DeviceSize {
        self.read_header_u64(Self::DESERIALIZED_SIZE_OFFSET)
    }

    pub fn serialized_size(&self) -> DeviceSize {
        self.read_header_u64(Self::SERIALIZED_SIZE_OFFSET)
    }

    /// Number of bottom-level references recorded in the blob's header.
    pub fn handles_count(&self) -> u64 {
        self.read_header_u64(Self::HANDLES_COUNT_OFFSET)
    }

    pub fn handle(&self, index: usize) -> u64 {
        assert!((index as u64) < self.handles_count());
        self.read_header_u64(Self::HANDLES_OFFSET + index * 8)
    }

    /// Overwrites one bottom-level reference in the header, used to point a
    /// deserialized blob at structures rebuilt in the current run.
    pub fn set_handle(&self, index: usize, value: u64) {
        assert!((index as u64) < self.handles_count());
        let offset = Self::HANDLES_OFFSET + index * 8;
        assert!(offset as DeviceSize + 8 <= self.storage_size);
        unsafe {
            self.buffer
                .host_ptr(offset as DeviceSize)
                .cast::<u64>()
                .write_unaligned(value)
        };
    }

    fn read_header_u64(&self, offset: usize) -> u64 {
        assert!(offset as DeviceSize + 8 <= self.storage_size);
        unsafe {
            self.buffer
                .host_ptr(offset as DeviceSize)
                .cast_const()
                .cast::<u64>()
                .read_unaligned()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_info_requires_matching_lengths() {
        let info = SerialInfo::new(vec![256, 128], vec![0x1000, 0x2000]);
        assert_eq!(info.sizes(), &[256, 128]);
        assert_eq!(info.addresses(), &[0x1000, 0x2000]);
    }

    #[test]
    #[should_panic]
    fn serial_info_rejects_mismatched_lengths() {
        let _ = SerialInfo::new(vec![256], vec![0x1000, 0x2000]);
    }

    #[test]
    fn bottom_slots_deduplicate_by_address() {
        // Entry 0 is the top level; instances at 0x2000, 0x3000, 0x2000.
        let (first_entries, instance_slots) =
            assign_bottom_slots(&[0x1000, 0x2000, 0x3000, 0x2000]);
        assert_eq!(first_entries, vec![1, 2]);
        assert_eq!(instance_slots, vec![0, 1, 0]);
    }

    #[test]
    fn bottom_slots_preserve_first_appearance_order() {
        let (first_entries, instance_slots) =
            assign_bottom_slots(&[0x1000, 0x9000, 0x9000, 0x8000, 0x9000, 0x8000]);
        assert_eq!(first_entries, vec![1, 3]);
        assert_eq!(instance_slots, vec![0, 0, 1, 0, 1]);
    }

    #[test]
    fn bottom_slots_with_top_level_only() {
        let (first_entries, instance_slots) = assign_bottom_slots(&[0x1000]);
        assert!(first_entries.is_empty());
        assert!(instance_slots.is_empty());
    }
}
