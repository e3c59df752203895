// Copyright (c) 2026 The vk-rtas developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

#![cfg(test)]

//! Shared setup for tests that need a real implementation.
//!
//! Tests acquire a device through [`ray_tracing_harness!`], which silently
//! returns (skipping the test body) on machines without a Vulkan loader, a
//! capable physical device or the acceleration-structure extensions.

use crate::device::RayTracingDevice;
use ash::vk;
use std::ffi::CStr;

/// Owns the instance and device a test runs against. The contained
/// [`RayTracingDevice`] is non-owning; this struct tears everything down.
pub(crate) struct TestHarness {
    _entry: ash::Entry,
    instance: ash::Instance,
    device: ash::Device,
    ray_tracing: RayTracingDevice,
    /// `accelerationStructureHostCommands` was available and enabled.
    pub(crate) host_commands: bool,
}

impl TestHarness {
    pub(crate) fn device(&self) -> &RayTracingDevice {
        &self.ray_tracing
    }
}

impl Drop for TestHarness {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

pub(crate) fn create_harness() -> Option<TestHarness> {
    let entry = unsafe { ash::Entry::load() }.ok()?;

    let app_info = vk::ApplicationInfo::default().api_version(vk::API_VERSION_1_2);
    let create_info = vk::InstanceCreateInfo::default().application_info(&app_info);
    let instance = unsafe { entry.create_instance(&create_info, None) }.ok()?;

    match create_device(&instance) {
        Some((device, ray_tracing, host_commands)) => Some(TestHarness {
            _entry: entry,
            instance,
            device,
            ray_tracing,
            host_commands,
        }),
        None => {
            unsafe { instance.destroy_instance(None) };
            None
        }
    }
}

fn create_device(instance: &ash::Instance) -> Option<(ash::Device, RayTracingDevice, bool)> {
    let required_extensions: [&CStr; 2] = [
        ash::khr::acceleration_structure::NAME,
        ash::khr::deferred_host_operations::NAME,
    ];

    for physical_device in unsafe { instance.enumerate_physical_devices() }.ok()? {
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        if properties.api_version < vk::API_VERSION_1_2 {
            continue;
        }

        let available = unsafe {
            instance.enumerate_device_extension_properties(physical_device)
        }
        .ok()?;
        let has_extension = |name: &CStr| {
            available
                .iter()
                .any(|ext| ext.extension_name_as_c_str().is_ok_and(|n| n == name))
        };
        if !required_extensions.iter().all(|&name| has_extension(name)) {
            continue;
        }

        let mut acceleration_structure =
            vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default();
        let mut buffer_device_address = vk::PhysicalDeviceBufferDeviceAddressFeatures::default();
        let mut features = vk::PhysicalDeviceFeatures2::default()
            .push_next(&mut acceleration_structure)
            .push_next(&mut buffer_device_address);
        unsafe { instance.get_physical_device_features2(physical_device, &mut features) };

        if acceleration_structure.acceleration_structure == vk::FALSE
            || buffer_device_address.buffer_device_address == vk::FALSE
        {
            continue;
        }
        let host_commands =
            acceleration_structure.acceleration_structure_host_commands == vk::TRUE;

        let queue_family_index = unsafe {
            instance.get_physical_device_queue_family_properties(physical_device)
        }
        .iter()
        .position(|family| family.queue_flags.contains(vk::QueueFlags::COMPUTE))?
            as u32;

        let priorities = [1.0];
        let queue_info = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family_index)
            .queue_priorities(&priorities);
        let extension_names: Vec<*const std::ffi::c_char> =
            required_extensions.iter().map(|name| name.as_ptr()).collect();

        let mut enable_acceleration_structure =
            vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default()
                .acceleration_structure(true)
                .acceleration_structure_host_commands(host_commands);
        let mut enable_buffer_device_address =
            vk::PhysicalDeviceBufferDeviceAddressFeatures::default().buffer_device_address(true);
        let device_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(std::slice::from_ref(&queue_info))
            .enabled_extension_names(&extension_names)
            .push_next(&mut enable_acceleration_structure)
            .push_next(&mut enable_buffer_device_address);

        let device =
            match unsafe { instance.create_device(physical_device, &device_info, None) } {
                Ok(device) => device,
                Err(_) => continue,
            };
        let queue = unsafe { device.get_device_queue(queue_family_index, 0) };
        let ray_tracing = RayTracingDevice::new(
            instance,
            physical_device,
            device.clone(),
            queue_family_index,
            queue,
        );
        return Some((device, ray_tracing, host_commands));
    }

    None
}

/// Acquires a ray-tracing capable device or returns from the test.
macro_rules! ray_tracing_harness {
    () => {{
        match crate::tests::create_harness() {
            Some(harness) => harness,
            None => return,
        }
    }};
}

macro_rules! assert_should_panic {
    ($msg:expr, $code:block) => {{
        let res = ::std::panic::catch_unwind(::std::panic::AssertUnwindSafe(|| $code));

        match res {
            Ok(_) => panic!("test expected to panic but didn't"),
            Err(err) => {
                if let Some(msg) = err.downcast_ref::<String>() {
                    assert!(msg.contains($msg));
                } else if let Some(&msg) = err.downcast_ref::<&str>() {
                    assert!(msg.contains($msg));
                } else {
                    panic!("couldn't decipher the panic message of the test")
                }
            }
        }
    }};
}
