//! Vulkan logical device ownership and object naming.

use std::ffi::CString;
use ash::{vk, Device, Entry, Instance};

/// Instance and logical device. Every native object keeps it alive through an `Arc`, so the
/// device is destroyed only after the last object created from it.
pub(crate) struct RawDevice {
    _entry: Entry,
    instance: Instance,
    device: Device,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    debug_utils: Option<ash::ext::debug_utils::Device>,
    messenger: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
}

impl RawDevice {
    pub(crate) fn new(
        entry: Entry,
        instance: Instance,
        physical_device: vk::PhysicalDevice,
        device: Device,
        messenger: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    ) -> Self {
        let memory_properties = unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let debug_utils = messenger
            .is_some()
            .then(|| ash::ext::debug_utils::Device::new(&instance, &device));
        Self {
            _entry: entry,
            instance,
            device,
            memory_properties,
            debug_utils,
            messenger,
        }
    }

    #[inline]
    pub(crate) fn handle(&self) -> &Device {
        &self.device
    }

    #[inline]
    pub(crate) fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }
}

impl Drop for RawDevice {
    fn drop(&mut self) {
        unsafe {
            if let Err(err) = self.device.device_wait_idle() {
                log::warn!("vkDeviceWaitIdle failed before destroying the device: {err:?}");
            }
            self.device.destroy_device(None);
            if let Some((debug_utils, messenger)) = self.messenger.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
        log::debug!("vulkan device destroyed");
    }
}

#[allow(dead_code)]
pub(crate) mod sealed {
    pub trait Sealed {}
}

/// Crate-only trait for objects that keep the logical device alive for their destruction.
///
/// Implemented by `#[DeviceObject]`, which also injects the `device` field.
#[allow(dead_code)]
pub(crate) trait DeviceObject: sealed::Sealed {
    fn raw_device(&self) -> &std::sync::Arc<RawDevice>;
}

/// Objects that carry a debug name visible in capture tools and validation messages.
pub(crate) trait DebuggableObject {
    fn set_debug_name(&self);
}

/// Attach `name` to `handle` when debug utils are enabled.
pub(crate) fn set_debug_name_handle<H: vk::Handle>(device: &RawDevice, handle: H, object_type: vk::ObjectType, name: &str) {
    let Some(debug_utils) = &device.debug_utils else {
        return;
    };
    let Ok(name) = CString::new(name) else {
        log::warn!("debug name {name:?} contains NUL; not set");
        return;
    };
    let mut info = vk::DebugUtilsObjectNameInfoEXT::default()
        .object_handle(handle)
        .object_name(&name);
    info.object_type = object_type;
    if let Err(err) = unsafe { debug_utils.set_debug_utils_object_name(&info) } {
        log::debug!("failed to name {object_type:?} '{}': {err:?}", name.to_string_lossy());
    }
}

/// Find a memory type allowed by `type_filter` with all of `properties`.
pub(crate) fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..memory_properties.memory_type_count).find(|&i| {
        let memory_type = memory_properties.memory_types[i as usize];
        (type_filter & (1 << i)) != 0 && memory_type.property_flags.contains(properties)
    })
}
