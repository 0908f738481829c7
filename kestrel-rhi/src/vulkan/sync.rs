use std::sync::Arc;
use std::time::Duration;
use ash::vk;
use kestrel_core::collections::SmallVec;
use kestrel_rhi_derive::DeviceObject;

use crate::backend::{downcast_native, FenceProvider, NativeEvent, NativeFence, NativeSemaphore};
use crate::error::RhiResult;
use crate::vulkan::device::{DebuggableObject, RawDevice};

#[DeviceObject(handle = fence, object_type = FENCE)]
pub(crate) struct VulkanFence {
    label: String,
    pub(crate) fence: vk::Fence,
}

impl VulkanFence {
    fn new(device: &Arc<RawDevice>, label: String) -> RhiResult<Self> {
        let info = vk::FenceCreateInfo::default();
        let fence = unsafe { device.handle().create_fence(&info, None)? };
        let fence = Self {
            label,
            fence,
            device: device.clone(),
        };
        fence.set_debug_name();
        Ok(fence)
    }
}

impl NativeFence for VulkanFence {
    fn is_signaled(&self) -> RhiResult<bool> {
        Ok(unsafe { self.device.handle().get_fence_status(self.fence)? })
    }

    fn reset(&self) -> RhiResult<()> {
        unsafe { self.device.handle().reset_fences(&[self.fence])? };
        Ok(())
    }
}

impl Drop for VulkanFence {
    fn drop(&mut self) {
        unsafe { self.device.handle().destroy_fence(self.fence, None) };
    }
}

pub(crate) struct VulkanFenceProvider {
    device: Arc<RawDevice>,
    created: std::sync::atomic::AtomicU64,
}

impl VulkanFenceProvider {
    pub(crate) fn new(device: Arc<RawDevice>) -> Self {
        Self {
            device,
            created: Default::default(),
        }
    }
}

impl FenceProvider for VulkanFenceProvider {
    fn create_fence(&self) -> RhiResult<Box<dyn NativeFence>> {
        let id = self.created.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok(Box::new(VulkanFence::new(&self.device, format!("completion fence #{id}"))?))
    }

    fn wait_any(&self, fences: &[&dyn NativeFence], timeout: Duration) -> RhiResult<bool> {
        if fences.is_empty() {
            std::thread::sleep(timeout);
            return Ok(false);
        }
        let handles = fences
            .iter()
            .map(|&fence| downcast_native::<VulkanFence>(fence.as_any(), "fence").map(|f| f.fence))
            .collect::<RhiResult<SmallVec<[vk::Fence; 16]>>>()?;
        let timeout_ns = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        match unsafe { self.device.handle().wait_for_fences(&handles, false, timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

/// Binary semaphore; signaled by one submission and consumed by the next wait.
#[DeviceObject(handle = semaphore, object_type = SEMAPHORE)]
pub(crate) struct VulkanEvent {
    label: String,
    pub(crate) semaphore: vk::Semaphore,
}

impl VulkanEvent {
    pub(crate) fn new(device: &Arc<RawDevice>, label: String) -> RhiResult<Self> {
        let info = vk::SemaphoreCreateInfo::default();
        let semaphore = unsafe { device.handle().create_semaphore(&info, None)? };
        let event = Self {
            label,
            semaphore,
            device: device.clone(),
        };
        event.set_debug_name();
        Ok(event)
    }
}

impl NativeEvent for VulkanEvent {}

impl Drop for VulkanEvent {
    fn drop(&mut self) {
        unsafe { self.device.handle().destroy_semaphore(self.semaphore, None) };
    }
}

#[DeviceObject(handle = semaphore, object_type = SEMAPHORE)]
pub(crate) struct VulkanSemaphore {
    label: String,
    pub(crate) semaphore: vk::Semaphore,
}

impl VulkanSemaphore {
    pub(crate) fn new(device: &Arc<RawDevice>, label: String) -> RhiResult<Self> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);
        let semaphore = unsafe { device.handle().create_semaphore(&info, None)? };
        let semaphore = Self {
            label,
            semaphore,
            device: device.clone(),
        };
        semaphore.set_debug_name();
        Ok(semaphore)
    }
}

impl NativeSemaphore for VulkanSemaphore {
    fn completed_value(&self) -> RhiResult<u64> {
        Ok(unsafe { self.device.handle().get_semaphore_counter_value(self.semaphore)? })
    }
}

impl Drop for VulkanSemaphore {
    fn drop(&mut self) {
        unsafe { self.device.handle().destroy_semaphore(self.semaphore, None) };
    }
}
