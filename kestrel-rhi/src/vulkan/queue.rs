use std::sync::Arc;
use ash::vk;
use parking_lot::Mutex;
use kestrel_core::collections::SmallVec;

use crate::backend::{downcast_native, NativeCommandPool, QueueBackend, QueueFamilyInfo, Submission};
use crate::error::{RhiError, RhiResult};
use crate::synchronization::SyncPoint;
use crate::vulkan::command::{VulkanCommandBuffer, VulkanCommandPool};
use crate::vulkan::device::{set_debug_name_handle, RawDevice};
use crate::vulkan::sync::{VulkanEvent, VulkanFence, VulkanSemaphore};

/// One `VkQueue`. Vulkan requires external synchronization of the queue handle, and several
/// `CommandQueue`s may share it, so submissions go through the lock.
pub(crate) struct VulkanQueue {
    device: Arc<RawDevice>,
    family: QueueFamilyInfo,
    index: u32,
    queue: Arc<Mutex<vk::Queue>>,
}

impl VulkanQueue {
    pub(crate) fn new(device: Arc<RawDevice>, family: QueueFamilyInfo, index: u32, queue: Arc<Mutex<vk::Queue>>) -> Self {
        set_debug_name_handle(&device, *queue.lock(), vk::ObjectType::QUEUE, &format!("queue {}.{index}", family.index));
        Self { device, family, index, queue }
    }
}

fn semaphore_info(point: &SyncPoint) -> RhiResult<vk::SemaphoreSubmitInfo<'static>> {
    let info = vk::SemaphoreSubmitInfo::default().stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS);
    Ok(match point {
        SyncPoint::Event(event) => {
            let event = downcast_native::<VulkanEvent>(event.native().as_any(), "event")?;
            info.semaphore(event.semaphore)
        }
        SyncPoint::Semaphore { semaphore, value } => {
            let semaphore = downcast_native::<VulkanSemaphore>(semaphore.native().as_any(), "semaphore")?;
            info.semaphore(semaphore.semaphore).value(*value)
        }
    })
}

impl QueueBackend for VulkanQueue {
    fn family(&self) -> &QueueFamilyInfo {
        &self.family
    }

    fn create_command_pool(&self) -> RhiResult<Box<dyn NativeCommandPool>> {
        let label = format!("command pool {}.{}", self.family.index, self.index);
        Ok(Box::new(VulkanCommandPool::new(&self.device, self.family.index, label)?))
    }

    #[profiling::function]
    fn submit(&self, submission: Submission<'_>) -> RhiResult<()> {
        let command_buffers = submission
            .command_buffers
            .iter()
            .map(|cb| {
                downcast_native::<VulkanCommandBuffer>((**cb).as_any(), "command buffer")
                    .map(|cb| vk::CommandBufferSubmitInfo::default().command_buffer(cb.cmd))
            })
            .collect::<RhiResult<SmallVec<[vk::CommandBufferSubmitInfo; 8]>>>()?;
        let waits = submission
            .waits
            .iter()
            .map(semaphore_info)
            .collect::<RhiResult<SmallVec<[vk::SemaphoreSubmitInfo; 4]>>>()?;
        let signals = submission
            .signals
            .iter()
            .map(semaphore_info)
            .collect::<RhiResult<SmallVec<[vk::SemaphoreSubmitInfo; 4]>>>()?;
        let fence = downcast_native::<VulkanFence>(submission.fence.as_any(), "fence")?;

        let submit_info = vk::SubmitInfo2::default()
            .command_buffer_infos(&command_buffers)
            .wait_semaphore_infos(&waits)
            .signal_semaphore_infos(&signals);

        let queue = self.queue.lock();
        unsafe { self.device.handle().queue_submit2(*queue, &[submit_info], fence.fence) }.map_err(|err| match err {
            vk::Result::ERROR_DEVICE_LOST => RhiError::DeviceLost,
            err => RhiError::Submission(format!("vkQueueSubmit2 on queue {}.{}: {err:?}", self.family.index, self.index)),
        })
    }

    fn wait_idle(&self) -> RhiResult<()> {
        let queue = self.queue.lock();
        unsafe { self.device.handle().queue_wait_idle(*queue)? };
        Ok(())
    }
}
