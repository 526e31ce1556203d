// Synchronization primitives
//
// Fences and semaphores for GPU-CPU and GPU-GPU sync.
// A fence is only reset or destroyed after it has been seen signaled.

use anyhow::{Context, Result};
use ash::vk;

/// Synchronization for one swapchain image
pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub work_finished: vk::Fence,
}

impl FrameSync {
    pub fn new(device: &ash::Device) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();

        unsafe {
            Ok(Self {
                image_available: device.create_semaphore(&semaphore_info, None)?,
                render_finished: device.create_semaphore(&semaphore_info, None)?,
                // Start signaled so the first wait on each image returns at once
                work_finished: create_fence(device, true)?,
            })
        }
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_semaphore(self.image_available, None);
            device.destroy_semaphore(self.render_finished, None);
            device.destroy_fence(self.work_finished, None);
        }
    }
}

pub fn create_fence(device: &ash::Device, signaled: bool) -> Result<vk::Fence> {
    let flags = if signaled {
        vk::FenceCreateFlags::SIGNALED
    } else {
        vk::FenceCreateFlags::empty()
    };
    let fence_info = vk::FenceCreateInfo::builder().flags(flags);
    unsafe { device.create_fence(&fence_info, None) }.context("Failed to create fence")
}

/// Non-blocking check of a fence.
pub fn fence_is_signaled(device: &ash::Device, fence: vk::Fence) -> Result<bool> {
    match unsafe { device.wait_for_fences(&[fence], true, 0) } {
        Ok(()) => Ok(true),
        Err(vk::Result::TIMEOUT) => Ok(false),
        Err(e) => Err(e).context("Failed to poll fence"),
    }
}
