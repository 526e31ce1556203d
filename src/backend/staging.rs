// Asynchronous staging uploads
//
// Each upload copies bytes into a host-visible staging buffer, records a
// one-shot GPU copy into the destination, and submits it with its own fence.
// Nothing waits on the copy: `poll` runs once per frame and releases every
// upload whose fence has signaled.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::MemoryLocation;

use super::buffer::{color_subresource_range, GpuBuffer, GpuImage};
use super::sync::{create_fence, fence_is_signaled};
use super::VulkanDevice;

/// One copy in flight
struct StagingUpload {
    buffer: GpuBuffer,
    command_buffer: vk::CommandBuffer,
    /// Signaled once the copy has finished and `buffer` may be freed
    fence: vk::Fence,
}

/// Tracker for uploads that have been submitted but not yet released
pub struct StagingUploads {
    command_pool: vk::CommandPool,
    uploads: Vec<StagingUpload>,
}

impl StagingUploads {
    pub fn new(device: &VulkanDevice) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.queue_family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);

        let command_pool = unsafe { device.device.create_command_pool(&pool_info, None) }
            .context("Failed to create staging command pool")?;

        Ok(Self {
            command_pool,
            uploads: Vec::new(),
        })
    }

    /// Number of uploads submitted but not yet reaped
    pub fn in_flight(&self) -> usize {
        self.uploads.len()
    }

    /// Queue a copy of `data` into the start of `dst`.
    ///
    /// A memory barrier makes the written range visible to `dst_stage` /
    /// `dst_access` for all later submissions on the queue.
    pub fn upload_to_buffer(
        &mut self,
        device: &VulkanDevice,
        dst: &GpuBuffer,
        data: &[u8],
        dst_stage: vk::PipelineStageFlags,
        dst_access: vk::AccessFlags,
    ) -> Result<()> {
        check_buffer_upload(data.len(), dst.size)?;
        let dst_buffer = dst.buffer;
        let size = data.len() as vk::DeviceSize;

        self.submit(device, data, |dev, cmd, src| unsafe {
            let region = vk::BufferCopy::builder().size(size).build();
            dev.cmd_copy_buffer(cmd, src, dst_buffer, &[region]);

            let barrier = vk::MemoryBarrier::builder()
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(dst_access)
                .build();
            dev.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[barrier],
                &[],
                &[],
            );
        })
    }

    /// Queue a copy of tightly packed RGBA8 texels into `dst`, leaving the
    /// image in `SHADER_READ_ONLY_OPTIMAL` for fragment shaders.
    pub fn upload_to_image(&mut self, device: &VulkanDevice, dst: &GpuImage, data: &[u8]) -> Result<()> {
        let image = dst.image;
        let extent = dst.extent;
        check_image_upload(data.len(), extent)?;
        let range = color_subresource_range();

        self.submit(device, data, |dev, cmd, src| unsafe {
            let to_transfer = vk::ImageMemoryBarrier::builder()
                .src_access_mask(vk::AccessFlags::empty())
                .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image)
                .subresource_range(range)
                .build();
            dev.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_transfer],
            );

            let region = vk::BufferImageCopy::builder()
                .buffer_offset(0)
                .buffer_row_length(0)
                .buffer_image_height(0)
                .image_subresource(vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: 1,
                })
                .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
                .image_extent(vk::Extent3D {
                    width: extent.width,
                    height: extent.height,
                    depth: 1,
                })
                .build();
            dev.cmd_copy_buffer_to_image(
                cmd,
                src,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );

            let to_shader = vk::ImageMemoryBarrier::builder()
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(vk::AccessFlags::SHADER_READ)
                .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image)
                .subresource_range(range)
                .build();
            dev.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_shader],
            );
        })
    }

    /// Fill a fresh staging buffer, record `record` into a one-shot command
    /// buffer and submit it with a new fence.
    fn submit<F>(&mut self, device: &VulkanDevice, data: &[u8], record: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer, vk::Buffer),
    {
        anyhow::ensure!(!data.is_empty(), "Nothing to upload");

        let mut buffer = GpuBuffer::new(
            device,
            "staging buffer",
            data.len() as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
        )?;

        let mut command_buffer = vk::CommandBuffer::null();
        let mut fence = vk::Fence::null();

        let result = (|| -> Result<()> {
            buffer.write(data)?;

            let alloc_info = vk::CommandBufferAllocateInfo::builder()
                .command_pool(self.command_pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);
            command_buffer = unsafe { device.device.allocate_command_buffers(&alloc_info) }
                .context("Failed to allocate staging command buffer")?[0];

            fence = create_fence(&device.device, false)?;

            let begin_info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            unsafe { device.device.begin_command_buffer(command_buffer, &begin_info) }?;
            record(&device.device, command_buffer, buffer.buffer);
            unsafe { device.device.end_command_buffer(command_buffer) }?;

            let command_buffers = [command_buffer];
            let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);
            unsafe {
                device
                    .device
                    .queue_submit(device.queue, &[submit_info.build()], fence)
            }
            .context("Failed to submit staging copy")?;

            Ok(())
        })();

        let upload = StagingUpload {
            buffer,
            command_buffer,
            fence,
        };
        if let Err(e) = result {
            // Nothing reached the queue, release immediately
            self.release(device, upload);
            return Err(e);
        }

        log::debug!(
            "Staging upload of {} bytes submitted ({} in flight)",
            data.len(),
            self.uploads.len() + 1
        );
        self.uploads.push(upload);
        Ok(())
    }

    /// Release every upload whose copy has completed. Returns how many were
    /// released.
    pub fn poll(&mut self, device: &VulkanDevice) -> Result<usize> {
        if self.uploads.is_empty() {
            return Ok(0);
        }

        let finished = take_finished(&mut self.uploads, |upload| {
            fence_is_signaled(&device.device, upload.fence)
        })?;
        let count = finished.len();

        for upload in finished {
            self.release(device, upload);
        }

        if count > 0 {
            log::debug!(
                "Reaped {} staging upload(s), {} still in flight",
                count,
                self.uploads.len()
            );
        }
        Ok(count)
    }

    fn release(&self, device: &VulkanDevice, mut upload: StagingUpload) {
        unsafe {
            if upload.fence != vk::Fence::null() {
                device.device.destroy_fence(upload.fence, None);
            }
            if upload.command_buffer != vk::CommandBuffer::null() {
                device
                    .device
                    .free_command_buffers(self.command_pool, &[upload.command_buffer]);
            }
        }
        upload.buffer.destroy(device);
    }

    /// Free everything, finished or not. The device must be idle.
    pub fn destroy(&mut self, device: &VulkanDevice) {
        if !self.uploads.is_empty() {
            log::debug!("Releasing {} staging upload(s) at shutdown", self.uploads.len());
        }
        for upload in std::mem::take(&mut self.uploads) {
            self.release(device, upload);
        }
        unsafe { device.device.destroy_command_pool(self.command_pool, None) };
        self.command_pool = vk::CommandPool::null();
    }
}

/// Byte size of a tightly packed RGBA8 image
pub(crate) fn rgba8_len(extent: vk::Extent2D) -> usize {
    extent.width as usize * extent.height as usize * 4
}

/// A buffer upload must carry data and fit in the destination
pub(crate) fn check_buffer_upload(len: usize, capacity: vk::DeviceSize) -> Result<()> {
    anyhow::ensure!(len > 0, "Nothing to upload");
    anyhow::ensure!(
        len as vk::DeviceSize <= capacity,
        "Upload of {} bytes overflows {} byte buffer",
        len,
        capacity
    );
    Ok(())
}

/// An image upload must cover the whole extent exactly
pub(crate) fn check_image_upload(len: usize, extent: vk::Extent2D) -> Result<()> {
    let expected = rgba8_len(extent);
    anyhow::ensure!(expected > 0, "Nothing to upload");
    anyhow::ensure!(
        len == expected,
        "Image {}x{} needs {} bytes, got {}",
        extent.width,
        extent.height,
        expected,
        len
    );
    Ok(())
}

/// Remove and return every item for which `is_done` answers true.
///
/// Removal swaps the last item into the hole, so the survivors' order is not
/// kept. Each remaining item is asked exactly once per call. On error the
/// items already removed are still returned to the list.
pub(crate) fn take_finished<T, F>(items: &mut Vec<T>, mut is_done: F) -> Result<Vec<T>>
where
    F: FnMut(&T) -> Result<bool>,
{
    let mut finished = Vec::new();
    let mut i = 0;
    while i < items.len() {
        match is_done(&items[i]) {
            Ok(true) => finished.push(items.swap_remove(i)),
            Ok(false) => i += 1,
            Err(e) => {
                items.append(&mut finished);
                return Err(e);
            }
        }
    }
    Ok(finished)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn nothing_finished_keeps_everything() {
        let mut items = vec![1, 2, 3];
        let finished = take_finished(&mut items, |_| Ok(false)).unwrap();
        assert!(finished.is_empty());
        assert_eq!(items, vec![1, 2, 3]);
    }

    #[test]
    fn everything_finished_empties_the_list() {
        let mut items = vec![1, 2, 3, 4];
        let mut finished = take_finished(&mut items, |_| Ok(true)).unwrap();
        finished.sort();
        assert_eq!(finished, vec![1, 2, 3, 4]);
        assert!(items.is_empty());
    }

    #[test]
    fn swapped_in_item_is_checked_too() {
        // 1 finishes, 4 is swapped into slot 0 and must be examined as well
        let mut items = vec![1, 2, 3, 4];
        let mut finished = take_finished(&mut items, |&x| Ok(x == 1 || x == 4)).unwrap();
        finished.sort();
        assert_eq!(finished, vec![1, 4]);
        let left: HashSet<_> = items.into_iter().collect();
        assert_eq!(left, HashSet::from([2, 3]));
    }

    #[test]
    fn each_item_is_polled_once() {
        let mut items: Vec<u32> = (0..10).collect();
        let mut polled = Vec::new();
        take_finished(&mut items, |&x| {
            polled.push(x);
            Ok(x % 3 == 0)
        })
        .unwrap();
        polled.sort();
        assert_eq!(polled, (0..10).collect::<Vec<_>>());
        assert_eq!(items.len(), 6);
    }

    #[test]
    fn pending_items_are_released_on_a_later_poll() {
        let mut items = vec!["vertices", "texture"];
        let mut signaled = HashSet::from(["texture"]);

        let first = take_finished(&mut items, |name| Ok(signaled.contains(name))).unwrap();
        assert_eq!(first, vec!["texture"]);
        assert_eq!(items, vec!["vertices"]);

        signaled.insert("vertices");
        let second = take_finished(&mut items, |name| Ok(signaled.contains(name))).unwrap();
        assert_eq!(second, vec!["vertices"]);
        assert!(items.is_empty());
    }

    #[test]
    fn error_keeps_all_items() {
        let mut items = vec![1, 2, 3];
        let result = take_finished(&mut items, |&x| {
            if x == 3 {
                anyhow::bail!("device lost")
            }
            Ok(x == 1)
        });
        assert!(result.is_err());
        items.sort();
        assert_eq!(items, vec![1, 2, 3]);
    }

    #[test]
    fn buffer_uploads_must_fit() {
        assert!(check_buffer_upload(36, 36).is_ok());
        assert!(check_buffer_upload(12, 36).is_ok());
        assert!(check_buffer_upload(37, 36).is_err());
        assert!(check_buffer_upload(0, 36).is_err());
    }

    #[test]
    fn image_uploads_must_cover_the_extent() {
        let extent = vk::Extent2D {
            width: 4,
            height: 2,
        };
        assert_eq!(rgba8_len(extent), 32);
        assert!(check_image_upload(32, extent).is_ok());
        assert!(check_image_upload(31, extent).is_err());
        assert!(check_image_upload(33, extent).is_err());

        let empty = vk::Extent2D {
            width: 0,
            height: 8,
        };
        assert!(check_image_upload(0, empty).is_err());
    }
}
