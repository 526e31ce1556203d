// Buffer and image memory
//
// Every allocation goes through gpu-allocator. A resource owns its
// allocation and must be handed back with `destroy`.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;

use super::staging::StagingUploads;
use super::VulkanDevice;

/// A buffer with its backing memory
pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub size: vk::DeviceSize,
    allocation: Option<Allocation>,
}

impl GpuBuffer {
    /// Placeholder that owns nothing; `destroy` on it is a no-op
    pub const fn null() -> Self {
        Self {
            buffer: vk::Buffer::null(),
            size: 0,
            allocation: None,
        }
    }

    pub fn new(
        device: &VulkanDevice,
        name: &str,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> Result<Self> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.device.create_buffer(&buffer_info, None) }
            .with_context(|| format!("Failed to create buffer '{}'", name))?;

        let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

        let allocation = device.allocator().allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.device.destroy_buffer(buffer, None) };
                return Err(e).with_context(|| format!("Failed to allocate memory for '{}'", name));
            }
        };

        let bound = unsafe {
            device
                .device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        };
        let mut gpu_buffer = Self {
            buffer,
            size,
            allocation: Some(allocation),
        };
        if let Err(e) = bound {
            gpu_buffer.destroy(device);
            return Err(e).context("Failed to bind buffer memory");
        }

        Ok(gpu_buffer)
    }

    /// Host pointer to the memory, present when the allocator placed the
    /// buffer in host-visible memory
    pub fn mapped_slice_mut(&mut self) -> Option<&mut [u8]> {
        self.allocation.as_mut()?.mapped_slice_mut()
    }

    /// Property flags of the memory type backing the buffer
    pub fn memory_properties(&self) -> vk::MemoryPropertyFlags {
        self.allocation
            .as_ref()
            .map_or(vk::MemoryPropertyFlags::empty(), |a| a.memory_properties())
    }

    /// Copy `data` to the start of the buffer through the host mapping.
    /// Fails when the memory is not host-visible.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        let mapped = self
            .mapped_slice_mut()
            .context("Buffer memory is not host-visible")?;
        anyhow::ensure!(
            data.len() <= mapped.len(),
            "Write of {} bytes overflows {} byte buffer",
            data.len(),
            mapped.len()
        );
        mapped[..data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn destroy(&mut self, device: &VulkanDevice) {
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = device.allocator().free(allocation) {
                log::error!("Failed to free buffer memory: {}", e);
            }
            unsafe { device.device.destroy_buffer(self.buffer, None) };
            self.buffer = vk::Buffer::null();
        }
    }
}

/// How a freshly allocated buffer receives its contents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitialUpload {
    /// memcpy through the existing mapping
    Direct,
    /// GPU copy from a staging buffer
    Staged,
}

/// Host writes are only visible to the device without a flush on coherent
/// memory, anything else goes through staging.
pub fn initial_upload(mapped: bool, properties: vk::MemoryPropertyFlags) -> InitialUpload {
    let coherent = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
    if mapped && properties.contains(coherent) {
        InitialUpload::Direct
    } else {
        InitialUpload::Staged
    }
}

/// Create a device-local vertex buffer holding `data`.
///
/// When the allocator hands out host-visible, coherent memory (integrated
/// GPUs, ReBAR) the bytes are written directly. Otherwise the copy is queued on
/// `staging` and completes asynchronously; the queue submission order puts
/// it ahead of any later draw.
pub fn create_static_vertex_buffer(
    device: &VulkanDevice,
    staging: &mut StagingUploads,
    data: &[u8],
) -> Result<GpuBuffer> {
    let mut buffer = GpuBuffer::new(
        device,
        "vertex buffer",
        data.len() as vk::DeviceSize,
        vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
        MemoryLocation::GpuOnly,
    )?;

    let mapped = buffer.mapped_slice_mut().is_some();
    if initial_upload(mapped, buffer.memory_properties()) == InitialUpload::Direct {
        log::debug!("Vertex buffer is host-visible, writing directly");
        if let Err(e) = buffer.write(data) {
            buffer.destroy(device);
            return Err(e);
        }
    } else {
        log::debug!("Vertex buffer is not host-coherent, staging {} bytes", data.len());
        if let Err(e) = staging.upload_to_buffer(
            device,
            &buffer,
            data,
            vk::PipelineStageFlags::VERTEX_INPUT,
            vk::AccessFlags::VERTEX_ATTRIBUTE_READ,
        ) {
            buffer.destroy(device);
            return Err(e);
        }
    }

    Ok(buffer)
}

/// A 2D image with its backing memory and a full view
pub struct GpuImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub extent: vk::Extent2D,
    allocation: Option<Allocation>,
}

impl GpuImage {
    /// Placeholder that owns nothing; `destroy` on it is a no-op
    pub const fn null() -> Self {
        Self {
            image: vk::Image::null(),
            view: vk::ImageView::null(),
            extent: vk::Extent2D {
                width: 0,
                height: 0,
            },
            allocation: None,
        }
    }

    pub fn new(
        device: &VulkanDevice,
        name: &str,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
    ) -> Result<Self> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(usage)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image = unsafe { device.device.create_image(&image_info, None) }
            .with_context(|| format!("Failed to create image '{}'", name))?;

        let requirements = unsafe { device.device.get_image_memory_requirements(image) };

        let allocation = device.allocator().allocate(&AllocationCreateDesc {
            name,
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.device.destroy_image(image, None) };
                return Err(e).with_context(|| format!("Failed to allocate memory for '{}'", name));
            }
        };

        let mut gpu_image = Self {
            image,
            view: vk::ImageView::null(),
            extent,
            allocation: Some(allocation),
        };

        let bound = match &gpu_image.allocation {
            Some(allocation) => unsafe {
                device
                    .device
                    .bind_image_memory(image, allocation.memory(), allocation.offset())
            },
            None => Ok(()),
        };
        if let Err(e) = bound {
            gpu_image.destroy(device);
            return Err(e).context("Failed to bind image memory");
        }

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(color_subresource_range());

        match unsafe { device.device.create_image_view(&view_info, None) } {
            Ok(view) => gpu_image.view = view,
            Err(e) => {
                gpu_image.destroy(device);
                return Err(e).context("Failed to create image view");
            }
        }

        Ok(gpu_image)
    }

    pub fn destroy(&mut self, device: &VulkanDevice) {
        if let Some(allocation) = self.allocation.take() {
            unsafe {
                if self.view != vk::ImageView::null() {
                    device.device.destroy_image_view(self.view, None);
                }
            }
            if let Err(e) = device.allocator().free(allocation) {
                log::error!("Failed to free image memory: {}", e);
            }
            unsafe { device.device.destroy_image(self.image, None) };
            self.view = vk::ImageView::null();
            self.image = vk::Image::null();
        }
    }
}

/// Single mip, single layer color range
pub fn color_subresource_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEVICE_LOCAL: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
    const HOST_VISIBLE: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::HOST_VISIBLE;
    const HOST_COHERENT: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::HOST_COHERENT;

    #[test]
    fn coherent_mapped_memory_is_written_directly() {
        let props = DEVICE_LOCAL | HOST_VISIBLE | HOST_COHERENT;
        assert_eq!(initial_upload(true, props), InitialUpload::Direct);
    }

    #[test]
    fn non_coherent_mapped_memory_is_staged() {
        let props = DEVICE_LOCAL | HOST_VISIBLE;
        assert_eq!(initial_upload(true, props), InitialUpload::Staged);
    }

    #[test]
    fn device_only_memory_is_staged() {
        assert_eq!(initial_upload(false, DEVICE_LOCAL), InitialUpload::Staged);
        // Coherent flags without a mapping still need a copy
        assert_eq!(
            initial_upload(false, DEVICE_LOCAL | HOST_VISIBLE | HOST_COHERENT),
            InitialUpload::Staged
        );
    }
}
