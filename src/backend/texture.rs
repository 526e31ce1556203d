// Sampled texture: image + sampler + the descriptor set that binds them

use anyhow::{Context, Result};
use ash::vk;

use super::buffer::GpuImage;
use super::staging::{check_image_upload, StagingUploads};
use super::VulkanDevice;

pub const TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

pub struct Texture {
    pub image: GpuImage,
    pub sampler: vk::Sampler,
    pub descriptor_set: vk::DescriptorSet,
    descriptor_pool: vk::DescriptorPool,
}

impl Texture {
    pub const fn null() -> Self {
        Self {
            image: GpuImage::null(),
            sampler: vk::Sampler::null(),
            descriptor_set: vk::DescriptorSet::null(),
            descriptor_pool: vk::DescriptorPool::null(),
        }
    }

    /// Create a texture from tightly packed RGBA8 texels.
    ///
    /// The texel upload is queued on `staging`; the descriptor set is usable
    /// right away since the copy is submitted before any draw.
    pub fn new(
        device: &VulkanDevice,
        staging: &mut StagingUploads,
        set_layout: vk::DescriptorSetLayout,
        extent: vk::Extent2D,
        texels: &[u8],
    ) -> Result<Self> {
        // Checked again by the upload, but before anything is allocated here
        check_image_upload(texels.len(), extent)?;

        let mut image = GpuImage::new(
            device,
            "texture",
            extent,
            TEXTURE_FORMAT,
            vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
        )?;

        if let Err(e) = staging.upload_to_image(device, &image, texels) {
            image.destroy(device);
            return Err(e);
        }

        let mut texture = Self {
            image,
            sampler: vk::Sampler::null(),
            descriptor_set: vk::DescriptorSet::null(),
            descriptor_pool: vk::DescriptorPool::null(),
        };

        if let Err(e) = texture.create_descriptors(device, set_layout) {
            // The texel copy may still be running
            if let Err(idle) = device.wait_idle() {
                log::error!("{:#}", idle);
            }
            texture.destroy(device);
            return Err(e);
        }

        log::info!("Created {}x{} texture", extent.width, extent.height);
        Ok(texture)
    }

    fn create_descriptors(
        &mut self,
        device: &VulkanDevice,
        set_layout: vk::DescriptorSetLayout,
    ) -> Result<()> {
        let sampler_info = sampler_info();
        self.sampler = unsafe { device.device.create_sampler(&sampler_info, None) }
            .context("Failed to create sampler")?;

        let pool_sizes = [vk::DescriptorPoolSize {
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: 1,
        }];
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(1)
            .pool_sizes(&pool_sizes);
        self.descriptor_pool = unsafe { device.device.create_descriptor_pool(&pool_info, None) }
            .context("Failed to create descriptor pool")?;

        let set_layouts = [set_layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.descriptor_pool)
            .set_layouts(&set_layouts);
        self.descriptor_set = unsafe { device.device.allocate_descriptor_sets(&alloc_info) }
            .context("Failed to allocate descriptor set")?[0];

        let image_info = [vk::DescriptorImageInfo {
            sampler: self.sampler,
            image_view: self.image.view,
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }];
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(self.descriptor_set)
            .dst_binding(0)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .image_info(&image_info)
            .build();
        unsafe { device.device.update_descriptor_sets(&[write], &[]) };

        Ok(())
    }

    pub fn destroy(&mut self, device: &VulkanDevice) {
        unsafe {
            // Destroying the pool frees the set
            if self.descriptor_pool != vk::DescriptorPool::null() {
                device.device.destroy_descriptor_pool(self.descriptor_pool, None);
                self.descriptor_pool = vk::DescriptorPool::null();
                self.descriptor_set = vk::DescriptorSet::null();
            }
            if self.sampler != vk::Sampler::null() {
                device.device.destroy_sampler(self.sampler, None);
                self.sampler = vk::Sampler::null();
            }
        }
        self.image.destroy(device);
    }
}

/// Linear filtering, repeating, single mip level
fn sampler_info() -> vk::SamplerCreateInfo {
    vk::SamplerCreateInfo::builder()
        .mag_filter(vk::Filter::LINEAR)
        .min_filter(vk::Filter::LINEAR)
        .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
        .address_mode_u(vk::SamplerAddressMode::REPEAT)
        .address_mode_v(vk::SamplerAddressMode::REPEAT)
        .address_mode_w(vk::SamplerAddressMode::REPEAT)
        .max_lod(0.0)
        .build()
}

/// RGBA8 checkerboard of `size` x `size` texels with square cells of
/// `cell` texels, starting with `a` in the top-left corner.
pub fn checkerboard(size: u32, cell: u32, a: [u8; 4], b: [u8; 4]) -> Vec<u8> {
    let cell = cell.max(1);
    let mut texels = Vec::with_capacity(size as usize * size as usize * 4);
    for y in 0..size {
        for x in 0..size {
            let even = ((x / cell) + (y / cell)) % 2 == 0;
            texels.extend_from_slice(if even { &a } else { &b });
        }
    }
    texels
}

#[cfg(test)]
mod tests {
    use super::*;

    const WHITE: [u8; 4] = [255, 255, 255, 255];
    const GREY: [u8; 4] = [96, 96, 96, 255];

    fn texel(texels: &[u8], size: u32, x: u32, y: u32) -> [u8; 4] {
        let i = ((y * size + x) * 4) as usize;
        texels[i..i + 4].try_into().unwrap()
    }

    #[test]
    fn checkerboard_size() {
        assert_eq!(checkerboard(64, 8, WHITE, GREY).len(), 64 * 64 * 4);
        assert!(checkerboard(0, 8, WHITE, GREY).is_empty());
    }

    #[test]
    fn checkerboard_alternates_per_cell() {
        let texels = checkerboard(16, 4, WHITE, GREY);
        assert_eq!(texel(&texels, 16, 0, 0), WHITE);
        assert_eq!(texel(&texels, 16, 3, 3), WHITE);
        assert_eq!(texel(&texels, 16, 4, 0), GREY);
        assert_eq!(texel(&texels, 16, 0, 4), GREY);
        assert_eq!(texel(&texels, 16, 4, 4), WHITE);
        assert_eq!(texel(&texels, 16, 15, 15), WHITE);
        assert_eq!(texel(&texels, 16, 12, 8), GREY);
        assert_eq!(texel(&texels, 16, 13, 1), GREY);
        assert_eq!(texel(&texels, 16, 13, 5), WHITE);
    }

    #[test]
    fn zero_cell_is_treated_as_one() {
        let texels = checkerboard(2, 0, WHITE, GREY);
        assert_eq!(texel(&texels, 2, 0, 0), WHITE);
        assert_eq!(texel(&texels, 2, 1, 0), GREY);
        assert_eq!(texel(&texels, 2, 0, 1), GREY);
        assert_eq!(texel(&texels, 2, 1, 1), WHITE);
    }

    #[test]
    fn sampler_filters_linearly() {
        let info = sampler_info();
        assert_eq!(info.mag_filter, vk::Filter::LINEAR);
        assert_eq!(info.min_filter, vk::Filter::LINEAR);
        assert_eq!(info.address_mode_u, vk::SamplerAddressMode::REPEAT);
        assert_eq!(info.address_mode_v, vk::SamplerAddressMode::REPEAT);
    }
}
