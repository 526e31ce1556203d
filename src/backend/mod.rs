// Backend module - Vulkan abstraction layer
//
// Thin wrappers around ash: each type owns its handles and is torn down
// explicitly, in reverse order of creation.

pub mod buffer;
pub mod device;
pub mod pipeline;
pub mod shader;
pub mod staging;
pub mod swapchain;
pub mod sync;
pub mod texture;

pub use device::VulkanDevice;
pub use swapchain::Swapchain;
