// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation with window-system extensions and validation layers
// - Window surface creation
// - Physical device selection (scored, see `device_score`)
// - Logical device + single graphics/present queue
// - Memory allocator setup

use anyhow::{Context, Result};
use ash::extensions::{ext::DebugUtils, khr::Surface};
use ash::{vk, Entry};
use parking_lot::{Mutex, MutexGuard};
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use std::ffi::{CStr, CString};
use std::mem::ManuallyDrop;
use std::sync::Arc;
use winit::window::Window;

/// Vulkan version the instance and allocator target
pub const API_VERSION: u32 = vk::API_VERSION_1_1;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    // Dropped by hand before the device, see Drop
    allocator: ManuallyDrop<Mutex<gpu_allocator::vulkan::Allocator>>,
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub surface: vk::SurfaceKHR,
    pub surface_loader: Surface,
    pub instance: ash::Instance,
    _entry: Entry,

    // Queue handles
    pub queue: vk::Queue,
    pub queue_family: u32,

    // Debug utils (if validation enabled)
    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
}

impl VulkanDevice {
    /// Create the instance, the window surface, and the logical device
    ///
    /// # Arguments
    /// * `app_name` - Application name reported to the driver
    /// * `window` - Window the surface is created for
    /// * `enable_validation` - Enable Vulkan validation layers
    pub fn new(app_name: &str, window: &Window, enable_validation: bool) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan device: {}", app_name);

        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        let display_handle = window.raw_display_handle();
        let window_handle = window.raw_window_handle();

        let instance = Self::create_instance(&entry, app_name, display_handle, enable_validation)?;

        let debug_utils = if enable_validation {
            Some(Self::setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        let surface_loader = Surface::new(&entry, &instance);
        let surface = unsafe {
            ash_window::create_surface(&entry, &instance, display_handle, window_handle, None)
        }
        .context("Failed to create window surface")?;

        let (physical_device, queue_family) =
            Self::pick_physical_device(&instance, &surface_loader, surface)?;

        let (device, queue) = Self::create_logical_device(&instance, physical_device, queue_family)?;

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        log::info!(
            "Selected GPU: {} ({:?}, {} MiB device-local)",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy(),
            properties.device_type,
            device_local_kib(&memory_properties) >> 10
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );

        let allocator = Self::create_allocator(&instance, physical_device, &device)?;

        Ok(Arc::new(Self {
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            device,
            physical_device,
            surface,
            surface_loader,
            instance,
            _entry: entry,
            queue,
            queue_family,
            debug_utils,
        }))
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        display_handle: raw_window_handle::RawDisplayHandle,
        enable_validation: bool,
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name)?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(0)
            .engine_name(c"")
            .engine_version(0)
            .api_version(API_VERSION);

        let mut extensions = ash_window::enumerate_required_extensions(display_handle)
            .context("Window system has no Vulkan surface support")?
            .to_vec();

        let layer_names = if enable_validation {
            extensions.push(DebugUtils::name().as_ptr());
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")?;

        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(DEBUG_SEVERITIES)
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .context("Failed to create debug messenger")?;

        Ok((debug_utils, messenger))
    }

    /// Pick the highest scoring device that can draw to and present on `surface`.
    fn pick_physical_device(
        instance: &ash::Instance,
        surface_loader: &Surface,
        surface: vk::SurfaceKHR,
    ) -> Result<(vk::PhysicalDevice, u32)> {
        let devices = unsafe { instance.enumerate_physical_devices() }?;

        if devices.is_empty() {
            anyhow::bail!("No Vulkan-capable GPU found");
        }

        let mut best_device = None;
        let mut best_score = 0;

        for device in devices {
            let props = unsafe { instance.get_physical_device_properties(device) };
            let mem_props = unsafe { instance.get_physical_device_memory_properties(device) };
            let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }.to_string_lossy();

            let Some(queue_family) =
                Self::find_queue_family(instance, surface_loader, surface, device)?
            else {
                log::debug!("Skipping {}: no graphics queue that can present", name);
                continue;
            };

            let score = device_score(props.device_type, &mem_props);
            log::debug!("Candidate GPU {} scored {:#x}", name, score);

            // Strictly greater: ties keep the first enumerated device
            if score > best_score {
                best_score = score;
                best_device = Some((device, queue_family));
            }
        }

        best_device.context("No suitable GPU found")
    }

    /// First queue family that supports graphics and presenting to `surface`
    fn find_queue_family(
        instance: &ash::Instance,
        surface_loader: &Surface,
        surface: vk::SurfaceKHR,
        device: vk::PhysicalDevice,
    ) -> Result<Option<u32>> {
        let families = unsafe { instance.get_physical_device_queue_family_properties(device) };

        for (index, family) in families.iter().enumerate() {
            let index = index as u32;
            if !family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
                continue;
            }
            let can_present = unsafe {
                surface_loader.get_physical_device_surface_support(device, index, surface)
            }
            .context("Failed to query surface support")?;
            if can_present {
                return Ok(Some(index));
            }
        }

        Ok(None)
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        queue_family: u32,
    ) -> Result<(ash::Device, vk::Queue)> {
        let queue_priorities = [0.0];
        let queue_create_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(queue_family)
            .queue_priorities(&queue_priorities)
            .build();

        let extensions = [ash::extensions::khr::Swapchain::name().as_ptr()];

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(std::slice::from_ref(&queue_create_info))
            .enabled_extension_names(&extensions);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .context("Failed to create logical device")?;

        let queue = unsafe { device.get_device_queue(queue_family, 0) };

        Ok((device, queue))
    }

    fn create_allocator(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: &ash::Device,
    ) -> Result<gpu_allocator::vulkan::Allocator> {
        let allocator =
            gpu_allocator::vulkan::Allocator::new(&gpu_allocator::vulkan::AllocatorCreateDesc {
                instance: instance.clone(),
                device: device.clone(),
                physical_device,
                debug_settings: Default::default(),
                buffer_device_address: false,
                allocation_sizes: Default::default(),
            })
            .context("Failed to create memory allocator")?;

        Ok(allocator)
    }

    /// Exclusive access to the memory allocator
    pub fn allocator(&self) -> MutexGuard<'_, gpu_allocator::vulkan::Allocator> {
        self.allocator.lock()
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.context("Failed to wait for device idle")?;
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        let _ = self.wait_idle();

        unsafe {
            // Remaining allocations are reported as leaks by the allocator
            ManuallyDrop::drop(&mut self.allocator);

            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

/// Static device ranking: the device type decides, device-local memory breaks ties.
///
/// The type rank sits in the upper 32 bits and the device-local heap size in KiB
/// in the lower 32, so any discrete GPU outranks any integrated one regardless
/// of memory.
pub fn device_score(
    device_type: vk::PhysicalDeviceType,
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
) -> u64 {
    let rank: u64 = match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 5,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 4,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 3,
        vk::PhysicalDeviceType::CPU => 2,
        vk::PhysicalDeviceType::OTHER => 1,
        _ => 0,
    };

    let kib = device_local_kib(memory_properties).min(u64::from(u32::MAX));
    (rank << 32) | kib
}

/// Sum of all device-local heaps, in KiB
pub fn device_local_kib(memory_properties: &vk::PhysicalDeviceMemoryProperties) -> u64 {
    let count = memory_properties.memory_heap_count as usize;
    let bytes: u64 = memory_properties.memory_heaps[..count]
        .iter()
        .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
        .map(|heap| heap.size)
        .sum();
    bytes >> 10
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() || (*p_callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*p_callback_data).p_message);

    log::log!(
        debug_log_level(message_severity),
        "[Vulkan] {}",
        message.to_string_lossy()
    );

    vk::FALSE
}

/// Severities the messenger subscribes to; `log`'s filter decides what is shown
const DEBUG_SEVERITIES: vk::DebugUtilsMessageSeverityFlagsEXT =
    vk::DebugUtilsMessageSeverityFlagsEXT::from_raw(
        vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE.as_raw()
            | vk::DebugUtilsMessageSeverityFlagsEXT::INFO.as_raw()
            | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING.as_raw()
            | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR.as_raw(),
    );

fn debug_log_level(severity: vk::DebugUtilsMessageSeverityFlagsEXT) -> log::Level {
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::Level::Error
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        log::Level::Warn
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        log::Level::Info
    } else {
        log::Level::Trace
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1 << 20;

    fn memory(heaps: &[(u64, vk::MemoryHeapFlags)]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties::default();
        for (i, &(size, flags)) in heaps.iter().enumerate() {
            props.memory_heaps[i] = vk::MemoryHeap { size, flags };
        }
        props.memory_heap_count = heaps.len() as u32;
        props
    }

    #[test]
    fn only_device_local_heaps_count() {
        let props = memory(&[
            (256 * MIB, vk::MemoryHeapFlags::DEVICE_LOCAL),
            (8192 * MIB, vk::MemoryHeapFlags::empty()),
            (512 * MIB, vk::MemoryHeapFlags::DEVICE_LOCAL),
        ]);
        assert_eq!(device_local_kib(&props), 768 * 1024);
    }

    #[test]
    fn heaps_past_the_count_are_ignored() {
        let mut props = memory(&[(MIB, vk::MemoryHeapFlags::DEVICE_LOCAL)]);
        props.memory_heaps[3] = vk::MemoryHeap {
            size: 64 * MIB,
            flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
        };
        assert_eq!(device_local_kib(&props), 1024);
    }

    #[test]
    fn device_type_dominates_memory() {
        let small = memory(&[(256 * MIB, vk::MemoryHeapFlags::DEVICE_LOCAL)]);
        let huge = memory(&[(3_000_000 * MIB, vk::MemoryHeapFlags::DEVICE_LOCAL)]);

        let discrete = device_score(vk::PhysicalDeviceType::DISCRETE_GPU, &small);
        let integrated = device_score(vk::PhysicalDeviceType::INTEGRATED_GPU, &huge);
        let virt = device_score(vk::PhysicalDeviceType::VIRTUAL_GPU, &huge);
        let cpu = device_score(vk::PhysicalDeviceType::CPU, &huge);
        let other = device_score(vk::PhysicalDeviceType::OTHER, &huge);

        assert!(discrete > integrated);
        assert!(integrated > virt);
        assert!(virt > cpu);
        assert!(cpu > other);
        assert!(other > 0);
    }

    #[test]
    fn memory_breaks_ties_within_a_type() {
        let small = memory(&[(2048 * MIB, vk::MemoryHeapFlags::DEVICE_LOCAL)]);
        let large = memory(&[(8192 * MIB, vk::MemoryHeapFlags::DEVICE_LOCAL)]);
        assert!(
            device_score(vk::PhysicalDeviceType::DISCRETE_GPU, &large)
                > device_score(vk::PhysicalDeviceType::DISCRETE_GPU, &small)
        );
    }

    #[test]
    fn score_layout() {
        let props = memory(&[(MIB, vk::MemoryHeapFlags::DEVICE_LOCAL)]);
        assert_eq!(
            device_score(vk::PhysicalDeviceType::DISCRETE_GPU, &props),
            (5 << 32) | 1024
        );
        assert_eq!(
            device_score(vk::PhysicalDeviceType::CPU, &memory(&[])),
            2 << 32
        );
    }

    #[test]
    fn validation_severities_map_to_log_levels() {
        use vk::DebugUtilsMessageSeverityFlagsEXT as Severity;

        assert_eq!(debug_log_level(Severity::ERROR), log::Level::Error);
        assert_eq!(debug_log_level(Severity::WARNING), log::Level::Warn);
        assert_eq!(debug_log_level(Severity::INFO), log::Level::Info);
        assert_eq!(debug_log_level(Severity::VERBOSE), log::Level::Trace);

        for severity in [Severity::VERBOSE, Severity::INFO, Severity::WARNING, Severity::ERROR] {
            assert!(DEBUG_SEVERITIES.contains(severity));
        }
    }
}
