//! GPU selection.
//!
//! The frame engine renders and presents from one queue, so a GPU qualifies
//! only when it has:
//! 1. Vulkan 1.3 (dynamic rendering, synchronization2)
//! 2. A queue family that supports graphics and can present to the surface
//! 3. `VK_KHR_swapchain` and at least one surface format and present mode
//!
//! Among qualifying GPUs the best rated wins. Discrete GPUs rate highest.
//!
//! # Example
//!
//! ```no_run
//! use swapframe_rhi::instance::Instance;
//! use swapframe_rhi::physical_device::select_physical_device;
//! use ash::vk;
//!
//! # fn example(instance: &Instance, surface: vk::SurfaceKHR) -> swapframe_rhi::RhiResult<()> {
//! let surface_loader = ash::khr::surface::Instance::new(instance.entry(), instance.handle());
//! let gpu = select_physical_device(instance.handle(), surface, &surface_loader)?;
//! println!("Rendering on {}", gpu.device_name());
//! # Ok(())
//! # }
//! ```

use std::ffi::CStr;
use std::fmt;

use ash::vk;
use tracing::{debug, info, warn};

use crate::error::{RhiError, RhiResult};

/// Device extensions the frame engine needs.
pub const DEVICE_EXTENSIONS: &[&CStr] = &[ash::khr::swapchain::NAME];

/// A GPU that can drive the frame engine.
#[derive(Clone)]
pub struct PhysicalDeviceInfo {
    pub device: vk::PhysicalDevice,
    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    /// Family of the queue used for both rendering and presentation.
    pub queue_family_index: u32,
}

impl PhysicalDeviceInfo {
    pub fn device_name(&self) -> &str {
        self.properties
            .device_name_as_c_str()
            .ok()
            .and_then(|name| name.to_str().ok())
            .unwrap_or("Unknown Device")
    }

    pub fn device_type_name(&self) -> &'static str {
        match self.properties.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => "discrete",
            vk::PhysicalDeviceType::INTEGRATED_GPU => "integrated",
            vk::PhysicalDeviceType::VIRTUAL_GPU => "virtual",
            vk::PhysicalDeviceType::CPU => "cpu",
            _ => "other",
        }
    }

    /// Total size of the device-local heaps in bytes.
    pub fn device_local_memory(&self) -> u64 {
        let heaps = &self.memory_properties.memory_heaps
            [..self.memory_properties.memory_heap_count as usize];
        heaps
            .iter()
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size)
            .sum()
    }
}

impl fmt::Debug for PhysicalDeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysicalDeviceInfo")
            .field("name", &self.device_name())
            .field("type", &self.device_type_name())
            .field("queue_family_index", &self.queue_family_index)
            .finish()
    }
}

/// Why a GPU was passed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rejection {
    ApiVersion(u32),
    NoPresentQueue,
    MissingExtension(&'static CStr),
    ExtensionQuery(vk::Result),
    SurfaceSupport,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ApiVersion(version) => write!(
                f,
                "Vulkan {}.{} is older than 1.3",
                vk::api_version_major(*version),
                vk::api_version_minor(*version)
            ),
            Self::NoPresentQueue => f.write_str("no queue family does both graphics and present"),
            Self::MissingExtension(name) => write!(f, "missing extension {:?}", name),
            Self::ExtensionQuery(e) => write!(f, "extension query failed: {}", e),
            Self::SurfaceSupport => f.write_str("no usable surface format or present mode"),
        }
    }
}

/// Selects the best rated GPU that can render and present to `surface`.
///
/// # Errors
///
/// Returns [`RhiError::NoSuitableGpu`] if no GPU qualifies.
pub fn select_physical_device(
    instance: &ash::Instance,
    surface: vk::SurfaceKHR,
    surface_loader: &ash::khr::surface::Instance,
) -> RhiResult<PhysicalDeviceInfo> {
    let devices = unsafe { instance.enumerate_physical_devices()? };
    info!("Found {} GPU(s)", devices.len());

    let selected = devices
        .into_iter()
        .filter_map(|device| {
            match evaluate_device(instance, device, surface, surface_loader) {
                Ok(info) => {
                    debug!("GPU '{}' qualifies, rating {}", info.device_name(), rate_device(&info));
                    Some(info)
                }
                Err(rejection) => {
                    let properties = unsafe { instance.get_physical_device_properties(device) };
                    let name = properties
                        .device_name_as_c_str()
                        .map(CStr::to_string_lossy)
                        .unwrap_or_default();
                    debug!("GPU '{}' skipped: {}", name, rejection);
                    None
                }
            }
        })
        .max_by_key(rate_device);

    let Some(selected) = selected else {
        warn!("No GPU can render and present to the surface");
        return Err(RhiError::NoSuitableGpu);
    };

    info!(
        "Selected GPU '{}' ({}), queue family {}",
        selected.device_name(),
        selected.device_type_name(),
        selected.queue_family_index
    );
    Ok(selected)
}

fn evaluate_device(
    instance: &ash::Instance,
    device: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
    surface_loader: &ash::khr::surface::Instance,
) -> Result<PhysicalDeviceInfo, Rejection> {
    let properties = unsafe { instance.get_physical_device_properties(device) };
    if !supports_vulkan_1_3(properties.api_version) {
        return Err(Rejection::ApiVersion(properties.api_version));
    }

    let families = unsafe { instance.get_physical_device_queue_family_properties(device) };
    let flags: Vec<vk::QueueFlags> = families
        .iter()
        .map(|family| {
            if family.queue_count == 0 {
                vk::QueueFlags::empty()
            } else {
                family.queue_flags
            }
        })
        .collect();
    let queue_family_index = pick_queue_family(&flags, |index| unsafe {
        surface_loader
            .get_physical_device_surface_support(device, index, surface)
            .unwrap_or(false)
    })
    .ok_or(Rejection::NoPresentQueue)?;

    let available = unsafe { instance.enumerate_device_extension_properties(device) }
        .map_err(Rejection::ExtensionQuery)?;
    let available: Vec<&CStr> = available
        .iter()
        .filter_map(|ext| ext.extension_name_as_c_str().ok())
        .collect();
    if let Some(missing) = missing_extension(&available) {
        return Err(Rejection::MissingExtension(missing));
    }

    let formats = unsafe { surface_loader.get_physical_device_surface_formats(device, surface) };
    let modes = unsafe { surface_loader.get_physical_device_surface_present_modes(device, surface) };
    if !formats.is_ok_and(|f| !f.is_empty()) || !modes.is_ok_and(|m| !m.is_empty()) {
        return Err(Rejection::SurfaceSupport);
    }

    Ok(PhysicalDeviceInfo {
        device,
        properties,
        memory_properties: unsafe { instance.get_physical_device_memory_properties(device) },
        queue_family_index,
    })
}

fn supports_vulkan_1_3(api_version: u32) -> bool {
    (vk::api_version_major(api_version), vk::api_version_minor(api_version)) >= (1, 3)
}

/// First entry of [`DEVICE_EXTENSIONS`] not in `available`.
fn missing_extension(available: &[&CStr]) -> Option<&'static CStr> {
    DEVICE_EXTENSIONS
        .iter()
        .copied()
        .find(|required| !available.contains(required))
}

/// First queue family that supports graphics and can present.
///
/// `flags` holds one entry per family (empty for families without queues).
fn pick_queue_family(flags: &[vk::QueueFlags], can_present: impl Fn(u32) -> bool) -> Option<u32> {
    (0u32..)
        .zip(flags)
        .find(|&(i, flags)| flags.contains(vk::QueueFlags::GRAPHICS) && can_present(i))
        .map(|(i, _)| i)
}

/// Higher is better: device type first, then image size limits and VRAM.
fn rate_device(info: &PhysicalDeviceInfo) -> u32 {
    let type_rating = match info.properties.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 10_000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 1_000,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 100,
        vk::PhysicalDeviceType::CPU => 10,
        _ => 1,
    };
    let vram_mb = (info.device_local_memory() / (1024 * 1024)).min(16_000) as u32;

    type_rating + info.properties.limits.max_image_dimension2_d + vram_mb
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gpu(device_type: vk::PhysicalDeviceType) -> PhysicalDeviceInfo {
        let mut info = PhysicalDeviceInfo {
            device: vk::PhysicalDevice::null(),
            properties: vk::PhysicalDeviceProperties::default(),
            memory_properties: vk::PhysicalDeviceMemoryProperties::default(),
            queue_family_index: 0,
        };
        info.properties.device_type = device_type;
        info
    }

    #[test]
    fn test_pick_queue_family_needs_graphics_and_present() {
        let flags = [
            vk::QueueFlags::TRANSFER,
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
            vk::QueueFlags::GRAPHICS,
        ];

        // Family 1 has graphics but cannot present
        assert_eq!(pick_queue_family(&flags, |i| i != 1), Some(2));
        assert_eq!(pick_queue_family(&flags, |_| true), Some(1));
        assert_eq!(pick_queue_family(&flags, |_| false), None);

        // Families without queues report no flags
        assert_eq!(pick_queue_family(&[vk::QueueFlags::empty()], |_| true), None);
    }

    #[test]
    fn test_supports_vulkan_1_3() {
        assert!(supports_vulkan_1_3(vk::API_VERSION_1_3));
        assert!(supports_vulkan_1_3(vk::make_api_version(0, 1, 4, 0)));
        assert!(supports_vulkan_1_3(vk::make_api_version(0, 2, 0, 0)));
        assert!(!supports_vulkan_1_3(vk::API_VERSION_1_2));
    }

    #[test]
    fn test_missing_extension_reports_swapchain() {
        assert_eq!(
            missing_extension(&[ash::khr::maintenance1::NAME]),
            Some(ash::khr::swapchain::NAME)
        );
        assert_eq!(missing_extension(&[ash::khr::swapchain::NAME]), None);
    }

    #[test]
    fn test_rejection_messages() {
        assert_eq!(
            Rejection::ApiVersion(vk::API_VERSION_1_2).to_string(),
            "Vulkan 1.2 is older than 1.3"
        );
        assert!(
            Rejection::MissingExtension(ash::khr::swapchain::NAME)
                .to_string()
                .contains("VK_KHR_swapchain")
        );
    }

    #[test]
    fn test_rate_device_prefers_discrete() {
        let discrete = gpu(vk::PhysicalDeviceType::DISCRETE_GPU);
        let mut integrated = gpu(vk::PhysicalDeviceType::INTEGRATED_GPU);
        integrated.properties.limits.max_image_dimension2_d = 8192;

        assert!(rate_device(&discrete) > rate_device(&integrated));
    }

    #[test]
    fn test_device_local_memory_counts_only_local_heaps() {
        let mut info = gpu(vk::PhysicalDeviceType::DISCRETE_GPU);
        info.memory_properties.memory_heap_count = 2;
        info.memory_properties.memory_heaps[0] = vk::MemoryHeap {
            size: 4u64 << 30,
            flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
        };
        info.memory_properties.memory_heaps[1] = vk::MemoryHeap {
            size: 16u64 << 30,
            flags: vk::MemoryHeapFlags::empty(),
        };

        assert_eq!(info.device_local_memory(), 4u64 << 30);
    }
}
