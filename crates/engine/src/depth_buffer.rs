//! Depth buffer management.
//!
//! Creates depth images with GPU-only memory and an associated image view,
//! sized to the swapchain extent. The frame scheduler rebuilds them together
//! with the rest of the per-image targets whenever the swapchain is rebuilt.
//!
//! # Overview
//!
//! - [`DepthBuffer`] wraps a VkImage and VkImageView for depth testing
//! - [`find_depth_format`] picks the first supported depth format, preferring
//!   D32_SFLOAT
//! - Memory is managed by gpu-allocator
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ash::vk;
//! use swapframe_engine::depth_buffer::DepthBuffer;
//! use swapframe_rhi::device::Device;
//!
//! # fn example(device: Arc<Device>) -> swapframe_rhi::RhiResult<()> {
//! let extent = vk::Extent2D { width: 1920, height: 1080 };
//! let depth_buffer = DepthBuffer::new(device, extent, vk::Format::D32_SFLOAT)?;
//!
//! let image_view = depth_buffer.image_view();
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use gpu_allocator::MemoryLocation;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use tracing::{debug, error};

use swapframe_rhi::device::Device;
use swapframe_rhi::{RhiError, RhiResult};

/// Depth formats in order of preference.
const DEPTH_FORMAT_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
];

/// Finds the first depth format usable as an optimally tiled depth attachment.
///
/// # Errors
///
/// Returns an error if the device supports none of the candidates.
pub fn find_depth_format(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> RhiResult<vk::Format> {
    let format = pick_depth_format(&DEPTH_FORMAT_CANDIDATES, |format| {
        let properties =
            unsafe { instance.get_physical_device_format_properties(physical_device, format) };
        properties
            .optimal_tiling_features
            .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
    })
    .ok_or_else(|| RhiError::InvalidHandle("No supported depth format".to_string()))?;

    debug!("Selected depth format {:?}", format);
    Ok(format)
}

fn pick_depth_format(
    candidates: &[vk::Format],
    supported: impl Fn(vk::Format) -> bool,
) -> Option<vk::Format> {
    candidates.iter().copied().find(|&format| supported(format))
}

/// Aspect flags for views and barriers of a depth image in `format`.
pub fn depth_aspect_mask(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D32_SFLOAT_S8_UINT | vk::Format::D24_UNORM_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        _ => vk::ImageAspectFlags::DEPTH,
    }
}

/// Depth buffer for depth testing.
///
/// # Resource Destruction
///
/// Resources are destroyed in the following order:
/// 1. Image view
/// 2. Image
/// 3. Memory allocation
pub struct DepthBuffer {
    /// Reference to the logical device.
    device: Arc<Device>,
    image: vk::Image,
    image_view: vk::ImageView,
    /// GPU memory allocation, taken on drop.
    allocation: Option<Allocation>,
    format: vk::Format,
    extent: vk::Extent2D,
}

impl DepthBuffer {
    /// Creates a depth buffer covering `extent`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `extent` has a zero dimension
    /// - Image creation fails
    /// - Memory allocation fails
    /// - Image view creation fails
    pub fn new(device: Arc<Device>, extent: vk::Extent2D, format: vk::Format) -> RhiResult<Self> {
        if extent.width == 0 || extent.height == 0 {
            return Err(RhiError::InvalidHandle(
                "Depth buffer dimensions must be greater than 0".to_string(),
            ));
        }

        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { device.handle().create_image(&image_info, None)? };

        // From here on `buffer` owns the image, so early returns clean up.
        let mut buffer = Self {
            device,
            image,
            image_view: vk::ImageView::null(),
            allocation: None,
            format,
            extent,
        };

        let requirements = unsafe { buffer.device.handle().get_image_memory_requirements(image) };

        let allocation = {
            let mut allocator = buffer
                .device
                .allocator()
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            allocator.allocate(&AllocationCreateDesc {
                name: "depth_buffer",
                requirements,
                location: MemoryLocation::GpuOnly,
                linear: false,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })?
        };

        unsafe {
            buffer.device.handle().bind_image_memory(
                image,
                allocation.memory(),
                allocation.offset(),
            )?;
        }
        buffer.allocation = Some(allocation);

        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(vk::ImageAspectFlags::DEPTH)
                    .base_mip_level(0)
                    .level_count(1)
                    .base_array_layer(0)
                    .layer_count(1),
            );

        buffer.image_view = unsafe { buffer.device.handle().create_image_view(&view_info, None)? };

        debug!(
            "Created depth buffer: {}x{} ({:?})",
            extent.width, extent.height, format
        );

        Ok(buffer)
    }

    /// Returns the Vulkan image handle.
    #[inline]
    pub fn image(&self) -> vk::Image {
        self.image
    }

    /// Returns the Vulkan image view handle.
    #[inline]
    pub fn image_view(&self) -> vk::ImageView {
        self.image_view
    }

    /// Returns the depth format.
    #[inline]
    pub fn format(&self) -> vk::Format {
        self.format
    }

}

impl Drop for DepthBuffer {
    fn drop(&mut self) {
        unsafe {
            if self.image_view != vk::ImageView::null() {
                self.device
                    .handle()
                    .destroy_image_view(self.image_view, None);
            }
            self.device.handle().destroy_image(self.image, None);
        }

        if let Some(allocation) = self.allocation.take() {
            let mut allocator = self
                .device
                .allocator()
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if let Err(e) = allocator.free(allocation) {
                error!("Failed to free depth buffer allocation: {:?}", e);
            }
        }

        debug!(
            "Destroyed depth buffer: {}x{}",
            self.extent.width, self.extent.height
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pick_depth_format_prefers_first_supported() {
        let picked = pick_depth_format(&DEPTH_FORMAT_CANDIDATES, |format| {
            format != vk::Format::D32_SFLOAT
        });
        assert_eq!(picked, Some(vk::Format::D32_SFLOAT_S8_UINT));

        assert_eq!(
            pick_depth_format(&DEPTH_FORMAT_CANDIDATES, |_| true),
            Some(vk::Format::D32_SFLOAT)
        );
        assert_eq!(pick_depth_format(&DEPTH_FORMAT_CANDIDATES, |_| false), None);
    }

    #[test]
    fn test_depth_aspect_mask() {
        assert_eq!(
            depth_aspect_mask(vk::Format::D32_SFLOAT),
            vk::ImageAspectFlags::DEPTH
        );
        assert_eq!(
            depth_aspect_mask(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
    }
}
