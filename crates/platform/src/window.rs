//! The application window and the Vulkan surface presented to it.

use std::ffi::c_char;
use std::sync::Arc;

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use winit::dpi::PhysicalSize;
use winit::event_loop::ActiveEventLoop;
use winit::window::{Window as WinitWindow, WindowAttributes};

use swapframe_core::{Error, Result, WindowConfig};

/// A resizable winit window.
///
/// Cloning is cheap and yields another handle to the same window.
#[derive(Clone)]
pub struct Window {
    window: Arc<WinitWindow>,
}

impl Window {
    pub fn new(event_loop: &ActiveEventLoop, config: &WindowConfig) -> Result<Self> {
        let attrs = WindowAttributes::default()
            .with_title(config.title.clone())
            .with_inner_size(PhysicalSize::new(config.width, config.height))
            .with_resizable(true);

        let window = event_loop
            .create_window(attrs)
            .map_err(|e| Error::Window(e.to_string()))?;

        tracing::info!(
            "Window created: {}x{} \"{}\"",
            config.width,
            config.height,
            config.title
        );

        Ok(Self {
            window: Arc::new(window),
        })
    }

    /// Current drawable size in physical pixels.
    ///
    /// Reports 0x0 on platforms where a minimized window has no drawable area.
    pub fn drawable_size(&self) -> vk::Extent2D {
        let size = self.window.inner_size();
        vk::Extent2D {
            width: size.width,
            height: size.height,
        }
    }

    /// Instance extensions needed to create a surface on this window's display.
    ///
    /// The pointers refer to static names owned by `ash_window`.
    pub fn surface_extensions(&self) -> Result<Vec<*const c_char>> {
        let display = self
            .window
            .display_handle()
            .map_err(|e| Error::Window(format!("No display handle: {}", e)))?;

        let extensions = ash_window::enumerate_required_extensions(display.as_raw())
            .map_err(|e| Error::Vulkan(format!("Unsupported display for Vulkan: {}", e)))?;
        tracing::debug!("Surface needs {} instance extension(s)", extensions.len());

        Ok(extensions.to_vec())
    }

    /// Creates a surface for this window on `instance`.
    ///
    /// `instance` must outlive the returned [`Surface`].
    pub fn create_surface(&self, entry: &ash::Entry, instance: &ash::Instance) -> Result<Surface> {
        let display = self
            .window
            .display_handle()
            .map_err(|e| Error::Window(format!("No display handle: {}", e)))?;
        let window = self
            .window
            .window_handle()
            .map_err(|e| Error::Window(format!("No window handle: {}", e)))?;

        // SAFETY: both handles come from a live winit window, and the surface
        // is destroyed in `Surface::drop` before the caller's instance.
        let handle = unsafe {
            ash_window::create_surface(entry, instance, display.as_raw(), window.as_raw(), None)
        }
        .map_err(|e| Error::Vulkan(format!("Failed to create Vulkan surface: {}", e)))?;

        tracing::info!("Vulkan surface created");
        Ok(Surface {
            handle,
            loader: ash::khr::surface::Instance::new(entry, instance),
        })
    }
}

/// A window surface, destroyed on drop.
///
/// Every swapchain created on it must be destroyed first.
pub struct Surface {
    handle: vk::SurfaceKHR,
    loader: ash::khr::surface::Instance,
}

impl Surface {
    #[inline]
    pub fn handle(&self) -> vk::SurfaceKHR {
        self.handle
    }

    /// The `VK_KHR_surface` function table, for device selection.
    #[inline]
    pub fn loader(&self) -> &ash::khr::surface::Instance {
        &self.loader
    }

    pub fn capabilities(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> ash::prelude::VkResult<vk::SurfaceCapabilitiesKHR> {
        unsafe {
            self.loader
                .get_physical_device_surface_capabilities(physical_device, self.handle)
        }
    }

    pub fn formats(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> ash::prelude::VkResult<Vec<vk::SurfaceFormatKHR>> {
        unsafe {
            self.loader
                .get_physical_device_surface_formats(physical_device, self.handle)
        }
    }

    pub fn present_modes(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> ash::prelude::VkResult<Vec<vk::PresentModeKHR>> {
        unsafe {
            self.loader
                .get_physical_device_surface_present_modes(physical_device, self.handle)
        }
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        unsafe { self.loader.destroy_surface(self.handle, None) };
        tracing::debug!("Vulkan surface destroyed");
    }
}
