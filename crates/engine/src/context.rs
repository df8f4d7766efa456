//! Vulkan implementation of [`DisplayContext`].
//!
//! [`VulkanContext`] creates and owns everything the frame engine runs on:
//! the instance, the window surface, the selected GPU and a logical device
//! with one graphics + present queue. Every trait primitive forwards to
//! `ash` one-to-one.
//!
//! # Resource Destruction Order
//!
//! 1. Logical device (after the caller has dropped every object created on it)
//! 2. Surface
//! 3. Instance
//!
//! `ManuallyDrop` is used to enforce this order. If device references are
//! still alive when the context drops, the surface and instance are leaked.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use swapframe_engine::VulkanContext;
//! use swapframe_platform::Window;
//! use swapframe_rhi::{DisplayContext, SwapchainPreferences, SwapchainState};
//!
//! # fn example(window: &Window) -> swapframe_rhi::RhiResult<()> {
//! let context: Arc<dyn DisplayContext> = Arc::new(VulkanContext::new(window, true)?);
//! let swapchain = SwapchainState::new(context, SwapchainPreferences::default())?;
//! # Ok(())
//! # }
//! ```

use std::mem::ManuallyDrop;
use std::sync::Arc;

use ash::prelude::VkResult;
use ash::vk;
use tracing::{error, info};

use swapframe_platform::{Surface, Window};
use swapframe_rhi::device::Device;
use swapframe_rhi::instance::Instance;
use swapframe_rhi::physical_device::{PhysicalDeviceInfo, select_physical_device};
use swapframe_rhi::swapchain::choose_surface_format;
use swapframe_rhi::{DisplayContext, FrameSubmission, RhiError, RhiResult};

/// Display context backed by a real Vulkan device.
pub struct VulkanContext {
    /// Vulkan instance (destroyed last).
    instance: ManuallyDrop<Instance>,
    /// Window surface (destroyed after the device).
    surface: ManuallyDrop<Surface>,
    /// Logical device (destroyed first).
    device: ManuallyDrop<Arc<Device>>,
    swapchain_loader: ash::khr::swapchain::Device,
    physical_device_info: PhysicalDeviceInfo,
    window: Window,
}

impl VulkanContext {
    /// Creates an instance, a surface for `window`, and a device that can
    /// render and present to it from one queue.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The Vulkan loader or the surface extensions are unavailable
    /// - Surface creation fails
    /// - No GPU can render and present to the surface
    /// - Device creation fails
    pub fn new(window: &Window, enable_validation: bool) -> RhiResult<Self> {
        let surface_extensions = window
            .surface_extensions()
            .map_err(|e| RhiError::SurfaceError(e.to_string()))?;

        let instance = Instance::new(&surface_extensions, enable_validation)?;

        let surface = window
            .create_surface(instance.entry(), instance.handle())
            .map_err(|e| RhiError::SurfaceError(e.to_string()))?;

        let physical_device_info =
            select_physical_device(instance.handle(), surface.handle(), surface.loader())?;

        let device = Device::new(&instance, &physical_device_info)?;
        let swapchain_loader = ash::khr::swapchain::Device::new(instance.handle(), device.handle());

        info!(
            "Display context ready on '{}' (queue family {})",
            physical_device_info.device_name(),
            physical_device_info.queue_family_index
        );

        Ok(Self {
            instance: ManuallyDrop::new(instance),
            surface: ManuallyDrop::new(surface),
            device: ManuallyDrop::new(device),
            swapchain_loader,
            physical_device_info,
            window: window.clone(),
        })
    }

    /// The logical device, for creating resources the engine does not manage
    /// (depth buffers, pipelines).
    ///
    /// Every clone must be dropped before the context.
    #[inline]
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    #[inline]
    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    fn ash_device(&self) -> &ash::Device {
        self.device.handle()
    }
}

impl DisplayContext for VulkanContext {
    fn device_handle(&self) -> vk::Device {
        self.ash_device().handle()
    }

    fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device_info.device
    }

    fn surface(&self) -> vk::SurfaceKHR {
        self.surface.handle()
    }

    fn queue(&self) -> vk::Queue {
        self.device.queue()
    }

    fn queue_family_index(&self) -> u32 {
        self.device.queue_family_index()
    }

    fn surface_capabilities(&self) -> RhiResult<vk::SurfaceCapabilitiesKHR> {
        Ok(self.surface.capabilities(self.physical_device_info.device)?)
    }

    fn surface_format(&self) -> RhiResult<vk::SurfaceFormatKHR> {
        let formats = self.surface.formats(self.physical_device_info.device)?;
        choose_surface_format(&formats)
    }

    fn surface_present_modes(&self) -> RhiResult<Vec<vk::PresentModeKHR>> {
        Ok(self.surface.present_modes(self.physical_device_info.device)?)
    }

    fn drawable_size(&self) -> vk::Extent2D {
        self.window.drawable_size()
    }

    fn create_semaphore(&self) -> RhiResult<vk::Semaphore> {
        let create_info = vk::SemaphoreCreateInfo::default();
        Ok(unsafe { self.ash_device().create_semaphore(&create_info, None)? })
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.ash_device().destroy_semaphore(semaphore, None) };
    }

    fn create_fence(&self, signaled: bool) -> RhiResult<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let create_info = vk::FenceCreateInfo::default().flags(flags);
        Ok(unsafe { self.ash_device().create_fence(&create_info, None)? })
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.ash_device().destroy_fence(fence, None) };
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout: u64) -> RhiResult<()> {
        unsafe { self.ash_device().wait_for_fences(&[fence], true, timeout)? };
        Ok(())
    }

    fn reset_fence(&self, fence: vk::Fence) -> RhiResult<()> {
        unsafe { self.ash_device().reset_fences(&[fence])? };
        Ok(())
    }

    fn fence_status(&self, fence: vk::Fence) -> RhiResult<bool> {
        Ok(unsafe { self.ash_device().get_fence_status(fence)? })
    }

    fn create_swapchain(
        &self,
        create_info: &vk::SwapchainCreateInfoKHR<'_>,
    ) -> RhiResult<vk::SwapchainKHR> {
        Ok(unsafe { self.swapchain_loader.create_swapchain(create_info, None)? })
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        unsafe { self.swapchain_loader.destroy_swapchain(swapchain, None) };
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> RhiResult<Vec<vk::Image>> {
        Ok(unsafe { self.swapchain_loader.get_swapchain_images(swapchain)? })
    }

    fn create_image_view(
        &self,
        create_info: &vk::ImageViewCreateInfo<'_>,
    ) -> RhiResult<vk::ImageView> {
        Ok(unsafe { self.ash_device().create_image_view(create_info, None)? })
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { self.ash_device().destroy_image_view(view, None) };
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout: u64,
        semaphore: vk::Semaphore,
    ) -> VkResult<(u32, bool)> {
        unsafe {
            self.swapchain_loader
                .acquire_next_image(swapchain, timeout, semaphore, vk::Fence::null())
        }
    }

    fn create_command_pool(
        &self,
        queue_family_index: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> RhiResult<vk::CommandPool> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family_index)
            .flags(flags);
        Ok(unsafe { self.ash_device().create_command_pool(&create_info, None)? })
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.ash_device().destroy_command_pool(pool, None) };
    }

    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> RhiResult<Vec<vk::CommandBuffer>> {
        let allocate_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);
        Ok(unsafe { self.ash_device().allocate_command_buffers(&allocate_info)? })
    }

    fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]) {
        unsafe { self.ash_device().free_command_buffers(pool, buffers) };
    }

    fn begin_command_buffer(&self, buffer: vk::CommandBuffer) -> RhiResult<()> {
        // No ONE_TIME_SUBMIT: the buffer is submitted once per presented frame.
        let begin_info = vk::CommandBufferBeginInfo::default();
        unsafe { self.ash_device().begin_command_buffer(buffer, &begin_info)? };
        Ok(())
    }

    fn end_command_buffer(&self, buffer: vk::CommandBuffer) -> RhiResult<()> {
        unsafe { self.ash_device().end_command_buffer(buffer)? };
        Ok(())
    }

    fn queue_submit(&self, submission: &FrameSubmission) -> VkResult<()> {
        let wait_semaphores = [submission.wait_semaphore];
        let wait_stages = [submission.wait_stage];
        let command_buffers = [submission.command_buffer];
        let signal_semaphores = [submission.signal_semaphore];

        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.ash_device()
                .queue_submit(self.device.queue(), &[submit_info], submission.fence)
        }
    }

    fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> VkResult<bool> {
        let wait_semaphores = [wait_semaphore];
        let swapchains = [swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        unsafe {
            self.swapchain_loader
                .queue_present(self.device.queue(), &present_info)
        }
    }

    fn queue_wait_idle(&self) -> RhiResult<()> {
        unsafe { self.ash_device().queue_wait_idle(self.device.queue())? };
        Ok(())
    }

    fn device_wait_idle(&self) -> RhiResult<()> {
        self.device.wait_idle()
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        // SAFETY: none of the three fields is touched again after this.
        let released =
            unsafe { release_in_order(&mut self.device, &mut self.surface, &mut self.instance) };
        if released {
            info!("Display context destroyed");
        }
    }
}

/// Drops this context's device reference, then the surface and the instance.
///
/// When other device references are still alive the surface and instance are
/// leaked instead, since the device must not outlive its parents. Returns
/// whether they were destroyed.
///
/// # Safety
///
/// None of the three values may be used after this call.
unsafe fn release_in_order<D, S, I>(
    device: &mut ManuallyDrop<Arc<D>>,
    surface: &mut ManuallyDrop<S>,
    instance: &mut ManuallyDrop<I>,
) -> bool {
    let outstanding = Arc::strong_count(&**device) - 1;
    unsafe { ManuallyDrop::drop(device) };

    if outstanding > 0 {
        error!(
            "{} device reference(s) outlive the display context, leaking the surface and instance",
            outstanding
        );
        return false;
    }

    unsafe {
        ManuallyDrop::drop(surface);
        ManuallyDrop::drop(instance);
    }
    true
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn test_vulkan_context_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<VulkanContext>();
    }

    struct Tracked(&'static str, Arc<Mutex<Vec<&'static str>>>);

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.1.lock().unwrap().push(self.0);
        }
    }

    fn parts(
        log: &Arc<Mutex<Vec<&'static str>>>,
    ) -> (
        ManuallyDrop<Arc<Tracked>>,
        ManuallyDrop<Tracked>,
        ManuallyDrop<Tracked>,
    ) {
        (
            ManuallyDrop::new(Arc::new(Tracked("device", log.clone()))),
            ManuallyDrop::new(Tracked("surface", log.clone())),
            ManuallyDrop::new(Tracked("instance", log.clone())),
        )
    }

    #[test]
    fn test_release_destroys_device_surface_then_instance() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (mut device, mut surface, mut instance) = parts(&log);

        let released = unsafe { release_in_order(&mut device, &mut surface, &mut instance) };

        assert!(released);
        assert_eq!(*log.lock().unwrap(), ["device", "surface", "instance"]);
    }

    #[test]
    fn test_release_leaks_parents_while_device_is_shared() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (mut device, mut surface, mut instance) = parts(&log);
        let shared = Arc::clone(&*device);

        let released = unsafe { release_in_order(&mut device, &mut surface, &mut instance) };

        assert!(!released);
        assert!(log.lock().unwrap().is_empty());
        drop(shared);
        assert_eq!(*log.lock().unwrap(), ["device"]);
    }
}
