//! Display context: the device, surface and queue the frame engine runs on.
//!
//! # Overview
//!
//! The frame engine does not negotiate instances, devices or extensions. It
//! consumes an already configured [`DisplayContext`] that owns:
//! - the logical and physical device
//! - the presentation surface
//! - one queue that supports both graphics and presentation
//!
//! and exposes the small set of device-object primitives the swapchain and
//! frame loop need. The production implementation wraps `ash`; the
//! [`mock`](crate::mock) implementation simulates fence and semaphore state
//! in memory for tests.
//!
//! Creation primitives return [`RhiResult`] and are fatal when they fail.
//! Per-frame primitives (`acquire_next_image`, `queue_submit`,
//! `queue_present`) return the raw [`VkResult`] so callers can triage the
//! expected staleness codes themselves.

use ash::prelude::VkResult;
use ash::vk;

use crate::error::RhiResult;

/// One submission of a prerecorded command buffer for an acquired image.
///
/// The buffer waits on `wait_semaphore` at `wait_stage`, signals
/// `signal_semaphore` when done, and signals `fence` on completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSubmission {
    pub command_buffer: vk::CommandBuffer,
    pub wait_semaphore: vk::Semaphore,
    pub wait_stage: vk::PipelineStageFlags,
    pub signal_semaphore: vk::Semaphore,
    pub fence: vk::Fence,
}

/// Device, surface and queue shared by everything that renders to a window.
///
/// Handles passed into this trait must have been created through the same
/// context. Implementations must be cheap to call per frame.
pub trait DisplayContext: Send + Sync {
    // =========================================================================
    // Handles
    // =========================================================================

    /// Raw logical device handle.
    fn device_handle(&self) -> vk::Device;

    /// Physical device the logical device was created from.
    fn physical_device(&self) -> vk::PhysicalDevice;

    /// Presentation surface.
    fn surface(&self) -> vk::SurfaceKHR;

    /// The graphics + present queue.
    fn queue(&self) -> vk::Queue;

    /// Family index of [`queue`](Self::queue).
    fn queue_family_index(&self) -> u32;

    // =========================================================================
    // Surface queries
    // =========================================================================

    /// Current capabilities of the surface (extent, image count limits, transform).
    fn surface_capabilities(&self) -> RhiResult<vk::SurfaceCapabilitiesKHR>;

    /// Best surface format for presentation.
    fn surface_format(&self) -> RhiResult<vk::SurfaceFormatKHR>;

    /// Present modes the surface supports.
    fn surface_present_modes(&self) -> RhiResult<Vec<vk::PresentModeKHR>>;

    /// Drawable size of the window backing the surface.
    ///
    /// Used when the surface leaves the extent up to the swapchain.
    fn drawable_size(&self) -> vk::Extent2D;

    // =========================================================================
    // Synchronization objects
    // =========================================================================

    fn create_semaphore(&self) -> RhiResult<vk::Semaphore>;

    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    /// Creates a fence, optionally already signaled.
    fn create_fence(&self, signaled: bool) -> RhiResult<vk::Fence>;

    fn destroy_fence(&self, fence: vk::Fence);

    /// Blocks until `fence` is signaled or `timeout` nanoseconds pass.
    fn wait_for_fence(&self, fence: vk::Fence, timeout: u64) -> RhiResult<()>;

    fn reset_fence(&self, fence: vk::Fence) -> RhiResult<()>;

    /// Non-blocking fence status query.
    fn fence_status(&self, fence: vk::Fence) -> RhiResult<bool>;

    // =========================================================================
    // Swapchain
    // =========================================================================

    /// Creates a swapchain. A non-null `old_swapchain` in `create_info` is
    /// retired by this call.
    fn create_swapchain(
        &self,
        create_info: &vk::SwapchainCreateInfoKHR<'_>,
    ) -> RhiResult<vk::SwapchainKHR>;

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);

    /// Images owned by `swapchain`, in presentation-engine index order.
    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> RhiResult<Vec<vk::Image>>;

    fn create_image_view(&self, create_info: &vk::ImageViewCreateInfo<'_>)
    -> RhiResult<vk::ImageView>;

    fn destroy_image_view(&self, view: vk::ImageView);

    /// Acquires the next presentable image, signaling `semaphore` when it is
    /// ready. Returns `(index, suboptimal)`.
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout: u64,
        semaphore: vk::Semaphore,
    ) -> VkResult<(u32, bool)>;

    // =========================================================================
    // Commands and queue
    // =========================================================================

    fn create_command_pool(
        &self,
        queue_family_index: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> RhiResult<vk::CommandPool>;

    fn destroy_command_pool(&self, pool: vk::CommandPool);

    /// Allocates `count` primary command buffers from `pool`.
    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> RhiResult<Vec<vk::CommandBuffer>>;

    fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]);

    /// Begins recording a command buffer that may be submitted many times.
    fn begin_command_buffer(&self, buffer: vk::CommandBuffer) -> RhiResult<()>;

    fn end_command_buffer(&self, buffer: vk::CommandBuffer) -> RhiResult<()>;

    /// Submits one frame to the queue.
    fn queue_submit(&self, submission: &FrameSubmission) -> VkResult<()>;

    /// Presents `image_index` of `swapchain` after `wait_semaphore`.
    /// Returns `true` when the swapchain is suboptimal.
    fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> VkResult<bool>;

    fn queue_wait_idle(&self) -> RhiResult<()>;

    fn device_wait_idle(&self) -> RhiResult<()>;
}
