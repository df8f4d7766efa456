//! Swapchain management.
//!
//! This module owns the presentable image chain and the per-image
//! synchronization state used by the frame loop.
//!
//! # Overview
//!
//! [`SwapchainState`] holds:
//! - the `VkSwapchainKHR` handle and its images (owned by the driver)
//! - one [`PresentableImage`] per image: a view, an acquire semaphore, a
//!   release semaphore and a fence
//! - a [`SemaphorePool`] of spare acquire semaphores
//!
//! # Acquire semaphores
//!
//! The presentation engine reports which image it bound an acquire to only
//! after the call returns, so the semaphore handed to the acquire cannot come
//! from the image slot. [`SwapchainState::acquire`] takes a spare from the
//! pool instead and, once the slot is known and its fence has been waited on,
//! swaps it with the slot's previous acquire semaphore. That previous
//! semaphore was last waited on by the submission the fence guarded, so it is
//! safe to hand to the next acquire.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use swapframe_rhi::context::DisplayContext;
//! use swapframe_rhi::swapchain::{AcquireOutcome, SwapchainPreferences, SwapchainState};
//!
//! # fn example(context: Arc<dyn DisplayContext>) -> swapframe_rhi::RhiResult<()> {
//! let mut swapchain = SwapchainState::new(context, SwapchainPreferences::default())?;
//!
//! match swapchain.acquire()? {
//!     AcquireOutcome::Acquired(frame) => {
//!         // submit work waiting on frame.acquire_semaphore ...
//!         let _ = frame;
//!     }
//!     AcquireOutcome::Stale(_) => swapchain.rebuild()?,
//!     AcquireOutcome::Failed(code) => eprintln!("acquire failed: {code}"),
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use tracing::{debug, error, info};

use crate::context::DisplayContext;
use crate::error::{RhiError, RhiResult};
use crate::sync::{Fence, Semaphore, SemaphorePool};

/// Tunables for swapchain creation and acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainPreferences {
    /// Present mode to use when the surface supports it. FIFO otherwise.
    pub present_mode: vk::PresentModeKHR,
    /// Acquire timeout in nanoseconds.
    pub acquire_timeout: u64,
}

impl Default for SwapchainPreferences {
    fn default() -> Self {
        Self {
            present_mode: vk::PresentModeKHR::MAILBOX,
            acquire_timeout: 1_000_000_000,
        }
    }
}

/// Snapshot of one acquired image, handed to the frame callbacks.
///
/// All handles stay valid until the next rebuild of the swapchain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    /// Index the presentation engine reported for this image.
    pub index: u32,
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    /// Signaled when the image is ready to be written.
    pub acquire_semaphore: vk::Semaphore,
    /// Signaled by the frame's submission, waited on by present.
    pub release_semaphore: vk::Semaphore,
    /// Signaled when the frame's submission completes.
    pub fence: vk::Fence,
}

/// One slot of the swapchain.
///
/// Dropping a slot destroys its view, then its semaphores, then its fence.
pub struct PresentableImage {
    context: Arc<dyn DisplayContext>,
    index: u32,
    image: vk::Image,
    view: vk::ImageView,
    acquire_semaphore: Semaphore,
    release_semaphore: Semaphore,
    fence: Fence,
}

impl PresentableImage {
    fn new(
        context: Arc<dyn DisplayContext>,
        index: u32,
        image: vk::Image,
        format: vk::Format,
    ) -> RhiResult<Self> {
        let create_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .components(vk::ComponentMapping {
                r: vk::ComponentSwizzle::IDENTITY,
                g: vk::ComponentSwizzle::IDENTITY,
                b: vk::ComponentSwizzle::IDENTITY,
                a: vk::ComponentSwizzle::IDENTITY,
            })
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .base_mip_level(0)
                    .level_count(1)
                    .base_array_layer(0)
                    .layer_count(1),
            );

        // The view is the only handle without its own guard, so it is created
        // last.
        let acquire_semaphore = Semaphore::new(context.clone())?;
        let release_semaphore = Semaphore::new(context.clone())?;
        let fence = Fence::new(context.clone(), true)?;

        let view = context.create_image_view(&create_info).map_err(|e| {
            RhiError::SwapchainError(format!("Failed to create image view {}: {}", index, e))
        })?;

        Ok(Self {
            context,
            index,
            image,
            view,
            acquire_semaphore,
            release_semaphore,
            fence,
        })
    }

    /// Index the presentation engine last reported for this slot.
    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    #[inline]
    pub fn acquire_semaphore(&self) -> vk::Semaphore {
        self.acquire_semaphore.handle()
    }

    #[inline]
    pub fn release_semaphore(&self) -> vk::Semaphore {
        self.release_semaphore.handle()
    }

    #[inline]
    pub fn fence(&self) -> &Fence {
        &self.fence
    }

    fn frame(&self, format: vk::Format, extent: vk::Extent2D) -> Frame {
        Frame {
            index: self.index,
            image: self.image,
            view: self.view,
            format,
            extent,
            acquire_semaphore: self.acquire_semaphore.handle(),
            release_semaphore: self.release_semaphore.handle(),
            fence: self.fence.handle(),
        }
    }
}

impl Drop for PresentableImage {
    fn drop(&mut self) {
        self.context.destroy_image_view(self.view);
    }
}

/// Result of [`SwapchainState::acquire`].
///
/// Only `Acquired` hands out an image. The other two are expected outcomes,
/// not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// The image is ready to be rendered to; its fence has been waited on
    /// and reset.
    Acquired(Frame),
    /// The swapchain no longer matches the surface (out of date or
    /// suboptimal) and must be rebuilt.
    Stale(vk::Result),
    /// The acquire failed for another reason (for example a timeout).
    Failed(vk::Result),
}

/// The presentable image chain and its per-image synchronization state.
///
/// # Thread Safety
///
/// The swapchain is driven by a single thread. It is `Send` so it can be
/// handed to the thread that runs the frame loop.
pub struct SwapchainState {
    context: Arc<dyn DisplayContext>,
    preferences: SwapchainPreferences,
    swapchain: vk::SwapchainKHR,
    /// Slots in image index order.
    images: Vec<PresentableImage>,
    pool: SemaphorePool,
    surface_format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
    present_mode: vk::PresentModeKHR,
}

impl SwapchainState {
    /// Creates the swapchain and one [`PresentableImage`] per image.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Surface queries fail
    /// - The surface currently has a zero extent
    /// - Swapchain, view, semaphore or fence creation fails
    pub fn new(
        context: Arc<dyn DisplayContext>,
        preferences: SwapchainPreferences,
    ) -> RhiResult<Self> {
        let mut state = Self {
            context,
            preferences,
            swapchain: vk::SwapchainKHR::null(),
            images: Vec::new(),
            pool: SemaphorePool::new(),
            surface_format: vk::SurfaceFormatKHR::default(),
            extent: vk::Extent2D::default(),
            present_mode: vk::PresentModeKHR::FIFO,
        };
        state.create(vk::SwapchainKHR::null())?;
        Ok(state)
    }

    /// Rebuilds the chain in place for the current surface.
    ///
    /// The current chain is handed to the driver as the old swapchain and
    /// destroyed once the new one exists. Spare semaphores are kept, up to
    /// the new image count.
    ///
    /// The caller must ensure no GPU work referencing the current images is
    /// still pending.
    ///
    /// # Errors
    ///
    /// Returns an error if the surface has a zero extent or any creation
    /// call fails. The state holds no images afterwards in that case.
    pub fn rebuild(&mut self) -> RhiResult<()> {
        info!(
            "Rebuilding swapchain (was {}x{}, {} images)",
            self.extent.width,
            self.extent.height,
            self.images.len()
        );

        self.images.clear();

        let old_swapchain = self.swapchain;
        let result = self.create(old_swapchain);

        // A retired chain is never queried again, only destroyed.
        if old_swapchain != vk::SwapchainKHR::null() {
            self.context.destroy_swapchain(old_swapchain);
            if self.swapchain == old_swapchain {
                self.swapchain = vk::SwapchainKHR::null();
            }
        }
        result?;

        self.pool.trim(self.images.len());
        Ok(())
    }

    fn create(&mut self, old_swapchain: vk::SwapchainKHR) -> RhiResult<()> {
        let capabilities = self.context.surface_capabilities()?;
        let surface_format = self.context.surface_format()?;
        let present_modes = self.context.surface_present_modes()?;

        let drawable = self.context.drawable_size();
        let extent = choose_extent(&capabilities, drawable);
        if extent.width == 0 || extent.height == 0 {
            return Err(RhiError::SwapchainError(format!(
                "Surface has zero extent {}x{}",
                extent.width, extent.height
            )));
        }

        let present_mode = choose_present_mode(&present_modes, self.preferences.present_mode);
        let image_count = determine_image_count(&capabilities);

        info!(
            "Creating swapchain: {}x{}, format {:?}, color space {:?}, present mode {:?}, {} images",
            extent.width,
            extent.height,
            surface_format.format,
            surface_format.color_space,
            present_mode,
            image_count
        );

        // One queue does graphics and present, so the images are never shared.
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.context.surface())
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let swapchain = self.context.create_swapchain(&create_info)?;
        self.swapchain = swapchain;
        self.surface_format = surface_format;
        self.extent = extent;
        self.present_mode = present_mode;

        let images = self.context.swapchain_images(swapchain)?;
        info!("Swapchain created with {} images", images.len());

        let mut slots = Vec::with_capacity(images.len());
        for (i, &image) in images.iter().enumerate() {
            slots.push(PresentableImage::new(
                self.context.clone(),
                i as u32,
                image,
                surface_format.format,
            )?);
        }
        debug!("Created {} presentable images", slots.len());
        self.images = slots;

        Ok(())
    }

    /// Acquires the next image.
    ///
    /// On success the returned frame's fence has been waited on and reset,
    /// so its previous submission has completed and the frame can be
    /// submitted again right away.
    ///
    /// # Errors
    ///
    /// Only semaphore creation and fence failures are errors. Stale and
    /// failed acquires are reported through [`AcquireOutcome`].
    pub fn acquire(&mut self) -> RhiResult<AcquireOutcome> {
        let semaphore = self.pool.take(&self.context)?;

        let acquired = self.context.acquire_next_image(
            self.swapchain,
            self.preferences.acquire_timeout,
            semaphore.handle(),
        );

        let (index, suboptimal) = match acquired {
            Ok(acquired) => acquired,
            Err(code) => {
                // Nothing was signaled; the semaphore is still spare.
                self.pool.recycle(semaphore);
                return Ok(match code {
                    vk::Result::ERROR_OUT_OF_DATE_KHR => AcquireOutcome::Stale(code),
                    _ => AcquireOutcome::Failed(code),
                });
            }
        };

        let image_count = self.images.len();
        let Some(slot) = self.images.get_mut(index as usize) else {
            return Err(RhiError::SwapchainError(format!(
                "Acquired image index {} out of range ({} images)",
                index, image_count
            )));
        };

        slot.index = index;
        slot.fence.wait(u64::MAX)?;

        // A suboptimal acquire still signals the semaphore, so it cannot go
        // back to the pool. It is retired into the slot like a normal acquire,
        // but the fence stays signaled because nothing will be submitted.
        if !suboptimal {
            slot.fence.reset()?;
        }
        let previous = std::mem::replace(&mut slot.acquire_semaphore, semaphore);
        self.pool.recycle(previous);

        if suboptimal {
            debug!("Acquired image {} from a suboptimal swapchain", index);
            return Ok(AcquireOutcome::Stale(vk::Result::SUBOPTIMAL_KHR));
        }

        Ok(AcquireOutcome::Acquired(
            slot.frame(self.surface_format.format, self.extent),
        ))
    }

    /// The extent a rebuild would use right now.
    ///
    /// Zero while the window is minimized.
    pub fn surface_extent(&self) -> RhiResult<vk::Extent2D> {
        let capabilities = self.context.surface_capabilities()?;
        let drawable = self.context.drawable_size();
        Ok(choose_extent(&capabilities, drawable))
    }

    /// Returns the swapchain handle.
    #[inline]
    pub fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    /// Returns the context the swapchain was created on.
    #[inline]
    pub fn context(&self) -> &Arc<dyn DisplayContext> {
        &self.context
    }

    /// Returns the swapchain extent (resolution).
    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Returns the present mode.
    #[inline]
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    /// Returns the number of swapchain images.
    #[inline]
    pub fn image_count(&self) -> u32 {
        self.images.len() as u32
    }

    /// Returns all slots in image index order.
    #[inline]
    pub fn images(&self) -> &[PresentableImage] {
        &self.images
    }

    /// Snapshot of the slot at `index`, as the frame callbacks see it.
    pub fn frame(&self, index: usize) -> Option<Frame> {
        self.images
            .get(index)
            .map(|slot| slot.frame(self.surface_format.format, self.extent))
    }

    /// Number of spare acquire semaphores.
    #[inline]
    pub fn recycled_semaphores(&self) -> usize {
        self.pool.len()
    }
}

impl Drop for SwapchainState {
    fn drop(&mut self) {
        // Fences and semaphores may still be referenced by queued work.
        if let Err(e) = self.context.device_wait_idle() {
            error!("Failed to wait for device idle before swapchain teardown: {}", e);
        }

        self.images.clear();

        if self.swapchain != vk::SwapchainKHR::null() {
            self.context.destroy_swapchain(self.swapchain);

            info!(
                "Swapchain destroyed (was {}x{}, {} spare semaphores)",
                self.extent.width,
                self.extent.height,
                self.pool.len()
            );
        }
    }
}

/// Formats tried in order, each in the sRGB nonlinear color space.
const PREFERRED_FORMATS: [vk::Format; 2] = [vk::Format::B8G8R8A8_SRGB, vk::Format::B8G8R8A8_UNORM];

/// Picks the first preferred format the surface offers, or else its first
/// format.
///
/// # Errors
///
/// Returns an error if `formats` is empty.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> RhiResult<vk::SurfaceFormatKHR> {
    let preferred = PREFERRED_FORMATS.iter().find_map(|&wanted| {
        formats.iter().copied().find(|f| {
            f.format == wanted && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
    });

    match preferred.or_else(|| formats.first().copied()) {
        Some(chosen) => {
            debug!("Surface format {:?} ({:?})", chosen.format, chosen.color_space);
            Ok(chosen)
        }
        None => Err(RhiError::SurfaceError("Surface reports no formats".to_string())),
    }
}

/// `preferred` when the surface supports it, FIFO otherwise.
fn choose_present_mode(
    present_modes: &[vk::PresentModeKHR],
    preferred: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if present_modes.contains(&preferred) {
        preferred
    } else {
        debug!("Present mode {:?} unsupported, using FIFO", preferred);
        vk::PresentModeKHR::FIFO
    }
}

/// The surface's current extent, or `drawable` clamped to the surface limits
/// when the surface leaves the extent to the swapchain.
///
/// A zero-sized drawable stays zero so minimization stays visible.
fn choose_extent(capabilities: &vk::SurfaceCapabilitiesKHR, drawable: vk::Extent2D) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }
    if drawable.width == 0 || drawable.height == 0 {
        return vk::Extent2D::default();
    }

    let (min, max) = (capabilities.min_image_extent, capabilities.max_image_extent);
    vk::Extent2D {
        width: drawable.width.clamp(min.width, max.width),
        height: drawable.height.clamp(min.height, max.height),
    }
}

/// One image more than the surface minimum, within its maximum (0 = none).
fn determine_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let wanted = capabilities.min_image_count + 1;
    match capabilities.max_image_count {
        0 => wanted,
        max => wanted.min(max),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::FrameSubmission;
    use crate::mock::{Call, MockContext};

    fn setup() -> (Arc<MockContext>, SwapchainState) {
        let mock = Arc::new(MockContext::new());
        let context: Arc<dyn DisplayContext> = mock.clone();
        let state = SwapchainState::new(context, SwapchainPreferences::default()).unwrap();
        (mock, state)
    }

    /// Submits an empty command buffer for `frame` and presents it.
    fn render(state: &SwapchainState, frame: &Frame, command_buffer: vk::CommandBuffer) {
        let context = state.context();
        context.begin_command_buffer(command_buffer).unwrap();
        context.end_command_buffer(command_buffer).unwrap();
        context
            .queue_submit(&FrameSubmission {
                command_buffer,
                wait_semaphore: frame.acquire_semaphore,
                wait_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                signal_semaphore: frame.release_semaphore,
                fence: frame.fence,
            })
            .unwrap();
        context
            .queue_present(state.handle(), frame.index, frame.release_semaphore)
            .unwrap();
    }

    fn command_buffers(state: &SwapchainState) -> (vk::CommandPool, Vec<vk::CommandBuffer>) {
        let context = state.context();
        let pool = context
            .create_command_pool(0, vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .unwrap();
        let buffers = context
            .allocate_command_buffers(pool, state.image_count())
            .unwrap();
        (pool, buffers)
    }

    fn acquired(outcome: AcquireOutcome) -> Frame {
        match outcome {
            AcquireOutcome::Acquired(frame) => frame,
            other => panic!("expected an acquired frame, got {:?}", other),
        }
    }

    fn srgb(format: vk::Format) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    fn free_extent(min: u32, max: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: min,
                height: min,
            },
            max_image_extent: vk::Extent2D {
                width: max,
                height: max,
            },
            ..Default::default()
        }
    }

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    #[test]
    fn test_surface_format_preference_order() {
        let all = [
            srgb(vk::Format::R8G8B8A8_UNORM),
            srgb(vk::Format::B8G8R8A8_UNORM),
            srgb(vk::Format::B8G8R8A8_SRGB),
        ];
        assert_eq!(choose_surface_format(&all).unwrap(), all[2]);
        assert_eq!(choose_surface_format(&all[..2]).unwrap(), all[1]);
        assert_eq!(choose_surface_format(&all[..1]).unwrap(), all[0]);

        // The preferred format in another color space does not count.
        let hdr = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_SRGB,
            color_space: vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT,
        };
        assert_eq!(choose_surface_format(&[hdr, all[0]]).unwrap(), all[0]);
    }

    #[test]
    fn test_choose_surface_format_empty_is_error() {
        assert!(matches!(
            choose_surface_format(&[]),
            Err(RhiError::SurfaceError(_))
        ));
    }

    #[test]
    fn test_present_mode_falls_back_to_fifo() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE];
        assert_eq!(
            choose_present_mode(&modes, vk::PresentModeKHR::IMMEDIATE),
            vk::PresentModeKHR::IMMEDIATE
        );
        assert_eq!(
            choose_present_mode(&modes, vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn test_fixed_surface_extent_wins_over_drawable() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: extent(1920, 1080),
            ..free_extent(1, 4096)
        };
        assert_eq!(choose_extent(&capabilities, extent(800, 600)), extent(1920, 1080));
    }

    #[test]
    fn test_free_extent_is_clamped_drawable() {
        let capabilities = free_extent(100, 2000);
        assert_eq!(choose_extent(&capabilities, extent(3000, 50)), extent(2000, 100));
        assert_eq!(choose_extent(&capabilities, extent(800, 600)), extent(800, 600));
        assert_eq!(choose_extent(&capabilities, extent(0, 600)), extent(0, 0));
    }

    #[test]
    fn test_image_count_is_one_over_minimum_within_maximum() {
        let count = |min_image_count, max_image_count| {
            determine_image_count(&vk::SurfaceCapabilitiesKHR {
                min_image_count,
                max_image_count,
                ..Default::default()
            })
        };
        assert_eq!(count(2, 8), 3);
        assert_eq!(count(2, 0), 3);
        assert_eq!(count(3, 3), 3);
        assert_eq!(count(1, 2), 2);
    }

    #[test]
    fn test_new_builds_one_slot_per_image() {
        let (mock, state) = setup();

        assert_eq!(state.image_count(), 3);
        assert_eq!(
            state.extent(),
            vk::Extent2D {
                width: 800,
                height: 600
            }
        );
        assert_eq!(state.present_mode(), vk::PresentModeKHR::MAILBOX);
        assert_eq!(mock.live_image_view_count(), 3);
        // acquire + release per slot
        assert_eq!(mock.live_semaphore_count(), 6);
        assert_eq!(mock.live_fence_count(), 3);

        for (i, slot) in state.images().iter().enumerate() {
            assert_eq!(slot.index(), i as u32);
            assert!(slot.fence().is_signaled());
            assert_ne!(slot.acquire_semaphore(), slot.release_semaphore());
        }
    }

    #[test]
    fn test_new_uses_driver_image_count() {
        let mock = Arc::new(MockContext::new());
        mock.set_image_count_override(Some(4));
        let context: Arc<dyn DisplayContext> = mock.clone();

        let state = SwapchainState::new(context, SwapchainPreferences::default()).unwrap();
        assert_eq!(state.image_count(), 4);
        assert_eq!(mock.live_fence_count(), 4);
    }

    #[test]
    fn test_new_rejects_zero_extent() {
        let mock = Arc::new(MockContext::new());
        mock.set_surface_extent(0, 0);
        let context: Arc<dyn DisplayContext> = mock.clone();

        let result = SwapchainState::new(context, SwapchainPreferences::default());
        assert!(matches!(result, Err(RhiError::SwapchainError(_))));
        assert!(mock.created_swapchains().is_empty());
    }

    #[test]
    fn test_undefined_extent_follows_drawable_size() {
        let mock = Arc::new(MockContext::new());
        mock.set_undefined_extent(1024, 768);
        let context: Arc<dyn DisplayContext> = mock.clone();

        let state = SwapchainState::new(context, SwapchainPreferences::default()).unwrap();
        assert_eq!(
            state.extent(),
            vk::Extent2D {
                width: 1024,
                height: 768
            }
        );
    }

    #[test]
    fn test_acquire_waits_and_resets_slot_fence() {
        let (mock, mut state) = setup();
        mock.clear_calls();

        let frame = acquired(state.acquire().unwrap());
        let calls = mock.calls();

        assert!(calls.contains(&Call::WaitForFence(frame.fence)));
        assert!(calls.contains(&Call::ResetFence(frame.fence)));
        assert!(!state.images()[frame.index as usize].fence().is_signaled());
    }

    #[test]
    fn test_acquire_swaps_semaphore_into_slot() {
        let (mock, mut state) = setup();
        let initial = state.images()[0].acquire_semaphore();
        mock.clear_calls();

        let frame = acquired(state.acquire().unwrap());
        assert_eq!(frame.index, 0);

        let used = match mock.calls().first() {
            Some(Call::Acquire { semaphore, .. }) => *semaphore,
            other => panic!("expected an acquire, got {:?}", other),
        };
        assert_eq!(frame.acquire_semaphore, used);
        assert_ne!(used, initial);
        assert!(state.pool.contains(initial));
        assert_eq!(state.recycled_semaphores(), 1);
    }

    #[test]
    fn test_out_of_date_returns_semaphore_to_pool() {
        let (mock, mut state) = setup();
        mock.fail_next_acquire(vk::Result::ERROR_OUT_OF_DATE_KHR);
        mock.clear_calls();

        let outcome = state.acquire().unwrap();
        assert_eq!(
            outcome,
            AcquireOutcome::Stale(vk::Result::ERROR_OUT_OF_DATE_KHR)
        );
        assert_eq!(state.recycled_semaphores(), 1);
        assert!(
            !mock
                .calls()
                .iter()
                .any(|call| matches!(call, Call::WaitForFence(_) | Call::ResetFence(_)))
        );
        for slot in state.images() {
            assert!(slot.fence().is_signaled());
        }
    }

    #[test]
    fn test_other_acquire_errors_are_failures() {
        let (mock, mut state) = setup();
        mock.fail_next_acquire(vk::Result::TIMEOUT);

        assert_eq!(
            state.acquire().unwrap(),
            AcquireOutcome::Failed(vk::Result::TIMEOUT)
        );
        assert_eq!(state.recycled_semaphores(), 1);

        let spare = match mock.calls().last() {
            Some(Call::Acquire { semaphore, .. }) => *semaphore,
            other => panic!("expected an acquire, got {:?}", other),
        };
        assert!(state.pool.contains(spare));

        // The same spare is used again
        let frame = acquired(state.acquire().unwrap());
        assert_eq!(frame.acquire_semaphore, spare);
    }

    #[test]
    fn test_suboptimal_acquire_is_stale_and_keeps_fence_signaled() {
        let (mock, mut state) = setup();
        mock.suboptimal_next_acquire();

        let outcome = state.acquire().unwrap();
        assert_eq!(outcome, AcquireOutcome::Stale(vk::Result::SUBOPTIMAL_KHR));
        assert!(state.images()[0].fence().is_signaled());

        state.rebuild().unwrap();
        let frame = acquired(state.acquire().unwrap());
        let (_pool, buffers) = command_buffers(&state);
        render(&state, &frame, buffers[frame.index as usize]);

        assert!(mock.violations().is_empty(), "{:?}", mock.violations());
    }

    #[test]
    fn test_semaphores_never_alias_pending_work() {
        let (mock, mut state) = setup();
        let (_pool, buffers) = command_buffers(&state);

        for _ in 0..20 {
            let frame = acquired(state.acquire().unwrap());

            // No other slot holds the semaphore that was just used.
            for (i, slot) in state.images().iter().enumerate() {
                if i as u32 != frame.index {
                    assert_ne!(slot.acquire_semaphore(), frame.acquire_semaphore);
                }
            }

            render(&state, &frame, buffers[frame.index as usize]);
            assert!(state.recycled_semaphores() <= state.image_count() as usize);
        }

        assert!(mock.violations().is_empty(), "{:?}", mock.violations());
    }

    #[test]
    fn test_consecutive_acquires_get_distinct_semaphores() {
        let (_mock, mut state) = setup();

        let first = acquired(state.acquire().unwrap());
        let second = acquired(state.acquire().unwrap());

        assert_ne!(first.index, second.index);
        assert_ne!(first.acquire_semaphore, second.acquire_semaphore);
    }

    #[test]
    fn test_rebuild_passes_old_chain_and_destroys_it() {
        let (mock, mut state) = setup();
        let old = state.handle();

        state.rebuild().unwrap();

        let created = mock.created_swapchains();
        assert_eq!(created.len(), 2);
        assert_eq!(created[1], (state.handle(), old));
        assert!(mock.calls().contains(&Call::DestroySwapchain(old)));
        assert_eq!(mock.live_swapchain_count(), 1);
        assert_eq!(mock.live_image_view_count(), 3);
        assert!(mock.violations().is_empty(), "{:?}", mock.violations());
    }

    #[test]
    fn test_rebuild_is_idempotent() {
        let (mock, mut state) = setup();

        state.rebuild().unwrap();
        let (count, extent) = (state.image_count(), state.extent());
        state.rebuild().unwrap();

        assert_eq!(state.image_count(), count);
        assert_eq!(state.extent(), extent);
        assert_eq!(mock.live_fence_count(), count as usize);
    }

    #[test]
    fn test_rebuild_picks_up_new_extent() {
        let (mock, mut state) = setup();
        mock.set_surface_extent(1280, 720);

        assert_eq!(
            state.surface_extent().unwrap(),
            vk::Extent2D {
                width: 1280,
                height: 720
            }
        );
        state.rebuild().unwrap();
        assert_eq!(
            state.extent(),
            vk::Extent2D {
                width: 1280,
                height: 720
            }
        );
    }

    #[test]
    fn test_rebuild_trims_pool_to_image_count() {
        let (mock, mut state) = setup();
        for _ in 0..5 {
            state
                .pool
                .recycle(Semaphore::new(state.context().clone()).unwrap());
        }
        mock.set_image_count_limits(1, 2);

        state.rebuild().unwrap();
        assert_eq!(state.image_count(), 2);
        assert_eq!(state.recycled_semaphores(), 2);
    }

    #[test]
    fn test_drop_releases_everything() {
        let (mock, mut state) = setup();
        let (pool, buffers) = command_buffers(&state);
        let frame = acquired(state.acquire().unwrap());
        render(&state, &frame, buffers[frame.index as usize]);
        state.context().device_wait_idle().unwrap();
        state.context().free_command_buffers(pool, &buffers);
        state.context().destroy_command_pool(pool);

        drop(state);

        assert!(mock.all_destroyed());
        assert!(mock.violations().is_empty(), "{:?}", mock.violations());
    }
}
