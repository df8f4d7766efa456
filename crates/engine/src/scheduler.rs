//! The acquire / submit / present loop.
//!
//! [`FrameScheduler`] drives a [`SwapchainState`] one frame at a time. Every
//! swapchain image gets one command buffer, recorded once when the chain is
//! (re)built and resubmitted every time that image comes around again. The
//! scene plugs in through two mandatory callbacks and two optional hook
//! lists:
//!
//! - `build_target(&Frame)`: (re)creates whatever the scene renders into
//!   alongside the swapchain image (depth buffers, framebuffers), once per
//!   image per rebuild
//! - `record_commands(cmd, &Frame)`: records the frame's commands into a
//!   command buffer that is already in the recording state
//! - [`on_update`](FrameScheduler::on_update): per-frame CPU work between
//!   acquire and submit
//! - [`on_resize`](FrameScheduler::on_resize): called after every rebuild
//!   with the new image count and extent
//!
//! Out-of-date and suboptimal results are routine. They trigger a rebuild
//! and never surface as errors.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use swapframe_engine::FrameScheduler;
//! use swapframe_platform::EventSource;
//! use swapframe_rhi::{DisplayContext, SwapchainPreferences, SwapchainState};
//!
//! # fn example(context: Arc<dyn DisplayContext>, events: &mut dyn EventSource) -> swapframe_rhi::RhiResult<()> {
//! let mut swapchain = SwapchainState::new(context.clone(), SwapchainPreferences::default())?;
//! let mut scheduler = FrameScheduler::new(
//!     context,
//!     &mut swapchain,
//!     Box::new(|_frame| Ok(())),
//!     Box::new(|_cmd, _frame| Ok(())),
//! )?;
//! scheduler.on_update(Box::new(|frame| {
//!     tracing::trace!("frame on image {}", frame.index);
//!     Ok(())
//! }));
//! scheduler.run(events)?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use tracing::{debug, error, info, warn};

use swapframe_platform::EventSource;
use swapframe_rhi::command::CommandPool;
use swapframe_rhi::{
    AcquireOutcome, DisplayContext, Frame, FrameSubmission, RhiError, RhiResult, SwapchainState,
};

/// Builds the per-image render target for a frame.
pub type BuildTargetFn<'a> = Box<dyn FnMut(&Frame) -> RhiResult<()> + 'a>;

/// Records a frame's commands into a command buffer in the recording state.
pub type RecordCommandsFn<'a> = Box<dyn FnMut(vk::CommandBuffer, &Frame) -> RhiResult<()> + 'a>;

/// Runs once per acquired frame, before submission.
pub type UpdateHook<'a> = Box<dyn FnMut(&Frame) -> RhiResult<()> + 'a>;

/// Runs once per rebuild with the new image count and extent.
pub type ResizeHook<'a> = Box<dyn FnMut(u32, vk::Extent2D) -> RhiResult<()> + 'a>;

/// What one [`FrameScheduler::step`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The frame was submitted and presented.
    Presented,
    /// The frame was submitted, but presentation reported the swapchain
    /// stale and it has been rebuilt.
    PresentedStale,
    /// Acquire reported the swapchain stale. It was rebuilt and nothing was
    /// submitted.
    Resized,
    /// Acquire failed for another reason. The queue was drained and the frame
    /// dropped.
    Skipped,
    /// The swapchain went stale and a close was requested while waiting for
    /// a nonzero surface extent. The swapchain is still stale.
    Closed,
}

/// Drives the acquire / submit / present cycle for one swapchain.
///
/// # Resource Destruction Order
///
/// 1. Wait for the device to go idle
/// 2. Command buffers and command pool
///
/// The swapchain is only borrowed and is destroyed by its owner afterwards.
pub struct FrameScheduler<'a> {
    context: Arc<dyn DisplayContext>,
    swapchain: &'a mut SwapchainState,
    command_pool: CommandPool,
    /// One prerecorded buffer per swapchain image, in image order.
    command_buffers: Vec<vk::CommandBuffer>,
    build_target: BuildTargetFn<'a>,
    record_commands: RecordCommandsFn<'a>,
    update_hooks: Vec<UpdateHook<'a>>,
    resize_hooks: Vec<ResizeHook<'a>>,
    prepared: bool,
    frames_presented: u64,
}

impl<'a> FrameScheduler<'a> {
    /// Creates a scheduler for `swapchain`.
    ///
    /// Only the command pool is created here. Targets and command buffers
    /// are prepared by the first [`step`](Self::step), so hooks registered
    /// in between see the initial image count.
    ///
    /// # Errors
    ///
    /// Returns an error if command pool creation fails.
    pub fn new(
        context: Arc<dyn DisplayContext>,
        swapchain: &'a mut SwapchainState,
        build_target: BuildTargetFn<'a>,
        record_commands: RecordCommandsFn<'a>,
    ) -> RhiResult<Self> {
        let command_pool = CommandPool::new(context.clone(), context.queue_family_index())?;

        debug!(
            "Frame scheduler created for {} swapchain images",
            swapchain.image_count()
        );

        Ok(Self {
            context,
            swapchain,
            command_pool,
            command_buffers: Vec::new(),
            build_target,
            record_commands,
            update_hooks: Vec::new(),
            resize_hooks: Vec::new(),
            prepared: false,
            frames_presented: 0,
        })
    }

    /// Registers a hook that runs for every acquired frame, in registration
    /// order.
    pub fn on_update(&mut self, hook: UpdateHook<'a>) {
        self.update_hooks.push(hook);
    }

    /// Registers a hook that runs after every rebuild, in registration order.
    pub fn on_resize(&mut self, hook: ResizeHook<'a>) {
        self.resize_hooks.push(hook);
    }

    /// Rebuilds the swapchain and everything derived from it.
    ///
    /// Blocks on `events` while the surface has a zero extent. Returns
    /// without rebuilding if a close is requested during that wait.
    ///
    /// # Errors
    ///
    /// Returns an error if waiting for the device, the rebuild, or any
    /// callback fails.
    pub fn resize(&mut self, events: &mut dyn EventSource) -> RhiResult<()> {
        self.rebuild(events).map(|_| ())
    }

    /// Returns `false` when a close cut the zero-extent wait short.
    fn rebuild(&mut self, events: &mut dyn EventSource) -> RhiResult<bool> {
        self.context.device_wait_idle()?;

        loop {
            let extent = self.swapchain.surface_extent()?;
            if extent.width > 0 && extent.height > 0 {
                break;
            }
            if events.close_requested() {
                info!("Close requested while the surface has a zero extent");
                return Ok(false);
            }
            debug!("Surface has a zero extent, waiting for events");
            events.wait_events();
        }

        self.swapchain.rebuild()?;
        self.prepare_frame_resources()?;
        Ok(true)
    }

    fn rebuild_after_stale(
        &mut self,
        events: &mut dyn EventSource,
        rebuilt: StepOutcome,
    ) -> RhiResult<StepOutcome> {
        if self.rebuild(events)? {
            Ok(rebuilt)
        } else {
            Ok(StepOutcome::Closed)
        }
    }

    /// Runs one frame.
    ///
    /// # Errors
    ///
    /// Returns an error if a callback fails, submission fails, presentation
    /// fails for a reason other than staleness, or a rebuild fails.
    pub fn step(&mut self, events: &mut dyn EventSource) -> RhiResult<StepOutcome> {
        if !self.prepared {
            self.prepare_frame_resources()?;
        }

        let frame = match self.swapchain.acquire()? {
            AcquireOutcome::Acquired(frame) => frame,
            AcquireOutcome::Stale(code) => {
                debug!("Acquire reported {:?}, rebuilding", code);
                return self.rebuild_after_stale(events, StepOutcome::Resized);
            }
            AcquireOutcome::Failed(code) => {
                warn!("Acquire failed with {:?}, skipping frame", code);
                self.context.queue_wait_idle()?;
                return Ok(StepOutcome::Skipped);
            }
        };

        for hook in &mut self.update_hooks {
            hook(&frame)?;
        }

        let command_buffer = self
            .command_buffers
            .get(frame.index as usize)
            .copied()
            .ok_or_else(|| {
                RhiError::InvalidHandle(format!("No command buffer for image {}", frame.index))
            })?;

        let submission = FrameSubmission {
            command_buffer,
            wait_semaphore: frame.acquire_semaphore,
            wait_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            signal_semaphore: frame.release_semaphore,
            fence: frame.fence,
        };
        self.context
            .queue_submit(&submission)
            .map_err(RhiError::SubmitFailed)?;

        let presented = self.context.queue_present(
            self.swapchain.handle(),
            frame.index,
            frame.release_semaphore,
        );

        match presented {
            Ok(false) => {
                self.frames_presented += 1;
                Ok(StepOutcome::Presented)
            }
            Ok(true) => {
                self.frames_presented += 1;
                debug!("Present reported a suboptimal swapchain, rebuilding");
                self.rebuild_after_stale(events, StepOutcome::PresentedStale)
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                debug!("Present reported an out-of-date swapchain, rebuilding");
                self.rebuild_after_stale(events, StepOutcome::PresentedStale)
            }
            Err(code) => Err(RhiError::PresentFailed(code)),
        }
    }

    /// Steps until `events` reports a close request or a step fails.
    ///
    /// The device is idle when this returns, on success and on error.
    ///
    /// # Errors
    ///
    /// Returns the first error from [`step`](Self::step), or from the final
    /// idle wait.
    pub fn run(&mut self, events: &mut dyn EventSource) -> RhiResult<()> {
        info!("Frame loop started");

        let result = loop {
            events.poll_events();
            if events.close_requested() {
                break Ok(());
            }
            if let Err(e) = self.step(events) {
                error!("Frame loop stopped: {}", e);
                break Err(e);
            }
        };

        let idle = self.context.device_wait_idle();
        info!(
            "Frame loop finished after {} presented frames",
            self.frames_presented
        );

        result.and(idle)
    }

    /// Frames presented so far, including suboptimal presents.
    #[inline]
    pub fn frames_presented(&self) -> u64 {
        self.frames_presented
    }

    /// The prerecorded command buffer for image `index`.
    #[inline]
    pub fn command_buffer(&self, index: usize) -> Option<vk::CommandBuffer> {
        self.command_buffers.get(index).copied()
    }

    #[inline]
    pub fn image_count(&self) -> u32 {
        self.swapchain.image_count()
    }

    #[inline]
    pub fn swapchain(&self) -> &SwapchainState {
        &*self.swapchain
    }

    /// Builds targets, runs resize hooks, and records one command buffer per
    /// image. The device must be idle.
    fn prepare_frame_resources(&mut self) -> RhiResult<()> {
        let image_count = self.swapchain.image_count();
        let extent = self.swapchain.extent();

        let frames: Vec<Frame> = (0..image_count as usize)
            .filter_map(|i| self.swapchain.frame(i))
            .collect();

        for frame in &frames {
            (self.build_target)(frame)?;
        }

        for hook in &mut self.resize_hooks {
            hook(image_count, extent)?;
        }

        let previous = std::mem::take(&mut self.command_buffers);
        self.command_pool.free(&previous);
        self.command_buffers = self.command_pool.allocate(image_count)?;

        for (frame, &buffer) in frames.iter().zip(&self.command_buffers) {
            self.context.begin_command_buffer(buffer)?;
            (self.record_commands)(buffer, frame)?;
            self.context.end_command_buffer(buffer)?;
        }

        self.prepared = true;
        debug!(
            "Prepared {} frames at {}x{}",
            image_count, extent.width, extent.height
        );
        Ok(())
    }
}

impl Drop for FrameScheduler<'_> {
    fn drop(&mut self) {
        // Buffers may still be executing.
        if let Err(e) = self.context.device_wait_idle() {
            error!("Failed to wait for device idle before freeing command buffers: {}", e);
        }
        self.command_pool.free(&self.command_buffers);
        self.command_buffers.clear();
    }
}
