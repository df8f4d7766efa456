//! Command pools and command recording.
//!
//! [`CommandPool`] hands out the per-image buffers the frame scheduler
//! prerecords; [`CommandBuffer`] records into one of them.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use swapframe_rhi::command::{CommandBuffer, CommandPool};
//! use swapframe_rhi::context::DisplayContext;
//! use swapframe_rhi::device::Device;
//! use swapframe_rhi::vk;
//!
//! # fn example(context: Arc<dyn DisplayContext>, device: Arc<Device>, image: vk::Image) -> swapframe_rhi::RhiResult<()> {
//! let pool = CommandPool::new(context.clone(), context.queue_family_index())?;
//! let buffers = pool.allocate(3)?;
//!
//! context.begin_command_buffer(buffers[0])?;
//! let cmd = CommandBuffer::from_handle(device, buffers[0]);
//! cmd.transition_image_layout(
//!     image,
//!     vk::ImageLayout::UNDEFINED,
//!     vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
//!     vk::ImageAspectFlags::COLOR,
//! );
//! context.end_command_buffer(cmd.handle())?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use tracing::{debug, warn};

use crate::context::DisplayContext;
use crate::device::Device;
use crate::error::RhiResult;

/// Command pool whose buffers are allocated and freed through a
/// [`DisplayContext`].
///
/// Created with `RESET_COMMAND_BUFFER`, so each buffer can be re-recorded on
/// its own. Not for use from several threads at once.
pub struct CommandPool {
    context: Arc<dyn DisplayContext>,
    pool: vk::CommandPool,
}

impl CommandPool {
    pub fn new(context: Arc<dyn DisplayContext>, queue_family_index: u32) -> RhiResult<Self> {
        let pool = context.create_command_pool(
            queue_family_index,
            vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
        )?;
        debug!("Command pool created for queue family {}", queue_family_index);
        Ok(Self { context, pool })
    }

    /// Allocates `count` primary command buffers.
    pub fn allocate(&self, count: u32) -> RhiResult<Vec<vk::CommandBuffer>> {
        self.context.allocate_command_buffers(self.pool, count)
    }

    /// Returns command buffers to the pool.
    ///
    /// None of them may still be pending on the GPU.
    pub fn free(&self, buffers: &[vk::CommandBuffer]) {
        if !buffers.is_empty() {
            self.context.free_command_buffers(self.pool, buffers);
        }
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        self.context.destroy_command_pool(self.pool);
        debug!("Command pool destroyed");
    }
}

/// Recorder for a command buffer in the recording state.
///
/// Covers what a frame records: dynamic rendering, viewport and scissor, and
/// whole-image layout transitions through synchronization2. The handle is
/// borrowed; its pool frees it.
pub struct CommandBuffer {
    device: Arc<Device>,
    buffer: vk::CommandBuffer,
}

impl CommandBuffer {
    #[inline]
    pub fn from_handle(device: Arc<Device>, buffer: vk::CommandBuffer) -> Self {
        Self { device, buffer }
    }

    #[inline]
    pub fn handle(&self) -> vk::CommandBuffer {
        self.buffer
    }

    pub fn begin_rendering(&self, rendering_info: &vk::RenderingInfo) {
        unsafe {
            self.device
                .handle()
                .cmd_begin_rendering(self.buffer, rendering_info)
        };
    }

    pub fn end_rendering(&self) {
        unsafe { self.device.handle().cmd_end_rendering(self.buffer) };
    }

    pub fn set_viewport(&self, viewport: &vk::Viewport) {
        unsafe {
            self.device
                .handle()
                .cmd_set_viewport(self.buffer, 0, std::slice::from_ref(viewport))
        };
    }

    pub fn set_scissor(&self, scissor: &vk::Rect2D) {
        unsafe {
            self.device
                .handle()
                .cmd_set_scissor(self.buffer, 0, std::slice::from_ref(scissor))
        };
    }

    /// Moves every mip level and layer of `image` from `old_layout` to
    /// `new_layout`.
    pub fn transition_image_layout(
        &self,
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
        aspect_mask: vk::ImageAspectFlags,
    ) {
        let masks = LayoutTransition::between(old_layout, new_layout);
        let barrier = vk::ImageMemoryBarrier2::default()
            .src_stage_mask(masks.src_stage)
            .src_access_mask(masks.src_access)
            .dst_stage_mask(masks.dst_stage)
            .dst_access_mask(masks.dst_access)
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(aspect_mask)
                    .level_count(vk::REMAINING_MIP_LEVELS)
                    .layer_count(vk::REMAINING_ARRAY_LAYERS),
            );
        let dependency =
            vk::DependencyInfo::default().image_memory_barriers(std::slice::from_ref(&barrier));

        unsafe {
            self.device
                .handle()
                .cmd_pipeline_barrier2(self.buffer, &dependency)
        };
    }
}

/// Stage and access scopes of one layout transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LayoutTransition {
    src_stage: vk::PipelineStageFlags2,
    src_access: vk::AccessFlags2,
    dst_stage: vk::PipelineStageFlags2,
    dst_access: vk::AccessFlags2,
}

impl LayoutTransition {
    fn between(old_layout: vk::ImageLayout, new_layout: vk::ImageLayout) -> Self {
        use vk::{AccessFlags2 as A, ImageLayout as L, PipelineStageFlags2 as S};

        let fragment_tests = S::EARLY_FRAGMENT_TESTS | S::LATE_FRAGMENT_TESTS;
        match (old_layout, new_layout) {
            // Same stage the acquire semaphore is waited on.
            (L::UNDEFINED, L::COLOR_ATTACHMENT_OPTIMAL) => Self {
                src_stage: S::COLOR_ATTACHMENT_OUTPUT,
                src_access: A::NONE,
                dst_stage: S::COLOR_ATTACHMENT_OUTPUT,
                dst_access: A::COLOR_ATTACHMENT_WRITE,
            },
            (L::UNDEFINED, L::DEPTH_ATTACHMENT_OPTIMAL) => Self {
                src_stage: fragment_tests,
                src_access: A::DEPTH_STENCIL_ATTACHMENT_WRITE,
                dst_stage: fragment_tests,
                dst_access: A::DEPTH_STENCIL_ATTACHMENT_READ | A::DEPTH_STENCIL_ATTACHMENT_WRITE,
            },
            // Presentation is ordered by the release semaphore.
            (L::COLOR_ATTACHMENT_OPTIMAL, L::PRESENT_SRC_KHR) => Self {
                src_stage: S::COLOR_ATTACHMENT_OUTPUT,
                src_access: A::COLOR_ATTACHMENT_WRITE,
                dst_stage: S::NONE,
                dst_access: A::NONE,
            },
            _ => {
                warn!(
                    "No barrier scopes for {:?} -> {:?}, using a full barrier",
                    old_layout, new_layout
                );
                Self {
                    src_stage: S::ALL_COMMANDS,
                    src_access: A::MEMORY_READ | A::MEMORY_WRITE,
                    dst_stage: S::ALL_COMMANDS,
                    dst_access: A::MEMORY_READ | A::MEMORY_WRITE,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{Call, MockContext};

    #[test]
    fn test_command_buffer_is_send() {
        // Compile-time check that CommandBuffer is Send
        fn assert_send<T: Send>() {}
        assert_send::<CommandBuffer>();
    }

    #[test]
    fn test_command_pool_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<CommandPool>();
    }

    #[test]
    fn test_pool_allocates_and_frees() {
        let mock = Arc::new(MockContext::new());
        let context: Arc<dyn DisplayContext> = mock.clone();

        let pool = CommandPool::new(context, 0).unwrap();
        let buffers = pool.allocate(3).unwrap();
        assert_eq!(buffers.len(), 3);
        assert_eq!(mock.live_command_buffer_count(), 3);

        pool.free(&buffers);
        assert_eq!(mock.live_command_buffer_count(), 0);

        // Freeing nothing is not forwarded
        pool.free(&[]);
        assert_eq!(
            mock.calls()
                .iter()
                .filter(|call| matches!(call, Call::FreeCommandBuffers(_)))
                .count(),
            1
        );

        drop(pool);
        assert_eq!(mock.live_command_pool_count(), 0);
        assert!(mock.violations().is_empty(), "{:?}", mock.violations());
    }

    #[test]
    fn test_color_transition_waits_in_attachment_stage() {
        let transition = LayoutTransition::between(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        );
        assert_eq!(
            transition.src_stage,
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT
        );
        assert_eq!(transition.src_access, vk::AccessFlags2::NONE);
        assert_eq!(
            transition.dst_access,
            vk::AccessFlags2::COLOR_ATTACHMENT_WRITE
        );
    }

    #[test]
    fn test_present_transition_makes_color_writes_available() {
        let transition = LayoutTransition::between(
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
        );
        assert_eq!(
            transition.src_access,
            vk::AccessFlags2::COLOR_ATTACHMENT_WRITE
        );
        assert_eq!(transition.dst_stage, vk::PipelineStageFlags2::NONE);
    }

    #[test]
    fn test_unknown_transition_uses_full_barrier() {
        let transition = LayoutTransition::between(
            vk::ImageLayout::GENERAL,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        );
        assert_eq!(transition.src_stage, vk::PipelineStageFlags2::ALL_COMMANDS);
        assert_eq!(transition.dst_stage, vk::PipelineStageFlags2::ALL_COMMANDS);
    }
}
