//! Clear-screen demo scene.
//!
//! Every swapchain image gets its own depth buffer. The recorded commands
//! clear color and depth with dynamic rendering and hand the image to the
//! presentation engine; nothing is drawn.

use std::cell::Cell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use tracing::{debug, info};

use swapframe_core::Timer;
use swapframe_engine::DepthBuffer;
use swapframe_engine::depth_buffer::depth_aspect_mask;
use swapframe_platform::EventSource;
use swapframe_rhi::command::CommandBuffer;
use swapframe_rhi::device::Device;
use swapframe_rhi::{Frame, RhiError, RhiResult};

/// Per-image render targets and the commands that clear them.
pub struct ClearScene {
    device: Arc<Device>,
    depth_format: vk::Format,
    clear_color: [f32; 4],
    /// One depth buffer per swapchain image, in image order.
    depth_targets: Vec<DepthBuffer>,
    extent: vk::Extent2D,
}

impl ClearScene {
    pub fn new(device: Arc<Device>, depth_format: vk::Format, clear_color: [f32; 4]) -> Self {
        Self {
            device,
            depth_format,
            clear_color,
            depth_targets: Vec::new(),
            extent: vk::Extent2D::default(),
        }
    }

    /// (Re)creates the depth buffer for `frame`.
    ///
    /// Targets are rebuilt in image order, so building image 0 releases
    /// every target of the previous chain.
    pub fn build_target(&mut self, frame: &Frame) -> RhiResult<()> {
        let index = frame.index as usize;
        self.depth_targets.truncate(index);
        if self.depth_targets.len() != index {
            return Err(RhiError::InvalidHandle(format!(
                "Depth target {} built before target {}",
                index,
                self.depth_targets.len()
            )));
        }

        self.depth_targets.push(DepthBuffer::new(
            self.device.clone(),
            frame.extent,
            self.depth_format,
        )?);
        Ok(())
    }

    pub fn on_resize(&mut self, image_count: u32, extent: vk::Extent2D) {
        self.depth_targets.truncate(image_count as usize);
        self.extent = extent;
        info!(
            "Scene resized to {}x{} with {} images",
            extent.width, extent.height, image_count
        );
    }

    /// Records the clear pass for `frame` into `buffer`.
    pub fn record(&self, buffer: vk::CommandBuffer, frame: &Frame) -> RhiResult<()> {
        let depth = self
            .depth_targets
            .get(frame.index as usize)
            .ok_or_else(|| {
                RhiError::InvalidHandle(format!("No depth target for image {}", frame.index))
            })?;

        let cmd = CommandBuffer::from_handle(self.device.clone(), buffer);

        cmd.transition_image_layout(
            frame.image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageAspectFlags::COLOR,
        );
        cmd.transition_image_layout(
            depth.image(),
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
            depth_aspect_mask(depth.format()),
        );

        let color_attachment = vk::RenderingAttachmentInfo::default()
            .image_view(frame.view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: self.clear_color,
                },
            });

        let depth_attachment = vk::RenderingAttachmentInfo::default()
            .image_view(depth.image_view())
            .image_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::DONT_CARE)
            .clear_value(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            });

        let render_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: frame.extent,
        };

        let rendering_info = vk::RenderingInfo::default()
            .render_area(render_area)
            .layer_count(1)
            .color_attachments(std::slice::from_ref(&color_attachment))
            .depth_attachment(&depth_attachment);

        cmd.begin_rendering(&rendering_info);
        cmd.set_viewport(&full_viewport(frame.extent));
        cmd.set_scissor(&render_area);
        cmd.end_rendering();

        cmd.transition_image_layout(
            frame.image,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
            vk::ImageAspectFlags::COLOR,
        );

        debug!("Recorded clear pass for image {}", frame.index);
        Ok(())
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }
}

fn full_viewport(extent: vk::Extent2D) -> vk::Viewport {
    vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: extent.width as f32,
        height: extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    }
}

/// Frame rate over one-second windows.
#[derive(Debug, Default)]
pub struct FrameStats {
    timer: Timer,
    frames: u32,
    window: Duration,
}

impl FrameStats {
    const WINDOW: Duration = Duration::from_secs(1);

    pub fn new() -> Self {
        Self::default()
    }

    /// Counts a frame, returning the frame rate when a window completes.
    pub fn tick(&mut self) -> Option<f64> {
        let delta = self.timer.tick();
        self.record(delta)
    }

    fn record(&mut self, delta: Duration) -> Option<f64> {
        self.frames += 1;
        self.window += delta;
        if self.window < Self::WINDOW {
            return None;
        }

        let fps = f64::from(self.frames) / self.window.as_secs_f64();
        self.frames = 0;
        self.window = Duration::ZERO;
        Some(fps)
    }
}

/// Event source that also reports a close once enough frames were counted.
pub struct FrameLimit<'a> {
    inner: &'a mut dyn EventSource,
    frames: Rc<Cell<u64>>,
    max_frames: Option<u64>,
}

impl<'a> FrameLimit<'a> {
    /// `frames` is advanced by the caller, typically from an update hook.
    pub fn new(
        inner: &'a mut dyn EventSource,
        frames: Rc<Cell<u64>>,
        max_frames: Option<u64>,
    ) -> Self {
        Self {
            inner,
            frames,
            max_frames,
        }
    }

    fn limit_reached(&self) -> bool {
        self.max_frames
            .is_some_and(|max| self.frames.get() >= max)
    }
}

impl EventSource for FrameLimit<'_> {
    fn poll_events(&mut self) {
        self.inner.poll_events();
    }

    fn wait_events(&mut self) {
        self.inner.wait_events();
    }

    fn close_requested(&self) -> bool {
        self.inner.close_requested() || self.limit_reached()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Idle {
        polls: usize,
        closed: bool,
    }

    impl EventSource for Idle {
        fn poll_events(&mut self) {
            self.polls += 1;
        }

        fn close_requested(&self) -> bool {
            self.closed
        }
    }

    #[test]
    fn test_frame_stats_reports_once_per_window() {
        let mut stats = FrameStats::new();
        for _ in 0..59 {
            assert_eq!(stats.record(Duration::from_millis(16)), None);
        }
        let fps = stats.record(Duration::from_millis(56)).unwrap();
        assert!((fps - 60.0).abs() < 1e-9);

        // The window starts over.
        assert_eq!(stats.record(Duration::from_millis(16)), None);
    }

    #[test]
    fn test_frame_limit_closes_after_max_frames() {
        let mut inner = Idle::default();
        let frames = Rc::new(Cell::new(0));
        let mut events = FrameLimit::new(&mut inner, frames.clone(), Some(3));

        events.poll_events();
        assert!(!events.close_requested());
        frames.set(3);
        assert!(events.close_requested());
    }

    #[test]
    fn test_frame_limit_forwards_to_inner_source() {
        let mut inner = Idle {
            closed: true,
            ..Default::default()
        };
        let frames = Rc::new(Cell::new(0));
        {
            let mut events = FrameLimit::new(&mut inner, frames, None);
            events.poll_events();
            events.wait_events();
            assert!(events.close_requested());
        }
        // The default wait pumps once through poll.
        assert_eq!(inner.polls, 2);
    }

    #[test]
    fn test_full_viewport_covers_extent() {
        let viewport = full_viewport(vk::Extent2D {
            width: 800,
            height: 600,
        });
        assert_eq!(viewport.width, 800.0);
        assert_eq!(viewport.height, 600.0);
        assert_eq!(viewport.max_depth, 1.0);
    }
}
