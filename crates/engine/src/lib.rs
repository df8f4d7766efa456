//! Swapchain-synchronized frame presentation.
//!
//! This crate runs the frame loop on top of the RHI:
//! - [`FrameScheduler`]: acquire, submit and present, with transparent
//!   swapchain rebuilds on resize and staleness
//! - [`VulkanContext`]: the `ash` implementation of
//!   [`DisplayContext`](swapframe_rhi::DisplayContext)
//! - [`DepthBuffer`]: per-image depth targets for scenes that need them

pub mod context;
pub mod depth_buffer;
pub mod scheduler;

pub use context::VulkanContext;
pub use depth_buffer::DepthBuffer;
pub use scheduler::{FrameScheduler, StepOutcome};
