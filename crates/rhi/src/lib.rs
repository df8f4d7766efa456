//! Vulkan abstraction layer (Render Hardware Interface).
//!
//! This crate provides a safe abstraction over Vulkan using the `ash` crate.
//! It handles:
//! - Instance and device creation
//! - The [`DisplayContext`](context::DisplayContext) seam the frame engine runs on
//! - Swapchain management and the acquire-semaphore recycling protocol
//! - Command pools and command buffer recording
//! - Synchronization primitives

mod error;

pub mod command;
pub mod context;
pub mod device;
pub mod instance;
pub mod physical_device;
pub mod swapchain;
pub mod sync;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use context::{DisplayContext, FrameSubmission};
pub use error::{RhiError, RhiResult};
pub use swapchain::{AcquireOutcome, Frame, SwapchainPreferences, SwapchainState};

// Re-export ash types that users might need
pub use ash::vk;
