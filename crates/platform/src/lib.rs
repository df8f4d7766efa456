//! Platform layer for the swapframe engine.
//!
//! This crate provides the windowing collaborators the frame engine consumes:
//! - Window management via winit
//! - The [`EventSource`] polling interface (poll, wait, close-requested)
//! - Vulkan surface creation from raw window handles

mod events;
mod system;
mod window;

pub use events::EventSource;
pub use system::WindowSystem;
pub use window::{Surface, Window};
