//! Error types shared by the non-GPU crates.

use thiserror::Error;

/// Main error type for the swapframe crates.
#[derive(Error, Debug)]
pub enum Error {
    /// Vulkan-related errors
    #[error("Vulkan error: {0}")]
    Vulkan(String),

    /// Window creation or event loop errors
    #[error("Window error: {0}")]
    Window(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed configuration file
    #[error("Config error: {0}")]
    Config(#[from] toml::de::Error),
}

/// Result type alias using the swapframe Error type.
pub type Result<T> = std::result::Result<T, Error>;
