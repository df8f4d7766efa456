//! Engine configuration loaded from TOML.
//!
//! Every field has a default, so a partial file (or no file at all) yields a
//! usable configuration:
//!
//! ```toml
//! [window]
//! width = 1280
//! height = 720
//! title = "swapframe"
//!
//! [present]
//! mode = "mailbox"
//! acquire_timeout_ms = 1000
//! validation = true
//!
//! [scene]
//! clear_color = [0.02, 0.02, 0.04, 1.0]
//! ```

use std::fs;
use std::path::Path;

use serde::Deserialize;
use tracing::{info, warn};

use crate::error::Result;

/// Default configuration file name, looked up in the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "swapframe.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub window: WindowConfig,
    pub present: PresentConfig,
    pub scene: SceneConfig,
}

/// Initial window parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub width: u32,
    pub height: u32,
    pub title: String,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            title: "swapframe".to_string(),
        }
    }
}

/// Present mode the swapchain should try first.
///
/// FIFO is always available and is used whenever the preference is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresentModePreference {
    Fifo,
    #[default]
    Mailbox,
    Immediate,
}

/// Swapchain and presentation settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PresentConfig {
    pub mode: PresentModePreference,
    /// Upper bound for a single image acquire, in milliseconds.
    pub acquire_timeout_ms: u64,
    /// Enable the Khronos validation layer when it is installed.
    pub validation: bool,
}

impl PresentConfig {
    /// Acquire timeout in nanoseconds, as the Vulkan API expects it.
    pub fn acquire_timeout_ns(&self) -> u64 {
        self.acquire_timeout_ms.saturating_mul(1_000_000)
    }
}

impl Default for PresentConfig {
    fn default() -> Self {
        Self {
            mode: PresentModePreference::default(),
            acquire_timeout_ms: 1000,
            validation: cfg!(debug_assertions),
        }
    }
}

/// Parameters of the built-in clear-screen scene.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct SceneConfig {
    pub clear_color: [f32; 4],
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            clear_color: [0.02, 0.02, 0.04, 1.0],
        }
    }
}

impl EngineConfig {
    /// Parses a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Loads the configuration at `path`.
    ///
    /// A missing file is not an error: the defaults are returned and a warning
    /// is logged. A file that exists but does not parse is an error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(text) => {
                let config = Self::from_toml_str(&text)?;
                info!("Loaded configuration from {}", path.display());
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("{} not found, using default configuration", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config.window.width, 1280);
        assert_eq!(config.window.height, 720);
        assert_eq!(config.present.mode, PresentModePreference::Mailbox);
        assert_eq!(config.present.acquire_timeout_ms, 1000);
    }

    #[test]
    fn test_partial_sections_keep_other_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            [window]
            width = 800

            [present]
            mode = "fifo"
            "#,
        )
        .unwrap();

        assert_eq!(config.window.width, 800);
        assert_eq!(config.window.height, 720);
        assert_eq!(config.window.title, "swapframe");
        assert_eq!(config.present.mode, PresentModePreference::Fifo);
        assert_eq!(config.scene.clear_color, [0.02, 0.02, 0.04, 1.0]);
    }

    #[test]
    fn test_unknown_present_mode_is_rejected() {
        let result = EngineConfig::from_toml_str("[present]\nmode = \"triple\"\n");
        assert!(matches!(result, Err(crate::Error::Config(_))));
    }

    #[test]
    fn test_acquire_timeout_conversion() {
        let present = PresentConfig {
            acquire_timeout_ms: 16,
            ..Default::default()
        };
        assert_eq!(present.acquire_timeout_ns(), 16_000_000);

        let saturated = PresentConfig {
            acquire_timeout_ms: u64::MAX,
            ..Default::default()
        };
        assert_eq!(saturated.acquire_timeout_ns(), u64::MAX);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = EngineConfig::load("definitely/not/here/swapframe.toml").unwrap();
        assert_eq!(config.window.title, "swapframe");
    }
}
