//! Configuration management for Vellum
//!
//! This module handles loading, parsing, and validating configuration
//! from TOML files. It covers shared-memory buffer tuning, GPU selection,
//! window sizing rules, and general runtime settings.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::protocol::PixelFormat;

/// Environment variable that forces shared-memory buffers.
pub const NO_GPU_ENV: &str = "VELLUM_NO_GPU";

/// Smallest resize pool worth keeping around.
const MIN_RESIZE_POOL: usize = 64 * 1024;

/// Main configuration struct containing all Vellum settings
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct VellumConfig {
    /// Shared-memory backend tuning
    #[serde(default)]
    pub shm: ShmConfig,

    /// GPU backend selection
    #[serde(default)]
    pub gpu: GpuConfig,

    /// Window sizing rules
    #[serde(default)]
    pub window: WindowConfig,

    /// General runtime settings
    #[serde(default)]
    pub general: GeneralConfig,
}

/// Shared-memory backend configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShmConfig {
    /// Pixel format for new buffers ("argb8888", "xrgb8888", "rgb565")
    pub format: PixelFormat,

    /// Allocate from a per-leaf resize pool during continuous resize
    pub use_resize_pool: bool,

    /// Size of each resize pool (bytes)
    #[serde(default = "ShmConfig::default_resize_pool_size")]
    pub resize_pool_size: usize,
}

/// GPU backend configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GpuConfig {
    /// Prefer GPU window surfaces when a device is available
    pub enabled: bool,
}

/// Window sizing configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WindowConfig {
    /// Minimum window width (pixels)
    pub min_width: u32,

    /// Minimum window height (pixels)
    pub min_height: u32,

    /// Width used when a window is created without a size
    pub default_width: u32,

    /// Height used when a window is created without a size
    pub default_height: u32,

    /// Match the buffer scale to the outputs a window is shown on
    #[serde(default)]
    pub follow_output_scale: bool,
}

/// General runtime settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneralConfig {
    /// Enable debug logging
    pub debug: bool,

    /// Frame completions remembered per surface for statistics
    #[serde(default = "GeneralConfig::default_frame_history")]
    pub frame_history: usize,
}

impl Default for ShmConfig {
    fn default() -> Self {
        Self {
            format: PixelFormat::Argb8888,
            use_resize_pool: true,
            resize_pool_size: Self::default_resize_pool_size(),
        }
    }
}

impl ShmConfig {
    fn default_resize_pool_size() -> usize {
        6 * 1024 * 1024
    }
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            min_width: 200,
            min_height: 200,
            default_width: 400,
            default_height: 300,
            follow_output_scale: true,
        }
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            debug: false,
            frame_history: Self::default_frame_history(),
        }
    }
}

impl GeneralConfig {
    fn default_frame_history() -> usize {
        120
    }
}

impl GpuConfig {
    /// Whether GPU surfaces should be used, honoring [`NO_GPU_ENV`].
    pub fn preferred(&self) -> bool {
        self.enabled && std::env::var_os(NO_GPU_ENV).is_none()
    }
}

impl VellumConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        // Expand ~ to home directory
        let expanded_path = if path.to_string_lossy().starts_with('~') {
            let home = std::env::var("HOME").context("Failed to get HOME environment variable")?;
            let rest = path.strip_prefix("~").unwrap_or(path);
            Path::new(&home).join(rest)
        } else {
            path.to_path_buf()
        };

        let contents = fs::read_to_string(&expanded_path)
            .with_context(|| format!("Failed to read config file: {}", expanded_path.display()))?;

        let config: VellumConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", expanded_path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.window.min_width == 0 || self.window.min_height == 0 {
            anyhow::bail!("Invalid minimum window size: both dimensions must be non-zero");
        }

        if self.window.default_width < self.window.min_width
            || self.window.default_height < self.window.min_height
        {
            anyhow::bail!("Invalid default window size: smaller than the minimum size");
        }

        if self.shm.use_resize_pool && self.shm.resize_pool_size < MIN_RESIZE_POOL {
            anyhow::bail!(
                "Invalid resize_pool_size: must be at least {} bytes",
                MIN_RESIZE_POOL
            );
        }

        if self.general.frame_history == 0 {
            anyhow::bail!("Invalid frame_history: must be at least 1");
        }

        Ok(())
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        fs::write(path, contents).context("Failed to write configuration file")?;

        Ok(())
    }

    /// Merge a partial configuration into this one
    /// Sections of the partial config that differ from the defaults win
    pub fn merge_partial(mut self, partial: VellumConfig) -> Self {
        let default_config = VellumConfig::default();

        if partial.shm != default_config.shm {
            self.shm = partial.shm;
        }
        if partial.gpu != default_config.gpu {
            self.gpu = partial.gpu;
        }
        if partial.window != default_config.window {
            self.window = partial.window;
        }
        if partial.general != default_config.general {
            self.general = partial.general;
        }

        self
    }
}
