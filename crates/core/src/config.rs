//! Renderer configuration loaded from TOML.
//!
//! Every section is optional; missing keys fall back to the defaults the
//! frame pipeline was tuned for (two frames in flight, a one second device
//! timeout, binding pools of 1000 tables growing up to 4096).
//!
//! # Example
//!
//! ```
//! use vkpipe_core::RendererConfig;
//!
//! let config = RendererConfig::from_toml_str(
//!     r#"
//!     [frames]
//!     frames_in_flight = 3
//!     "#,
//! )
//! .unwrap();
//! assert_eq!(config.frames.frames_in_flight, 3);
//! assert_eq!(config.bindings.max_tables, 4096);
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Largest ring the pipeline supports.
pub const MAX_FRAMES_IN_FLIGHT: usize = 4;

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RendererConfig {
    #[serde(default)]
    pub frames: FrameConfig,
    #[serde(default)]
    pub bindings: BindingConfig,
    #[serde(default)]
    pub presentation: PresentationConfig,
    #[serde(default)]
    pub debug: DebugConfig,
}

/// Frame ring settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameConfig {
    /// Number of frame slots in the ring (default: 2, range: 1-4)
    #[serde(default = "default_frames_in_flight")]
    pub frames_in_flight: usize,
    /// Bound on every host wait for device completion, in milliseconds (default: 1000)
    #[serde(default = "default_fence_timeout_ms")]
    pub fence_timeout_ms: u64,
    /// Frames between statistics log lines, 0 disables them (default: 120)
    #[serde(default = "default_stats_interval")]
    pub stats_interval: u64,
}

/// Descriptor category a pool ratio applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingKind {
    Sampler,
    CombinedImageSampler,
    SampledImage,
    StorageImage,
    UniformBuffer,
    StorageBuffer,
    UniformBufferDynamic,
    StorageBufferDynamic,
}

/// Weight of one descriptor category per binding table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RatioConfig {
    pub kind: BindingKind,
    pub ratio: f32,
}

/// Per-frame binding-table pool settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindingConfig {
    /// Tables in the first pool of every frame slot (default: 1000)
    #[serde(default = "default_initial_tables")]
    pub initial_tables: u32,
    /// Ceiling for pool growth (default: 4096)
    #[serde(default = "default_max_tables")]
    pub max_tables: u32,
    /// Descriptor ratios every pool is built with
    #[serde(default = "default_frame_ratios")]
    pub ratios: Vec<RatioConfig>,
}

/// Presentation chain settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresentationConfig {
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    /// Requested presentable images, clamped to what the surface allows (default: 3)
    #[serde(default = "default_image_count")]
    pub image_count: u32,
    #[serde(default = "default_title")]
    pub title: String,
}

/// Debugging aids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugConfig {
    /// Enable the Vulkan validation layer when available (default: debug builds)
    #[serde(default = "default_validation")]
    pub validation: bool,
    /// tracing filter directive used when RUST_LOG is unset
    #[serde(default)]
    pub log_filter: Option<String>,
}

fn default_frames_in_flight() -> usize {
    2
}
fn default_fence_timeout_ms() -> u64 {
    1000
}
fn default_stats_interval() -> u64 {
    120
}
fn default_initial_tables() -> u32 {
    1000
}
fn default_max_tables() -> u32 {
    4096
}
fn default_frame_ratios() -> Vec<RatioConfig> {
    vec![
        RatioConfig {
            kind: BindingKind::StorageImage,
            ratio: 3.0,
        },
        RatioConfig {
            kind: BindingKind::StorageBuffer,
            ratio: 3.0,
        },
        RatioConfig {
            kind: BindingKind::UniformBuffer,
            ratio: 3.0,
        },
        RatioConfig {
            kind: BindingKind::CombinedImageSampler,
            ratio: 4.0,
        },
    ]
}
fn default_width() -> u32 {
    1280
}
fn default_height() -> u32 {
    720
}
fn default_image_count() -> u32 {
    3
}
fn default_title() -> String {
    "vkpipe".to_string()
}
fn default_validation() -> bool {
    cfg!(debug_assertions)
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: default_frames_in_flight(),
            fence_timeout_ms: default_fence_timeout_ms(),
            stats_interval: default_stats_interval(),
        }
    }
}

impl Default for BindingConfig {
    fn default() -> Self {
        Self {
            initial_tables: default_initial_tables(),
            max_tables: default_max_tables(),
            ratios: default_frame_ratios(),
        }
    }
}

impl Default for PresentationConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            image_count: default_image_count(),
            title: default_title(),
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation: default_validation(),
            log_filter: None,
        }
    }
}

impl FrameConfig {
    /// Completion wait bound as a [`Duration`].
    #[inline]
    pub fn fence_timeout(&self) -> Duration {
        Duration::from_millis(self.fence_timeout_ms)
    }
}

impl RendererConfig {
    /// Parse and validate a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigRead`] when the file cannot be read, and a parse
    /// or validation error when its content is rejected.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| Error::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&text)?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Check value ranges the frame pipeline depends on.
    pub fn validate(&self) -> Result<()> {
        let frames = &self.frames;
        if frames.frames_in_flight == 0 || frames.frames_in_flight > MAX_FRAMES_IN_FLIGHT {
            return Err(Error::Config(format!(
                "frames_in_flight must be in 1..={}, got {}",
                MAX_FRAMES_IN_FLIGHT, frames.frames_in_flight
            )));
        }
        if frames.fence_timeout_ms == 0 {
            return Err(Error::Config("fence_timeout_ms must be positive".into()));
        }

        let bindings = &self.bindings;
        if bindings.initial_tables == 0 {
            return Err(Error::Config("initial_tables must be positive".into()));
        }
        if bindings.initial_tables > bindings.max_tables {
            return Err(Error::Config(format!(
                "initial_tables ({}) exceeds max_tables ({})",
                bindings.initial_tables, bindings.max_tables
            )));
        }
        if bindings.ratios.is_empty() {
            return Err(Error::Config("at least one binding ratio is required".into()));
        }
        if let Some(bad) = bindings
            .ratios
            .iter()
            .find(|r| !r.ratio.is_finite() || r.ratio <= 0.0)
        {
            return Err(Error::Config(format!(
                "ratio for {:?} must be positive, got {}",
                bad.kind, bad.ratio
            )));
        }

        if self.presentation.image_count == 0 {
            return Err(Error::Config("image_count must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = RendererConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.frames.frames_in_flight, 2);
        assert_eq!(config.frames.fence_timeout(), Duration::from_secs(1));
        assert_eq!(config.bindings.initial_tables, 1000);
        assert_eq!(config.bindings.ratios.len(), 4);
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = RendererConfig::from_toml_str("").unwrap();
        assert_eq!(config, RendererConfig::default());
    }

    #[test]
    fn test_partial_sections() {
        let config = RendererConfig::from_toml_str(
            r#"
            [bindings]
            initial_tables = 10
            ratios = [{ kind = "storage_image", ratio = 1.0 }]

            [presentation]
            width = 640
            "#,
        )
        .unwrap();
        assert_eq!(config.bindings.initial_tables, 10);
        assert_eq!(config.bindings.max_tables, 4096);
        assert_eq!(config.bindings.ratios[0].kind, BindingKind::StorageImage);
        assert_eq!(config.presentation.width, 640);
        assert_eq!(config.presentation.height, 720);
    }

    #[test]
    fn test_rejects_out_of_range_ring() {
        let err = RendererConfig::from_toml_str("[frames]\nframes_in_flight = 0\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        let err = RendererConfig::from_toml_str("[frames]\nframes_in_flight = 5\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_rejects_initial_above_max() {
        let err = RendererConfig::from_toml_str(
            "[bindings]\ninitial_tables = 5000\nmax_tables = 4096\n",
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_rejects_non_positive_ratio() {
        let err = RendererConfig::from_toml_str(
            "[bindings]\nratios = [{ kind = \"uniform_buffer\", ratio = 0.0 }]\n",
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_unknown_binding_kind_is_parse_error() {
        let err = RendererConfig::from_toml_str(
            "[bindings]\nratios = [{ kind = \"texture\", ratio = 1.0 }]\n",
        )
        .unwrap_err();
        assert!(matches!(err, Error::ConfigParse(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[frames]\nfence_timeout_ms = 250").unwrap();
        let config = RendererConfig::load(file.path()).unwrap();
        assert_eq!(config.frames.fence_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn test_load_missing_file() {
        let err = RendererConfig::load("/nonexistent/vkpipe.toml").unwrap_err();
        assert!(matches!(err, Error::ConfigRead { .. }));
    }
}
