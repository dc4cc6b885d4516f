//! Core utilities for vkpipe.
//!
//! This crate provides foundational types used across the workspace:
//! - Error types and result aliases
//! - Logging initialization
//! - Renderer configuration
//! - Section timers and frame statistics

pub mod config;
mod error;
mod logging;
mod timer;

pub use config::{BindingKind, RatioConfig, RendererConfig};
pub use error::{Error, Result};
pub use logging::{DEFAULT_LOG_FILTER, init_logging};
pub use timer::{FrameStats, Timer};
