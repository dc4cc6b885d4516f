//! Logging initialization and configuration.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Filter used when neither `RUST_LOG` nor the config names one.
pub const DEFAULT_LOG_FILTER: &str = "info,vkpipe=debug";

/// Initialize the logging system with tracing.
///
/// `RUST_LOG` takes precedence. Otherwise `filter` is used, falling back to
/// [`DEFAULT_LOG_FILTER`] when it is `None` or fails to parse.
///
/// # Example
/// ```
/// vkpipe_core::init_logging(Some("info"));
/// tracing::info!("vkpipe initialized");
/// ```
pub fn init_logging(filter: Option<&str>) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter.unwrap_or(DEFAULT_LOG_FILTER)))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .try_init();
    if let Err(e) = installed {
        tracing::debug!("Keeping the existing tracing subscriber: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_twice_keeps_first_subscriber() {
        init_logging(Some("debug"));
        init_logging(Some("not a [valid filter"));
        tracing::info!("still logging");
    }
}
