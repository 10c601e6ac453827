//! Logging utilities for the engine
//!
//! The engine always emits `tracing` events; installing a subscriber is
//! left to the application, or to [`init_logging`] with the `logging`
//! feature.

/// Log per-frame traffic: at `debug` when the engine runs with `Debug`
/// enabled, at `trace` otherwise.
macro_rules! log_traffic {
    ($verbose:expr, $($arg:tt)*) => {
        if $verbose {
            tracing::debug!($($arg)*);
        } else {
            tracing::trace!($($arg)*);
        }
    };
}

pub(crate) use log_traffic;

/// Initialize logging subsystem
#[cfg(feature = "logging")]
pub fn init_logging() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Initialize logging subsystem (no-op when logging feature is disabled)
#[cfg(not(feature = "logging"))]
pub fn init_logging() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    Ok(())
}
