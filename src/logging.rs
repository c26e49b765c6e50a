//! Logging facade.
//!
//! Modules log through these re-exports so the subscriber wiring stays in
//! one place.

use anyhow::Result;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub use tracing::{debug, error, info, trace, warn};

/// Install the global tracing subscriber.
///
/// `log_level` overrides the `RUST_LOG` environment variable when given.
/// Safe to call once per process; embedding applications that already
/// install their own subscriber should skip this.
pub fn init_logger(log_level: Option<&str>) -> Result<()> {
    let env_filter = if let Some(level) = log_level {
        EnvFilter::try_new(level)?
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,flowscript=debug"))
    };

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();

    Ok(())
}
