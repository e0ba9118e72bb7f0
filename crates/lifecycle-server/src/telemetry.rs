//! Logging and metrics initialization

use crate::config::LoggingSection;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber and describe lifecycle metrics
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init(logging: &LoggingSection) -> anyhow::Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&logging.level))?;

    let registry = tracing_subscriber::registry().with(env_filter);
    if logging.json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true),
            )
            .try_init()?;
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()?;
    }

    lifecycle_core::metrics::register_metrics();
    tracing::debug!(level = %logging.level, json = logging.json, "telemetry initialized");
    Ok(())
}
