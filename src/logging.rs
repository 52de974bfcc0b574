#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use tracing_subscriber::util::SubscriberInitExt;

/// Installs the global fmt subscriber. `log_level` accepts any `EnvFilter`
/// directive, e.g. `info` or `warn,shorts_autopilot=debug`.
pub fn init_logger(log_level: &str) -> Result<()> {
    tracing_subscriber::fmt::Subscriber::builder()
        .compact()
        .with_env_filter(tracing_subscriber::EnvFilter::builder().parse_lossy(log_level))
        .with_target(false)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::new(
            "%Y-%m-%d %H:%M:%S%.3f".to_owned(),
        ))
        .finish()
        .try_init()
        .context("initializing logger")
}
