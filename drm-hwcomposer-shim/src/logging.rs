//! Tracing setup

use crate::config::ShimConfig;
use tracing_subscriber::EnvFilter;

/// Pick the log filter: `DRM_SHIM_LOG`, then `RUST_LOG`, then the config.
pub fn filter_directive<F>(config: &ShimConfig, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    lookup("DRM_SHIM_LOG")
        .or_else(|| lookup("RUST_LOG"))
        .filter(|f| !f.trim().is_empty())
        .unwrap_or_else(|| config.log_filter.clone())
}

/// Install a stderr subscriber unless the host process already has one.
pub fn init(config: &ShimConfig) {
    let directive = filter_directive(config, |key| std::env::var(key).ok());
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_thread_names(true)
        .try_init();
}
