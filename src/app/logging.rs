//! Tracing subscriber setup with dynamic log level reload.

use std::sync::OnceLock;

use tracing::{error, info};
use tracing_subscriber::{reload, EnvFilter};

pub type ReloadHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;

// Global reload handle so the signal handler can change the level at runtime.
static RELOAD_HANDLE: OnceLock<ReloadHandle> = OnceLock::new();

pub fn init_tracing(filter: &str) {
    use tracing_subscriber::prelude::*;

    let env_filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter_layer, reload_handle) = reload::Layer::new(env_filter);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let _ = RELOAD_HANDLE.set(reload_handle);
}

/// Swap the active filter; a no-op before [`init_tracing`] has run.
pub fn set_level(filter: &str) {
    let Some(handle) = RELOAD_HANDLE.get() else {
        return;
    };
    match EnvFilter::try_new(filter) {
        Ok(env_filter) => match handle.reload(env_filter) {
            Ok(()) => info!("log level set to {}", filter),
            Err(e) => error!("failed to reload log level: {}", e),
        },
        Err(e) => error!("invalid log filter '{}': {}", filter, e),
    }
}
