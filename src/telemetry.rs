//! Tracing subscriber setup for embedders

use tracing_subscriber::EnvFilter;

use crate::error::{Result, TroupeError};

fn env_filter(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive))
}

/// Install a global fmt subscriber
///
/// `RUST_LOG` wins over `default_directive` when set. Panics if a global
/// subscriber is already installed; use [`try_init_tracing`] when that may
/// happen.
pub fn init_tracing(default_directive: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(default_directive))
        .init();
}

/// Like [`init_tracing`], but reports an existing subscriber as an error
pub fn try_init_tracing(default_directive: &str) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(default_directive))
        .try_init()
        .map_err(|e| TroupeError::Config(format!("tracing already initialized: {e}")))
}
