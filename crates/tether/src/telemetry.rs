//! Tracing setup for binaries.
//!
//! Library code only emits events; whoever owns `main` picks one of these.
//! `RUST_LOG` wins over `default_directive` when set.

use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt};

/// Human-readable output, e.g. `init_tracing("info,tether=debug")`.
///
/// # Errors
/// Fails if a global subscriber is already installed.
pub fn init_tracing(default_directive: &str) -> Result<(), TryInitError> {
    tracing_subscriber::registry()
        .with(filter(default_directive))
        .with(tracing_subscriber::fmt::layer())
        .try_init()
}

/// One JSON object per event, for log shippers.
///
/// # Errors
/// Fails if a global subscriber is already installed.
pub fn init_tracing_json(default_directive: &str) -> Result<(), TryInitError> {
    tracing_subscriber::registry()
        .with(filter(default_directive))
        .with(tracing_subscriber::fmt::layer().json())
        .try_init()
}

fn filter(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive))
}
