//! Tracing setup for binaries and demos embedding the cache
//!
//! The library itself only emits `tracing` events; installing a subscriber
//! is left to the application. `init_tracing` is the convenience the demos
//! use: an `EnvFilter` read from `RUST_LOG` over a plain fmt layer.

use std::sync::OnceLock;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "ouroboros_query=info";

static TRACING_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Build the filter from `RUST_LOG`, falling back to [`DEFAULT_FILTER`]
pub fn env_filter() -> EnvFilter {
    filter_from(std::env::var("RUST_LOG").ok())
}

fn filter_from(directives: Option<String>) -> EnvFilter {
    directives
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}

/// Install a global fmt subscriber once
///
/// Safe to call repeatedly and alongside another subscriber: if one is
/// already installed this is a no-op.
pub fn init_tracing() {
    TRACING_INITIALIZED.get_or_init(|| {
        let installed = tracing_subscriber::registry()
            .with(env_filter())
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init();

        if installed.is_err() {
            tracing::debug!("Global tracing subscriber already set; keeping it");
        }
    });
}
