//! Trace logging initialisation.
//!
//! `RUST_LOG` takes precedence as usual; without it, setting
//! `DEMI_EPOLL_LOG=trace` turns on trace output for the shim. With neither,
//! nothing is emitted.

use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Environment variable enabling trace output when `RUST_LOG` is unset.
pub const LOG_ENV: &str = "DEMI_EPOLL_LOG";

/// Install the tracing subscriber. Safe to call more than once; later calls
/// are no-ops.
pub fn init() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else if std::env::var(LOG_ENV).as_deref() == Ok("trace") {
        EnvFilter::new("trace")
    } else {
        EnvFilter::new("off")
    };
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init();
}
