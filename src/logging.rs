//! Logging setup
//!
//! The bridge is loaded into a host process that may or may not have its
//! own tracing subscriber. The C entry points call [`init`] lazily; it
//! installs a fmt subscriber once and backs off if one is already set.

use std::sync::Once;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

static INIT: Once = Once::new();

/// Default filter when `RUST_LOG` is unset
pub const DEFAULT_DIRECTIVE: &str = "llm_bridge=info";

/// Installs the global subscriber, at most once per process.
pub fn init() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));
        if tracing_subscriber::registry()
            .with(fmt::layer().with_thread_names(true))
            .with(filter)
            .try_init()
            .is_ok()
        {
            tracing::info!("Starting llm-bridge v{}", env!("CARGO_PKG_VERSION"));
        }
    });
}

/// Whether [`init`] has run in this process.
pub fn is_initialized() -> bool {
    INIT.is_completed()
}
