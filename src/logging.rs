//! Subscriber setup for the `tracing` events emitted by the server.
//!
//! The server only emits events; installing a subscriber is left to the
//! application. These helpers cover the common case:
//!
//! ```no_run
//! dispatch_web::logging::init();
//! ```
//!
//! The filter is read from `RUST_LOG` when set, e.g.
//! `RUST_LOG=dispatch_web=debug`.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default directive when `RUST_LOG` is not set.
pub const DEFAULT_DIRECTIVE: &str = "dispatch_web=info";

/// Installs a formatted subscriber filtered by `RUST_LOG` or [`DEFAULT_DIRECTIVE`].
///
/// Returns `false` if a global subscriber was already installed.
pub fn init() -> bool {
    init_with(DEFAULT_DIRECTIVE)
}

/// Same as [`init`] with a custom fallback directive.
pub fn init_with(directive: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(directive))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init()
        .is_ok()
}
