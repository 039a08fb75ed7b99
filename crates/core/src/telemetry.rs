//! Tracing subscriber set-up for processes embedding the decision core.

use tracing_subscriber::EnvFilter;

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "routewise=info";

/// Install a global `tracing` subscriber. JSON output is meant for
/// production log shipping; plain text for local runs. Returns `false` when
/// a subscriber was already installed (safe to call more than once).
pub fn init_tracing(json: bool) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into());
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = if json {
        builder.json().try_init().is_ok()
    } else {
        builder.try_init().is_ok()
    };
    if installed {
        tracing::debug!(json, "tracing subscriber installed");
    }
    installed
}
