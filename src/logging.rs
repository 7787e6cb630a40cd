//! Diagnostic tracing to stderr.
//!
//! Session artifacts (`result.json`, `turns.jsonl`, reports) are written
//! regardless of the filter. A child `eval` process inherits `RUST_LOG`, and
//! its stderr lands in that session's `session.log`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "warn,ui_verdict=info";

/// Install the global subscriber.
///
/// Reads `RUST_LOG`, falling back to [`DEFAULT_FILTER`]. Calling it twice is
/// harmless; the second call is ignored.
///
/// ```bash
/// RUST_LOG=ui_verdict=debug ui-verdict suite --url http://localhost:8000/ --instruction "..."
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
