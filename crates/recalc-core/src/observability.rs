//! Logging initialization and span helpers.
//!
//! Every recalc component logs through `tracing`. Binaries and embedding services call
//! [`init_logging`] once; library code only creates spans and events.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

impl LogFormat {
    /// Parses a format name (`json` or `pretty`), defaulting to pretty.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        if name.trim().eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Pretty
        }
    }
}

/// Initializes the logging subsystem.
///
/// Safe to call multiple times; subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `recalc_engine=debug`)
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for a propagation operation scoped to one workspace table.
///
/// # Example
///
/// ```rust
/// use recalc_core::observability::compute_span;
///
/// let span = compute_span("plan", "bseProd", "tblBugs");
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn compute_span(operation: &str, workspace: &str, table: &str) -> Span {
    tracing::info_span!(
        "recalc",
        op = operation,
        workspace = workspace,
        table = table,
    )
}
