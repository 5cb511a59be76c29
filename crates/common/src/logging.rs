//! Process-wide `tracing` subscriber setup.

use std::sync::Once;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

const DEFAULT_DIRECTIVE: &str = "floe=info";

#[derive(Debug, Clone, Copy, Default)]
pub enum LogFormat {
    /// JSON structured logs.
    Json,
    #[default]
    Pretty,
}

/// Installs the global subscriber. Later calls are ignored.
///
/// The filter comes from `RUST_LOG` and falls back to `floe=info`.
pub fn init(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));

        let registry = tracing_subscriber::registry().with(env_filter);
        let result = match format {
            LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
            LogFormat::Pretty => registry.with(fmt::layer().pretty()).try_init(),
        };
        if let Err(e) = result {
            eprintln!("tracing subscriber already installed: {e}");
        }
    });
}

/// Subscriber for tests; output is captured by the test harness.
pub fn init_test_logging() {
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("floe=debug")),
        )
        .with_test_writer()
        .try_init();
}
