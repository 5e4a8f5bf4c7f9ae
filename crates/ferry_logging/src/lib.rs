use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Initializes the global tracing subscriber. `log_level` (from
/// `GlobalConfig`) sets the default filter directive whenever `RUST_LOG`
/// isn't set in the environment; `RUST_LOG` always wins when present.
pub fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{log_level},ferry_core=debug,ferry_listener=debug,ferry_control=debug"
        ))
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .compact()
                .with_target(true)
                .with_thread_ids(false),
        )
        .init();
}
