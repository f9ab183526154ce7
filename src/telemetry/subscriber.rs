use super::config::TelemetryConfig;
use std::sync::OnceLock;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Guard returned by [`init_telemetry`]; keep it alive for the process lifetime.
pub struct TelemetryGuard {
    _private: (),
}

static TELEMETRY_INIT: OnceLock<bool> = OnceLock::new();

/// Initialize the global tracing subscriber (singleton, called once).
///
/// Uses `RUST_LOG` if set, otherwise falls back to `config.log_filter`.
/// Later calls are no-ops, and so is the first one if the host already
/// installed a global subscriber.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    TELEMETRY_INIT.get_or_init(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&config.log_filter));
        let registry = tracing_subscriber::registry().with(env_filter);

        let installed = if config.json_output {
            registry
                .with(
                    fmt::layer()
                        .json()
                        .with_target(config.show_target)
                        .with_thread_ids(config.show_thread_ids),
                )
                .try_init()
        } else {
            registry
                .with(
                    fmt::layer()
                        .with_target(config.show_target)
                        .with_thread_ids(config.show_thread_ids)
                        .with_ansi(config.enable_console_colors),
                )
                .try_init()
        };
        installed.is_ok()
    });

    TelemetryGuard { _private: () }
}

/// Whether [`init_telemetry`] installed the global subscriber.
pub fn telemetry_installed() -> bool {
    TELEMETRY_INIT.get().copied().unwrap_or(false)
}
