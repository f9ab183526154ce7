/// Configuration for the telemetry subsystem.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Minimum log level filter (e.g. "info", "ledger_rpc_core=debug,warn").
    pub log_filter: String,
    /// Emit one JSON object per event instead of human-readable lines.
    pub json_output: bool,
    /// Whether to enable ANSI-colored console output.
    pub enable_console_colors: bool,
    /// Whether to include target module in output.
    pub show_target: bool,
    /// Whether to include thread IDs.
    pub show_thread_ids: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_filter: "info".into(),
            json_output: false,
            enable_console_colors: true,
            show_target: true,
            show_thread_ids: false,
        }
    }
}

impl TelemetryConfig {
    /// Reads `LEDGER_RPC_LOG_FILTER` and `LEDGER_RPC_LOG_FORMAT` (`json` or
    /// `text`), keeping defaults for anything unset.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(filter) = std::env::var("LEDGER_RPC_LOG_FILTER") {
            config.log_filter = filter;
        }
        if let Ok(format) = std::env::var("LEDGER_RPC_LOG_FORMAT") {
            config.json_output = format.eq_ignore_ascii_case("json");
        }
        config
    }
}
