//! Logging helpers (thin wrappers over `tracing`).
//!
//! Setting `LEDGER_RPC_SILENT` suppresses the chatty helpers; structured
//! `tracing` events emitted directly by the pipeline are unaffected.

/// Log levels for the serving core
#[derive(Clone, Copy)]
pub enum LogLevel {
    Info,
    Warning,
}

fn silent() -> bool {
    std::env::var("LEDGER_RPC_SILENT").is_ok()
}

/// Logs a message
pub fn log(level: LogLevel, message: &str) {
    if silent() {
        return;
    }

    match level {
        LogLevel::Info => tracing::info!("{}", message),
        LogLevel::Warning => tracing::warn!("{}", message),
    }
}

/// Logs pipeline startup information
pub fn log_startup(database_url: &str, event_window: u32, transaction_window: u32, batch: usize) {
    if silent() {
        return;
    }

    tracing::info!(
        database_url = %redact_credentials(database_url),
        event_retention_window = event_window,
        transaction_retention_window = transaction_window,
        batch_size = batch,
        "Ledger ingestion startup"
    );
}

/// Logs a ledger batch summary
pub fn log_batch(first: u32, last: u32, transactions: usize, events: usize, duration_ms: u64) {
    if silent() {
        return;
    }
    tracing::info!(
        first_ledger = first,
        last_ledger = last,
        transactions = transactions,
        events = events,
        duration_ms = duration_ms,
        "Ledger batch ingested"
    );
}

/// Logs an error with context
pub fn log_error(context: &str, error: &str) {
    tracing::error!(context = context, error = error, "Ledger RPC core error");
}

/// Strips a `user:password@` section from a connection string.
fn redact_credentials(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}[REDACTED]{}", &url[..scheme_end + 3], &url[at..])
        }
        _ => url.to_string(),
    }
}
