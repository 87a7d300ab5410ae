//! `tracing` subscriber setup, seeded from `agent.loglevel`.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const ENV_VAR: &str = "EVPN_AGENT_LOG";

/// Python's `logging` levels, lower-cased into `tracing`'s vocabulary.
/// Unrecognised levels fall back to `info`, matching `logging.basicConfig`'s
/// own tolerance for garbage level names.
fn normalise(loglevel: &str) -> &'static str {
    match loglevel.to_uppercase().as_str() {
        "DEBUG" => "debug",
        "INFO" => "info",
        "WARNING" | "WARN" => "warn",
        "ERROR" => "error",
        "CRITICAL" => "error",
        _ => "info",
    }
}

pub fn init(loglevel: &str) {
    let filter = std::env::var(ENV_VAR)
        .ok()
        .and_then(|v| EnvFilter::try_new(v).ok())
        .unwrap_or_else(|| EnvFilter::new(normalise(loglevel)));

    tracing_subscriber::registry().with(fmt::layer().with_target(false)).with(filter).init();
}
