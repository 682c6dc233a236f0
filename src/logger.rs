//! Tracing setup with a runtime-reloadable level filter.

use std::sync::OnceLock;

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, reload, Registry};

use crate::errinput;
use crate::error::{Error, Result};

static RELOAD_HANDLE: OnceLock<reload::Handle<LevelFilter, Registry>> = OnceLock::new();

/// Installs the global subscriber. Idempotent; later calls (including from
/// other stores in the same process) are no-ops.
pub fn init() {
    let (filter, handle) = reload::Layer::new(LevelFilter::INFO);
    let _ = RELOAD_HANDLE.set(handle);
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .try_init();
}

/// Swaps the global severity filter. Accepts `off`, `error`, `warn`,
/// `info`, `debug` and `trace`.
pub fn set_log_level(level: &str) -> Result<()> {
    let filter = match level.to_ascii_lowercase().as_str() {
        "off" => LevelFilter::OFF,
        "error" => LevelFilter::ERROR,
        "warn" => LevelFilter::WARN,
        "info" => LevelFilter::INFO,
        "debug" => LevelFilter::DEBUG,
        "trace" => LevelFilter::TRACE,
        other => return Err(errinput!("unknown log level: {other}")),
    };
    if let Some(handle) = RELOAD_HANDLE.get() {
        handle
            .modify(|f| *f = filter)
            .map_err(|e| Error::InvalidOperation(format!("log level reload failed: {e}")))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init();
        init();
    }

    #[test]
    fn test_set_log_level() {
        init();
        set_log_level("debug").expect("Failed to set log level");
        set_log_level("INFO").expect("Level names should be case-insensitive");
        assert!(matches!(
            set_log_level("loud"),
            Err(Error::InvalidInput(_))
        ));
    }
}
