//! Logging facade for every Tessera crate.
//!
//! Downstream crates depend on this crate only and use the macros from
//! [`prelude`]; the binary decides once, through [`init`], how events
//! are formatted and filtered.

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

pub use tracing::{self, debug, error, info, instrument, trace, warn, Instrument};

pub mod prelude {
    //! Macros and types used at every log site.
    pub use tracing::{debug, error, info, instrument, span, trace, warn, Level, Span};
}

/// Output format of the installed subscriber.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Format {
    /// Human-oriented single-line output.
    #[default]
    Full,
    /// Compact single-line output.
    Compact,
    /// Newline-delimited JSON, for log shippers.
    Json,
}

/// Logger configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default directive when `RUST_LOG` is unset, e.g. `"info"`.
    pub filter: Option<String>,
    /// Output format.
    pub format: Format,
}

/// Error on logger initialization.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The logger may only be initialized once per process.
    #[error("logger is already initialized")]
    AlreadyInitialized,
}

static INITIALIZED: OnceLock<()> = OnceLock::new();

/// Install the global subscriber. Call once, from the binary.
///
/// # Errors
/// Fails if a subscriber was already installed through this crate.
pub fn init(config: &Config) -> Result<(), Error> {
    if INITIALIZED.set(()).is_err() {
        return Err(Error::AlreadyInitialized);
    }
    let filter = match &config.filter {
        Some(directive) => EnvFilter::try_new(directive)
            .unwrap_or_else(|_| EnvFilter::new("info")),
        None => EnvFilter::from_default_env(),
    };
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.format {
        Format::Full => builder.init(),
        Format::Compact => builder.compact().init(),
        Format::Json => builder.json().init(),
    }
    Ok(())
}

/// Install a default subscriber for tests. Idempotent; the first call
/// wins, later calls are no-ops.
pub fn test_logger() {
    let _ = INITIALIZED.set(());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_rejected() {
        test_logger();
        assert!(matches!(
            init(&Config::default()),
            Err(Error::AlreadyInitialized)
        ));
    }
}
