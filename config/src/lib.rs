//! Typed configuration for every Tessera subsystem.
//!
//! Each section deserializes with per-field defaults so a partial
//! configuration file stays valid as new knobs are added.

use std::{path::PathBuf, time::Duration};

use eyre::{Result, WrapErr};
use serde::{Deserialize, Serialize};
use tessera_data_model::HistoryMode;

/// Store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Root directory of the on-disk store.
    pub store_dir: PathBuf,
    /// Retention policy of the chain.
    pub history_mode: HistoryMode,
    /// Number of blocks cemented into one cycle file.
    pub blocks_per_cycle: u32,
    /// Buffered index entries before a flush to the index logs.
    pub index_write_buffer: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from("./storage"),
            history_mode: HistoryMode::default(),
            blocks_per_cycle: default_blocks_per_cycle(),
            index_write_buffer: default_index_write_buffer(),
        }
    }
}

const fn default_blocks_per_cycle() -> u32 {
    4096
}

const fn default_index_write_buffer() -> usize {
    10_000
}

/// Mempool configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MempoolConfig {
    /// Pending operations classified per scheduling round.
    pub operations_batch_size: usize,
    /// Capacity of each bounded classification bucket (refused,
    /// outdated, branch-refused, branch-delayed).
    pub max_refused_operations: usize,
    /// Timeout of a single operation fetch from the network.
    #[serde(with = "duration_millis")]
    pub operation_timeout: Duration,
    /// Debounce applied before advertising newly classified operations.
    #[serde(with = "duration_millis")]
    pub advertisement_delay: Duration,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self {
            operations_batch_size: 50,
            max_refused_operations: 1000,
            operation_timeout: Duration::from_secs(10),
            advertisement_delay: Duration::from_millis(100),
        }
    }
}

/// Block-validator configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// Run protocol code in an external subprocess instead of
    /// in-process.
    pub external: bool,
    /// Path of the validator binary, used when `external` is set.
    pub binary: PathBuf,
    /// Directory for the validator socket. Defaults to
    /// `$XDG_RUNTIME_DIR`, then the system temp dir.
    pub socket_dir: Option<PathBuf>,
    /// Grace period between `Terminate` and SIGTERM on close.
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            external: false,
            binary: PathBuf::from("tessera_validator"),
            socket_dir: None,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl ValidatorConfig {
    /// Resolve the directory the validator socket is created in.
    #[must_use]
    pub fn resolve_socket_dir(&self) -> PathBuf {
        self.socket_dir.clone().unwrap_or_else(|| {
            std::env::var_os("XDG_RUNTIME_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(std::env::temp_dir)
        })
    }
}

/// Network fetch timeouts honoured by the shell workers.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Timeout of a block-header fetch.
    #[serde(with = "duration_millis")]
    pub block_header_timeout: Duration,
    /// Timeout of a block-operations fetch.
    #[serde(with = "duration_millis")]
    pub block_operations_timeout: Duration,
    /// Timeout of a protocol fetch.
    #[serde(with = "duration_millis")]
    pub protocol_timeout: Duration,
    /// Timeout of a new-head request round.
    #[serde(with = "duration_millis")]
    pub new_head_request_timeout: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            block_header_timeout: Duration::from_secs(15),
            block_operations_timeout: Duration::from_secs(15),
            protocol_timeout: Duration::from_secs(120),
            new_head_request_timeout: Duration::from_secs(90),
        }
    }
}

/// Whole-node configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    pub store: StoreConfig,
    pub mempool: MempoolConfig,
    pub validator: ValidatorConfig,
    pub timeouts: TimeoutConfig,
}

impl Configuration {
    /// Load a configuration from a JSON file.
    ///
    /// # Errors
    /// Fails if the file cannot be read or parsed.
    pub fn from_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let contents = std::fs::read_to_string(&path)
            .wrap_err_with(|| format!("failed to read configuration at {}", path.display()))?;
        serde_json::from_str(&contents)
            .wrap_err_with(|| format!("failed to parse configuration at {}", path.display()))
    }
}

mod duration_millis {
    //! Durations as integer milliseconds in configuration files.
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Configuration::default();
        assert_eq!(config.store.blocks_per_cycle, 4096);
        assert_eq!(config.mempool.operations_batch_size, 50);
        assert_eq!(config.validator.shutdown_timeout, Duration::from_secs(5));
    }

    #[test]
    fn partial_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"store": {{"blocks_per_cycle": 8}}, "mempool": {{"operation_timeout": 250}}}}"#
        )
        .unwrap();
        let config = Configuration::from_path(file.path()).unwrap();
        assert_eq!(config.store.blocks_per_cycle, 8);
        assert_eq!(config.mempool.operation_timeout, Duration::from_millis(250));
        assert_eq!(config.mempool.max_refused_operations, 1000);
    }

    #[test]
    fn socket_dir_falls_back_to_runtime_dir() {
        let config = ValidatorConfig {
            socket_dir: Some(PathBuf::from("/run/tessera")),
            ..ValidatorConfig::default()
        };
        assert_eq!(config.resolve_socket_dir(), PathBuf::from("/run/tessera"));
    }
}
