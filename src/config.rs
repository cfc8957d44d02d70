use std::io::{self, Read};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cm::ConnParam;
use crate::rdma::qp::QpCaps;

/// Name of the TOML table holding [`EchoConfig`].
const CONFIG_TABLE: &str = "echo";

/// Errors when loading an [`EchoConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] io::Error),

    #[error("malformed config: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("`[{CONFIG_TABLE}]` table not found in config")]
    MissingTable,
}

/// Tunables of both echo roles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EchoConfig {
    /// Timeout of address and route resolution, in milliseconds.
    pub timeout_ms: u64,

    /// Capacity of the shared completion queue.
    pub cq_depth: u32,

    /// Queue pair capabilities of every connection.
    pub qp: QpCaps,

    /// Listen backlog of the server.
    pub backlog: i32,

    /// Parameters for connect and accept.
    pub conn: ConnParam,
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 500,
            cq_depth: 10,
            qp: QpCaps::default(),
            backlog: 10,
            conn: ConnParam::default(),
        }
    }
}

impl EchoConfig {
    /// Address and route resolution timeout.
    #[inline]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Load the `[echo]` table from a TOML file.
    pub fn load_toml(config_file: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut file = std::fs::File::open(config_file.as_ref())?;
        let mut toml_str = String::new();
        file.read_to_string(&mut toml_str)?;
        Self::from_toml_str(&toml_str)
    }

    /// Parse the `[echo]` table from TOML text. Missing keys take defaults.
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let mut toml: toml::Table = toml::from_str(toml_str)?;
        match toml.remove(CONFIG_TABLE) {
            Some(table @ toml::Value::Table(_)) => Ok(table.try_into()?),
            _ => Err(ConfigError::MissingTable),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_table_keeps_defaults() {
        let config = EchoConfig::from_toml_str(
            r#"
            [echo]
            timeout_ms = 2000
            backlog = 4

            [echo.qp]
            max_recv_wr = 32

            [echo.conn]
            rnr_retry_count = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.timeout(), Duration::from_secs(2));
        assert_eq!(config.backlog, 4);
        assert_eq!(config.cq_depth, 10);
        assert_eq!(config.qp.max_recv_wr, 32);
        assert_eq!(config.qp.max_send_wr, 10);
        assert_eq!(config.conn.rnr_retry_count, 3);
        assert_eq!(config.conn.retry_count, 7);
    }

    #[test]
    fn empty_table_is_default() {
        let config = EchoConfig::from_toml_str("[echo]\n").unwrap();
        assert_eq!(config, EchoConfig::default());
        assert_eq!(config.timeout(), Duration::from_millis(500));
    }

    #[test]
    fn missing_table() {
        let err = EchoConfig::from_toml_str("[other]\nx = 1\n").unwrap_err();
        assert!(matches!(err, ConfigError::MissingTable));

        let err = EchoConfig::from_toml_str("[echo]\ncq_depth = \"ten\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Toml(_)));
    }

    #[test]
    fn load_from_file() {
        let path = std::env::temp_dir().join(format!("rdma-echo-{}.toml", std::process::id()));
        std::fs::write(&path, "[echo]\ncq_depth = 64\n").unwrap();
        let config = EchoConfig::load_toml(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.cq_depth, 64);

        assert!(matches!(
            EchoConfig::load_toml(&path),
            Err(ConfigError::Io(_))
        ));
    }
}
