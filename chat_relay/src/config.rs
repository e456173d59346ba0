// Relay configuration.
//
// `RelayConfig` is plain data with serde support, so it can come from a JSON
// file (`from_file`), from code (`Default` plus struct update), or from the
// command line (`main.rs` overlays CLI flags on whichever of those applies).
// Missing fields in a file take their default values, or the values of a
// caller-supplied base (`from_file_over`).

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ConfigError;

pub const DEFAULT_PORT: u16 = 45700;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub port: u16,
    pub bind_address: IpAddr,
    /// Upper bound on inbound messages taken from the poll group per pass.
    pub max_messages_per_receive: usize,
    /// Sleep between loop passes.
    pub poll_interval_ms: u64,
    /// How long to wait on shutdown for goodbye traffic to flush before the
    /// listener closes.
    pub linger_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            max_messages_per_receive: 100,
            poll_interval_ms: 10,
            linger_ms: 500,
        }
    }
}

impl RelayConfig {
    /// Load a JSON config file and validate it. Fields the file leaves out
    /// take their `Default` values.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_file_over(path, &Self::default())
    }

    /// Like `from_file`, but fields the file leaves out are taken from `base`.
    pub fn from_file_over(path: impl AsRef<Path>, base: &Self) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let parse_error = |source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        };
        let overrides: Value = serde_json::from_str(&text).map_err(parse_error)?;
        let merged = match (serde_json::to_value(base).map_err(parse_error)?, overrides) {
            (Value::Object(mut fields), Value::Object(file_fields)) => {
                fields.extend(file_fields);
                Value::Object(fields)
            }
            // Not an object; let deserialization report it.
            (_, other) => other,
        };
        let config: Self = serde_json::from_value(merged).map_err(parse_error)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_messages_per_receive == 0 {
            return Err(ConfigError::Invalid(
                "max_messages_per_receive must be at least 1".into(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "poll_interval_ms must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn linger(&self) -> Duration {
        Duration::from_millis(self.linger_ms)
    }
}
