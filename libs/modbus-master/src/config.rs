//! Connection parameters
//!
//! Priority (highest to lowest):
//! 1. Environment variables prefixed `MODBUS_` (e.g. `MODBUS_TIMEOUT_MS`)
//! 2. Config file (TOML, YAML or JSON, chosen by extension)
//! 3. Default values

use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Json, Serialized, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::constants::{
    CONFIG_ENV_PREFIX, DEFAULT_RECONNECT_DELAY_MS, DEFAULT_RETRIES, DEFAULT_TCP_PORT,
    DEFAULT_TIMEOUT_MS, DEFAULT_UNIT_ID,
};
use crate::error::{ModbusError, ModbusResult};

/// Modbus TCP master configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ModbusConfig {
    /// Slave or gateway host
    pub host: String,
    /// TCP port
    pub port: u16,
    /// Connect when the client is built instead of on first request
    pub keep_alive: bool,
    /// Response timeout per attempt
    pub timeout_ms: u64,
    /// Retries after the first attempt
    pub retries: u32,
    /// Unit id for operations that do not name one
    pub unit_id: u8,
    /// TCP connect timeout; falls back to `timeout_ms`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_timeout_ms: Option<u64>,
    /// Pause before an attempt that follows a failed connect
    pub reconnect_delay_ms: u64,
}

impl Default for ModbusConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_TCP_PORT,
            keep_alive: true,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            retries: DEFAULT_RETRIES,
            unit_id: DEFAULT_UNIT_ID,
            connect_timeout_ms: None,
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
        }
    }
}

impl ModbusConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_unit_id(mut self, unit_id: u8) -> Self {
        self.unit_id = unit_id;
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.unwrap_or(self.timeout_ms))
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// `host:port`
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Load from a config file, then apply `MODBUS_*` overrides
    pub fn load(path: impl AsRef<Path>) -> ModbusResult<Self> {
        let path = path.as_ref();
        let extension = path
            .extension()
            .and_then(|s| s.to_str())
            .ok_or_else(|| ModbusError::config("Config file must have an extension"))?;
        if !path.is_file() {
            return Err(ModbusError::config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }

        let figment = Figment::from(Serialized::defaults(Self::default()));
        let figment = match extension {
            "toml" => figment.merge(Toml::file(path)),
            "yaml" | "yml" => figment.merge(Yaml::file(path)),
            "json" => figment.merge(Json::file(path)),
            _ => {
                return Err(ModbusError::config(format!(
                    "Unsupported config file format: {}",
                    extension
                )))
            },
        };

        Self::extract(figment.merge(Env::prefixed(CONFIG_ENV_PREFIX)))
    }

    /// Defaults plus `MODBUS_*` overrides only
    pub fn from_env() -> ModbusResult<Self> {
        Self::extract(
            Figment::from(Serialized::defaults(Self::default()))
                .merge(Env::prefixed(CONFIG_ENV_PREFIX)),
        )
    }

    fn extract(figment: Figment) -> ModbusResult<Self> {
        let config: Self = figment
            .extract()
            .map_err(|e| ModbusError::config(format!("Failed to load configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject parameters no session can use
    pub fn validate(&self) -> ModbusResult<()> {
        if self.host.trim().is_empty() {
            return Err(ModbusError::config("host must not be empty"));
        }
        if self.port == 0 {
            return Err(ModbusError::config("port must not be 0"));
        }
        if self.timeout_ms == 0 {
            return Err(ModbusError::config("timeout_ms must be greater than 0"));
        }
        if self.connect_timeout_ms == Some(0) {
            return Err(ModbusError::config(
                "connect_timeout_ms must be greater than 0",
            ));
        }
        Ok(())
    }
}
