//! Configuration management

use crate::domain::shared::{GateError, Result};
use crate::infrastructure::protocols::sip::{CallTiming, MachineSettings};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Printed when the configuration file does not exist
pub const CONFIG_EXAMPLE: &str = include_str!("../../config.example.yml");

const ENV_PREFIX: &str = "GATECALL";
const ENV_SEPARATOR: &str = "__";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub http: HttpConfig,
    pub sip: SipConfig,
    pub call: CallConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
    /// Cooldown between two activations
    pub penalty_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SipConfig {
    pub server: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    /// Number that opens the gate
    pub call_number: String,
    /// 0 picks an ephemeral port
    pub local_port: u16,
    pub expires: u32,
    pub reregister_secs: u64,
    pub user_agent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    pub registration_wait_secs: u64,
    pub watchdog_secs: u64,
    pub retry_delay_ms: u64,
    pub register_auth_retries: u32,
    pub reregister_auth_retries: u32,
    pub invite_auth_retries: u32,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            penalty_secs: 10,
        }
    }
}

impl Default for SipConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            port: 5060,
            user: String::new(),
            password: String::new(),
            call_number: String::new(),
            local_port: 0,
            expires: 300,
            reregister_secs: 240,
            user_agent: concat!("gatecall/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            registration_wait_secs: 15,
            watchdog_secs: 30,
            retry_delay_ms: 1000,
            register_auth_retries: 3,
            reregister_auth_retries: 1,
            invite_auth_retries: 3,
        }
    }
}

impl Config {
    /// Load `path` (YAML or TOML, by extension) with `GATECALL__*` environment
    /// overrides on top.
    pub fn load(path: &Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator(ENV_SEPARATOR)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let required = [
            ("sip.server", &self.sip.server),
            ("sip.user", &self.sip.user),
            ("sip.call_number", &self.sip.call_number),
        ];
        for (key, value) in required {
            if value.trim().is_empty() {
                return Err(GateError::Config(format!("{} must be set", key)));
            }
        }
        if self.sip.reregister_secs == 0 {
            return Err(GateError::Config(
                "sip.reregister_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn http_bind(&self) -> String {
        format!("{}:{}", self.http.host, self.http.port)
    }

    pub fn registrar_addr(&self) -> String {
        format!("{}:{}", self.sip.server, self.sip.port)
    }

    pub fn machine_settings(&self) -> MachineSettings {
        MachineSettings {
            retry_delay: Duration::from_millis(self.call.retry_delay_ms),
            register_auth_retries: self.call.register_auth_retries,
            reregister_auth_retries: self.call.reregister_auth_retries,
            invite_auth_retries: self.call.invite_auth_retries,
            reregister_interval: Duration::from_secs(self.sip.reregister_secs),
            ..MachineSettings::default()
        }
    }

    pub fn call_timing(&self) -> CallTiming {
        CallTiming {
            registration_wait: Duration::from_secs(self.call.registration_wait_secs),
            watchdog: Duration::from_secs(self.call.watchdog_secs),
            penalty: Duration::from_secs(self.http.penalty_secs),
        }
    }
}
