//! Service configuration: TOML file plus `METERSRV_` environment overrides.
//!
//! The register address list is configuration data, not code. Startup
//! validation enforces that it matches the field-name schema one-to-one and
//! fails fast on a mismatch; duplicate addresses (present in the reference
//! deployment's trailing entries) are reported as a warning, not an error.

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{MeterError, Result};
use crate::reading::REGISTER_FIELDS;

/// Register addresses of the reference deployment, in schema order. The two
/// trailing entries historically share address 223.
pub const DEFAULT_REGISTER_ADDRESSES: [u16; 32] = [
    99, 101, 103, 113, 115, 117, 121, 123, 125, 127, 129, 131, 133, 135, 137, 141, 143, 145, 149,
    151, 153, 157, 159, 161, 177, 179, 181, 183, 185, 187, 223, 223,
];

const ENV_PREFIX: &str = "METERSRV_";
const DEFAULT_CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub meter: MeterConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    pub uplink: UplinkConfig,
    #[serde(default)]
    pub backlog: BacklogConfig,
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub log: LogConfig,
    /// One address per register-backed schema field, in schema order.
    #[serde(default = "default_registers")]
    pub registers: Vec<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeterConfig {
    /// Modbus unit id, also stamped into every reading.
    #[serde(default = "default_meter_id")]
    pub id: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default = "default_device_path")]
    pub path: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default = "default_parity")]
    pub parity: String,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UplinkConfig {
    /// Collector endpoint readings are POSTed to.
    pub base_url: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// Port probed for reachability; defaults to the URL's port (80 for http).
    #[serde(default)]
    pub probe_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacklogConfig {
    #[serde(default = "default_backlog_path")]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_cycle_delay_secs")]
    pub cycle_delay_secs: u64,
    #[serde(default = "default_fatal_grace_secs")]
    pub fatal_grace_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// When set, a daily-rolling log file is written under this directory.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

fn default_meter_id() -> u8 {
    101
}
fn default_device_path() -> String {
    "/dev/ttyUSB0".to_string()
}
fn default_baud_rate() -> u32 {
    9600
}
fn default_data_bits() -> u8 {
    8
}
fn default_parity() -> String {
    "none".to_string()
}
fn default_stop_bits() -> u8 {
    2
}
fn default_response_timeout_ms() -> u64 {
    1000
}
fn default_request_timeout_ms() -> u64 {
    10_000
}
fn default_probe_timeout_ms() -> u64 {
    2000
}
fn default_backlog_path() -> PathBuf {
    PathBuf::from("energy_meter_readings.csv")
}
fn default_cycle_delay_secs() -> u64 {
    3
}
fn default_fatal_grace_secs() -> u64 {
    10
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_registers() -> Vec<u16> {
    DEFAULT_REGISTER_ADDRESSES.to_vec()
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            id: default_meter_id(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            path: default_device_path(),
            baud_rate: default_baud_rate(),
            data_bits: default_data_bits(),
            parity: default_parity(),
            stop_bits: default_stop_bits(),
            response_timeout_ms: default_response_timeout_ms(),
        }
    }
}

impl Default for BacklogConfig {
    fn default() -> Self {
        Self {
            path: default_backlog_path(),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            cycle_delay_secs: default_cycle_delay_secs(),
            fatal_grace_secs: default_fatal_grace_secs(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: None,
        }
    }
}

impl DeviceConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

impl UplinkConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Host and port probed before each cycle, derived from the base URL.
    pub fn probe_target(&self) -> Result<(String, u16)> {
        let url = reqwest::Url::parse(&self.base_url)
            .map_err(|e| MeterError::invalid_config("uplink.base_url", e.to_string()))?;
        let host = url
            .host_str()
            .ok_or_else(|| MeterError::invalid_config("uplink.base_url", "missing host"))?
            .to_string();
        let port = self
            .probe_port
            .or_else(|| url.port_or_known_default())
            .unwrap_or(80);
        Ok((host, port))
    }
}

impl ServiceConfig {
    pub fn cycle_delay(&self) -> Duration {
        Duration::from_secs(self.cycle_delay_secs)
    }

    pub fn fatal_grace(&self) -> Duration {
        Duration::from_secs(self.fatal_grace_secs)
    }
}

impl Config {
    /// Load from an explicit TOML file, with environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| MeterError::config(e.to_string()))
    }

    /// Load from `config.toml` in the working directory (if present) plus
    /// environment overrides.
    pub fn load() -> Result<Self> {
        Self::from_file(DEFAULT_CONFIG_FILE)
    }

    /// Fail fast on configuration that would corrupt the pipeline; log
    /// warnings for suspicious-but-workable entries.
    pub fn validate(&self) -> Result<()> {
        if self.registers.len() != REGISTER_FIELDS.len() {
            return Err(MeterError::invalid_config(
                "registers",
                format!(
                    "register list length {} does not match field-name list length {}",
                    self.registers.len(),
                    REGISTER_FIELDS.len()
                ),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for (&address, field) in self.registers.iter().zip(REGISTER_FIELDS.iter()) {
            if !seen.insert(address) {
                warn!(address, field, "duplicate register address in map");
            }
        }

        if self.meter.id == 0 || self.meter.id > 247 {
            return Err(MeterError::invalid_config(
                "meter.id",
                format!("{} is not a valid unit id (1-247)", self.meter.id),
            ));
        }

        if !matches!(self.device.data_bits, 5..=8) {
            return Err(MeterError::invalid_config(
                "device.data_bits",
                format!("{} (expected 5-8)", self.device.data_bits),
            ));
        }
        if !matches!(self.device.stop_bits, 1 | 2) {
            return Err(MeterError::invalid_config(
                "device.stop_bits",
                format!("{} (expected 1 or 2)", self.device.stop_bits),
            ));
        }
        if !matches!(self.device.parity.as_str(), "none" | "even" | "odd") {
            return Err(MeterError::invalid_config(
                "device.parity",
                format!("{:?} (expected none, even or odd)", self.device.parity),
            ));
        }
        if self.device.response_timeout_ms == 0 {
            return Err(MeterError::invalid_config(
                "device.response_timeout_ms",
                "must be non-zero; an unbounded read stalls the whole pipeline",
            ));
        }

        // Also checks the URL parses.
        self.uplink.probe_target()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    fn minimal_toml() -> &'static str {
        r#"
            [uplink]
            base_url = "http://collector.example.com/api/readings/"
        "#
    }

    #[test]
    fn minimal_config_gets_reference_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file("config.toml", minimal_toml())?;
            let config = Config::load().unwrap();
            config.validate().unwrap();

            assert_eq!(config.meter.id, 101);
            assert_eq!(config.device.baud_rate, 9600);
            assert_eq!(config.device.stop_bits, 2);
            assert_eq!(config.registers.len(), 32);
            assert_eq!(config.registers[0], 99);
            assert_eq!(config.service.cycle_delay_secs, 3);
            Ok(())
        });
    }

    #[test]
    fn env_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file("config.toml", minimal_toml())?;
            jail.set_env("METERSRV_METER__ID", "42");
            let config = Config::load().unwrap();
            assert_eq!(config.meter.id, 42);
            Ok(())
        });
    }

    #[test]
    fn register_length_mismatch_is_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "config.toml",
                r#"
                    registers = [99, 101]

                    [uplink]
                    base_url = "http://collector.example.com/"
                "#,
            )?;
            let config = Config::load().unwrap();
            assert!(matches!(
                config.validate(),
                Err(MeterError::InvalidConfig { .. })
            ));
            Ok(())
        });
    }

    #[test]
    fn duplicate_addresses_pass_validation() {
        Jail::expect_with(|jail| {
            jail.create_file("config.toml", minimal_toml())?;
            let config = Config::load().unwrap();
            // Reference map carries the historical duplicate at 223.
            assert_eq!(config.registers[30], config.registers[31]);
            config.validate().unwrap();
            Ok(())
        });
    }

    #[test]
    fn probe_target_defaults_to_http_port() {
        let uplink = UplinkConfig {
            base_url: "http://collector.example.com/api/".to_string(),
            request_timeout_ms: 1,
            probe_timeout_ms: 1,
            probe_port: None,
        };
        assert_eq!(
            uplink.probe_target().unwrap(),
            ("collector.example.com".to_string(), 80)
        );

        let with_port = UplinkConfig {
            probe_port: Some(8443),
            ..uplink
        };
        assert_eq!(with_port.probe_target().unwrap().1, 8443);
    }

    #[test]
    fn bad_url_is_rejected() {
        let uplink = UplinkConfig {
            base_url: "not a url".to_string(),
            request_timeout_ms: 1,
            probe_timeout_ms: 1,
            probe_port: None,
        };
        assert!(uplink.probe_target().is_err());
    }

    #[test]
    fn zero_response_timeout_is_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "config.toml",
                r#"
                    [device]
                    response_timeout_ms = 0

                    [uplink]
                    base_url = "http://collector.example.com/"
                "#,
            )?;
            let config = Config::load().unwrap();
            assert!(config.validate().is_err());
            Ok(())
        });
    }
}
