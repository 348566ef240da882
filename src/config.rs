//! Connection, polling and motion configuration
//!
//! All timing values are deployment tuning rather than protocol constants,
//! so they live here with the serial parameters. A configuration file is
//! JSON; every field is optional and falls back to the defaults below.
//!
//! ```json
//! {
//!   "link": { "port": "/dev/ttyUSB0", "baud_rate": 57600, "slave_id": 7 },
//!   "polling": { "fast_interval_ms": 33 },
//!   "motion": { "max_speed": 2400.0 }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::codec::ByteOrder;
use crate::error::{RotaryError, RotaryResult};

/// Serial parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

/// Serial link parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Serial device path
    pub port: String,
    pub baud_rate: u32,
    /// Modbus slave address of the controller
    pub slave_id: u8,
    pub parity: Parity,
    /// 7 or 8
    pub data_bits: u8,
    /// 1 or 2
    pub stop_bits: u8,
    /// Bound on one request/response exchange
    pub timeout_ms: u64,
    /// Word layout of 32-bit fields
    pub byte_order: ByteOrder,
    /// Hex-dump every frame through the log
    pub packet_logging: bool,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            port: "/dev/serial0".to_string(),
            baud_rate: 57600,
            slave_id: 17,
            parity: Parity::None,
            data_bits: 8,
            stop_bits: 1,
            timeout_ms: 1000,
            byte_order: ByteOrder::LittleSwap,
            packet_logging: false,
        }
    }
}

impl LinkConfig {
    pub fn new<S: Into<String>>(port: S, baud_rate: u32, slave_id: u8) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            slave_id,
            ..Self::default()
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Reject parameters no serial port could be opened with
    pub fn validate(&self) -> RotaryResult<()> {
        if self.port.trim().is_empty() {
            return Err(RotaryError::configuration("Serial port path is empty"));
        }
        if self.baud_rate == 0 {
            return Err(RotaryError::configuration("Baud rate must be non-zero"));
        }
        if !(1..=247).contains(&self.slave_id) {
            return Err(RotaryError::configuration(format!(
                "Invalid slave ID: {} (must be 1-247)",
                self.slave_id
            )));
        }
        if !matches!(self.data_bits, 7 | 8) {
            return Err(RotaryError::configuration(format!(
                "Unsupported data bits: {}",
                self.data_bits
            )));
        }
        if !matches!(self.stop_bits, 1 | 2) {
            return Err(RotaryError::configuration(format!(
                "Unsupported stop bits: {}",
                self.stop_bits
            )));
        }
        if self.timeout_ms == 0 {
            return Err(RotaryError::configuration("Timeout must be non-zero"));
        }
        Ok(())
    }
}

/// Poll cadence and reconnect timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// Interval between polls while the link is healthy
    pub fast_interval_ms: u64,
    /// Interval once the link keeps failing
    pub slow_interval_ms: u64,
    /// Consecutive failures before the slow interval is used
    pub degrade_after_failures: u32,
    /// Delay between a failed connect and the next attempt
    pub reconnect_delay_ms: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            fast_interval_ms: 40,
            slow_interval_ms: 500,
            degrade_after_failures: 2,
            reconnect_delay_ms: 5000,
        }
    }
}

impl PollConfig {
    pub fn fast_interval(&self) -> Duration {
        Duration::from_millis(self.fast_interval_ms)
    }

    pub fn slow_interval(&self) -> Duration {
        Duration::from_millis(self.slow_interval_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn validate(&self) -> RotaryResult<()> {
        if self.fast_interval_ms == 0 || self.slow_interval_ms == 0 {
            return Err(RotaryError::configuration("Poll intervals must be non-zero"));
        }
        if self.slow_interval_ms < self.fast_interval_ms {
            return Err(RotaryError::configuration(
                "Slow poll interval must not be shorter than the fast one",
            ));
        }
        Ok(())
    }
}

/// Motion configuration pushed to the controller at connect time
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionParameters {
    pub min_speed: f32,
    pub max_speed: f32,
    pub acceleration: f32,
    /// Physical units per `ratio_den` steps
    pub ratio_num: i32,
    pub ratio_den: i32,
}

impl Default for MotionParameters {
    fn default() -> Self {
        Self {
            min_speed: 150.0,
            max_speed: 3600.0,
            acceleration: 5.0,
            ratio_num: 360,
            ratio_den: 1600,
        }
    }
}

impl MotionParameters {
    /// Convert a physical position to controller steps
    pub fn to_steps(&self, position: f64) -> i32 {
        if self.ratio_num == 0 {
            return 0;
        }
        (position / self.ratio_num as f64 * self.ratio_den as f64) as i32
    }

    /// Convert controller steps to a physical position
    pub fn to_position(&self, steps: i32) -> f64 {
        if self.ratio_den == 0 {
            return 0.0;
        }
        steps as f64 * self.ratio_num as f64 / self.ratio_den as f64
    }
}

/// Electronic gearing ratio used in synchro mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynchroRatio {
    pub num: i32,
    pub den: i32,
}

impl Default for SynchroRatio {
    fn default() -> Self {
        Self { num: 1024, den: 36000 }
    }
}

/// Complete client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ControllerConfig {
    pub link: LinkConfig,
    pub polling: PollConfig,
    pub motion: MotionParameters,
    pub synchro: SynchroRatio,
}

impl ControllerConfig {
    pub fn from_json_str(text: &str) -> RotaryResult<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> RotaryResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            RotaryError::configuration(format!("Cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&text)
    }

    /// Check the settings the process cannot run without
    ///
    /// Link parameters are left out: a bad port or slave id fails each
    /// connect attempt and is retried on the reconnect schedule, so it can be
    /// fixed without a restart. Use [`LinkConfig::validate`] to report it early.
    pub fn validate(&self) -> RotaryResult<()> {
        self.polling.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ControllerConfig::default();
        assert_eq!(config.link.baud_rate, 57600);
        assert_eq!(config.link.byte_order, ByteOrder::LittleSwap);
        assert_eq!(config.polling.reconnect_delay(), Duration::from_secs(5));
        assert_eq!(config.motion.ratio_den, 1600);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = ControllerConfig::from_json_str(
            r#"{ "link": { "port": "/dev/ttyUSB1", "slave_id": 7 }, "polling": { "fast_interval_ms": 33 } }"#,
        )
        .unwrap();
        assert_eq!(config.link.port, "/dev/ttyUSB1");
        assert_eq!(config.link.slave_id, 7);
        assert_eq!(config.link.baud_rate, 57600);
        assert_eq!(config.polling.fast_interval_ms, 33);
        assert_eq!(config.polling.slow_interval_ms, 500);
    }

    #[test]
    fn test_invalid_link_is_configuration_error() {
        let mut link = LinkConfig::default();
        link.baud_rate = 0;
        assert!(link.validate().unwrap_err().is_configuration());

        let link = LinkConfig::new("/dev/ttyUSB0", 57600, 0);
        assert!(link.validate().unwrap_err().is_configuration());

        let link = LinkConfig::new("  ", 57600, 7);
        assert!(link.validate().unwrap_err().is_configuration());

        assert!(ControllerConfig::from_json_str("{ not json").unwrap_err().is_configuration());
    }

    #[test]
    fn test_bad_link_loads_but_bad_polling_does_not() {
        let config =
            ControllerConfig::from_json_str(r#"{ "link": { "port": "", "slave_id": 0 } }"#).unwrap();
        assert!(config.validate().is_ok());
        let err = config.link.validate().unwrap_err();
        assert!(err.is_configuration());

        let err = ControllerConfig::from_json_str(r#"{ "polling": { "fast_interval_ms": 0 } }"#)
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_slave_id_message_is_not_nested() {
        let err = LinkConfig::new("/dev/ttyUSB0", 57600, 0).validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Configuration error: Invalid slave ID: 0 (must be 1-247)"
        );
    }

    #[test]
    fn test_step_conversion() {
        let motion = MotionParameters::default();
        assert_eq!(motion.to_steps(360.0), 1600);
        assert!((motion.to_position(800) - 180.0).abs() < 1e-9);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rotary.json");
        std::fs::write(&path, r#"{ "synchro": { "num": 1, "den": 4 } }"#).unwrap();
        let config = ControllerConfig::from_json_file(&path).unwrap();
        assert_eq!(config.synchro, SynchroRatio { num: 1, den: 4 });

        assert!(ControllerConfig::from_json_file(dir.path().join("missing.json")).is_err());
    }
}
