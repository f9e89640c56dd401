//! Driver configuration, loadable from TOML.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::data::Rotation;
use crate::error::{DeviceError, Result};

/// Static IMU driver settings.
///
/// All fields have conservative defaults, so a partial TOML file (or none
/// at all) yields a working driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImuConfig {
    /// Timer rate in Hz; 0 selects manual mode (sample on read)
    pub poll_rate_hz: u32,
    /// Underlying measurement rate in Hz
    pub sample_rate_hz: u32,
    /// Staging ring depth per channel, in records
    pub queue_depth: usize,
    /// Board mounting rotation
    pub rotation: Rotation,
    /// Accelerometer full-scale range in g
    pub accel_range_g: f32,
    /// Gyro full-scale range in degrees per second
    pub gyro_range_dps: f32,
    /// Accelerometer low-pass cutoff in Hz; absent disables filtering
    pub accel_cutoff_hz: Option<f32>,
    /// Gyro low-pass cutoff in Hz; absent disables filtering
    pub gyro_cutoff_hz: Option<f32>,
}

impl Default for ImuConfig {
    fn default() -> Self {
        Self {
            poll_rate_hz: 250,
            sample_rate_hz: 400,
            queue_depth: 2,
            rotation: Rotation::None,
            accel_range_g: 8.0,
            gyro_range_dps: 2000.0,
            accel_cutoff_hz: Some(30.0),
            gyro_cutoff_hz: Some(30.0),
        }
    }
}

impl ImuConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)
            .map_err(|e| DeviceError::InvalidArgument(format!("config parse: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            DeviceError::InvalidArgument(format!(
                "config {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_toml_str(&text)
    }

    fn validate(&self) -> Result<()> {
        if self.sample_rate_hz == 0 {
            return Err(DeviceError::InvalidArgument("sample_rate_hz is 0".into()));
        }
        if self.queue_depth == 0 {
            return Err(DeviceError::InvalidArgument("queue_depth is 0".into()));
        }
        if self.accel_range_g <= 0.0 || self.gyro_range_dps <= 0.0 {
            return Err(DeviceError::InvalidArgument(
                "measurement ranges must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(ImuConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config = ImuConfig::from_toml_str(
            r#"
            poll_rate_hz = 100
            rotation = "yaw180"
            "#,
        )
        .unwrap();
        assert_eq!(config.poll_rate_hz, 100);
        assert_eq!(config.rotation, Rotation::Yaw180);
        assert_eq!(config.sample_rate_hz, 400);
        assert_eq!(config.queue_depth, 2);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(ImuConfig::from_toml_str("sample_rate_hz = 0").is_err());
        assert!(ImuConfig::from_toml_str("queue_depth = 0").is_err());
        assert!(ImuConfig::from_toml_str("accel_range_g = -1.0").is_err());
        assert!(ImuConfig::from_toml_str("rotation = \"sideways\"").is_err());
    }

    #[test]
    fn test_round_trips_through_toml() {
        let config = ImuConfig {
            poll_rate_hz: 0,
            gyro_cutoff_hz: None,
            ..Default::default()
        };
        let text = toml::to_string(&config).unwrap();
        let back = ImuConfig::from_toml_str(&text).unwrap();
        assert_eq!(back.poll_rate_hz, 0);
        assert_eq!(back.gyro_cutoff_hz, None);
        assert_eq!(back.accel_range_g, config.accel_range_g);
    }
}
