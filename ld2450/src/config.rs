/*!
Configuration for the radar core.

All structs use `#[serde(default)]` so a partial TOML table fills in the
remaining fields with the defaults below.
*/

use serde::{Deserialize, Serialize};

use crate::protocol::{MAX_SENSOR_ANGLE, MAX_SENSOR_DISTANCE, TARGET_SLOTS};
use crate::error::{RadarError, Result};

/// Top-level sensor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    /// Name used in log output
    pub name: String,

    /// Negate decoded x coordinates
    pub flip_x_axis: bool,

    /// Keep targets present for a short grace window after their last change
    pub fast_off_detection: bool,

    /// Distance and angle gating
    pub limits: DetectionLimits,

    /// Per-slot settings (at most 3)
    pub targets: Vec<TargetConfig>,

    /// Zones evaluated on every data frame
    pub zones: Vec<ZoneConfig>,

    /// Protocol timing
    pub timing: TimingConfig,

    /// Which optional outputs the publishing layer forwards
    pub outputs: OutputConfig,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            name: "LD2450".to_string(),
            flip_x_axis: false,
            fast_off_detection: false,
            limits: DetectionLimits::default(),
            targets: Vec::new(),
            zones: Vec::new(),
            timing: TimingConfig::default(),
            outputs: OutputConfig::default(),
        }
    }
}

impl SensorConfig {
    /// Check values that serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.targets.len() > TARGET_SLOTS {
            return Err(RadarError::config(format!(
                "at most {} targets can be configured, got {}",
                TARGET_SLOTS,
                self.targets.len()
            )));
        }
        if self.limits.min_tilt_angle > self.limits.max_tilt_angle {
            return Err(RadarError::config("min_tilt_angle must not exceed max_tilt_angle"));
        }
        for zone in &self.zones {
            if zone.polygon.len() < 3 {
                return Err(RadarError::config(format!(
                    "zone '{}' needs at least 3 points, got {}",
                    zone.name,
                    zone.polygon.len()
                )));
            }
        }
        Ok(())
    }
}

/// Sensor-level gating of raw target positions
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionLimits {
    /// Maximum radial distance (mm)
    pub max_distance: i32,

    /// Extra distance granted to targets that are already present (mm)
    pub max_distance_margin: i32,

    /// Maximum bearing angle (degrees, 0 = straight ahead)
    pub max_tilt_angle: f32,

    /// Minimum bearing angle (degrees)
    pub min_tilt_angle: f32,

    /// Extra angle granted to targets that are already present (degrees)
    pub tilt_angle_margin: f32,
}

impl Default for DetectionLimits {
    fn default() -> Self {
        Self {
            max_distance: MAX_SENSOR_DISTANCE,
            max_distance_margin: 250,
            max_tilt_angle: MAX_SENSOR_ANGLE,
            min_tilt_angle: -MAX_SENSOR_ANGLE,
            tilt_angle_margin: 5.0,
        }
    }
}

/// Per-slot target settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    pub name: Option<String>,

    /// Log raw values while present
    pub debug: bool,
}

/// Zone definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZoneConfig {
    pub name: String,

    /// Convex polygon corners as `[x, y]` in mm
    pub polygon: Vec<[i32; 2]>,

    /// Distance outside the polygon in which tracked targets are kept (mm)
    pub margin: u32,

    /// Time a tracked target may report absence before it is dropped (ms)
    pub target_timeout_ms: u64,

    /// Template polygon evaluation interval (ms), 0 disables
    pub template_evaluation_interval_ms: u64,
}

impl Default for ZoneConfig {
    fn default() -> Self {
        Self {
            name: "Unnamed Zone".to_string(),
            polygon: Vec::new(),
            margin: 250,
            target_timeout_ms: 5000,
            template_evaluation_interval_ms: 1000,
        }
    }
}

/// Protocol timing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Delay before a command is retransmitted (ms)
    pub command_retry_delay_ms: u64,

    /// Transmissions before a command is abandoned
    pub command_max_retries: u32,

    /// Silence after which the sensor is reported unavailable (ms)
    pub sensor_unavailable_timeout_ms: u64,

    /// Command hold-off after a restart or factory reset (ms)
    pub post_restart_lockout_ms: u64,

    /// Interval between attempts to leave a stuck configuration mode (ms)
    pub config_recovery_interval_ms: u64,

    /// Grace window of fast-off detection (ms)
    pub fast_off_threshold_ms: u64,

    /// Minimum interval between per-target debug lines (ms)
    pub target_debug_interval_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            command_retry_delay_ms: 100,
            command_max_retries: 10,
            sensor_unavailable_timeout_ms: 1000,
            post_restart_lockout_ms: 2000,
            config_recovery_interval_ms: 5000,
            fast_off_threshold_ms: 100,
            target_debug_interval_ms: 1000,
        }
    }
}

/// Optional outputs forwarded by the publishing layer.
/// The core computes every value regardless of these flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub occupancy: bool,
    pub target_count: bool,
    pub per_target: bool,
    pub zones: bool,
    pub firmware_version: bool,
    pub mac_address: bool,
    pub tracking_mode: bool,
    pub bluetooth: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            occupancy: true,
            target_count: true,
            per_target: true,
            zones: true,
            firmware_version: true,
            mac_address: true,
            tracking_mode: true,
            bluetooth: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = SensorConfig::default();
        assert_eq!(config.limits.max_distance, 6000);
        assert_eq!(config.limits.max_distance_margin, 250);
        assert_eq!(config.timing.command_max_retries, 10);
        assert!(!config.fast_off_detection);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: SensorConfig = toml::from_str(
            r#"
            fast_off_detection = true

            [limits]
            max_distance = 4000

            [[zones]]
            name = "Desk"
            polygon = [[-500, 500], [500, 500], [0, 1500]]
            "#,
        )
        .unwrap();

        assert!(config.fast_off_detection);
        assert_eq!(config.limits.max_distance, 4000);
        assert_eq!(config.limits.tilt_angle_margin, 5.0);
        assert_eq!(config.zones[0].margin, 250);
        assert_eq!(config.zones[0].target_timeout_ms, 5000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = SensorConfig::default();
        config.targets = vec![TargetConfig::default(); 4];
        assert!(config.validate().is_err());

        let mut config = SensorConfig::default();
        config.zones.push(ZoneConfig { polygon: vec![[0, 0], [1, 1]], ..ZoneConfig::default() });
        assert!(config.validate().is_err());
    }
}
