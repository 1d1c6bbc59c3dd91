/*!
Target slot decoding and presence tracking.

Each data frame carries three 8-byte records:

```text
x (u16 LE, sign flag) | y (u16 LE, 0x8000 offset) | speed (u16 LE, sign flag) | resolution (u16 LE)
```

The encodings are reproduced exactly as the device emits them, with 16-bit
wrapping, rather than reinterpreted as two's complement.
*/

use tracing::debug;

use crate::config::{DetectionLimits, SensorConfig, TargetConfig};
use crate::protocol::{
    COORDINATE_OFFSET, DATA_PAYLOAD_SIZE, MAX_SENSOR_ANGLE, MAX_SENSOR_DISTANCE, TARGET_RECORD_SIZE, TARGET_SLOTS,
};

/// Decoded values of one target record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawTarget {
    pub x: i16,
    pub y: i16,
    pub speed: i16,
    pub resolution: u16,
}

impl RawTarget {
    /// Decode a single 8-byte record
    pub fn decode(record: &[u8; TARGET_RECORD_SIZE]) -> Self {
        let field = |i: usize| u16::from_le_bytes([record[i], record[i + 1]]);
        Self {
            x: decode_sign_flag(field(0)),
            y: decode_offset(field(2)),
            speed: decode_sign_flag(field(4)),
            resolution: field(6),
        }
    }

    /// Decode all records of a data frame payload
    pub fn decode_frame(payload: &[u8; DATA_PAYLOAD_SIZE]) -> [RawTarget; TARGET_SLOTS] {
        let mut targets = [RawTarget::default(); TARGET_SLOTS];
        for (target, chunk) in targets.iter_mut().zip(payload.chunks_exact(TARGET_RECORD_SIZE)) {
            let mut record = [0u8; TARGET_RECORD_SIZE];
            record.copy_from_slice(chunk);
            *target = RawTarget::decode(&record);
        }
        targets
    }
}

/// Top bit set: negate the 16-bit reading and add 0x8000, truncated to 16 bits
fn decode_sign_flag(raw: u16) -> i16 {
    let value = raw as i16;
    if raw & 0x8000 != 0 {
        (-(value as i32) + COORDINATE_OFFSET) as i16
    } else {
        value
    }
}

/// Subtract 0x8000 unless the reading is zero, truncated to 16 bits
fn decode_offset(raw: u16) -> i16 {
    let value = raw as i16;
    if value != 0 {
        (value as i32 - COORDINATE_OFFSET) as i16
    } else {
        value
    }
}

/// Bearing in degrees, 0 straight ahead, positive to the right of the sensor
pub fn bearing(x: f32, y: f32) -> f32 {
    -(y.atan2(x).to_degrees() - 90.0)
}

/// One of the three target slots
#[derive(Debug, Clone)]
pub struct Target {
    name: String,
    debug: bool,
    fast_off_detection: bool,
    fast_off_threshold_ms: u64,
    debug_interval_ms: u64,
    x: i16,
    y: i16,
    speed: i16,
    resolution: u16,
    last_change: Option<u64>,
    last_detection: Option<RawTarget>,
    last_debug_message: Option<u64>,
}

impl Target {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            debug: false,
            fast_off_detection: false,
            fast_off_threshold_ms: 100,
            debug_interval_ms: 1000,
            x: 0,
            y: 0,
            speed: 0,
            resolution: 0,
            last_change: None,
            last_detection: None,
            last_debug_message: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_debugging(&mut self, flag: bool) {
        self.debug = flag;
    }

    pub fn set_fast_off_detection(&mut self, flag: bool, threshold_ms: u64) {
        self.fast_off_detection = flag;
        self.fast_off_threshold_ms = threshold_ms;
    }

    /// Store a new reading
    pub fn update_values(&mut self, raw: RawTarget, now_ms: u64) {
        let changed = raw != self.raw();
        if self.fast_off_detection && self.resolution != 0 && changed {
            self.last_change = Some(now_ms);
        }
        self.x = raw.x;
        self.y = raw.y;
        self.speed = raw.speed;
        self.resolution = raw.resolution;
        if raw.resolution != 0 {
            self.last_detection = Some(raw);
        }
    }

    /// Reset to "no detection" and forget the last detection, with no grace window
    pub fn clear(&mut self) {
        self.x = 0;
        self.y = 0;
        self.speed = 0;
        self.resolution = 0;
        self.last_change = None;
        self.last_detection = None;
    }

    /// Whether the slot currently reports a target
    pub fn is_present(&self, now_ms: u64) -> bool {
        if self.resolution != 0 {
            return true;
        }
        self.fast_off_detection
            && self
                .last_change
                .map_or(false, |changed| now_ms.saturating_sub(changed) <= self.fast_off_threshold_ms)
    }

    pub fn is_moving(&self) -> bool {
        self.reported().speed != 0
    }

    /// Last stored reading, as reported by the sensor
    pub fn raw(&self) -> RawTarget {
        RawTarget { x: self.x, y: self.y, speed: self.speed, resolution: self.resolution }
    }

    pub fn x(&self) -> i16 {
        self.x
    }

    pub fn y(&self) -> i16 {
        self.y
    }

    pub fn speed(&self) -> i16 {
        self.speed
    }

    pub fn resolution(&self) -> u16 {
        self.resolution
    }

    /// Timestamp of the last value change seen while detected
    pub fn last_change(&self) -> Option<u64> {
        self.last_change
    }

    /// Reading used for output: the current one, or the last detected one
    /// while fast-off detection holds the target present
    pub fn reported(&self) -> RawTarget {
        if self.resolution != 0 {
            self.raw()
        } else {
            self.last_detection.unwrap_or_else(|| self.raw())
        }
    }

    /// Position used for geometry, taken from [`Target::reported`]
    pub fn position(&self) -> (i16, i16) {
        let reported = self.reported();
        (reported.x, reported.y)
    }

    /// Bearing in degrees, `None` while absent
    pub fn angle(&self, now_ms: u64) -> Option<f32> {
        if !self.is_present(now_ms) {
            return None;
        }
        let (x, y) = self.position();
        Some(bearing(x as f32, y as f32))
    }

    /// Distance from the sensor in mm, `None` while absent
    pub fn distance(&self, now_ms: u64) -> Option<f32> {
        if !self.is_present(now_ms) {
            return None;
        }
        let (x, y) = self.position();
        Some((x as f32).hypot(y as f32))
    }

    /// Rate-limited debug output of the raw values
    pub fn log_debug(&mut self, now_ms: u64) {
        if !self.debug || !self.is_present(now_ms) {
            return;
        }
        let due = self
            .last_debug_message
            .map_or(true, |last| now_ms.saturating_sub(last) > self.debug_interval_ms);
        if due {
            self.last_debug_message = Some(now_ms);
            debug!(
                "Target {}: x:{}; y:{}; speed:{}; res:{};",
                self.name, self.x, self.y, self.speed, self.resolution
            );
        }
    }
}

/// Owns the three target slots and applies data frames to them
pub struct TargetTracker {
    targets: [Target; TARGET_SLOTS],
    limits: DetectionLimits,
    flip_x_axis: bool,
}

impl TargetTracker {
    pub fn new(config: &SensorConfig) -> Self {
        let targets = std::array::from_fn(|i| {
            let slot = config.targets.get(i).cloned().unwrap_or_else(TargetConfig::default);
            let mut target = Target::new(slot.name.unwrap_or_else(|| format!("Target {}", i + 1)));
            target.set_debugging(slot.debug);
            target.set_fast_off_detection(config.fast_off_detection, config.timing.fast_off_threshold_ms);
            target.debug_interval_ms = config.timing.target_debug_interval_ms;
            target
        });

        Self { targets, limits: config.limits, flip_x_axis: config.flip_x_axis }
    }

    pub fn targets(&self) -> &[Target; TARGET_SLOTS] {
        &self.targets
    }

    pub fn target(&self, index: usize) -> Option<&Target> {
        self.targets.get(index)
    }

    pub fn limits(&self) -> DetectionLimits {
        self.limits
    }

    /// Decode a data frame, gate each slot and store the results
    pub fn apply_frame(&mut self, payload: &[u8; DATA_PAYLOAD_SIZE], now_ms: u64) {
        let limits = self.limits;
        for (target, mut raw) in self.targets.iter_mut().zip(RawTarget::decode_frame(payload)) {
            if self.flip_x_axis {
                raw.x = raw.x.wrapping_neg();
            }

            // No detection in the slot: nothing to gate
            if raw.resolution == 0 {
                target.update_values(raw, now_ms);
                target.log_debug(now_ms);
                continue;
            }

            let distance = (raw.x as f32).hypot(raw.y as f32);
            let angle = bearing(raw.x as f32, raw.y as f32);
            let present = target.is_present(now_ms);
            let max_distance = limits.max_distance as f32;
            let distance_margin = limits.max_distance_margin as f32;

            let distance_ok = distance <= max_distance || (present && distance <= max_distance + distance_margin);
            let max_angle_ok = angle <= limits.max_tilt_angle
                || (present && angle <= limits.max_tilt_angle + limits.tilt_angle_margin);
            let min_angle_ok = angle >= limits.min_tilt_angle
                || (present && angle >= limits.min_tilt_angle - limits.tilt_angle_margin);

            if distance_ok && max_angle_ok && min_angle_ok {
                target.update_values(raw, now_ms);
            } else if distance > max_distance + distance_margin
                || angle > limits.max_tilt_angle + limits.tilt_angle_margin
                || angle < limits.min_tilt_angle - limits.tilt_angle_margin
            {
                target.clear();
            }

            target.log_debug(now_ms);
        }
    }

    /// Clear every slot (sensor unavailable)
    pub fn clear_all(&mut self) {
        for target in &mut self.targets {
            target.clear();
        }
    }

    pub fn present_count(&self, now_ms: u64) -> usize {
        self.targets.iter().filter(|target| target.is_present(now_ms)).count()
    }

    pub fn is_occupied(&self, now_ms: u64) -> bool {
        self.present_count(now_ms) > 0
    }

    /// Returns the effective (clamped) maximum distance
    pub fn set_max_distance(&mut self, distance: i32) -> i32 {
        self.limits.max_distance = distance.clamp(0, MAX_SENSOR_DISTANCE);
        self.limits.max_distance
    }

    /// Returns the effective (clamped) maximum tilt angle
    pub fn set_max_tilt_angle(&mut self, angle: f32) -> f32 {
        self.limits.max_tilt_angle = angle.clamp(self.limits.min_tilt_angle, MAX_SENSOR_ANGLE);
        self.limits.max_tilt_angle
    }

    /// Returns the effective (clamped) minimum tilt angle
    pub fn set_min_tilt_angle(&mut self, angle: f32) -> f32 {
        self.limits.min_tilt_angle = angle.clamp(-MAX_SENSOR_ANGLE, self.limits.max_tilt_angle);
        self.limits.min_tilt_angle
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Encode a record the way the device does
    pub(crate) fn encode_record(x: i16, y: i16, speed: i16, resolution: u16) -> [u8; TARGET_RECORD_SIZE] {
        let sign_flag = |v: i16| -> u16 {
            if v < 0 {
                0x8000 | v.unsigned_abs()
            } else {
                v as u16
            }
        };
        let offset = |v: i16| -> u16 {
            if v == 0 {
                0
            } else {
                (v as u16).wrapping_add(0x8000)
            }
        };

        let mut record = [0u8; TARGET_RECORD_SIZE];
        record[0..2].copy_from_slice(&sign_flag(x).to_le_bytes());
        record[2..4].copy_from_slice(&offset(y).to_le_bytes());
        record[4..6].copy_from_slice(&sign_flag(speed).to_le_bytes());
        record[6..8].copy_from_slice(&resolution.to_le_bytes());
        record
    }

    pub(crate) fn payload(records: [[u8; TARGET_RECORD_SIZE]; TARGET_SLOTS]) -> [u8; DATA_PAYLOAD_SIZE] {
        let mut payload = [0u8; DATA_PAYLOAD_SIZE];
        for (chunk, record) in payload.chunks_exact_mut(TARGET_RECORD_SIZE).zip(records) {
            chunk.copy_from_slice(&record);
        }
        payload
    }

    #[test]
    fn test_decode_literal_records() {
        assert_eq!(RawTarget::decode(&[0x00; 8]), RawTarget { x: 0, y: 0, speed: 0, resolution: 0 });

        // x sign flag set, y offset, speed positive
        assert_eq!(
            RawTarget::decode(&[0x32, 0x80, 0x00, 0x81, 0x10, 0x00, 0x68, 0x01]),
            RawTarget { x: -0x32, y: 256, speed: 16, resolution: 360 }
        );

        // x positive, y zero kept as zero, speed sign flag set
        assert_eq!(
            RawTarget::decode(&[0x32, 0x00, 0x00, 0x00, 0x10, 0x80, 0x00, 0x00]),
            RawTarget { x: 0x32, y: 0, speed: -16, resolution: 0 }
        );

        assert_eq!(
            RawTarget::decode(&[0xE8, 0x83, 0xD0, 0x87, 0x00, 0x00, 0x40, 0x01]),
            RawTarget { x: -1000, y: 2000, speed: 0, resolution: 320 }
        );

        // y without the top bit wraps below zero
        assert_eq!(RawTarget::decode(&[0, 0, 0x00, 0x01, 0, 0, 0, 0]).y, -32512);
    }

    #[test]
    fn test_decode_frame_slots() {
        let payload = payload([
            encode_record(-120, 1500, 0, 360),
            encode_record(0, 0, 0, 0),
            encode_record(2000, 3000, -40, 320),
        ]);
        let targets = RawTarget::decode_frame(&payload);
        assert_eq!(targets[0], RawTarget { x: -120, y: 1500, speed: 0, resolution: 360 });
        assert_eq!(targets[1], RawTarget::default());
        assert_eq!(targets[2], RawTarget { x: 2000, y: 3000, speed: -40, resolution: 320 });
    }

    #[test]
    fn test_presence_without_fast_off() {
        let mut target = Target::new("Target 1");
        assert!(!target.is_present(0));

        target.update_values(RawTarget { x: 10, y: 1000, speed: 0, resolution: 360 }, 0);
        assert!(target.is_present(10_000));

        target.update_values(RawTarget::default(), 100);
        assert!(!target.is_present(100));
        assert_eq!(target.angle(100), None);
    }

    #[test]
    fn test_fast_off_grace_window() {
        let mut target = Target::new("Target 1");
        target.set_fast_off_detection(true, 100);

        let detected = RawTarget { x: 10, y: 1000, speed: 0, resolution: 360 };
        target.update_values(detected, 0);
        target.update_values(detected, 50);
        target.update_values(RawTarget::default(), 200);
        assert_eq!(target.last_change(), Some(200));

        for now in [200, 250, 300] {
            target.update_values(RawTarget::default(), now);
            assert!(target.is_present(now), "present at {}", now);
        }
        assert_eq!(target.position(), (10, 1000));
        assert!(!target.is_present(301));
    }

    #[test]
    fn test_untouched_slot_is_never_present() {
        let mut target = Target::new("Target 3");
        target.set_fast_off_detection(true, 100);
        target.clear();
        assert!(!target.is_present(0));
    }

    #[test]
    fn test_derived_values() {
        let mut target = Target::new("Target 1");
        target.update_values(RawTarget { x: 0, y: 1000, speed: 5, resolution: 360 }, 0);
        assert!((target.angle(0).unwrap()).abs() < 1e-3);
        assert!((target.distance(0).unwrap() - 1000.0).abs() < 1e-3);
        assert!(target.is_moving());

        target.update_values(RawTarget { x: 1000, y: 1000, speed: 0, resolution: 360 }, 0);
        assert!((target.angle(0).unwrap() - 45.0).abs() < 1e-3);
        target.update_values(RawTarget { x: -1000, y: 1000, speed: 0, resolution: 360 }, 0);
        assert!((target.angle(0).unwrap() + 45.0).abs() < 1e-3);
    }

    fn tracker(limits: DetectionLimits) -> TargetTracker {
        let config = SensorConfig { limits, ..SensorConfig::default() };
        TargetTracker::new(&config)
    }

    #[test]
    fn test_distance_gate_with_margin() {
        let mut tracker = tracker(DetectionLimits { max_distance: 3000, ..DetectionLimits::default() });
        let frame = |y| payload([encode_record(0, y, 0, 360), [0; 8], [0; 8]]);

        // New target beyond the limit is ignored
        tracker.apply_frame(&frame(3100), 0);
        assert!(!tracker.target(0).unwrap().is_present(0));

        // Present target may move into the margin
        tracker.apply_frame(&frame(2900), 100);
        tracker.apply_frame(&frame(3200), 200);
        assert!(tracker.target(0).unwrap().is_present(200));
        assert_eq!(tracker.target(0).unwrap().y(), 3200);

        // Beyond limit plus margin it is cleared
        tracker.apply_frame(&frame(3300), 300);
        assert!(!tracker.target(0).unwrap().is_present(300));
        assert_eq!(tracker.target(0).unwrap().raw(), RawTarget::default());
    }

    #[test]
    fn test_force_clear_skips_fast_off_window() {
        let config = SensorConfig {
            fast_off_detection: true,
            limits: DetectionLimits { max_distance: 3000, ..DetectionLimits::default() },
            ..SensorConfig::default()
        };
        let mut tracker = TargetTracker::new(&config);
        let frame = |y| payload([encode_record(0, y, 0, 360), [0; 8], [0; 8]]);

        tracker.apply_frame(&frame(2900), 0);
        assert!(tracker.is_occupied(0));

        tracker.apply_frame(&frame(4000), 50);
        let target = tracker.target(0).unwrap();
        assert!(!target.is_present(50));
        assert_eq!(target.last_change(), None);
        assert_eq!(target.position(), (0, 0));
        assert_eq!(tracker.present_count(50), 0);
    }

    #[test]
    fn test_empty_record_keeps_fast_off_window_with_narrow_angles() {
        let config = SensorConfig {
            fast_off_detection: true,
            limits: DetectionLimits { max_tilt_angle: 45.0, min_tilt_angle: -45.0, ..DetectionLimits::default() },
            ..SensorConfig::default()
        };
        let mut tracker = TargetTracker::new(&config);
        tracker.apply_frame(&payload([encode_record(0, 1000, 0, 360), [0; 8], [0; 8]]), 0);
        tracker.apply_frame(&payload([[0; 8]; TARGET_SLOTS]), 50);

        let target = tracker.target(0).unwrap();
        assert!(target.is_present(150));
        assert_eq!(target.position(), (0, 1000));
        assert!(!target.is_present(151));
    }

    #[test]
    fn test_clear_forgets_last_detection() {
        let mut target = Target::new("Target 1");
        target.set_fast_off_detection(true, 100);
        target.update_values(RawTarget { x: 10, y: 1000, speed: 3, resolution: 360 }, 0);
        target.clear();
        assert!(!target.is_present(0));
        assert_eq!(target.reported(), RawTarget::default());
        assert!(!target.is_moving());
    }

    #[test]
    fn test_angle_gate_with_margin() {
        let mut tracker = tracker(DetectionLimits {
            max_tilt_angle: 45.0,
            min_tilt_angle: -45.0,
            tilt_angle_margin: 5.0,
            ..DetectionLimits::default()
        });
        // bearing(x, 1000) for x = 1000 is 45 degrees; 1100 is ~47.7; 1300 is ~52.4
        let frame = |x| payload([encode_record(x, 1000, 0, 360), [0; 8], [0; 8]]);

        tracker.apply_frame(&frame(1100), 0);
        assert!(!tracker.target(0).unwrap().is_present(0));

        tracker.apply_frame(&frame(900), 100);
        tracker.apply_frame(&frame(1100), 200);
        assert!(tracker.target(0).unwrap().is_present(200));

        tracker.apply_frame(&frame(1300), 300);
        assert!(!tracker.target(0).unwrap().is_present(300));
        assert_eq!(tracker.present_count(300), 0);
    }

    #[test]
    fn test_flip_x_axis() {
        let config = SensorConfig { flip_x_axis: true, ..SensorConfig::default() };
        let mut tracker = TargetTracker::new(&config);
        tracker.apply_frame(&payload([encode_record(-500, 1000, 0, 360), [0; 8], [0; 8]]), 0);
        assert_eq!(tracker.target(0).unwrap().x(), 500);
        assert!(tracker.is_occupied(0));
    }

    #[test]
    fn test_limit_clamping() {
        let mut tracker = tracker(DetectionLimits::default());
        assert_eq!(tracker.set_max_distance(9000), 6000);
        assert_eq!(tracker.set_max_distance(-5), 0);
        assert_eq!(tracker.set_min_tilt_angle(-30.0), -30.0);
        assert_eq!(tracker.set_max_tilt_angle(-60.0), -30.0);
        assert_eq!(tracker.set_min_tilt_angle(10.0), -30.0);
        assert_eq!(tracker.set_max_tilt_angle(120.0), 90.0);
    }

    #[test]
    fn test_default_names() {
        let tracker = tracker(DetectionLimits::default());
        let names: Vec<_> = tracker.targets().iter().map(|t| t.name().to_string()).collect();
        assert_eq!(names, vec!["Target 1", "Target 2", "Target 3"]);
    }
}
