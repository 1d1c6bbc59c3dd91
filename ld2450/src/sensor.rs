/*!
The poll-driven LD2450 hub.

[`Ld2450::poll`] is the only entry point that touches the transport. Each
call runs, in order:

1. one step of the command channel
2. frame decoding until the transport runs dry
3. the unavailability check
4. configuration mode recovery
5. the RX stall check

High-level operations only enqueue commands; they are sent by later polls.
*/

use serde::Serialize;
use tracing::{debug, error, info};

use crate::command::{Ack, BaudRate, Command, CommandChannel, CommandStats};
use crate::config::{DetectionLimits, SensorConfig};
use crate::error::{RadarError, Result};
use crate::frame::{DecoderStats, Frame, FrameDecoder};
use crate::protocol::{DATA_PAYLOAD_SIZE, TARGET_SLOTS};
use crate::target::{Target, TargetTracker};
use crate::transport::Transport;
use crate::zone::Zone;

/// Values reported by the sensor in response to read commands
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Telemetry {
    pub firmware_version: Option<String>,
    /// Formatted as `AA:BB:CC:DD:EE:FF`, absent while bluetooth is disabled
    pub mac_address: Option<String>,
    pub bluetooth_enabled: Option<bool>,
    pub multi_target_tracking: Option<bool>,
}

/// Per-target output values. Everything but the name is absent while the
/// target is not present.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetSnapshot {
    pub name: String,
    pub present: bool,
    pub x: Option<i16>,
    pub y: Option<i16>,
    pub speed: Option<i16>,
    pub resolution: Option<u16>,
    pub angle: Option<f32>,
    pub distance: Option<f32>,
    pub moving: Option<bool>,
}

impl TargetSnapshot {
    fn capture(target: &Target, now_ms: u64) -> Self {
        let present = target.is_present(now_ms);
        let reading = target.reported();
        Self {
            name: target.name().to_string(),
            present,
            x: present.then_some(reading.x),
            y: present.then_some(reading.y),
            speed: present.then_some(reading.speed),
            resolution: present.then_some(reading.resolution),
            angle: target.angle(now_ms),
            distance: target.distance(now_ms),
            moving: present.then_some(target.is_moving()),
        }
    }
}

/// Per-zone output values
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ZoneSnapshot {
    pub name: String,
    pub valid: bool,
    pub occupied: bool,
    /// Absent while the sensor is unavailable
    pub target_count: Option<usize>,
    pub tracked_slots: Vec<usize>,
}

/// Complete output state handed to a publishing layer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorSnapshot {
    pub timestamp_ms: u64,
    pub available: bool,
    pub configuration_mode: bool,
    pub occupied: bool,
    /// Absent while the sensor is unavailable
    pub target_count: Option<usize>,
    pub targets: Vec<TargetSnapshot>,
    pub zones: Vec<ZoneSnapshot>,
    pub telemetry: Telemetry,
}

/// LD2450 hub
pub struct Ld2450 {
    config: SensorConfig,
    decoder: FrameDecoder,
    channel: CommandChannel,
    tracker: TargetTracker,
    zones: Vec<Zone>,
    sensor_available: bool,
    last_message: u64,
    last_leave_attempt: u64,
    last_available_size: usize,
    last_available_change: u64,
    rx_drains: u64,
    telemetry: Telemetry,
}

impl Ld2450 {
    /// Create a hub from a validated configuration
    pub fn new(config: SensorConfig) -> Result<Self> {
        config.validate()?;

        let zones = config.zones.iter().map(Zone::from_config).collect();
        Ok(Self {
            decoder: FrameDecoder::new(),
            channel: CommandChannel::new(&config.timing),
            tracker: TargetTracker::new(&config),
            zones,
            sensor_available: false,
            last_message: 0,
            last_leave_attempt: 0,
            last_available_size: 0,
            last_available_change: 0,
            rx_drains: 0,
            telemetry: Telemetry::default(),
            config,
        })
    }

    /// Queue the initial read of firmware version and switch states
    pub fn begin(&mut self) {
        self.read_firmware_version();
        self.read_switch_states();
    }

    /// Drive the engine with the current time
    pub fn poll<T: Transport + ?Sized>(&mut self, transport: &mut T, now_ms: u64) -> Result<()> {
        self.channel.tick(transport, now_ms)?;

        while let Some(frame) = self.decoder.poll(transport)? {
            match frame {
                Frame::Data(payload) => self.process_data(&payload, now_ms),
                Frame::Config(payload) => self.process_config(&payload, now_ms),
            }
        }

        self.check_availability(now_ms);
        self.check_config_recovery(now_ms);
        self.check_rx_stall(transport, now_ms);
        Ok(())
    }

    fn process_data(&mut self, payload: &[u8; DATA_PAYLOAD_SIZE], now_ms: u64) {
        self.sensor_available = true;
        self.last_message = now_ms;
        self.channel.set_configuration_mode(false);

        self.tracker.apply_frame(payload, now_ms);
        for zone in &mut self.zones {
            zone.update(self.tracker.targets(), true, now_ms);
        }
    }

    fn process_config(&mut self, payload: &[u8], now_ms: u64) {
        let Some(ack) = self.channel.handle_ack(payload, now_ms) else {
            return;
        };

        match ack {
            Ack::FirmwareVersion(version) => {
                info!("Sensor Firmware-Version: {}", version);
                self.telemetry.firmware_version = Some(version);
            }
            Ack::MacAddress { mac, bluetooth_enabled } => {
                if bluetooth_enabled {
                    let formatted = mac.iter().map(|b| format!("{:02X}", b)).collect::<Vec<_>>().join(":");
                    info!("Sensor MAC-Address: {}", formatted);
                    self.telemetry.mac_address = Some(formatted);
                } else {
                    info!("Sensor MAC-Address: Bluetooth disabled!");
                    self.telemetry.mac_address = None;
                }
                self.telemetry.bluetooth_enabled = Some(bluetooth_enabled);
            }
            Ack::TrackingMode { multi } => {
                debug!("Multi target tracking: {}", multi);
                self.telemetry.multi_target_tracking = Some(multi);
            }
            _ => {}
        }
    }

    fn check_availability(&mut self, now_ms: u64) {
        let elapsed_ms = now_ms.saturating_sub(self.last_message);
        if !self.sensor_available || elapsed_ms <= self.config.timing.sensor_unavailable_timeout_ms {
            return;
        }

        self.sensor_available = false;
        error!("{}", RadarError::SensorUnavailable { elapsed_ms });

        for zone in &mut self.zones {
            zone.update(self.tracker.targets(), false, now_ms);
        }
        self.tracker.clear_all();
    }

    /// A silent sensor is assumed to be stuck in configuration mode
    fn check_config_recovery(&mut self, now_ms: u64) {
        if self.channel.is_applying_changes()
            || self.sensor_available
            || now_ms.saturating_sub(self.last_leave_attempt) <= self.config.timing.config_recovery_interval_ms
        {
            return;
        }

        debug!("Sensor is not sending updates, attempting to leave config mode.");
        self.last_leave_attempt = now_ms;
        self.channel.force_leave_config();
    }

    /// Drain input that has not moved for half the unavailability timeout
    fn check_rx_stall<T: Transport + ?Sized>(&mut self, transport: &mut T, now_ms: u64) {
        let available = transport.available();
        if available != self.last_available_size {
            self.last_available_size = available;
            self.last_available_change = now_ms;
        }

        let stall_ms = self.config.timing.sensor_unavailable_timeout_ms / 2;
        if available == 0 || now_ms.saturating_sub(self.last_available_change) <= stall_ms {
            return;
        }

        debug!("Clearing RX buffer ({} bytes).", available);
        for _ in 0..available {
            if transport.read_byte().is_none() {
                break;
            }
        }
        self.decoder.reset();
        self.rx_drains += 1;
    }

    // Command operations

    pub fn read_firmware_version(&mut self) {
        self.channel.enqueue(Command::read_firmware_version());
    }

    pub fn read_mac_address(&mut self) {
        self.channel.enqueue(Command::read_mac_address());
    }

    /// Read tracking mode and MAC address (which carries the bluetooth state)
    pub fn read_switch_states(&mut self) {
        self.channel.enqueue(Command::read_tracking_mode());
        self.read_mac_address();
    }

    pub fn restart(&mut self) {
        self.channel.enqueue(Command::restart());
        self.read_switch_states();
    }

    pub fn factory_reset(&mut self) {
        self.channel.enqueue(Command::factory_reset());
        self.restart();
    }

    pub fn set_tracking_mode(&mut self, multi: bool) {
        self.channel.enqueue(Command::set_tracking_mode(multi));
        self.channel.enqueue(Command::read_tracking_mode());
    }

    /// Takes effect after the restart that is queued behind it
    pub fn set_bluetooth(&mut self, enabled: bool) {
        self.channel.enqueue(Command::set_bluetooth(enabled));
        self.restart();
    }

    /// Takes effect after the restart that is queued behind it
    pub fn set_baud_rate(&mut self, rate: BaudRate) {
        self.channel.enqueue(Command::set_baud_rate(rate));
        self.restart();
    }

    // Detection limits

    pub fn set_max_distance(&mut self, distance: i32) -> i32 {
        self.tracker.set_max_distance(distance)
    }

    pub fn set_max_tilt_angle(&mut self, angle: f32) -> f32 {
        self.tracker.set_max_tilt_angle(angle)
    }

    pub fn set_min_tilt_angle(&mut self, angle: f32) -> f32 {
        self.tracker.set_min_tilt_angle(angle)
    }

    pub fn limits(&self) -> DetectionLimits {
        self.tracker.limits()
    }

    // Zones

    pub fn add_zone(&mut self, zone: Zone) {
        self.zones.push(zone);
    }

    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }

    pub fn zones_mut(&mut self) -> &mut [Zone] {
        &mut self.zones
    }

    pub fn zone(&self, name: &str) -> Option<&Zone> {
        self.zones.iter().find(|zone| zone.name() == name)
    }

    // State

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &SensorConfig {
        &self.config
    }

    pub fn is_available(&self) -> bool {
        self.sensor_available
    }

    pub fn is_configuration_mode(&self) -> bool {
        self.channel.is_configuration_mode()
    }

    pub fn is_occupied(&self, now_ms: u64) -> bool {
        self.tracker.is_occupied(now_ms)
    }

    pub fn target_count(&self, now_ms: u64) -> usize {
        self.tracker.present_count(now_ms)
    }

    pub fn targets(&self) -> &[Target; TARGET_SLOTS] {
        self.tracker.targets()
    }

    pub fn target(&self, index: usize) -> Option<&Target> {
        self.tracker.target(index)
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    pub fn command_channel(&self) -> &CommandChannel {
        &self.channel
    }

    pub fn decoder_stats(&self) -> DecoderStats {
        self.decoder.stats()
    }

    pub fn command_stats(&self) -> CommandStats {
        self.channel.stats()
    }

    /// Number of times stalled input was discarded
    pub fn rx_drains(&self) -> u64 {
        self.rx_drains
    }

    /// Capture every output value
    pub fn snapshot(&self, now_ms: u64) -> SensorSnapshot {
        let available = self.sensor_available;
        SensorSnapshot {
            timestamp_ms: now_ms,
            available,
            configuration_mode: self.channel.is_configuration_mode(),
            occupied: self.tracker.is_occupied(now_ms),
            target_count: available.then(|| self.tracker.present_count(now_ms)),
            targets: self
                .tracker
                .targets()
                .iter()
                .map(|target| TargetSnapshot::capture(target, now_ms))
                .collect(),
            zones: self
                .zones
                .iter()
                .map(|zone| ZoneSnapshot {
                    name: zone.name().to_string(),
                    valid: zone.is_valid(),
                    occupied: zone.is_occupied(),
                    target_count: available.then(|| zone.target_count()),
                    tracked_slots: zone.tracked_slots(),
                })
                .collect(),
            telemetry: self.telemetry.clone(),
        }
    }

    /// Snapshot as a single JSON line
    pub fn to_json(&self, now_ms: u64) -> Result<String> {
        Ok(serde_json::to_string(&self.snapshot(now_ms))?)
    }

    /// Log the hub configuration
    pub fn dump_config(&self) {
        let limits = self.tracker.limits();
        info!("LD2450 Hub: {}", self.config.name);
        info!("  fast_off_detection: {}", self.config.fast_off_detection);
        info!("  flip_x_axis: {}", self.config.flip_x_axis);
        info!("  max_detection_tilt_angle: {:.2} °", limits.max_tilt_angle);
        info!("  min_detection_tilt_angle: {:.2} °", limits.min_tilt_angle);
        info!("  max_detection_distance: {} mm", limits.max_distance);
        info!("  max_distance_margin: {} mm", limits.max_distance_margin);
        info!("  tilt_angle_margin: {:.2} °", limits.tilt_angle_margin);
        for zone in &self.zones {
            zone.dump_config();
        }
    }
}
