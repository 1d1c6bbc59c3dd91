/*!
# LD2450 Radar Core

This crate turns the UART byte stream of an HLK-LD2450 mmWave radar into
multi-target position data and evaluates occupancy over user-defined zones.

## Core Types

- [`FrameDecoder`] - Resynchronizing decoder for Data and Config/Ack frames
- [`CommandChannel`] - Outgoing command queue with retry and mode tracking
- [`TargetTracker`] - Per-slot target decoding, gating and presence hysteresis
- [`Zone`] - Convex polygon region with margin and timeout hysteresis
- [`Ld2450`] - Hub wiring everything into a single poll function

## Modules

- [`frame`] - Wire frame decoding
- [`command`] - Command encoding and acknowledgement handling
- [`target`] - Target slot decoding and presence
- [`geometry`] - Convexity, containment and distance helpers
- [`zone`] - Zone membership engine
- [`sensor`] - The poll-driven hub
- [`config`] - Serializable configuration
- [`transport`] - Byte transport abstraction
- [`error`] - Common error types
*/

pub mod command;
pub mod config;
pub mod error;
pub mod frame;
pub mod geometry;
pub mod sensor;
pub mod target;
pub mod transport;
pub mod zone;

// Re-export commonly used types
pub use command::{BaudRate, Command, CommandChannel, Opcode};
pub use config::{DetectionLimits, OutputConfig, SensorConfig, TargetConfig, TimingConfig, ZoneConfig};
pub use error::{RadarError, Result};
pub use frame::{DecoderState, Frame, FrameDecoder};
pub use geometry::Point;
pub use sensor::{Ld2450, SensorSnapshot, TargetSnapshot, Telemetry, ZoneSnapshot};
pub use target::{RawTarget, Target, TargetTracker};
pub use transport::{MemoryTransport, Transport};
pub use zone::Zone;

/// Version information for the radar core library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol constants
pub mod protocol {
    /// Header preceding every periodic target report
    pub const DATA_HEADER: [u8; 4] = [0xAA, 0xFF, 0x03, 0x00];

    /// Trailer closing a target report
    pub const DATA_TRAILER: [u8; 2] = [0x55, 0xCC];

    /// Header shared by outgoing commands and incoming acknowledgements
    pub const CONFIG_HEADER: [u8; 4] = [0xFD, 0xFC, 0xFB, 0xFA];

    /// Trailer shared by outgoing commands and incoming acknowledgements
    pub const CONFIG_TRAILER: [u8; 4] = [0x04, 0x03, 0x02, 0x01];

    /// Number of target slots reported by the sensor
    pub const TARGET_SLOTS: usize = 3;

    /// Size of one target record in a data frame
    pub const TARGET_RECORD_SIZE: usize = 8;

    /// Size of the data frame payload (3 target records)
    pub const DATA_PAYLOAD_SIZE: usize = TARGET_SLOTS * TARGET_RECORD_SIZE;

    /// Bytes following a data header: payload plus trailer
    pub const DATA_FRAME_BODY_SIZE: usize = DATA_PAYLOAD_SIZE + DATA_TRAILER.len();

    /// Upper bound for the content length of a config/ack frame
    pub const MAX_CONFIG_PAYLOAD_SIZE: usize = 20;

    /// Ack flag in the second byte of an acknowledgement
    pub const ACK_SUCCESS: u8 = 0x01;

    /// MAC address reported by the sensor while bluetooth is disabled
    pub const BLUETOOTH_DISABLED_MAC: [u8; 6] = [0x08, 0x05, 0x04, 0x03, 0x02, 0x01];

    /// Offset of the fixed-offset and sign-flag encodings
    pub const COORDINATE_OFFSET: i32 = 0x8000;

    /// Largest detection distance supported by the sensor (mm)
    pub const MAX_SENSOR_DISTANCE: i32 = 6000;

    /// Largest absolute tilt angle supported by the sensor (degrees)
    pub const MAX_SENSOR_ANGLE: f32 = 90.0;
}
