/*!
Common error types for the LD2450 radar core.

Nothing in the core is fatal. Protocol-level variants are reported through
counters and log lines and the engine keeps running; they exist as values so
callers and statistics can name what went wrong.
*/

use thiserror::Error;

/// Common result type used throughout the radar core
pub type Result<T> = std::result::Result<T, RadarError>;

/// Error type for all radar core operations
#[derive(Error, Debug)]
pub enum RadarError {
    /// Byte sequence matched the first byte of a header but not the rest
    #[error("Malformed frame header")]
    MalformedHeader,

    /// Frame length matched but the trailer sentinel was wrong
    #[error("Malformed frame trailer: {}", hex::encode(.0))]
    MalformedTrailer(Vec<u8>),

    /// A command was discarded after exhausting its retries
    #[error("No acknowledgement for command 0x{opcode:02X} after {retries} attempts")]
    AckTimeout { opcode: u8, retries: u32 },

    /// No data frame arrived within the unavailability timeout
    #[error("Sensor stopped sending updates for {elapsed_ms} ms")]
    SensorUnavailable { elapsed_ms: u64 },

    /// Polygon failed the convexity check
    #[error("Invalid polygon: {0}")]
    InvalidPolygon(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors from the underlying transport
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl RadarError {
    /// Create a new invalid polygon error
    pub fn invalid_polygon(msg: impl Into<String>) -> Self {
        Self::InvalidPolygon(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
