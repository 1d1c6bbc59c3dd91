/*!
Outgoing configuration commands and acknowledgement handling.

At most one command is in flight at a time. The head of the queue is
retransmitted every retry delay until it is acknowledged or runs out of
retries. Commands other than entering/leaving configuration mode need the
device to be in configuration mode, so an enter command is prepended when
the mode flag is not set.
*/

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::TimingConfig;
use crate::error::{RadarError, Result};
use crate::protocol::{ACK_SUCCESS, BLUETOOTH_DISABLED_MAC, CONFIG_HEADER, CONFIG_TRAILER};
use crate::transport::Transport;

/// Command words understood by the sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Opcode {
    SingleTrackingMode = 0x80,
    MultiTrackingMode = 0x90,
    ReadTrackingMode = 0x91,
    ReadFirmwareVersion = 0xA0,
    SetBaudRate = 0xA1,
    FactoryReset = 0xA2,
    Restart = 0xA3,
    Bluetooth = 0xA4,
    ReadMacAddress = 0xA5,
    LeaveConfig = 0xFE,
    EnterConfig = 0xFF,
}

impl Opcode {
    /// Parse an opcode from its command word
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x80 => Some(Self::SingleTrackingMode),
            0x90 => Some(Self::MultiTrackingMode),
            0x91 => Some(Self::ReadTrackingMode),
            0xA0 => Some(Self::ReadFirmwareVersion),
            0xA1 => Some(Self::SetBaudRate),
            0xA2 => Some(Self::FactoryReset),
            0xA3 => Some(Self::Restart),
            0xA4 => Some(Self::Bluetooth),
            0xA5 => Some(Self::ReadMacAddress),
            0xFE => Some(Self::LeaveConfig),
            0xFF => Some(Self::EnterConfig),
            _ => None,
        }
    }

    /// Whether this command can be sent outside configuration mode
    pub fn is_mode_switch(self) -> bool {
        matches!(self, Self::EnterConfig | Self::LeaveConfig)
    }
}

/// Serial baud rates selectable on the sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum BaudRate {
    Baud9600 = 1,
    Baud19200 = 2,
    Baud38400 = 3,
    Baud57600 = 4,
    Baud115200 = 5,
    Baud230400 = 6,
    Baud256000 = 7,
    Baud460800 = 8,
}

impl BaudRate {
    pub const ALL: [BaudRate; 8] = [
        Self::Baud9600,
        Self::Baud19200,
        Self::Baud38400,
        Self::Baud57600,
        Self::Baud115200,
        Self::Baud230400,
        Self::Baud256000,
        Self::Baud460800,
    ];

    /// Bits per second
    pub fn bits_per_second(self) -> u32 {
        match self {
            Self::Baud9600 => 9600,
            Self::Baud19200 => 19200,
            Self::Baud38400 => 38400,
            Self::Baud57600 => 57600,
            Self::Baud115200 => 115200,
            Self::Baud230400 => 230400,
            Self::Baud256000 => 256000,
            Self::Baud460800 => 460800,
        }
    }
}

impl fmt::Display for BaudRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bits_per_second())
    }
}

impl FromStr for BaudRate {
    type Err = RadarError;

    fn from_str(s: &str) -> Result<Self> {
        let bps: u32 = s
            .trim()
            .parse()
            .map_err(|_| RadarError::config(format!("invalid baud rate: {}", s)))?;
        Self::ALL
            .into_iter()
            .find(|rate| rate.bits_per_second() == bps)
            .ok_or_else(|| RadarError::config(format!("unsupported baud rate: {}", bps)))
    }
}

/// A command awaiting transmission and acknowledgement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub opcode: Opcode,
    /// Content bytes: command word followed by parameters
    pub payload: Vec<u8>,
}

impl Command {
    fn new(opcode: Opcode, params: &[u8]) -> Self {
        let mut payload = vec![opcode as u8, 0x00];
        payload.extend_from_slice(params);
        Self { opcode, payload }
    }

    pub fn enter_config() -> Self {
        Self::new(Opcode::EnterConfig, &[0x01, 0x00])
    }

    pub fn leave_config() -> Self {
        Self::new(Opcode::LeaveConfig, &[])
    }

    pub fn read_firmware_version() -> Self {
        Self::new(Opcode::ReadFirmwareVersion, &[])
    }

    pub fn read_mac_address() -> Self {
        Self::new(Opcode::ReadMacAddress, &[0x01, 0x00])
    }

    pub fn read_tracking_mode() -> Self {
        Self::new(Opcode::ReadTrackingMode, &[])
    }

    pub fn set_tracking_mode(multi: bool) -> Self {
        if multi {
            Self::new(Opcode::MultiTrackingMode, &[])
        } else {
            Self::new(Opcode::SingleTrackingMode, &[])
        }
    }

    pub fn set_bluetooth(enabled: bool) -> Self {
        Self::new(Opcode::Bluetooth, &[enabled as u8, 0x00])
    }

    pub fn restart() -> Self {
        Self::new(Opcode::Restart, &[])
    }

    pub fn factory_reset() -> Self {
        Self::new(Opcode::FactoryReset, &[])
    }

    pub fn set_baud_rate(rate: BaudRate) -> Self {
        Self::new(Opcode::SetBaudRate, &[rate as u8, 0x00])
    }

    /// Wire representation: header, u16 LE length, payload, trailer
    pub fn encode(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(CONFIG_HEADER.len() + 2 + self.payload.len() + CONFIG_TRAILER.len());
        frame.extend_from_slice(&CONFIG_HEADER);
        frame.extend_from_slice(&(self.payload.len() as u16).to_le_bytes());
        frame.extend_from_slice(&self.payload);
        frame.extend_from_slice(&CONFIG_TRAILER);
        frame
    }
}

/// Decoded content of a successful acknowledgement
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ack {
    EnterConfig,
    LeaveConfig,
    Restart,
    FactoryReset,
    FirmwareVersion(String),
    MacAddress { mac: [u8; 6], bluetooth_enabled: bool },
    TrackingMode { multi: bool },
    Other(u8),
}

impl Ack {
    /// Parse an acknowledgement payload. Returns `None` unless the ack flag signals success.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < 2 || payload[1] != ACK_SUCCESS {
            return None;
        }

        let ack = match Opcode::from_u8(payload[0]) {
            Some(Opcode::EnterConfig) => Ack::EnterConfig,
            Some(Opcode::LeaveConfig) => Ack::LeaveConfig,
            Some(Opcode::Restart) => Ack::Restart,
            Some(Opcode::FactoryReset) => Ack::FactoryReset,
            Some(Opcode::ReadFirmwareVersion) if payload.len() >= 12 => Ack::FirmwareVersion(format!(
                "V{:X}.{:02X}.{:02X}{:02X}{:02X}{:02X}",
                payload[7], payload[6], payload[11], payload[10], payload[9], payload[8]
            )),
            Some(Opcode::ReadMacAddress) if payload.len() >= 10 => {
                let mut mac = [0u8; 6];
                mac.copy_from_slice(&payload[4..10]);
                Ack::MacAddress { mac, bluetooth_enabled: mac != BLUETOOTH_DISABLED_MAC }
            }
            Some(Opcode::ReadTrackingMode) if payload.len() >= 5 => Ack::TrackingMode { multi: payload[4] == 0x02 },
            _ => Ack::Other(payload[0]),
        };
        Some(ack)
    }
}

/// Command channel counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CommandStats {
    pub transmissions: u64,
    pub acknowledged: u64,
    pub timeouts: u64,
    /// Opcode of the most recently abandoned command
    pub last_timeout: Option<u8>,
}

/// Serializes configuration commands to the sensor
pub struct CommandChannel {
    queue: VecDeque<Command>,
    configuration_mode: bool,
    retries: u32,
    last_sent: Option<u64>,
    lockout_started: Option<u64>,
    retry_delay_ms: u64,
    max_retries: u32,
    lockout_ms: u64,
    stats: CommandStats,
}

impl CommandChannel {
    pub fn new(timing: &TimingConfig) -> Self {
        Self {
            queue: VecDeque::new(),
            configuration_mode: false,
            retries: 0,
            last_sent: None,
            lockout_started: None,
            retry_delay_ms: timing.command_retry_delay_ms,
            max_retries: timing.command_max_retries,
            lockout_ms: timing.post_restart_lockout_ms,
            stats: CommandStats::default(),
        }
    }

    /// Append a command to the queue
    pub fn enqueue(&mut self, command: Command) {
        debug!("Queued command 0x{:02X}", command.opcode as u8);
        self.queue.push_back(command);
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Opcodes in queue order
    pub fn pending(&self) -> Vec<Opcode> {
        self.queue.iter().map(|command| command.opcode).collect()
    }

    pub fn head(&self) -> Option<&Command> {
        self.queue.front()
    }

    pub fn is_configuration_mode(&self) -> bool {
        self.configuration_mode
    }

    /// Update the mode flag from outside (data frames imply normal mode)
    pub fn set_configuration_mode(&mut self, enabled: bool) {
        self.configuration_mode = enabled;
    }

    /// Number of transmissions of the current head command
    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn stats(&self) -> CommandStats {
        self.stats
    }

    /// Whether a restart/factory reset lockout is still running
    pub fn is_locked_out(&self, now_ms: u64) -> bool {
        self.lockout_started
            .map_or(false, |started| now_ms.saturating_sub(started) <= self.lockout_ms)
    }

    /// Whether a lockout was started and has not been cleared by a tick yet
    pub fn is_applying_changes(&self) -> bool {
        self.lockout_started.is_some()
    }

    /// Assume the device is stuck in configuration mode and try to leave it
    pub fn force_leave_config(&mut self) {
        self.configuration_mode = true;
        self.queue.clear();
        self.queue.push_back(Command::leave_config());
        self.retries = 0;
    }

    /// Advance the head of the queue
    pub fn tick<T: Transport + ?Sized>(&mut self, transport: &mut T, now_ms: u64) -> Result<()> {
        if let Some(started) = self.lockout_started {
            if now_ms.saturating_sub(started) <= self.lockout_ms {
                return Ok(());
            }
            debug!("Post-restart lockout expired");
            self.lockout_started = None;
        }

        let Some(head) = self.queue.front() else {
            if self.configuration_mode {
                self.queue.push_back(Command::leave_config());
                self.retries = 0;
            }
            return Ok(());
        };

        if !self.configuration_mode && !head.opcode.is_mode_switch() {
            self.queue.push_front(Command::enter_config());
            self.retries = 0;
        }

        if let Some(last) = self.last_sent {
            if now_ms.saturating_sub(last) <= self.retry_delay_ms {
                return Ok(());
            }
        }

        if self.retries >= self.max_retries {
            self.give_up();
            return Ok(());
        }

        if let Some(command) = self.queue.front() {
            transport.write_all(&command.encode())?;
            transport.flush()?;
            debug!("Sent command 0x{:02X} (attempt {})", command.opcode as u8, self.retries + 1);
        }
        self.last_sent = Some(now_ms);
        self.retries += 1;
        self.stats.transmissions += 1;
        Ok(())
    }

    fn give_up(&mut self) {
        let Some(command) = self.queue.pop_front() else {
            return;
        };

        match command.opcode {
            Opcode::LeaveConfig => {
                // Assume the device already left configuration mode
                self.configuration_mode = false;
            }
            Opcode::EnterConfig => {
                self.queue.clear();
                warn!("Entering config mode failed, clearing command queue.");
            }
            _ => {}
        }

        let err = RadarError::AckTimeout { opcode: command.opcode as u8, retries: self.retries };
        warn!("{}. Is the sensor connected?", err);
        self.retries = 0;
        self.stats.timeouts += 1;
        self.stats.last_timeout = Some(command.opcode as u8);
    }

    /// Consume a config/ack frame. Returns the decoded acknowledgement when it signals success.
    pub fn handle_ack(&mut self, payload: &[u8], now_ms: u64) -> Option<Ack> {
        let ack = Ack::parse(payload)?;

        if let Some(head) = self.queue.front() {
            if head.opcode as u8 == payload[0] {
                self.queue.pop_front();
                self.retries = 0;
                self.last_sent = None;
                self.stats.acknowledged += 1;
            }
        }

        match &ack {
            Ack::EnterConfig => self.configuration_mode = true,
            Ack::LeaveConfig => self.configuration_mode = false,
            Ack::Restart | Ack::FactoryReset => {
                // The device reboots into normal mode; hold the queue until it is back
                self.configuration_mode = false;
                self.lockout_started = Some(now_ms);
                info!("Sensor restarting, holding commands for {} ms", self.lockout_ms);
            }
            _ => {}
        }

        Some(ack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;

    fn timing(max_retries: u32) -> TimingConfig {
        TimingConfig {
            command_retry_delay_ms: 100,
            command_max_retries: max_retries,
            post_restart_lockout_ms: 2000,
            ..TimingConfig::default()
        }
    }

    fn ack(opcode: Opcode) -> Vec<u8> {
        vec![opcode as u8, ACK_SUCCESS, 0x00, 0x00]
    }

    fn sent_opcodes(transport: &mut MemoryTransport) -> Vec<u8> {
        // Every command written here has a header, a 2-byte length and the opcode right after
        let written = transport.take_written();
        let mut opcodes = Vec::new();
        let mut i = 0;
        while i + 6 < written.len() {
            let len = u16::from_le_bytes([written[i + 4], written[i + 5]]) as usize;
            opcodes.push(written[i + 6]);
            i += 4 + 2 + len + 4;
        }
        opcodes
    }

    #[test]
    fn test_command_encoding() {
        assert_eq!(
            Command::enter_config().encode(),
            vec![0xFD, 0xFC, 0xFB, 0xFA, 0x04, 0x00, 0xFF, 0x00, 0x01, 0x00, 0x04, 0x03, 0x02, 0x01]
        );
        assert_eq!(
            Command::set_baud_rate(BaudRate::Baud256000).encode(),
            vec![0xFD, 0xFC, 0xFB, 0xFA, 0x04, 0x00, 0xA1, 0x00, 0x07, 0x00, 0x04, 0x03, 0x02, 0x01]
        );
        assert_eq!(Command::set_bluetooth(true).payload, vec![0xA4, 0x00, 0x01, 0x00]);
    }

    #[test]
    fn test_baud_rate_parsing() {
        assert_eq!("115200".parse::<BaudRate>().unwrap(), BaudRate::Baud115200);
        assert_eq!(BaudRate::Baud460800 as u8, 8);
        assert!("12345".parse::<BaudRate>().is_err());
        assert!("fast".parse::<BaudRate>().is_err());
    }

    #[test]
    fn test_enter_config_is_prepended() {
        let mut channel = CommandChannel::new(&timing(3));
        let mut transport = MemoryTransport::new();
        channel.enqueue(Command::read_firmware_version());

        channel.tick(&mut transport, 1000).unwrap();
        assert_eq!(channel.pending(), vec![Opcode::EnterConfig, Opcode::ReadFirmwareVersion]);
        assert_eq!(sent_opcodes(&mut transport), vec![0xFF]);
        assert_eq!(transport.flush_count(), 1);
    }

    #[test]
    fn test_leave_config_is_not_prefixed() {
        let mut channel = CommandChannel::new(&timing(3));
        let mut transport = MemoryTransport::new();
        channel.enqueue(Command::leave_config());

        channel.tick(&mut transport, 1000).unwrap();
        assert_eq!(channel.pending(), vec![Opcode::LeaveConfig]);
        assert_eq!(sent_opcodes(&mut transport), vec![0xFE]);
    }

    #[test]
    fn test_full_exchange_returns_to_normal_mode() {
        let mut channel = CommandChannel::new(&timing(3));
        let mut transport = MemoryTransport::new();
        channel.enqueue(Command::read_tracking_mode());

        channel.tick(&mut transport, 1000).unwrap();
        assert_eq!(channel.handle_ack(&ack(Opcode::EnterConfig), 1010), Some(Ack::EnterConfig));
        assert!(channel.is_configuration_mode());

        // Acked command frees the slot immediately
        channel.tick(&mut transport, 1020).unwrap();
        let reply = [0x91, 0x01, 0x00, 0x00, 0x02, 0x00];
        assert_eq!(channel.handle_ack(&reply, 1030), Some(Ack::TrackingMode { multi: true }));
        assert!(channel.is_empty());

        // Empty queue while in config mode queues a leave command
        channel.tick(&mut transport, 1040).unwrap();
        assert_eq!(channel.pending(), vec![Opcode::LeaveConfig]);
        channel.tick(&mut transport, 1050).unwrap();
        channel.handle_ack(&ack(Opcode::LeaveConfig), 1060);
        assert!(!channel.is_configuration_mode());
        assert!(channel.is_empty());

        assert_eq!(sent_opcodes(&mut transport), vec![0xFF, 0x91, 0xFE]);
        assert_eq!(channel.stats().acknowledged, 3);
    }

    #[test]
    fn test_unmatched_or_failed_ack_keeps_head() {
        let mut channel = CommandChannel::new(&timing(3));
        let mut transport = MemoryTransport::new();
        channel.enqueue(Command::leave_config());
        channel.tick(&mut transport, 1000).unwrap();

        assert_eq!(channel.handle_ack(&[0xFE, 0x00, 0x01, 0x00], 1010), None);
        assert_eq!(channel.handle_ack(&ack(Opcode::ReadFirmwareVersion), 1020), Some(Ack::Other(0xA0)));
        assert_eq!(channel.pending(), vec![Opcode::LeaveConfig]);
    }

    #[test]
    fn test_retry_then_give_up() {
        let mut channel = CommandChannel::new(&timing(3));
        let mut transport = MemoryTransport::new();
        channel.set_configuration_mode(true);
        channel.enqueue(Command::restart());
        channel.enqueue(Command::read_mac_address());

        let mut now = 1000;
        channel.tick(&mut transport, now).unwrap();
        for _ in 0..9 {
            now += 50;
            channel.tick(&mut transport, now).unwrap();
        }

        // Sent at 1000, 1150 and 1300, discarded at 1450
        assert_eq!(sent_opcodes(&mut transport), vec![0xA3, 0xA3, 0xA3]);
        assert_eq!(channel.pending(), vec![Opcode::ReadMacAddress]);
        assert_eq!(channel.stats().timeouts, 1);
        assert_eq!(channel.stats().last_timeout, Some(0xA3));
    }

    #[test]
    fn test_failed_enter_config_clears_queue() {
        let mut channel = CommandChannel::new(&timing(2));
        let mut transport = MemoryTransport::new();
        channel.enqueue(Command::read_firmware_version());
        channel.enqueue(Command::read_mac_address());

        for now in (1000..2000).step_by(101) {
            channel.tick(&mut transport, now).unwrap();
        }

        assert_eq!(sent_opcodes(&mut transport), vec![0xFF, 0xFF]);
        assert!(channel.is_empty());
        assert!(!channel.is_configuration_mode());
    }

    #[test]
    fn test_failed_leave_config_assumes_success() {
        let mut channel = CommandChannel::new(&timing(2));
        let mut transport = MemoryTransport::new();
        channel.force_leave_config();
        assert!(channel.is_configuration_mode());

        for now in (1000..2000).step_by(101) {
            channel.tick(&mut transport, now).unwrap();
        }

        assert_eq!(sent_opcodes(&mut transport), vec![0xFE, 0xFE]);
        assert!(channel.is_empty());
        assert!(!channel.is_configuration_mode());
    }

    #[test]
    fn test_restart_ack_starts_lockout() {
        let mut channel = CommandChannel::new(&timing(3));
        let mut transport = MemoryTransport::new();
        channel.set_configuration_mode(true);
        channel.enqueue(Command::restart());
        channel.enqueue(Command::read_tracking_mode());

        channel.tick(&mut transport, 1000).unwrap();
        channel.handle_ack(&ack(Opcode::Restart), 1010);
        assert!(channel.is_locked_out(1010));
        assert!(!channel.is_configuration_mode());

        for now in (1100..=3010).step_by(100) {
            channel.tick(&mut transport, now).unwrap();
        }
        assert_eq!(sent_opcodes(&mut transport), vec![0xA3]);

        channel.tick(&mut transport, 3011).unwrap();
        assert!(!channel.is_locked_out(3011));
        assert!(!channel.is_applying_changes());
        assert_eq!(sent_opcodes(&mut transport), vec![0xFF]);
    }

    #[test]
    fn test_ack_decoding() {
        let version = [0xA0, 0x01, 0x00, 0x00, 0x00, 0x00, 0x02, 0x01, 0x16, 0x06, 0x24, 0x22];
        assert_eq!(Ack::parse(&version), Some(Ack::FirmwareVersion("V1.02.22240616".to_string())));

        let disabled = [0xA5, 0x01, 0x00, 0x00, 0x08, 0x05, 0x04, 0x03, 0x02, 0x01];
        assert_eq!(
            Ack::parse(&disabled),
            Some(Ack::MacAddress { mac: BLUETOOTH_DISABLED_MAC, bluetooth_enabled: false })
        );

        let enabled = [0xA5, 0x01, 0x00, 0x00, 0x8F, 0x27, 0x2E, 0xB8, 0x0F, 0x65];
        assert!(matches!(Ack::parse(&enabled), Some(Ack::MacAddress { bluetooth_enabled: true, .. })));

        assert_eq!(Ack::parse(&[0xA0]), None);
    }
}
