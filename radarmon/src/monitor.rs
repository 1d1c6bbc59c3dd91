/*!
Live radar monitor.

Two threads linked by crossbeam channels:
1. Source thread: TCP bridge connection (tokio) or capture file replay -> raw chunks
2. Poll thread: raw chunks -> `Ld2450` hub -> one output line per state change

Outgoing commands travel the other way, from the poll thread to the TCP writer.
*/

use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use chrono::Local;
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use ld2450::command::CommandStats;
use ld2450::frame::DecoderStats;
use ld2450::{BaudRate, Ld2450, OutputConfig, SensorSnapshot};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::runtime::Runtime;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::stream::StreamTransport;

/// Where the byte stream comes from
#[derive(Debug, Clone)]
pub enum Source {
    /// Serial-to-TCP bridge at `host:port`
    Tcp(String),
    /// Raw capture file
    Replay(PathBuf),
}

/// Device commands queued at startup
#[derive(Debug, Clone, Default)]
pub struct DeviceActions {
    pub restart: bool,
    pub factory_reset: bool,
    pub multi_tracking: Option<bool>,
    pub bluetooth: Option<bool>,
    pub baud_rate: Option<BaudRate>,
}

impl DeviceActions {
    fn apply(&self, hub: &mut Ld2450) {
        if self.factory_reset {
            info!("🏭 Queued factory reset");
            hub.factory_reset();
        }
        if let Some(multi) = self.multi_tracking {
            info!("🎯 Queued tracking mode: {}", if multi { "multi" } else { "single" });
            hub.set_tracking_mode(multi);
        }
        if let Some(enabled) = self.bluetooth {
            info!("📶 Queued bluetooth {}", if enabled { "on" } else { "off" });
            hub.set_bluetooth(enabled);
        }
        if let Some(rate) = self.baud_rate {
            info!("🔌 Queued baud rate {}", rate);
            hub.set_baud_rate(rate);
        }
        if self.restart {
            info!("🔄 Queued restart");
            hub.restart();
        }
    }
}

/// Counters reported when the monitor stops
#[derive(Debug, Clone, Copy, Default)]
pub struct MonitorSummary {
    pub decoder: DecoderStats,
    pub commands: CommandStats,
    pub rx_drains: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub states_published: u64,
}

pub struct RadarMonitor {
    source: Source,
    config: AppConfig,
    actions: DeviceActions,
    running: Arc<AtomicBool>,
}

impl RadarMonitor {
    pub fn new(source: Source, config: AppConfig, actions: DeviceActions) -> Self {
        Self {
            source,
            config,
            actions,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Get a reference to the running flag for external control
    pub fn get_running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Run until the source ends or the running flag is cleared
    pub fn start(&mut self) -> Result<MonitorSummary> {
        let (data_tx, data_rx) = bounded::<Vec<u8>>(self.config.transport.channel_buffer_size);

        let running_source = Arc::clone(&self.running);
        let running_poll = Arc::clone(&self.running);

        let (source_handle, command_tx) = match self.source.clone() {
            Source::Tcp(address) => {
                let (command_tx, command_rx) = unbounded::<Bytes>();
                let transport = self.config.transport.clone();
                let handle = thread::spawn(move || -> Result<()> {
                    let rt = Runtime::new().context("Failed to start tokio runtime")?;
                    rt.block_on(Self::tcp_source_thread(address, transport, data_tx, command_rx, running_source))
                        .inspect(|_| info!("TCP source thread finished successfully"))
                        .inspect_err(|e| error!("TCP source thread failed: {:#}", e))
                });
                (handle, Some(command_tx))
            }
            Source::Replay(path) => {
                let chunk_size = self.config.monitor.replay_chunk_size.max(1);
                let interval = Duration::from_millis(self.config.monitor.replay_chunk_interval_ms);
                let handle = thread::spawn(move || -> Result<()> {
                    Self::replay_source_thread(path, chunk_size, interval, data_tx, running_source)
                        .inspect(|_| info!("Replay source thread finished successfully"))
                        .inspect_err(|e| error!("Replay source thread failed: {:#}", e))
                });
                (handle, None)
            }
        };

        let config = self.config.clone();
        let actions = self.actions.clone();
        let poll_handle = thread::spawn(move || -> Result<MonitorSummary> {
            Self::poll_thread(config, actions, data_rx, command_tx, running_poll)
                .inspect_err(|e| error!("Poll thread failed: {:#}", e))
        });

        let source_result = source_handle.join().map_err(|_| anyhow!("Source thread panicked"))?;
        let poll_result = poll_handle.join().map_err(|_| anyhow!("Poll thread panicked"))?;

        source_result?;
        poll_result
    }

    /// Bridge connection: forwards received bytes and writes queued commands
    async fn tcp_source_thread(
        address: String,
        transport: crate::config::TransportConfig,
        data_tx: Sender<Vec<u8>>,
        command_rx: Receiver<Bytes>,
        running: Arc<AtomicBool>,
    ) -> Result<()> {
        info!("🔌 Connecting to {}", address);
        let stream = TcpStream::connect(&address)
            .await
            .with_context(|| format!("Failed to connect to {}", address))?;
        stream.set_nodelay(true)?;

        let sock_ref = socket2::SockRef::from(&stream);
        sock_ref.set_recv_buffer_size(transport.recv_buffer_size)?;
        sock_ref.set_keepalive(transport.keepalive)?;
        info!("✅ Connected, receive buffer {} bytes", transport.recv_buffer_size);

        let (mut reader, mut writer) = stream.into_split();
        let mut buffer = vec![0u8; 1024];
        let mut dropped_chunks = 0u64;

        while running.load(Ordering::SeqCst) {
            while let Ok(command) = command_rx.try_recv() {
                debug!("→ {}", hex::encode(&command));
                writer.write_all(&command).await?;
                writer.flush().await?;
            }

            match tokio::time::timeout(Duration::from_millis(50), reader.read(&mut buffer)).await {
                Ok(Ok(0)) => {
                    warn!("Bridge closed the connection");
                    break;
                }
                Ok(Ok(received)) => {
                    if data_tx.try_send(buffer[..received].to_vec()).is_err() {
                        error!("Data channel full, dropping chunk! The poll thread can't keep up.");
                        dropped_chunks += 1;
                    }
                }
                Ok(Err(e)) => return Err(e).context("Read from bridge failed"),
                Err(_) => {
                    // Timeout - continue to check running flag
                    continue;
                }
            }
        }

        if dropped_chunks > 0 {
            warn!("Dropped {} chunks", dropped_chunks);
        }
        Ok(())
    }

    /// Capture replay: feeds the file in fixed-size chunks
    fn replay_source_thread(
        path: PathBuf,
        chunk_size: usize,
        interval: Duration,
        data_tx: Sender<Vec<u8>>,
        running: Arc<AtomicBool>,
    ) -> Result<()> {
        let capture = std::fs::read(&path).with_context(|| format!("Failed to read capture {}", path.display()))?;
        info!("📼 Replaying {} ({} bytes)", path.display(), capture.len());

        for chunk in capture.chunks(chunk_size) {
            if !running.load(Ordering::SeqCst) {
                break;
            }
            if data_tx.send(chunk.to_vec()).is_err() {
                // Poll thread is gone
                break;
            }
            if !interval.is_zero() {
                thread::sleep(interval);
            }
        }
        Ok(())
    }

    fn poll_thread(
        config: AppConfig,
        actions: DeviceActions,
        data_rx: Receiver<Vec<u8>>,
        command_tx: Option<Sender<Bytes>>,
        running: Arc<AtomicBool>,
    ) -> Result<MonitorSummary> {
        let json_output = config.monitor.json_output;
        let outputs = config.sensor.outputs;
        let poll_interval = Duration::from_millis(config.monitor.poll_interval_ms);
        let stats_interval = Duration::from_secs(config.monitor.stats_interval_seconds);

        let mut hub = Ld2450::new(config.sensor)?;
        hub.dump_config();
        let can_send = command_tx.is_some();
        let mut transport = StreamTransport::new(data_rx, command_tx);
        if can_send {
            hub.begin();
            actions.apply(&mut hub);
        }

        let start_time = Instant::now();
        let mut last_stats = Instant::now();
        let mut last_state: Option<Value> = None;
        let mut states_published = 0u64;

        while running.load(Ordering::SeqCst) {
            let connected = transport.pump();
            let now_ms = start_time.elapsed().as_millis() as u64;

            if let Err(e) = hub.poll(&mut transport, now_ms) {
                error!("Poll failed: {}", e);
            }

            let snapshot = hub.snapshot(now_ms);
            let state = published_state(&snapshot, &outputs)?;
            if last_state.as_ref() != Some(&state) {
                let line = if json_output { format_json(&state)? } else { format_text(&snapshot, &outputs) };
                let mut stdout = std::io::stdout().lock();
                writeln!(stdout, "{}", line)?;
                stdout.flush()?;
                states_published += 1;
                last_state = Some(state);
            }

            if !stats_interval.is_zero() && last_stats.elapsed() >= stats_interval {
                let stats = hub.decoder_stats();
                info!(
                    "📊 {} data frames, {} acks, {} trailer errors, {} bytes skipped",
                    stats.data_frames, stats.config_frames, stats.trailer_errors, stats.bytes_skipped
                );
                last_stats = Instant::now();
            }

            if !connected {
                info!("Data source ended");
                break;
            }
            thread::sleep(poll_interval);
        }

        let summary = MonitorSummary {
            decoder: hub.decoder_stats(),
            commands: hub.command_stats(),
            rx_drains: hub.rx_drains(),
            bytes_received: transport.bytes_received(),
            bytes_sent: transport.bytes_sent(),
            states_published,
        };
        log_summary(&summary, start_time.elapsed());
        Ok(summary)
    }
}

/// Snapshot fields enabled in `outputs`, without the timestamp.
/// A new line is published whenever this value changes.
pub fn published_state(snapshot: &SensorSnapshot, outputs: &OutputConfig) -> Result<Value> {
    let mut state = serde_json::to_value(snapshot)?;
    if let Some(fields) = state.as_object_mut() {
        fields.remove("timestamp_ms");
        let optional = [
            (outputs.occupancy, "occupied"),
            (outputs.target_count, "target_count"),
            (outputs.per_target, "targets"),
            (outputs.zones, "zones"),
        ];
        for (_, key) in optional.iter().filter(|(enabled, _)| !enabled) {
            fields.remove(*key);
        }

        if let Some(telemetry) = fields.get_mut("telemetry").and_then(Value::as_object_mut) {
            let optional = [
                (outputs.firmware_version, "firmware_version"),
                (outputs.mac_address, "mac_address"),
                (outputs.bluetooth, "bluetooth_enabled"),
                (outputs.tracking_mode, "multi_target_tracking"),
            ];
            for (_, key) in optional.iter().filter(|(enabled, _)| !enabled) {
                telemetry.remove(*key);
            }
        }
    }
    Ok(state)
}

pub fn format_json(state: &Value) -> Result<String> {
    let line = serde_json::json!({
        "time": Local::now().to_rfc3339(),
        "state": state,
    });
    Ok(serde_json::to_string(&line)?)
}

pub fn format_text(snapshot: &SensorSnapshot, outputs: &OutputConfig) -> String {
    let mut line = format!("{} ", Local::now().format("%H:%M:%S%.3f"));

    if !snapshot.available {
        line.push_str("sensor unavailable");
        return line;
    }

    let mut summary = Vec::new();
    if outputs.occupancy {
        summary.push(format!("occupied={}", snapshot.occupied));
    }
    if outputs.target_count {
        summary.push(format!("targets={}", snapshot.target_count.unwrap_or(0)));
    }
    line.push_str(&summary.join(" "));

    let targets = snapshot.targets.iter().filter(|target| outputs.per_target && target.present);
    for target in targets {
        line.push_str(&format!(
            " | {} ({}, {}) {:.0}mm {:.1}°",
            target.name,
            target.x.unwrap_or(0),
            target.y.unwrap_or(0),
            target.distance.unwrap_or(0.0),
            target.angle.unwrap_or(0.0)
        ));
    }

    for zone in snapshot.zones.iter().filter(|_| outputs.zones) {
        line.push_str(&format!(" | {}: {}", zone.name, zone.target_count.unwrap_or(0)));
    }
    line
}

fn log_summary(summary: &MonitorSummary, elapsed: Duration) {
    info!("📈 Monitor final stats:");
    info!("   Bytes received: {}", summary.bytes_received);
    info!("   Bytes sent: {}", summary.bytes_sent);
    info!("   Data frames: {}", summary.decoder.data_frames);
    info!("   Config frames: {}", summary.decoder.config_frames);
    info!("   Header mismatches: {}", summary.decoder.header_mismatches);
    info!("   Trailer errors: {}", summary.decoder.trailer_errors);
    info!("   Bytes skipped: {}", summary.decoder.bytes_skipped);
    info!("   RX drains: {}", summary.rx_drains);
    info!("   Commands sent: {}", summary.commands.transmissions);
    info!("   Commands acknowledged: {}", summary.commands.acknowledged);
    info!("   Command timeouts: {}", summary.commands.timeouts);
    info!("   States published: {}", summary.states_published);
    info!("   Duration: {:.1}s", elapsed.as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;
    use ld2450::protocol::{DATA_HEADER, DATA_PAYLOAD_SIZE, DATA_TRAILER};
    use ld2450::ZoneConfig;
    use tempfile::NamedTempFile;

    fn data_frame(payload: &[u8; DATA_PAYLOAD_SIZE]) -> Vec<u8> {
        let mut frame = DATA_HEADER.to_vec();
        frame.extend_from_slice(payload);
        frame.extend_from_slice(&DATA_TRAILER);
        frame
    }

    /// Target 0 at (0, 1000) mm
    fn target_ahead() -> [u8; DATA_PAYLOAD_SIZE] {
        let mut payload = [0u8; DATA_PAYLOAD_SIZE];
        payload[..8].copy_from_slice(&[0x00, 0x00, 0xE8, 0x83, 0x00, 0x00, 0x68, 0x01]);
        payload
    }

    fn hub_with_zone() -> Ld2450 {
        let mut config = AppConfig::new().sensor;
        config.zones.push(ZoneConfig {
            name: "Desk".to_string(),
            polygon: vec![[-500, 500], [500, 500], [0, 1500]],
            ..ZoneConfig::default()
        });
        Ld2450::new(config).unwrap()
    }

    #[test]
    fn test_published_state_ignores_timestamp() {
        let hub = hub_with_zone();
        let outputs = OutputConfig::default();
        let first = published_state(&hub.snapshot(0), &outputs).unwrap();
        let later = published_state(&hub.snapshot(500), &outputs).unwrap();

        assert_eq!(first, later);
        assert!(first.get("timestamp_ms").is_none());
    }

    #[test]
    fn test_text_and_json_lines() {
        let mut hub = hub_with_zone();
        let outputs = OutputConfig::default();
        assert!(format_text(&hub.snapshot(0), &outputs).ends_with("sensor unavailable"));

        let mut transport = ld2450::MemoryTransport::new();
        transport.feed(&data_frame(&target_ahead()));
        hub.poll(&mut transport, 10).unwrap();

        let text = format_text(&hub.snapshot(10), &outputs);
        assert!(text.contains("occupied=true targets=1"));
        assert!(text.contains("Target 1 (0, 1000) 1000mm"));
        assert!(text.contains("Desk: 1"));

        let state = published_state(&hub.snapshot(10), &outputs).unwrap();
        let value: Value = serde_json::from_str(&format_json(&state).unwrap()).unwrap();
        assert_eq!(value["state"]["target_count"], 1);
        assert!(value["state"]["telemetry"].get("mac_address").is_some());
        assert!(value["time"].is_string());
    }

    #[test]
    fn test_disabled_outputs_are_omitted() {
        let mut hub = hub_with_zone();
        let mut transport = ld2450::MemoryTransport::new();
        transport.feed(&data_frame(&target_ahead()));
        hub.poll(&mut transport, 10).unwrap();

        let outputs = OutputConfig {
            per_target: false,
            zones: false,
            target_count: false,
            mac_address: false,
            ..OutputConfig::default()
        };

        let text = format_text(&hub.snapshot(10), &outputs);
        assert!(text.contains("occupied=true"));
        assert!(!text.contains("targets="));
        assert!(!text.contains("Target 1"));
        assert!(!text.contains("Desk"));

        let state = published_state(&hub.snapshot(10), &outputs).unwrap();
        assert_eq!(state["occupied"], true);
        assert!(state.get("targets").is_none());
        assert!(state.get("zones").is_none());
        assert!(state.get("target_count").is_none());
        assert!(state["telemetry"].get("mac_address").is_none());
        assert!(state["telemetry"].get("firmware_version").is_some());

        // A change limited to a disabled output publishes nothing new
        transport.feed(&data_frame(&[0; DATA_PAYLOAD_SIZE]));
        hub.poll(&mut transport, 20).unwrap();
        let quiet = OutputConfig { occupancy: false, ..outputs };
        assert_eq!(
            published_state(&hub.snapshot(10), &quiet).unwrap(),
            published_state(&hub.snapshot(20), &quiet).unwrap()
        );
    }

    #[test]
    fn test_replay_capture() {
        let mut capture = vec![0x13, 0x37];
        capture.extend(data_frame(&[0; DATA_PAYLOAD_SIZE]));
        capture.extend(data_frame(&target_ahead()));
        capture.extend(data_frame(&[0; DATA_PAYLOAD_SIZE]));

        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), &capture).unwrap();

        let mut config = AppConfig::new();
        config.monitor.replay_chunk_size = 7;
        config.monitor.replay_chunk_interval_ms = 0;
        config.monitor.poll_interval_ms = 1;
        config.monitor.json_output = true;

        let mut monitor = RadarMonitor::new(Source::Replay(file.path().to_path_buf()), config, DeviceActions::default());
        let summary = monitor.start().unwrap();

        assert_eq!(summary.decoder.data_frames, 3);
        assert_eq!(summary.bytes_received, capture.len() as u64);
        assert_eq!(summary.bytes_sent, 0);
        assert_eq!(summary.decoder.bytes_skipped, 2);
        assert!(summary.states_published >= 1);
    }

    #[test]
    fn test_missing_capture_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut monitor = RadarMonitor::new(
            Source::Replay(dir.path().join("missing.bin")),
            AppConfig::new(),
            DeviceActions::default(),
        );
        assert!(monitor.start().is_err());
    }
}
