/*!
# Radar Monitor

Live monitor and configuration tool for an HLK-LD2450 mmWave radar attached
to a serial-to-TCP bridge.

## Usage

### Monitor a sensor
```bash
radarmon monitor --addr 192.168.1.40:8899
```

### Replay a raw capture
```bash
radarmon monitor --replay capture.bin --json
```

### Change device settings, then keep monitoring
```bash
radarmon monitor --tracking-mode single --bluetooth false --restart
```

### Generate a configuration file
```bash
radarmon config --output radarmon.toml
```
*/

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use ld2450::BaudRate;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod monitor;
mod stream;

use config::AppConfig;
use monitor::{DeviceActions, RadarMonitor, Source};

#[derive(Parser)]
#[command(name = "radarmon")]
#[command(about = "Live monitor and configuration tool for the HLK-LD2450 mmWave radar")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, default_value = "radarmon.toml", global = true)]
    config: PathBuf,

    /// Debug logging (ignored when RUST_LOG is set)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum TrackingMode {
    Single,
    Multi,
}

#[derive(Subcommand)]
enum Commands {
    /// Decode the sensor stream and print state changes
    Monitor {
        /// Bridge address (overrides the config file)
        #[arg(short, long, conflicts_with = "replay")]
        addr: Option<String>,

        /// Replay a raw capture file instead of connecting
        #[arg(short, long)]
        replay: Option<PathBuf>,

        /// Print JSON lines
        #[arg(long)]
        json: bool,

        /// Restart the sensor
        #[arg(long)]
        restart: bool,

        /// Restore factory settings
        #[arg(long)]
        factory_reset: bool,

        /// Set the tracking mode
        #[arg(long, value_enum)]
        tracking_mode: Option<TrackingMode>,

        /// Enable or disable bluetooth (applied after a restart)
        #[arg(long)]
        bluetooth: Option<bool>,

        /// Set the serial baud rate (applied after a restart)
        #[arg(long)]
        baud_rate: Option<BaudRate>,
    },

    /// Generate configuration file
    Config {
        /// Output path for configuration file
        #[arg(short, long, default_value = "radarmon.toml")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr to keep stdout for state lines
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Monitor {
            addr,
            replay,
            json,
            restart,
            factory_reset,
            tracking_mode,
            bluetooth,
            baud_rate,
        } => {
            let mut config = AppConfig::load_or_default(&cli.config)?;
            config.monitor.json_output |= json;

            let source = match (replay, addr) {
                (Some(path), _) => Source::Replay(path),
                (None, Some(addr)) => Source::Tcp(addr),
                (None, None) => Source::Tcp(config.transport.address.clone()),
            };

            let actions = DeviceActions {
                restart,
                factory_reset,
                multi_tracking: tracking_mode.map(|mode| matches!(mode, TrackingMode::Multi)),
                bluetooth,
                baud_rate,
            };

            run_monitor(source, config, actions)
        }

        Commands::Config { output } => generate_config_file(output),
    }
}

fn run_monitor(source: Source, config: AppConfig, actions: DeviceActions) -> Result<()> {
    info!("🚀 Starting radar monitor ({:?})", source);

    let mut monitor = RadarMonitor::new(source, config, actions);

    // Set up Ctrl+C handler
    let running = monitor.get_running_flag();
    ctrlc::set_handler(move || {
        eprintln!("\n🛑 Received Ctrl+C, shutting down gracefully...");
        running.store(false, std::sync::atomic::Ordering::SeqCst);
    })?;

    monitor.start()?;

    info!("✅ Monitor stopped");
    Ok(())
}

/// Generate a default configuration file
fn generate_config_file(output_path: PathBuf) -> Result<()> {
    let config = AppConfig::new();
    config.save_to_file(&output_path)?;

    println!("✅ Generated configuration file: {}", output_path.display());
    println!("📝 Edit the file to customize settings, then run:");
    println!("   radarmon --config {} monitor", output_path.display());

    Ok(())
}
