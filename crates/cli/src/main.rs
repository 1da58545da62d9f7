//! usbwatch CLI
//!
//! Watches USB device insertions and removals from the command line,
//! and can open a bulk transfer channel to a single device for a quick
//! probe.

mod config;
mod logging;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use config::WatchConfig;
use tokio::signal;
use tracing::{error, info, warn};
use usbwatch::{
    ChannelEvent, ChannelOptions, DeviceIdentity, Direction, HostDriver, LibusbDriver,
    MonitorConfig, PresenceEvent, TransferChannel, spawn_monitor,
};

#[derive(Parser, Debug)]
#[command(name = "usbwatch")]
#[command(
    author,
    version,
    about = "Watch USB device insertions and removals"
)]
#[command(long_about = "
Tracks which USB devices are attached to the host and reports
insertions and removals, using hotplug events where the platform
supports them and falling back to periodic enumeration otherwise.

EXAMPLES:
    # Watch all insertions and removals
    usbwatch

    # Watch for a specific device
    usbwatch --watch 0x0483:0x3748

    # List attached devices and exit
    usbwatch --list-devices

    # Open a bulk channel to a device and send two bytes
    usbwatch --probe 0x0483:0x3748 --send f180

CONFIGURATION:
    The watcher looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usbwatch/config.toml
    3. /etc/usbwatch/config.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List attached USB devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Watch this identity (VID:PID), in addition to the config file
    /// watch list; may be repeated
    #[arg(short, long, value_name = "VID:PID")]
    watch: Vec<String>,

    /// Open a bulk transfer channel to this device (VID:PID), report
    /// what it sends back, and exit
    #[arg(long, value_name = "VID:PID")]
    probe: Option<String>,

    /// Hex payload to write on the probe channel (e.g. "f180")
    #[arg(long, value_name = "HEX", requires = "probe")]
    send: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle --save-config flag early (before loading config)
    if args.save_config {
        let config = WatchConfig::default();
        let path = WatchConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    // Load configuration first (to get log level from config if not specified)
    let config = if let Some(ref path) = args.config {
        WatchConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        WatchConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.monitor.log_level);

    logging::init(log_level)?;

    info!("usbwatch v{}", env!("CARGO_PKG_VERSION"));

    if let Some(ref target) = args.probe {
        let identity: DeviceIdentity = target.parse().map_err(|e: String| anyhow!(e))?;
        return probe_mode(&config, identity, args.send.as_deref()).await;
    }

    // Merge CLI watches into the configured watch list
    let mut watch = config.watch_identities()?;
    for entry in &args.watch {
        let identity: DeviceIdentity = entry.parse().map_err(|e: String| anyhow!(e))?;
        if !watch.contains(&identity) {
            watch.push(identity);
        }
    }

    let driver = LibusbDriver::new().context("Failed to initialize USB subsystem")?;
    let (handle, worker) = spawn_monitor(
        driver,
        MonitorConfig {
            poll_interval: config.poll_interval(),
            watch,
        },
    )
    .context("Failed to start USB monitor")?;

    let result = if args.list_devices {
        list_devices_mode(&handle).await
    } else {
        watch_mode(&handle).await
    };

    info!("Shutting down USB monitor...");
    if let Err(e) = handle.shutdown().await {
        error!("Error shutting down USB monitor: {:#}", e);
    }
    if let Err(e) = worker.join() {
        error!("USB monitor thread panicked: {:?}", e);
    }

    result
}

/// List attached devices and exit
async fn list_devices_mode(handle: &usbwatch::MonitorHandle) -> Result<()> {
    let devices = handle
        .list_devices()
        .await
        .context("Failed to query device list")?;

    if devices.is_empty() {
        println!("No USB devices found.");
    } else {
        println!("Found {} USB device(s):", devices.len());
        for device in devices {
            println!("  {}", device);
        }
    }

    Ok(())
}

/// Report insertions and removals until Ctrl+C
async fn watch_mode(handle: &usbwatch::MonitorHandle) -> Result<()> {
    let devices = handle
        .list_devices()
        .await
        .context("Failed to query device list")?;
    println!("{} device(s) attached. Watching, press Ctrl+C to stop.", devices.len());

    let absent = handle.absent_watched().await?;
    for identity in &absent {
        println!("waiting for {}", identity);
    }

    loop {
        tokio::select! {
            event = handle.recv_event() => {
                match event {
                    Ok(PresenceEvent::Inserted(devices)) => {
                        for identity in devices {
                            println!("+ {}", identity);
                        }
                    }
                    Ok(PresenceEvent::Removed(devices)) => {
                        for identity in devices {
                            println!("- {}", identity);
                        }
                    }
                    Err(e) => {
                        error!("Monitor stopped unexpectedly: {:#}", e);
                        return Err(e.into());
                    }
                }
            }
            result = signal::ctrl_c() => {
                result.context("Error waiting for Ctrl+C")?;
                info!("Received Ctrl+C, shutting down gracefully...");
                return Ok(());
            }
        }
    }
}

/// Open a bulk channel to one device, optionally write a payload, and
/// print whatever arrives for a short window.
async fn probe_mode(
    config: &WatchConfig,
    identity: DeviceIdentity,
    payload: Option<&str>,
) -> Result<()> {
    let payload = payload.map(config::parse_hex_payload).transpose()?;

    let driver = LibusbDriver::new().context("Failed to initialize USB subsystem")?;
    let endpoints = driver
        .open_endpoints(
            identity,
            &config.probe_device_config(),
            config.probe_endpoints()?,
            Direction::ReadWrite,
        )
        .with_context(|| format!("Failed to open {}", identity))?;

    let (mut channel, events) = TransferChannel::new();
    channel
        .open(endpoints, ChannelOptions::default())
        .context("Failed to open transfer channel")?;
    println!("Opened bulk channel to {}", identity);

    if let Some(bytes) = payload {
        let accepted = channel
            .write(&bytes)
            .with_context(|| format!("Failed to write {} bytes", bytes.len()))?;
        println!("Wrote {} byte(s)", accepted);
    }

    // Collect responses until the device goes quiet
    let mut total = 0usize;
    while let Ok(event) = tokio::time::timeout(std::time::Duration::from_secs(1), events.recv()).await {
        match event {
            Ok(ChannelEvent::ReadyToRead) => {
                let data = channel.read().context("Failed to drain channel buffer")?;
                total += data.len();
                let hex: Vec<String> = data.iter().map(|b| format!("{:02x}", b)).collect();
                println!("Read {} byte(s): {}", data.len(), hex.join(" "));
            }
            Ok(ChannelEvent::WriteComplete(_)) => {}
            Err(e) => {
                warn!("Channel event stream closed: {}", e);
                break;
            }
        }
    }

    if total == 0 {
        println!("No data received.");
    }

    channel.close();
    Ok(())
}
