use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use muse_bridge_core::{
    BridgeConfig, DeviceManager, EventFilter, NativeSdk, PacketKind, TracingObserver,
};
use tokio::time::{Instant, sleep};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Muse headband bridge over the native SDK", long_about = None)]
struct Args {
    /// Path to the vendor SDK shared library
    #[arg(long, global = true)]
    library: Option<String>,

    /// Path to a TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scan and list nearby headbands
    Scan {
        /// Seconds to scan for
        #[arg(short, long, default_value_t = 5)]
        duration: u64,
    },
    /// Connect to a headband and log its events
    Connect {
        /// Device name or address
        device: String,

        /// Seconds to wait for the device to show up
        #[arg(long, default_value_t = 10)]
        scan_timeout: u64,

        /// Seconds to stay connected
        #[arg(short, long, default_value_t = 30)]
        duration: u64,

        /// Replace the configured channels (e.g. eeg, alpha_absolute, battery)
        #[arg(long, value_delimiter = ',')]
        channels: Vec<String>,
    },
    /// Print the effective configuration, or write it to a file
    Config {
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn load_config(args: &Args) -> Result<BridgeConfig> {
    let mut config = match &args.config {
        Some(path) => BridgeConfig::load_from_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => BridgeConfig::default(),
    };
    if let Some(library) = &args.library {
        config.library_path = Some(library.clone());
    }
    Ok(config)
}

fn parse_channels(names: &[String]) -> Result<Vec<PacketKind>> {
    names
        .iter()
        .map(|name| {
            let wanted: String = name.chars().filter(|c| *c != '_' && *c != '-').collect();
            PacketKind::ALL
                .iter()
                .copied()
                .find(|kind| kind.to_string().eq_ignore_ascii_case(wanted.trim()))
                .with_context(|| format!("unknown channel '{}'", name))
        })
        .collect()
}

fn open_manager(config: BridgeConfig) -> Result<DeviceManager<NativeSdk>> {
    let Some(path) = config.library_path.clone() else {
        bail!("no SDK library configured; pass --library or set library_path");
    };
    info!("Loading SDK from {}", path);
    let sdk = Arc::new(NativeSdk::load(&path)?);
    let manager = DeviceManager::builder(sdk).config(config).build()?;
    manager.subscribe(EventFilter::All, Arc::new(TracingObserver));
    Ok(manager)
}

async fn scan(config: BridgeConfig, duration: u64) -> Result<()> {
    let manager = open_manager(config)?;
    manager.start_scanning().await?;
    sleep(Duration::from_secs(duration)).await;
    manager.refresh_devices();
    manager.stop_scanning().await?;

    let devices = manager.devices();
    if devices.is_empty() {
        println!("No headbands found.");
    }
    for device in devices.iter() {
        println!(
            "{:<20} {:<20} {:>6.1} dBm  {}",
            device.name, device.address, device.rssi, device.family
        );
    }
    manager.shutdown().await?;
    Ok(())
}

async fn connect(
    mut config: BridgeConfig,
    target: &str,
    scan_timeout: u64,
    duration: u64,
    channels: &[String],
) -> Result<()> {
    if !channels.is_empty() {
        config.session.channels = parse_channels(channels)?;
    }
    let manager = open_manager(config)?;
    manager.start_scanning().await?;

    let deadline = Instant::now() + Duration::from_secs(scan_timeout);
    let device = loop {
        manager.refresh_devices();
        if let Some(device) = manager.find_device(target) {
            break device;
        }
        if Instant::now() >= deadline {
            manager.shutdown().await?;
            bail!("device '{}' not found within {}s", target, scan_timeout);
        }
        sleep(Duration::from_millis(500)).await;
    };

    info!("Connecting to {}", device);
    let outcome = manager.connect_to_device(&device).await;
    if let Err(e) = outcome {
        if let Some(hint) = e.hint() {
            warn!("Hint: {}", hint);
        }
        manager.shutdown().await?;
        return Err(e.into());
    }

    sleep(Duration::from_secs(duration)).await;
    manager.shutdown().await?;

    let stats = manager.normalization_stats();
    info!(
        timestamps_replaced = stats.timestamps_replaced,
        values_replaced = stats.values_replaced,
        unmapped_packets = stats.unmapped_packets,
        "Session finished"
    );
    Ok(())
}

fn write_config(config: &BridgeConfig, output: Option<&PathBuf>) -> Result<()> {
    match output {
        Some(path) => {
            config.save_to_file(path)?;
            info!("Wrote configuration to {}", path.display());
        }
        None => print!("{}", config.to_toml()?),
    }
    Ok(())
}

async fn run(args: Args) -> Result<()> {
    let config = load_config(&args)?;
    match args.command {
        Command::Scan { duration } => scan(config, duration).await,
        Command::Connect {
            device,
            scan_timeout,
            duration,
            channels,
        } => connect(config, &device, scan_timeout, duration, &channels).await,
        Command::Config { output } => write_config(&config, output.as_ref()),
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(args).await {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}
