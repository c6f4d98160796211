use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use battmon::{
    BatteryClient, BluestRadio, ConnectionState, MonitorConfig, MonitorEvent, Preconditions,
    ProtocolVariant,
};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Stream telemetry from a BLE 12V battery monitor")]
struct Args {
    /// JSON config file
    #[arg(short, long, default_value = "battmon.json")]
    config: PathBuf,

    /// Address of the monitor (default: first monitor found)
    #[arg(short, long)]
    address: Option<String>,

    /// Scan duration in seconds
    #[arg(short, long)]
    scan_timeout: Option<u64>,

    /// Firmware variant to start with (legacy or modern)
    #[arg(long)]
    variant: Option<ProtocolVariant>,

    /// Stick to the configured variant
    #[arg(long)]
    no_auto_detect: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "battmon=debug" } else { "battmon=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let mut config = MonitorConfig::load_or_default(&args.config)?;
    if let Some(variant) = args.variant {
        config.variant = variant;
    }
    if args.no_auto_detect {
        config.auto_detect_variant = false;
    }
    if let Some(secs) = args.scan_timeout {
        config.scan_timeout = Duration::from_secs(secs);
    }

    let radio = BluestRadio::new().await.context("No Bluetooth adapter")?;
    info!("Waiting for the Bluetooth adapter");
    radio.wait_available().await?;

    let (client, mut events) = BatteryClient::new(Arc::new(radio), config);

    match client.check_preconditions().await {
        Preconditions::Ready {
            location_service_disabled: true,
        } => warn!("Location service is off; scans may find nothing"),
        Preconditions::Ready { .. } => {}
        Preconditions::Denied(reason) => bail!("Cannot use Bluetooth: {reason:?}"),
    }

    let wanted = args.address.as_deref().map(battmon::discovery::normalize_address);
    client.start_scan(client.config().scan_timeout).await?;
    let mut connecting = false;
    let mut state = client.watch_state();

    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            Ok(()) = state.changed() => {
                if *state.borrow_and_update() == ConnectionState::Failed {
                    client.dispose().await;
                    bail!("Session failed");
                }
                continue;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        };
        let Some(event) = event else { break };

        match event {
            MonitorEvent::DeviceFound(peer) => {
                let chosen = match &wanted {
                    Some(address) => &peer.address == address,
                    None => peer.is_candidate(),
                };
                if chosen && !connecting {
                    connecting = true;
                    info!("Connecting to {} ({})", peer.address, peer.display_name);
                    client.connect(&peer.address).await?;
                }
            }
            MonitorEvent::ScanStopped(summary) => {
                info!(
                    "Scan stopped: {} devices, {} matches",
                    summary.devices_found, summary.matches
                );
                if !connecting {
                    bail!("No battery monitor found");
                }
            }
            MonitorEvent::Connected => info!("Connected"),
            MonitorEvent::Data(frame) => println!("{frame}"),
            MonitorEvent::Disconnected => {
                info!("Disconnected");
                break;
            }
            MonitorEvent::Error(err) => error!("{err}"),
        }
    }

    client.dispose().await;
    Ok(())
}
