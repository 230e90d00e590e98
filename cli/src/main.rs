// bhs: BLE handshake harness
//
// Runs the peripheral and scanner sessions against an in-process loopback
// radio so the full handshake can be exercised without hardware.

mod config;

use anyhow::{Context, Result};
use blehandshake_core::{
    AdapterPowerState, AdvertisingConfig, Delivery, DeviceFilter, DiscoveredDevice,
    LoopbackRadio, PeripheralSession, PeripheralState, ScannerSession, ScannerState,
};
use clap::{Parser, Subcommand};
use colored::*;
use std::sync::Arc;
use std::time::Duration;

/// How long a peripheral may take to reach Advertising
const ACTIVATION_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "bhs")]
#[command(about = "BLE Handshake - advertise, discover and deliver a payload", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a full handshake over the loopback radio
    Handshake {
        /// Local name the peripheral advertises
        #[arg(short, long)]
        name: Option<String>,
        /// Name the scanner looks for (defaults to the advertised name)
        #[arg(short, long)]
        target: Option<String>,
        /// Payload text written to the peripheral
        #[arg(short, long)]
        payload: Option<String>,
        /// Scan window in milliseconds
        #[arg(long)]
        scan_ms: Option<u64>,
        /// Match the target as a name prefix
        #[arg(long)]
        prefix: bool,
    },
    /// Scan a simulated neighbourhood of peripherals
    Scan {
        /// Scan window in milliseconds
        #[arg(long)]
        scan_ms: Option<u64>,
        /// Drop sightings weaker than this RSSI (dBm)
        #[arg(long, allow_negative_numbers = true)]
        min_rssi: Option<i16>,
    },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    match cli.command {
        Commands::Handshake {
            name,
            target,
            payload,
            scan_ms,
            prefix,
        } => cmd_handshake(name, target, payload, scan_ms, prefix).await,
        Commands::Scan { scan_ms, min_rssi } => cmd_scan(scan_ms, min_rssi).await,
        Commands::Config { action } => cmd_config(action),
    }
}

async fn cmd_handshake(
    name: Option<String>,
    target: Option<String>,
    payload: Option<String>,
    scan_ms: Option<u64>,
    prefix: bool,
) -> Result<()> {
    let config = config::Config::load()?;
    tracing::debug!("Loaded config: {:?}", config);
    let settings = config.settings.clone();
    let service_id = config.service_uuid()?;
    let characteristic_id = config.characteristic_uuid()?;

    let name = name.unwrap_or_else(|| config.local_name.clone());
    let target = target.unwrap_or_else(|| name.clone());
    let payload = payload.unwrap_or_else(|| config.payload.clone());

    println!("{}", "BLE Handshake (loopback radio)".bold());
    println!();

    let radio =
        LoopbackRadio::new().with_manufacturer_data_limit(settings.max_manufacturer_data_len);
    let ticket_adapter = radio.adapter();
    let decoy_adapter = radio.adapter();
    let central_adapter = radio.adapter();

    let advert = AdvertisingConfig::new(name.clone(), vec![service_id])
        .context("Invalid advertising config")?;
    let decoy_advert = AdvertisingConfig::new("Other", vec![service_id])
        .context("Invalid advertising config")?;

    let ticket = PeripheralSession::new(
        Arc::new(ticket_adapter.clone()),
        advert.clone(),
        settings.clone(),
    )
    .with_characteristic_id(characteristic_id);
    let decoy = PeripheralSession::new(
        Arc::new(decoy_adapter.clone()),
        decoy_advert.clone(),
        settings.clone(),
    )
    .with_characteristic_id(characteristic_id);

    // Radio is still off: both sessions park until power-on
    ticket.activate(advert).await;
    decoy.activate(decoy_advert).await;

    radio.set_power(AdapterPowerState::PoweredOn);
    println!("  {} Radio powered on", "✓".green());

    wait_until_advertising(&ticket).await?;
    println!(
        "  {} Peripheral {} advertising as {}",
        "✓".green(),
        ticket_adapter.id().dimmed(),
        name.bright_cyan()
    );
    wait_until_advertising(&decoy).await?;
    println!(
        "  {} Decoy {} advertising as {}",
        "✓".green(),
        decoy_adapter.id().dimmed(),
        "Other".bright_cyan()
    );

    let filter = if prefix {
        DeviceFilter::name_prefix(target.clone())
    } else {
        DeviceFilter::by_name(target.clone())
    };
    println!("  {} Scanning for {}", "→".bright_blue(), filter.label());

    let central = ScannerSession::new(Arc::new(central_adapter), settings);
    central
        .start(Some(filter), scan_ms.map(Duration::from_millis))
        .await;
    if central.state() != ScannerState::Scanning {
        anyhow::bail!(
            "Scan did not start: {}",
            describe_error(central.last_error())
        );
    }

    let devices = central.devices();
    println!();
    print_devices(&devices);
    println!();

    let Some(first) = devices.first() else {
        central.stop();
        anyhow::bail!("No peripheral matched {:?}", target);
    };

    let delivery = central
        .deliver(
            &first.device_id,
            service_id,
            characteristic_id,
            payload.as_bytes(),
        )
        .await;
    central.stop();

    match &delivery {
        Delivery::Accepted { echo } => {
            println!(
                "  {} Delivered \"{}\", echo \"{}\" ({})",
                "✓".green(),
                payload,
                String::from_utf8_lossy(echo).bright_yellow(),
                hex::encode(echo).dimmed()
            );
        }
        Delivery::Rejected => {
            println!("  {} Peripheral rejected the payload", "✗".red());
        }
        Delivery::Failed(kind) => {
            println!(
                "  {} Delivery failed ({}): {}",
                "✗".red(),
                kind,
                describe_error(central.last_error())
            );
        }
    }

    match ticket.last_received_payload() {
        Some(received) => println!(
            "  {} Peripheral received {:?}",
            "✓".green(),
            String::from_utf8_lossy(&received)
        ),
        None => println!("  {} Peripheral received nothing", "✗".red()),
    }

    ticket.deactivate().await;
    decoy.deactivate().await;

    if !delivery.is_accepted() {
        anyhow::bail!("Handshake did not complete");
    }
    Ok(())
}

async fn cmd_scan(scan_ms: Option<u64>, min_rssi: Option<i16>) -> Result<()> {
    let config = config::Config::load()?;
    let settings = config.settings.clone();
    let service_id = config.service_uuid()?;

    let radio = LoopbackRadio::new();
    radio.set_power(AdapterPowerState::PoweredOn);

    let mut peripherals = Vec::new();
    for (name, rssi) in [("Ticket", -48), ("Other", -67), ("Beacon-7", -88)] {
        let adapter = radio.adapter();
        adapter.set_rssi(rssi);
        let advert = AdvertisingConfig::new(name, vec![service_id])
            .context("Invalid advertising config")?;
        let session = PeripheralSession::new(Arc::new(adapter), advert.clone(), settings.clone());
        session.activate(advert).await;
        wait_until_advertising(&session).await?;
        peripherals.push(session);
    }

    let window = scan_ms
        .map(Duration::from_millis)
        .or_else(|| settings.default_scan_duration());
    let central = ScannerSession::new(Arc::new(radio.adapter()), settings);
    let filter = min_rssi.map(DeviceFilter::min_rssi);

    println!(
        "{} ({})",
        "Scanning loopback radio".bold(),
        window
            .map(|w| format!("{}ms window", w.as_millis()))
            .unwrap_or_else(|| "unbounded".to_string())
    );
    central.start(filter, window).await;

    if window.is_some() {
        let mut changes = central.subscribe();
        changes
            .wait_for(|snapshot| snapshot.state != ScannerState::Scanning)
            .await
            .context("Scanner session closed")?;
    } else {
        central.stop();
    }

    if central.state() == ScannerState::Failed {
        anyhow::bail!("Scan failed: {}", describe_error(central.last_error()));
    }

    println!();
    print_devices(&central.devices());

    for session in &peripherals {
        session.deactivate().await;
    }
    Ok(())
}

fn cmd_config(action: ConfigAction) -> Result<()> {
    let mut config = config::Config::load()?;

    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => {
            if let Some(value) = config.get(&key) {
                println!("{} = {}", key.bright_cyan(), value);
            } else {
                anyhow::bail!("Unknown config key: {}", key);
            }
        }

        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!();

            for (key, value) in config.list() {
                println!("  {:<28} {}", key.bright_cyan(), value);
            }
        }

        ConfigAction::Path => {
            println!("{}", config::Config::config_file()?.display());
        }
    }

    Ok(())
}

async fn wait_until_advertising(session: &PeripheralSession) -> Result<()> {
    let mut changes = session.subscribe();
    let snapshot = tokio::time::timeout(
        ACTIVATION_TIMEOUT,
        changes.wait_for(|s| {
            matches!(
                s.state,
                PeripheralState::Advertising | PeripheralState::Failed | PeripheralState::Stopped
            )
        }),
    )
    .await
    .context("Timed out waiting for peripheral to advertise")?
    .context("Peripheral session closed")?
    .clone();

    if snapshot.state != PeripheralState::Advertising {
        anyhow::bail!(
            "Peripheral {}: {}",
            snapshot.state,
            describe_error(snapshot.last_error)
        );
    }
    Ok(())
}

fn describe_error(error: Option<blehandshake_core::ErrorInfo>) -> String {
    error
        .map(|e| e.to_string())
        .unwrap_or_else(|| "no error recorded".to_string())
}

fn print_devices(devices: &[DiscoveredDevice]) {
    println!("{}", format!("Discovered devices ({})", devices.len()).bold());
    if devices.is_empty() {
        println!("  {}", "(none)".dimmed());
        return;
    }

    for device in devices {
        println!(
            "  {:<20} {:<12} {:>8}  {}",
            device.device_id.bright_cyan(),
            device.display_name(),
            device
                .rssi
                .map(|rssi| format!("{} dBm", rssi))
                .unwrap_or_else(|| "-".to_string()),
            device
                .service_ids
                .iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join(", ")
                .dimmed()
        );
    }
}
