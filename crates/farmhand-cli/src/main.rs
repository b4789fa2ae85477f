//! farmhand CLI - printer fleet utilities
//!
//! Scans the local network for Bambu Lab printers and follows live
//! smart plug telemetry from an MQTT broker.

use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::debug;

use farmhand_discovery::{discover, DEFAULT_DISCOVERY_WINDOW};
use farmhand_telemetry::{BridgeSettings, PlugSubscription, SmartPlugBridge};

#[derive(Parser)]
#[command(name = "farmhand")]
#[command(about = "Fleet utilities for networked 3D printers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan the local network for printers
    Discover {
        /// How long to listen, in seconds
        #[arg(long, default_value_t = DEFAULT_DISCOVERY_WINDOW.as_secs())]
        window: u64,
        /// Print the results as JSON
        #[arg(long)]
        json: bool,
    },
    /// Follow live readings from one smart plug topic
    WatchPlug {
        /// Broker hostname or IP address
        #[arg(long)]
        broker: String,
        /// Broker port
        #[arg(long, default_value_t = 1883)]
        port: u16,
        /// Broker username (empty for anonymous access)
        #[arg(long, default_value = "")]
        username: String,
        /// Broker password
        #[arg(long, default_value = "")]
        password: String,
        /// Connect over TLS
        #[arg(long)]
        tls: bool,
        /// Topic the plug publishes telemetry on
        #[arg(long)]
        topic: String,
        /// Dot path to the power reading (e.g. "ENERGY.Power")
        #[arg(long)]
        power_path: Option<String>,
        /// Dot path to the energy reading
        #[arg(long)]
        energy_path: Option<String>,
        /// Dot path to the relay state
        #[arg(long)]
        state_path: Option<String>,
        /// Scale factor applied to numeric readings
        #[arg(long, default_value_t = 1.0)]
        multiplier: f64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Discover { window, json } => {
            run_discover(Duration::from_secs(window), json).await?;
        }
        Commands::WatchPlug {
            broker,
            port,
            username,
            password,
            tls,
            topic,
            power_path,
            energy_path,
            state_path,
            multiplier,
        } => {
            let settings = BridgeSettings {
                enabled: true,
                broker,
                port,
                username,
                password,
                use_tls: tls,
            };
            let mut sub = PlugSubscription::new(topic).with_multiplier(multiplier);
            sub.power_path = power_path;
            sub.energy_path = energy_path;
            sub.state_path = state_path;
            run_watch_plug(settings, sub).await?;
        }
    }

    Ok(())
}

async fn run_discover(window: Duration, json: bool) -> Result<()> {
    eprintln!("Scanning for printers ({}s)...", window.as_secs());
    let printers = discover(window).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&printers)?);
        return Ok(());
    }

    if printers.is_empty() {
        println!("No printers found.");
        return Ok(());
    }
    for printer in &printers {
        println!(
            "{}  {}  {}  {}",
            printer.serial,
            printer.ip_address,
            printer.model.as_deref().unwrap_or("-"),
            printer.name
        );
    }
    Ok(())
}

async fn run_watch_plug(settings: BridgeSettings, sub: PlugSubscription) -> Result<()> {
    let broker = settings.broker.clone();
    let topic = sub.topic.clone();

    let bridge = SmartPlugBridge::new();
    if !bridge.configure(settings).await {
        anyhow::bail!("could not connect to broker {}", broker);
    }
    bridge.subscribe(1, sub).await;
    eprintln!("Watching {} (Ctrl-C to stop)...", topic);

    let mut ticker = tokio::time::interval(Duration::from_secs(2));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                let Some(snapshot) = bridge.snapshot(1) else {
                    debug!("no snapshot yet");
                    continue;
                };
                let power = snapshot
                    .power
                    .map(|w| format!("{w:.1} W"))
                    .unwrap_or_else(|| "-".into());
                let energy = snapshot
                    .energy
                    .map(|kwh| format!("{kwh:.3} kWh"))
                    .unwrap_or_else(|| "-".into());
                let state = snapshot
                    .state
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "-".into());
                let reachable = if bridge.is_reachable(1) { "ok" } else { "stale" };
                println!("power={power}  energy={energy}  state={state}  link={reachable}");
            }
        }
    }

    bridge.disconnect().await;
    Ok(())
}
