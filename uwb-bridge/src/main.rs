use std::time::Duration;

use tracing::info;
use uwb_bridge::{AnchorConfig, BridgeConfig};

#[derive(clap::Parser)]
#[command(name = "uwb-bridge")]
#[command(about = "HTTP control plane for a BLE-attached UWB anchor")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Advertised anchor name to connect to ("" accepts any anchor)
    #[arg(long, global = true)]
    name: Option<String>,
    /// Log filter, e.g. "debug" or "info,BLE=debug"
    #[arg(long, global = true)]
    log_level: Option<String>,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Keep the anchor link up and serve the HTTP API
    Run {
        /// Address to listen on
        #[arg(short, long)]
        listen: Option<String>,
    },
    /// List nearby BLE advertisers
    Scan {
        /// Scan duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Read the anchor configuration
    Get {
        /// Seconds to wait for the link
        #[arg(short, long, default_value = "30")]
        wait: u64,
    },
    /// Write anchor configuration fields
    Set {
        /// Fields to set, e.g. '{"HB_MS": 1000}'
        #[arg(long)]
        json: String,
        /// Seconds to wait for the link
        #[arg(short, long, default_value = "30")]
        wait: u64,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli: Cli = clap::Parser::parse();

    let home = uwb_bridge::bridge_home()?;
    let mut config = BridgeConfig::load_or_create(&home)?;
    if let Some(name) = cli.name {
        config.name_filter = name;
    }
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    uwb_bridge::init_logging(&config.log_level);
    info!(home = %home.display(), "config loaded");

    match cli.command {
        Commands::Run { listen } => {
            if let Some(listen) = listen {
                config.listen_addr = listen;
            }
            let bridge = uwb_bridge::start(&config).await?;
            tokio::select! {
                r = uwb_bridge::http::run_server(&config.listen_addr, bridge) => r?,
                _ = tokio::signal::ctrl_c() => info!("shutting down"),
            }
        }
        Commands::Scan { duration } => {
            let filter = Some(config.name_filter.as_str());
            let devices =
                uwb_link::btleplug_transport::scan(Duration::from_secs(duration), filter).await?;
            for d in devices {
                let marker = if d.is_anchor { "*" } else { " " };
                println!("{marker} {} {:<24} {:?}", d.address, d.name, d.rssi);
            }
        }
        Commands::Get { wait } => {
            let bridge = uwb_bridge::start(&config).await?;
            bridge.link().wait_ready(Duration::from_secs(wait)).await?;
            let readout = bridge.get_config().await?;
            println!("{}", serde_json::to_string_pretty(&readout)?);
        }
        Commands::Set { json, wait } => {
            let fields: AnchorConfig = serde_json::from_str(&json)?;
            if fields.is_empty() {
                return Err("no fields to set".into());
            }
            let bridge = uwb_bridge::start(&config).await?;
            bridge.link().wait_ready(Duration::from_secs(wait)).await?;
            let outcome = bridge.set_config(&fields).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
    }
    Ok(())
}
