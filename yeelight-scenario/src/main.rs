use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::{info, warn};
use tokio::sync::watch;

use yeelight_scenario_lib::config::{scenarios_from_yaml_str, NetworkConfig};
use yeelight_scenario_lib::control_interface::{ControlSession, PowerState};
use yeelight_scenario_lib::orchestrator::Orchestrator;
use yeelight_scenario_lib::scenario::{ScenarioEngine, ScenarioTable};
use yeelight_scenario_lib::util::discovery::{
    probe_once, Debounced, DiscoveryListener, DISCOVERY_MULTICAST_ADDRESS,
};
use yeelight_scenario_lib::util::message::DeviceRecord;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    handle_cli(cli).await
}

/// This struct defines the command line interface of the application
#[derive(Parser)]
#[clap(
    name = "yeelight_scenario",
    about = "Keeps LAN smart bulbs in line with a time-of-day lighting scenario",
    version
)]
pub struct Cli {
    /// Path to the scenario list
    #[clap(long, default_value = "./config/scenarios.yaml")]
    pub scenarios: PathBuf,

    /// Path to the network configuration
    #[clap(long, default_value = "./config/main.yaml")]
    pub config: PathBuf,

    #[clap(subcommand)]
    pub command: Commands,
}

/// Supported output formats for the `discover` command.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum OutputFormat {
    /// Plain text format.
    Plaintext,
    /// JSON format.
    Json,
    /// YAML format.
    Yaml,
}

/// Subcommands available for the CLI
#[derive(Subcommand)]
pub enum Commands {
    /// Alternates listening and probing forever, applying scenarios
    #[clap(name = "run")]
    Run,
    /// Only listens for announcements and applies scenarios to announcing bulbs
    #[clap(name = "listen")]
    Listen,
    /// Sends one search request and prints the reply
    #[clap(name = "discover")]
    Discover {
        /// Output format (plaintext, json, yaml)
        #[clap(short, long, value_enum, default_value_t = OutputFormat::Plaintext)]
        output: OutputFormat,

        /// Where to send the search request
        #[clap(short, long, default_value = DISCOVERY_MULTICAST_ADDRESS)]
        target: String,
    },
    /// Sends a single command to one bulb
    #[clap(name = "device-call")]
    DeviceCall {
        /// Host of the bulb, with an optional port
        #[clap(long)]
        host: String,

        #[clap(subcommand)]
        action: DeviceAction,
    },
}

/// Actions available under the `device-call` subcommand
#[derive(Subcommand)]
pub enum DeviceAction {
    /// Sets the color temperature in Kelvin (1700-6500).
    #[clap(name = "set-ct")]
    SetCt { kelvin: u32 },
    /// Sets the brightness in percent (1-100).
    #[clap(name = "set-bright")]
    SetBright { percent: u8 },
    /// Turns the bulb on or off.
    #[clap(name = "power")]
    Power {
        #[clap(value_enum)]
        state: PowerState,
    },
    /// Sets an RGB color.
    #[clap(name = "rgb")]
    Rgb { red: u8, green: u8, blue: u8 },
    /// Sets hue (0-359) and saturation (0-100).
    #[clap(name = "hsv")]
    Hsv { hue: u16, saturation: u8 },
    /// Toggles the power state.
    #[clap(name = "toggle")]
    Toggle,
}

fn load_network_config(path: &Path) -> Result<NetworkConfig> {
    let yaml = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    NetworkConfig::from_yaml_str(&yaml)
        .with_context(|| format!("Failed to load {}", path.display()))
}

fn load_scenarios(path: &Path) -> Result<ScenarioTable> {
    let yaml = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    scenarios_from_yaml_str(&yaml).with_context(|| format!("Failed to load {}", path.display()))
}

/// The probe socket address for `discover`, which also works without a
/// network configuration file.
fn probe_local_address(path: &Path) -> String {
    if !path.exists() {
        return NetworkConfig::default().probe_local_address();
    }
    match load_network_config(path) {
        Ok(config) => config.probe_local_address(),
        Err(e) => {
            warn!("Using default network settings: {:#}", e);
            NetworkConfig::default().probe_local_address()
        }
    }
}

fn print_record(record: &DeviceRecord, output: OutputFormat) -> Result<()> {
    match output {
        OutputFormat::Plaintext => println!("{}", record),
        OutputFormat::Json => println!("{}", serde_json::to_string(record)?),
        OutputFormat::Yaml => println!("{}", serde_yaml::to_string(record)?),
    }
    Ok(())
}

async fn handle_cli(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Run => {
            let config = load_network_config(&cli.config)?;
            let scenarios = Arc::new(load_scenarios(&cli.scenarios)?);
            info!(
                "Loaded {} scenario(s), refreshing every {} minute(s)",
                scenarios.scenarios().len(),
                config.refresh_minutes
            );
            let engine = Arc::new(ScenarioEngine::with_tcp(scenarios));
            Orchestrator::new(engine, config).run().await;
        }
        Commands::Listen => {
            let config = load_network_config(&cli.config)?;
            let scenarios = Arc::new(load_scenarios(&cli.scenarios)?);
            let listener = DiscoveryListener::bind(&config.listen_address).await?;
            let sink = Debounced::new(
                ScenarioEngine::with_tcp(scenarios),
                config.bounce_window(),
            );

            let (cancel_tx, cancel_rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Stopping listener");
                    let _ = cancel_tx.send(true);
                }
            });
            listener.run(&sink, cancel_rx).await?;
        }
        Commands::Discover { output, target } => {
            let local = probe_local_address(&cli.config);
            let record = probe_once(&local, &target).await?;
            print_record(&record, output)?;
        }
        Commands::DeviceCall { host, action } => {
            let mut session = ControlSession::open(&host).await?;

            match action {
                DeviceAction::SetCt { kelvin } => {
                    session.set_color_temperature(kelvin).await?;
                    println!("Color temperature set to {}K", kelvin);
                }
                DeviceAction::SetBright { percent } => {
                    session.set_brightness(percent).await?;
                    println!("Brightness set to {}%", percent);
                }
                DeviceAction::Power { state } => {
                    session.set_power(state).await?;
                    println!("Power set to {}", state);
                }
                DeviceAction::Rgb { red, green, blue } => {
                    session.set_rgb(red, green, blue).await?;
                    println!("Color set to ({}, {}, {})", red, green, blue);
                }
                DeviceAction::Hsv { hue, saturation } => {
                    session.set_hsv(hue, saturation).await?;
                    println!("Hue set to {}, saturation to {}", hue, saturation);
                }
                DeviceAction::Toggle => {
                    session.toggle().await?;
                    println!("Power toggled");
                }
            }

            session.close().await?;
        }
    }

    Ok(())
}
