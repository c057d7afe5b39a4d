//! z21ctl - Command line control for Z21 command stations
//!
//! Drives locomotives, switches turnouts and watches station broadcasts.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use z21link::config::{self, Config};
use z21link::protocol::{
    FunctionAction, LocoInfo, RailComData, SystemState, ThrottleSteps, TrackPower, TurnoutInfo,
    TurnoutPosition,
};
use z21link::{Loco, Station, SwitchMode, Turnout};

/// z21ctl - Z21 command station control
#[derive(Parser)]
#[command(name = "z21ctl")]
#[command(author = "z21link Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Control a Z21 model railway command station", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Station address, overrides the configuration
    #[arg(long, global = true)]
    host: Option<String>,

    /// Station UDP port, overrides the configuration
    #[arg(long, global = true)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show station serial number and versions
    Info,

    /// Switch the track voltage
    Power {
        #[arg(value_enum)]
        state: PowerState,
    },

    /// Drive a locomotive at a signed percentage of full speed
    Drive {
        /// Locomotive address (1-9999)
        address: u16,

        /// Speed in percent, negative to reverse
        #[arg(allow_hyphen_values = true)]
        speed: f32,

        /// Throttle steps: 14, 28 or 128
        #[arg(short, long, value_parser = parse_steps)]
        steps: Option<ThrottleSteps>,
    },

    /// Stop a locomotive
    Stop {
        /// Locomotive address (1-9999)
        address: u16,

        /// Stop immediately instead of braking
        #[arg(short, long)]
        emergency: bool,
    },

    /// Switch a locomotive function
    Function {
        /// Locomotive address (1-9999)
        address: u16,

        /// Function index (0-31)
        index: u8,

        #[arg(value_enum)]
        action: FunctionArg,
    },

    /// Switch a turnout
    Turnout {
        /// Turnout address (0-2047)
        address: u16,

        #[arg(value_enum)]
        position: PositionArg,

        /// Pulse the output for this many ms instead of queueing
        #[arg(long)]
        pulse_ms: Option<u64>,
    },

    /// Request RailCom data of a decoder
    Railcom {
        /// Locomotive address (1-9999)
        address: u16,
    },

    /// Print station broadcasts
    Monitor {
        /// Stop after this many seconds (default: until Ctrl+C)
        #[arg(short, long)]
        seconds: Option<u64>,

        /// Print one JSON object per line
        #[arg(long)]
        json: bool,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum PowerState {
    On,
    Off,
}

#[derive(Clone, Copy, ValueEnum)]
enum FunctionArg {
    On,
    Off,
    Toggle,
}

impl From<FunctionArg> for FunctionAction {
    fn from(arg: FunctionArg) -> Self {
        match arg {
            FunctionArg::On => FunctionAction::On,
            FunctionArg::Off => FunctionAction::Off,
            FunctionArg::Toggle => FunctionAction::Toggle,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum PositionArg {
    P0,
    P1,
}

impl From<PositionArg> for TurnoutPosition {
    fn from(arg: PositionArg) -> Self {
        match arg {
            PositionArg::P0 => TurnoutPosition::P0,
            PositionArg::P1 => TurnoutPosition::P1,
        }
    }
}

fn parse_steps(s: &str) -> Result<ThrottleSteps, String> {
    let count: u16 = s.parse().map_err(|e| format!("{}", e))?;
    ThrottleSteps::try_from(count)
}

/// A broadcast as printed by `monitor`
#[derive(Debug, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
enum MonitorEvent {
    SystemState(SystemState),
    LocoInfo(LocoInfo),
    Railcom(RailComData),
    TrackPower(TrackPower),
    Turnout(TurnoutInfo),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };
    if let Some(host) = &cli.host {
        config.station.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.station.port = port;
    }

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&config.general.log_level))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    if let Commands::Config { generate, output } = &cli.command {
        if *generate {
            let sample = config::generate_sample_config()?;
            if let Some(path) = output {
                std::fs::write(path, &sample)?;
                println!("Configuration written to: {}", path.display());
            } else {
                println!("{}", sample);
            }
        } else {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        return Ok(());
    }

    let station = Station::connect_with(&config.station_config()).await?;
    let result = run_command(&station, cli.command).await;
    station.close().await;
    result
}

async fn run_command(station: &Station, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Info => print_station_info(station).await?,
        Commands::Power { state } => match state {
            PowerState::On => {
                station.voltage_on().await?;
                println!("Track power on");
            }
            PowerState::Off => {
                station.voltage_off().await?;
                println!("Track power off");
            }
        },
        Commands::Drive {
            address,
            speed,
            steps,
        } => {
            let steps = steps.unwrap_or(station.config().default_steps);
            let loco = Loco::control(station, address, steps).await?;
            loco.drive(speed).await?;
            let state = loco.get_state();
            println!(
                "Loco {}: {:.1}% {:?} ({})",
                address, state.speed_percentage, state.direction, state.steps
            );
        }
        Commands::Stop { address, emergency } => {
            let loco = Loco::control_default(station, address).await?;
            if emergency {
                loco.halt().await?;
                println!("Loco {}: emergency stop", address);
            } else {
                loco.stop().await?;
                println!("Loco {}: stop", address);
            }
        }
        Commands::Function {
            address,
            index,
            action,
        } => {
            // Taking control reads the station's view, so a toggle flips it
            let loco = Loco::control_default(station, address).await?;
            loco.set_function(index, action.into()).await?;
            let on = loco.get_state().functions.get(index);
            println!(
                "Loco {}: F{} {}",
                address,
                index,
                if on { "on" } else { "off" }
            );
        }
        Commands::Turnout {
            address,
            position,
            pulse_ms,
        } => {
            let turnout = Turnout::new(station, address)?;
            let mode = match pulse_ms {
                Some(ms) => SwitchMode::Immediate(Duration::from_millis(ms)),
                None => SwitchMode::Queued,
            };
            turnout.switch(position.into(), mode).await?;
            println!("Turnout {}: {:?}", address, TurnoutPosition::from(position));
        }
        Commands::Railcom { address } => {
            let data = station.get_railcom_data(address).await?;
            println!("RailCom for loco {}", data.address);
            println!("  Received:   {}", data.receive_counter);
            println!("  Errors:     {} ({:.1}%)", data.error_counter, data.error_rate());
            if data.has_speed1() || data.has_speed2() {
                println!("  Speed:      {}", data.speed);
            }
            if data.has_qos() {
                println!("  QoS:        {}", data.qos);
            }
        }
        Commands::Monitor { seconds, json } => run_monitor(station, seconds, json).await?,
        Commands::Config { .. } => {}
    }

    Ok(())
}

/// Print station information
async fn print_station_info(station: &Station) -> anyhow::Result<()> {
    let serial = station.get_serial_number().await?;
    let firmware = station.get_firmware_version().await?;
    let xbus = station.get_version().await?;

    println!("Z21 Station Information");
    println!("=======================\n");
    println!("Address:  {}", station.remote_addr());
    println!("Serial:   {}", serial);
    println!("Firmware: {}", firmware);
    println!("Protocol: {}", xbus);

    match station.get_broadcast_flags().await {
        Ok(flags) => println!("Broadcast flags: {:#010x}", flags),
        Err(e) => tracing::debug!("Broadcast flags unavailable: {}", e),
    }

    Ok(())
}

/// Print broadcasts until Ctrl+C or the time limit
async fn run_monitor(station: &Station, seconds: Option<u64>, json: bool) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();

    let events = tx.clone();
    station
        .subscribe_system_state(1.0, move |state| {
            let _ = events.send(MonitorEvent::SystemState(*state));
        })
        .await?;
    let events = tx.clone();
    station.subscribe_loco_info(None, move |info| {
        let _ = events.send(MonitorEvent::LocoInfo(info.clone()));
    })?;
    let events = tx.clone();
    station.subscribe_railcom(None, move |data| {
        let _ = events.send(MonitorEvent::Railcom(*data));
    })?;
    let events = tx.clone();
    station.subscribe_track_power(move |power| {
        let _ = events.send(MonitorEvent::TrackPower(power));
    })?;
    station.subscribe_turnout(None, move |info| {
        let _ = tx.send(MonitorEvent::Turnout(*info));
    })?;
    station.enable_railcom_broadcasts(true).await?;

    if !json {
        println!("Monitoring {} (Ctrl+C to stop)\n", station.remote_addr());
    }

    let deadline = async {
        match seconds {
            Some(s) => tokio::time::sleep(Duration::from_secs(s)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            Some(event) = rx.recv() => {
                if json {
                    println!("{}", serde_json::to_string(&event)?);
                } else {
                    print_event(&event);
                }
            }
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => {
                println!("\nStopping monitor...");
                break;
            }
        }
    }

    Ok(())
}

fn print_event(event: &MonitorEvent) {
    match event {
        MonitorEvent::SystemState(state) => println!(
            "state      main {} mA, prog {} mA, track {} mV, {} °C{}",
            state.main_current,
            state.prog_current,
            state.vcc_voltage,
            state.temperature,
            if state.is_short_circuit() {
                ", SHORT CIRCUIT"
            } else {
                ""
            }
        ),
        MonitorEvent::LocoInfo(info) => println!(
            "loco {:<5} speed {:>6}  functions {:?}",
            info.address,
            info.speed_percentage()
                .map(|p| format!("{:.1}%", p))
                .unwrap_or_else(|| "-".to_string()),
            info.functions.active()
        ),
        MonitorEvent::Railcom(data) => println!(
            "railcom {:<5} speed {}, qos {}, errors {:.1}%",
            data.address,
            data.speed,
            data.qos,
            data.error_rate()
        ),
        MonitorEvent::TrackPower(power) => println!("power      {:?}", power),
        MonitorEvent::Turnout(info) => {
            println!("turnout {:<5} {:?}", info.address, info.position)
        }
    }
}
