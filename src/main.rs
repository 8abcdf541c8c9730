use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use ble_serial_relay_lib::commands::{self, CommandError};
use ble_serial_relay_lib::config::AppConfig;
use ble_serial_relay_lib::core::events::Subscription;
use ble_serial_relay_lib::core::bluetooth::{
    BleTransport, BluestTransport, LinkEvent, SimulatedPeripheral, SimulatedTransport,
};
use ble_serial_relay_lib::logging;
use ble_serial_relay_lib::relay::{MemoryStore, RecordStore, RemoteEvent, RemoteViewer};
use ble_serial_relay_lib::state::AppState;
use clap::{Parser, Subcommand};
use log::{LevelFilter, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};

/// Serial console for BLE UART modules, with optional remote session sharing
#[derive(Parser)]
#[command(name = "ble-serial-relay", version)]
struct Cli {
    /// Directory holding ble_serial_relay.json
    #[arg(long, global = true, default_value = ".")]
    config: PathBuf,

    /// Use an in-process simulated device and store instead of real hardware
    #[arg(long, global = true)]
    simulate: bool,

    #[arg(long, global = true, default_value = "info")]
    log_level: LevelFilter,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the device picker once and print the result
    Scan,
    /// Connect and open an interactive console
    Connect {
        /// Device id; when omitted the picker runs first
        #[arg(long)]
        device: Option<String>,
        /// Share the console as a named session
        #[arg(long)]
        share: Option<String>,
        /// Label shown to the remote party
        #[arg(long, default_value = "local user")]
        user: String,
    },
    /// Write the default configuration file
    InitConfig,
}

fn simulated_transport() -> SimulatedTransport {
    SimulatedTransport::new(vec![
        SimulatedPeripheral::new("SIM-HC05", Some("HC-05")),
        SimulatedPeripheral::serial_module("SIM-8601", "86-Sensor").with_at_responder(),
    ])
}

fn report(error: &CommandError) {
    println!("error: {}", error);
    if error.can_reconnect {
        println!("type /reconnect to connect again");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_level).context("Failed to initialize logging")?;

    let config = AppConfig::load_config(&cli.config).await?;
    if let Commands::InitConfig = cli.command {
        config.save_config(&cli.config).await?;
        println!("wrote {}", cli.config.display());
        return Ok(());
    }

    let transport: Arc<dyn BleTransport> = if cli.simulate {
        info!("Using the simulated Bluetooth platform");
        Arc::new(simulated_transport())
    } else {
        Arc::new(BluestTransport::new().await?)
    };
    let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());

    match cli.command {
        Commands::InitConfig => {}
        Commands::Scan => {
            let state = AppState::init(config, transport, store)?;
            match commands::scan_devices(&state).await {
                Ok(devices) if devices.is_empty() => println!("no matching device found"),
                Ok(devices) => {
                    for device in devices {
                        println!("{}\t{}\t{:?}", device.id, device.label(), device.rssi);
                    }
                }
                Err(e) => report(&e),
            }
            state.dispose().await;
        }
        Commands::Connect { device, share, user } => {
            let state = AppState::init(config, transport, store)?;
            let result = console(&state, device, share, &user, cli.simulate).await;
            state.dispose().await;
            result?;
        }
    }
    Ok(())
}

async fn console(
    state: &AppState,
    device: Option<String>,
    share: Option<String>,
    user: &str,
    simulate: bool,
) -> Result<()> {
    let device_id = match device {
        Some(id) => id,
        None => match commands::scan_devices(state).await?.into_iter().next() {
            Some(found) => found.id,
            None => bail!("no matching device found"),
        },
    };

    let _output = state.link.subscribe(|event| match event {
        LinkEvent::Line(line) => println!("< {}", line),
        LinkEvent::StateChanged(link_state) => println!("-- {:?}", link_state),
    });
    commands::connect_to_device(state, &device_id).await?;
    println!("connected ({}), type /quit to leave", state.link.serial_config());

    let mut remote: Option<(RemoteViewer, Subscription)> = None;
    if let Some(name) = share {
        let session = commands::start_sharing(state, &name, user).await?;
        println!("sharing session {}", session.id);
        if simulate {
            let viewer = state.join_remote(session.id.clone()).await?;
            let watch = viewer.subscribe(|event| {
                if let RemoteEvent::SessionEnded(id) = event {
                    println!("-- remote view of {} ended", id);
                }
            });
            remote = Some((viewer, watch));
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim_end();
        match line.split_once(' ').map_or((line, ""), |(head, rest)| (head, rest)) {
            ("/quit", _) => break,
            ("/reconnect", _) => {
                if let Err(e) = commands::reconnect(state).await {
                    report(&e);
                }
            }
            ("/sessions", _) => match commands::list_sessions(state).await {
                Ok(sessions) => {
                    for session in sessions {
                        println!("{}\t{}\t{}", session.id, session.name, session.device_label);
                    }
                }
                Err(e) => report(&e),
            },
            ("/support", command) => match &remote {
                Some((viewer, _)) => {
                    if let Err(e) = viewer.send_command(command).await {
                        warn!("Support command not sent: {}", e);
                    }
                }
                None => println!("/support needs --simulate and --share"),
            },
            _ => {
                if let Err(e) = commands::send_line(state, line).await {
                    report(&e);
                }
            }
        }
    }

    if let Some((viewer, _)) = remote {
        viewer.leave();
    }
    Ok(())
}
