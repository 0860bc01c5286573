use mcsnoopd::config::{Config, ConfigManager, DEFAULT_CONFIG_PATH};
use mcsnoopd::engine::Engine;
use mcsnoopd::hw::MemoryHardware;
use mcsnoopd::interface::{self, InterfaceStateManager};
use mcsnoopd::socket::{self, PortSocket, RawPacketSocket, SocketTransmit};

use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

fn main() {
    env_logger::init();
    let args = Cli::parse();
    let config_manager = ConfigManager::new(&args.config);
    let rt = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            log::error!("Failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };
    rt.block_on(async move {
        if let Command::Check = args.subcmd {
            match config_manager.load().await {
                Ok(()) => println!("{}: ok", args.config.display()),
                Err(e) => {
                    println!("{}: {}", args.config.display(), e);
                    std::process::exit(1);
                }
            }
            return;
        }

        if let Err(e) = config_manager.load().await {
            log::warn!("Failed to load configuration: {:?}", e);
        }

        let config = config_manager.clone();
        tokio::spawn(async move {
            while !config_manager.is_loaded() {
                tokio::time::sleep(Duration::from_secs(1)).await;
                let _ = config_manager.load().await;
            }

            log::info!("Configuration loaded");
        });

        match args.subcmd {
            Command::Start => {
                enable_config_reloader(config.clone());
                if let Err(e) = start(config).await {
                    log::error!("{}", e);
                    std::process::exit(1);
                }
            }

            #[allow(unreachable_patterns)]
            _ => {
                log::error!("Invalid subcommand");
            }
        }
    });
}

fn enable_config_reloader(config: ConfigManager) {
    tokio::spawn(async move {
        let mut signal = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
            Ok(signal) => signal,
            Err(e) => {
                log::warn!("Cannot listen for SIGHUP: {}", e);
                return;
            }
        };
        loop {
            signal.recv().await;
            log::info!("Received SIGHUP, reloading configuration");
            if let Err(e) = config.load().await {
                log::warn!("Failed to reload configuration: {:?}", e);
            }
        }
    });
}

async fn wait_for_config(config: &ConfigManager) -> Result<Config, std::io::Error> {
    let mut changes = config.subscribe();
    loop {
        if let Some(config_data) = config.get() {
            return Ok(config_data);
        }
        log::warn!("Configuration not loaded, waiting til configured");
        if let Err(RecvError::Closed) = changes.recv().await {
            return Err(std::io::Error::other("configuration manager went away"));
        }
    }
}

/// Pushes link state and interface addresses into the engine.
fn sync_interfaces(engine: &Mutex<Engine>, if_manager: &InterfaceStateManager, config: &Config) {
    let mut engine = engine.lock();
    for port in &config.ports {
        let up = if_manager.get_by_name(&port.name).map(|interface| interface.oper_up).unwrap_or(false);
        engine.link_set(port.index, up);
    }

    let Some(host_if) = config.system.interface.as_deref() else {
        return;
    };
    if config.system.mac.is_none() {
        if let Some(mac) = if_manager.get_by_name(host_if).and_then(|interface| interface.mac) {
            engine.set_system_mac(mac);
        }
    }
    engine.set_interface_address(None, if_manager.get_ipv4_addr_by_name(host_if));
    for entry in &config.vlans {
        let vlan_if = format!("{}.{}", host_if, entry.vid);
        engine.set_interface_address(Some(entry.vid), if_manager.get_ipv4_addr_by_name(&vlan_if));
    }
}

fn open_port(name: &str) -> Result<RawPacketSocket, std::io::Error> {
    let if_index = interface::name_to_index(name)?;
    let socket = RawPacketSocket::new(if_index)?;
    socket.set_all_multicast()?;
    Ok(socket)
}

async fn start(config: ConfigManager) -> Result<(), std::io::Error> {
    let config_data = wait_for_config(&config).await?;
    log::debug!("Configuration: {:?}", config_data);

    let if_manager = InterfaceStateManager::new().await?;

    let port_count = config_data.port_count();
    let transmit = Arc::new(Mutex::new(SocketTransmit::new(port_count)));
    let hardware = MemoryHardware::new().shared();
    let engine = Arc::new(Mutex::new(Engine::new(&config_data, Box::new(hardware), Box::new(transmit.clone()))));
    log::info!("{} ports, {} VLANs", port_count, config_data.vlans.len());

    for port in &config_data.ports {
        let port_socket = match open_port(&port.name).and_then(RawPacketSocket::into_async) {
            Ok(port_socket) => port_socket,
            Err(e) => {
                log::error!("port {} ({}): cannot open socket: {}", port.index, port.name, e);
                continue;
            }
        };
        transmit.lock().set_port(port.index, Some(PortSocket {
            socket: port_socket.clone(),
            pvid: port.pvid,
        }));

        let engine = engine.clone();
        let index = port.index;
        let pvid = port.pvid;
        let name = port.name.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65536];
            loop {
                let info = match port_socket.recv(&mut buf).await {
                    Ok(info) => info,
                    Err(e) => {
                        log::error!("port {} ({}): receive failed: {}", index, name, e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };
                if info.outgoing {
                    continue;
                }

                let frame = &buf[..info.len];
                let (vid, frame) = match (info.vid, socket::strip_tag(frame)) {
                    (Some(vid), _) => (vid, frame.to_vec()),
                    (None, Some((vid, untagged))) => (vid, untagged),
                    (None, None) => (pvid, frame.to_vec()),
                };
                if !socket::is_membership_frame(&frame) {
                    continue;
                }
                engine.lock().rx_frame(index, vid, &frame);
            }
        });
    }

    sync_interfaces(&engine, &if_manager, &config_data);

    let mut config_changes = config.subscribe();
    let mut if_changes = if_manager.subscribe();
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut config_data = config_data;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                engine.lock().tick();
            }

            changed = config_changes.recv() => {
                if let Err(RecvError::Closed) = changed {
                    break;
                }
                let Some(new_config) = config.get() else {
                    continue;
                };
                log::info!("Applying configuration");
                engine.lock().apply_config(&new_config);
                config_data = new_config;
                sync_interfaces(&engine, &if_manager, &config_data);
            }

            changed = if_changes.recv() => {
                if let Err(RecvError::Closed) = changed {
                    break;
                }
                sync_interfaces(&engine, &if_manager, &config_data);
            }

            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupted, shutting down");
                break;
            }
        }
    }

    Ok(())
}

/// IGMP/MLD snooping daemon
#[derive(Debug, Clone, Parser)]
#[clap(name = "mcsnoopd", version, about)]
pub struct Cli {
    /// Path to the configuration file
    #[clap(short, long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    #[clap(subcommand)]
    pub subcmd: Command,
}

#[derive(Debug, Clone, Subcommand)]
#[non_exhaustive]
pub enum Command {
    /// start the daemon
    Start,

    /// validate the configuration file and exit
    Check,
}
