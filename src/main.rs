// Copyright (C) 2026 Brian Johnson
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

// YMODEM-style firmware receiver
mod config;
mod crc;
mod device;
mod integrity;
mod listener;
mod modem;
mod protocol;
mod session;
mod stream;
mod timer;
mod transfer;
mod validator;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use config::{Config, Overrides};
use device::{CommandReboot, FileSnapshotProvider, TracingProgress};
use listener::{Acceptor, BridgeAcceptor, Listener, ListenerSettings, TcpAcceptor};
use session::SessionContext;
use validator::{ArtifactValidator, ShellPackageInspector};

#[derive(Parser)]
#[command(name = "apklink")]
#[command(about = "Receives firmware packages over a YMODEM-style link and stages them for install", long_about = None)]
#[command(disable_help_subcommand = true)]
struct Cli {
    /// Configuration file (default: ~/.config/apklink/config.toml, then /etc/apklink/config.toml)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable debug output
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Listen for transfers on TCP (and the serial bridge when enabled)
    Serve {
        /// TCP port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Directory received files are written to
        #[arg(long, value_name = "DIR")]
        save_dir: Option<PathBuf>,

        /// Acknowledge every data block instead of only the end of transfer
        #[arg(long)]
        ack_per_block: bool,

        /// Also accept transfers on this serial bridge device
        #[arg(long, value_name = "DEVICE")]
        bridge: Option<String>,
    },
    /// Report whether a package would be installed
    Validate {
        /// Package file to check
        artifact: PathBuf,

        /// Install even when the version is not newer or the package differs
        #[arg(long)]
        force: bool,
    },
}

fn init_logging(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let mut config = match config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    match cli.command {
        Commands::Serve { port, save_dir, ack_per_block, bridge } => {
            config.apply(&Overrides { port, save_dir, ack_per_block, bridge });
            if let Err(e) = serve(&config) {
                eprintln!("Serve failed: {}", e);
                std::process::exit(1);
            }
        }
        Commands::Validate { artifact, force } => {
            if !artifact.exists() {
                eprintln!("File not found: {}", artifact.display());
                std::process::exit(1);
            }

            let outcome = build_validator(&config).validate(&artifact, force);
            match serde_json::to_string_pretty(&outcome) {
                Ok(json) => println!("{}", json),
                Err(e) => {
                    eprintln!("Error: {}", e);
                    std::process::exit(1);
                }
            }
        }
    }
}

fn build_validator(config: &Config) -> ArtifactValidator {
    let package = &config.package;
    let inspector = ShellPackageInspector {
        ignore: package.ignore.clone(),
        list_command: package.list_command.clone(),
        dump_command: package.dump_command.clone(),
        badging_command: package.badging_command.clone(),
    };
    ArtifactValidator::new(Box::new(inspector), package.prefix.clone())
}

fn serve(config: &Config) -> std::io::Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "starting apklink");

    let ctx = Arc::new(SessionContext::new(
        config.session_settings(),
        build_validator(config),
        Arc::new(CommandReboot { command: config.device.reboot_command.clone() }),
        Box::new(FileSnapshotProvider::new(&config.device.snapshot_file)),
        Arc::new(TracingProgress),
    ));
    let running = Arc::new(AtomicBool::new(true));
    let settings = config.listener_settings();

    let mut workers = Vec::new();

    let tcp = TcpAcceptor::new(&config.server.bind, config.server.port, Duration::from_millis(200));
    workers.push(spawn_listener("tcp-listener", tcp, &ctx, settings, &running)?);

    if config.bridge.enabled {
        let bridge = BridgeAcceptor::new(
            &config.bridge.device,
            config.bridge.baud_rate,
            Duration::from_millis(config.bridge.poll_interval_ms),
        );
        workers.push(spawn_listener("bridge-listener", bridge, &ctx, settings, &running)?);
    }

    for worker in workers {
        if worker.join().is_err() {
            error!("listener thread panicked");
        }
    }
    Ok(())
}

fn spawn_listener<A: Acceptor + 'static>(
    name: &str,
    acceptor: A,
    ctx: &Arc<SessionContext>,
    settings: ListenerSettings,
    running: &Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<()>> {
    let mut listener = Listener::new(acceptor, Arc::clone(ctx), settings, Arc::clone(running));
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || listener.run())
}
