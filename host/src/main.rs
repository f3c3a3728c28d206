mod config;
mod console;
mod daemon;
mod machines;

use anyhow::{Context, Result};
use clap::Parser;
use config::HostConfig;
use daemon::{Daemon, Listener};
use machines::SimulatedHost;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use utm_remote_core::{
    FileSecureStorage, GatewayConfig, GatewayEvent, GatewayHandle, IdentityStore,
    JsonFileTrustStore, Role, SessionGateway, TrustRegistry,
};

const TRANSITION_DELAY: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(name = "utm-remote-host")]
#[command(about = "UTM Remote host daemon")]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse()?)
                .add_directive("utm_remote_core=debug".parse()?)
                .add_directive("utm_remote_host=debug".parse()?)
                .add_directive("mdns_sd=warn".parse()?),
        )
        .init();

    let config = HostConfig::load(args.config.as_deref())?;
    info!("UTM Remote host '{}' starting...", config.device_name);

    let mut identities = IdentityStore::new(
        Role::Server,
        config.device_name.clone(),
        Box::new(FileSecureStorage::new(config.storage_dir.clone())?),
    );
    let identity = identities.load().context("Failed to load server identity")?;
    info!("Server fingerprint: {}", identity.fingerprint());

    let registry = TrustRegistry::open(Box::new(JsonFileTrustStore::new(
        config.storage_dir.clone(),
    )?))
    .context("Failed to open trust registry")?;

    let machines = Arc::new(SimulatedHost::new(&config.machines, TRANSITION_DELAY));
    let gateway = SessionGateway::spawn(
        GatewayConfig {
            autoblock: config.autoblock,
            password: config.password.clone(),
            ..GatewayConfig::default()
        },
        identity.fingerprint(),
        registry,
        machines.clone(),
    );
    machines.attach(gateway.clone());

    let printer = tokio::spawn(print_events(gateway.clone()));
    let listener = Listener::start(&config, &identity, &gateway)?;

    let mut daemon = Daemon {
        config,
        identities,
        gateway,
        listener: Some(listener),
    };
    println!("{}", console::HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            line = lines.next_line(), if stdin_open => {
                let Some(line) = line? else {
                    debug!("stdin closed, console disabled");
                    stdin_open = false;
                    continue;
                };
                match console::parse(&line) {
                    Ok(Some(command)) => match daemon.execute(command).await {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(e) => println!("Error: {:#}", e),
                    },
                    Ok(None) => {}
                    Err(e) => println!("{}", e),
                }
            }
        }
    }

    daemon.shutdown().await;
    printer.abort();
    info!("UTM Remote host stopped");
    Ok(())
}

async fn print_events(gateway: GatewayHandle) {
    let mut events = gateway.subscribe();
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!("Missed {} gateway events", skipped);
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        match event {
            GatewayEvent::ApprovalRequested {
                fingerprint,
                combined,
                remote_address,
            } => {
                println!(
                    "\nClient at {} is asking to connect.\n  Verification code: {}\n  Client fingerprint: {}\n  Type 'allow {}' or 'deny {}'",
                    remote_address,
                    combined,
                    fingerprint,
                    fingerprint.short(),
                    fingerprint.short()
                );
            }
            GatewayEvent::TrustedConnection {
                fingerprint,
                remote_address,
            } => {
                println!(
                    "Trusted client {} connected from {}. Type 'disconnect {}' to drop it.",
                    fingerprint.short(),
                    remote_address,
                    fingerprint.short()
                );
            }
            GatewayEvent::Established {
                fingerprint,
                remote_address,
            } => {
                println!("Session established with {} ({})", fingerprint.short(), remote_address);
            }
            GatewayEvent::Rejected {
                fingerprint,
                remote_address,
                reason,
            } => {
                let who = fingerprint.map_or_else(|| "unknown".to_string(), |fp| fp.short());
                info!("Rejected {} from {}: {:?}", who, remote_address, reason);
            }
            GatewayEvent::Closed {
                fingerprint,
                reason,
            } => {
                println!("Session with {} closed ({:?})", fingerprint.short(), reason);
            }
            GatewayEvent::TrustChanged {
                fingerprint,
                status,
            } => {
                debug!("Trust for {} is now {:?}", fingerprint.short(), status);
            }
        }
    }
    debug!("Gateway event stream ended");
}
