use anyhow::Result;
use bluer::Address;
use bytes::Bytes;
use clap::Parser;
use safeway_link::connection::{ChannelDispatcher, DispatchQueue, LinkSlot};
use safeway_link::host::{HomeScreen, HostListener};
use safeway_link::peer::{BluezDirectory, BondedPeer, StaticDirectory};
use safeway_link::permission::{PermissionFlag, PermissionGate};
use safeway_link::transport::{RfcommTransport, TcpTransport, Transport};
use safeway_link::{ConnectionManager, LinkConfig, LinkWriter, TransportMode};
use safeway_shared::LinkError;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, BufReader};

use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Connect to the SafeWay companion device and forward stdin to it
#[derive(Parser, Debug)]
#[command(name = "safeway-link", version)]
struct Args {
    /// Configuration file (defaults apply when it does not exist)
    #[arg(short, long, default_value = "safeway.toml")]
    config: PathBuf,

    /// Name of the bonded device, overriding the configuration
    #[arg(short, long)]
    peer: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let args = Args::parse();
    let mut config = LinkConfig::load(&args.config)?;
    if let Some(peer) = args.peer {
        config.peer_name = peer;
    }

    info!("SafeWay link starting");
    info!("  peer: {}", config.peer_name);
    info!("  service: {}", config.service());
    info!("  transport: {:?}", config.transport);

    let slot = LinkSlot::new();
    let gate: Arc<dyn PermissionGate> = Arc::new(PermissionFlag::granted());

    match config.transport {
        TransportMode::Rfcomm => {
            let directory = match BluezDirectory::new().await {
                Ok(directory) => directory,
                Err(e) => {
                    error!("Bluetooth is not supported on this device: {:#}", e);
                    return Err(e);
                }
            };
            let transport = RfcommTransport::new(
                directory.session().clone(),
                directory.adapter().clone(),
                config.rfcomm_channel.into(),
            );
            let manager = ConnectionManager::new(
                config.retry_policy(),
                Arc::new(directory),
                transport,
                gate,
                slot,
            );
            run(manager, &config).await
        }
        TransportMode::TcpSimulation => {
            info!("  simulating peer at {}", config.tcp_address);
            let directory = StaticDirectory::new(vec![BondedPeer::new(
                config.peer_name.clone(),
                Address::any(),
            )]);
            let transport = TcpTransport::new(config.tcp_address.clone());
            let manager = ConnectionManager::new(
                config.retry_policy(),
                Arc::new(directory),
                transport,
                gate,
                slot,
            );
            run(manager, &config).await
        }
    }
}

/// Drive one connection flow, then forward stdin lines over the link
async fn run<T: Transport>(manager: ConnectionManager<T>, config: &LinkConfig) -> Result<()> {
    let (dispatcher, mut queue) = ChannelDispatcher::new();
    let manager = manager.with_dispatcher(Arc::new(dispatcher));

    let screen = Arc::new(Mutex::new(HomeScreen::new(config.peer_name.clone())));
    let listener = Arc::new(HostListener::new(screen.clone(), config.peer_name.clone()));

    screen
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .show_finding();
    let session = manager
        .begin(&config.peer_name, config.service(), listener)
        .await;

    let outcome = drive_session(session, &mut queue).await;
    match outcome {
        Ok(handle) => info!("Link open to {} ({})", handle.peer().name, handle.peer().address),
        Err(LinkError::Cancelled) => {
            info!("Connection cancelled");
            return Ok(());
        }
        Err(e) => {
            error!("{}", e);
            return Err(e.into());
        }
    }

    forward_stdin(LinkWriter::new(manager.slot().clone())).await
}

/// Run host callbacks until the flow settles; Ctrl-C cancels it
async fn drive_session(
    session: safeway_link::ConnectSession,
    queue: &mut DispatchQueue,
) -> Result<safeway_link::LinkHandle, LinkError> {
    let canceller = session.canceller();
    let finished = session.finished();
    tokio::pin!(finished);

    let outcome = loop {
        tokio::select! {
            outcome = &mut finished => break outcome,
            _ = queue.run_next() => {}
            _ = tokio::signal::ctrl_c() => {
                canceller.cancel();
            }
        }
    };

    // Callbacks posted right before the worker returned
    queue.drain();
    outcome
}

async fn forward_stdin(writer: LinkWriter) -> Result<()> {
    info!("Type a line to send it, Ctrl-D or Ctrl-C to quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if let Err(e) = writer.send(Bytes::from(format!("{}\n", line))).await {
                    warn!("Send failed: {}", e);
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    writer.disconnect().await?;
    info!("Link closed");
    Ok(())
}
