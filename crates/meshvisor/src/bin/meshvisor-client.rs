//! Connects the calling process's network namespace to a meshvisor server
//! and keeps the session alive with heartbeats.

use std::fs::File;
use std::os::fd::AsFd;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use log::{LevelFilter, debug, info};
use meshvisor::config::AppConfig;
use meshvisor::key::PrivateKey;
use meshvisor_protocol::{Channel, MessageKind};
use tokio::signal::unix::{SignalKind, signal};

#[derive(Debug, Parser)]
#[command(author, version, about = "Attach this network namespace to a meshvisor server.")]
struct Cli {
    /// Override the config file path
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Server control socket [default: server.socket from the config]
    #[arg(long = "sock", value_name = "PATH")]
    socket: Option<PathBuf>,
    /// Node private key (64 hex characters)
    #[arg(long, value_name = "HEX", env = "CJDNS_PRIVKEY")]
    privkey: Option<String>,
    /// Seconds between heartbeats [default: watchdog.heartbeat_secs from the config]
    #[arg(long, value_name = "SECS")]
    interval: Option<u64>,
    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();
    let level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::from_env(env_logger::Env::default())
        .filter_level(level)
        .init();

    if let Err(err) = run(cli) {
        log::error!("{err:#}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn run(cli: Cli) -> Result<()> {
    let config = AppConfig::load(cli.config.as_deref())?;
    let socket = cli.socket.unwrap_or(config.server.socket);
    let interval = cli
        .interval
        .map(|secs| Duration::from_secs(secs.max(1)))
        .unwrap_or_else(|| config.watchdog.heartbeat());

    let key = match cli.privkey.as_deref().filter(|k| !k.is_empty()) {
        Some(hex) => {
            let key = PrivateKey::from_hex(hex).context("parsing private key")?;
            if !key.is_valid() {
                bail!("invalid private key: address is outside fc00::/8");
            }
            info!("node address {}", key.public_key().address());
            Some(key)
        }
        None => None,
    };

    let channel = Channel::connect(&socket)
        .await
        .with_context(|| format!("connecting to {:?}", socket))?;
    let netns = File::open("/proc/self/ns/net").context("opening /proc/self/ns/net")?;
    info!("connected to {:?}", socket);

    let payload = key.as_ref().map(|k| k.as_bytes().as_slice()).unwrap_or_default();
    channel
        .send(MessageKind::InitRequest, 0, payload, &[netns.as_fd()])
        .await
        .context("sending init request")?;
    drop(netns);

    channel
        .recv_kind(MessageKind::InitResponse)
        .await
        .context("waiting for the daemon to start")?;
    info!("daemon running, sending heartbeats every {}s", interval.as_secs());

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    let mut sequence: u32 = 1;
    loop {
        tokio::select! {
            _ = sigint.recv() => break,
            _ = sigterm.recv() => break,
            _ = ticker.tick() => {
                channel.send_heartbeat(sequence).await.context("sending heartbeat")?;
                debug!("heartbeat {sequence}");
                sequence = sequence.wrapping_add(1);
            }
        }
    }
    info!("disconnecting");
    Ok(())
}
