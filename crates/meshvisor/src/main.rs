use std::env;
use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::{LevelFilter, debug, error, info};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

use meshvisor::config::{APP_NAME, AppConfig};

fn main() {
    if let Err(err) = try_main() {
        error!("{err:#}");
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Provisions and supervises a mesh daemon per client session or network namespace."
)]
struct Cli {
    /// Override the config file path
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,
    /// Output logs as JSON
    #[arg(long)]
    json: bool,
    /// Control socket path
    #[arg(long = "sock", value_name = "PATH")]
    socket: Option<PathBuf>,
    /// Control socket permissions (octal)
    #[arg(long = "perms", value_name = "MODE")]
    socket_mode: Option<String>,
    /// Mesh daemon executable
    #[arg(long, value_name = "PATH")]
    daemon: Option<String>,
    /// Bootstrap peer address (host:port)
    #[arg(long, value_name = "ADDR")]
    peer_address: Option<String>,
    /// Bootstrap peer password
    #[arg(long, value_name = "PASSWORD", env = "MESHVISOR_PEER_PASSWORD")]
    peer_password: Option<String>,
    /// Bootstrap peer public key
    #[arg(long = "peer-pubkey", value_name = "KEY")]
    peer_public_key: Option<String>,
    /// Detect network namespaces from the process table
    #[arg(long)]
    detect_netns: bool,
    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,
}

impl Cli {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(socket) = &self.socket {
            config.server.socket = socket.clone();
        }
        if let Some(mode) = &self.socket_mode {
            config.server.socket_mode = mode.clone();
        }
        if let Some(daemon) = &self.daemon {
            config.daemon.binary = daemon.clone();
        }
        if let Some(address) = &self.peer_address {
            config.peer.address = address.clone();
        }
        if let Some(password) = &self.peer_password {
            config.peer.password = password.clone();
        }
        if let Some(key) = &self.peer_public_key {
            config.peer.public_key = key.clone();
        }
        if self.detect_netns {
            config.discovery.enabled = true;
        }
    }

    fn log_level(&self) -> LevelFilter {
        match self.verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }

    fn init_logging(&self) {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        let level = self.log_level().to_string().to_lowercase();
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{APP_NAME}={level},meshvisor_protocol={level}"))
        });

        if self.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .ok();
        } else {
            let disable_color = env::var_os("NO_COLOR").is_some() || !io::stderr().is_terminal();
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(io::stderr)
                        .with_ansi(!disable_color),
                )
                .try_init()
                .ok();
        }

        // Falls back to env_logger when no subscriber could be installed.
        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
        builder.filter_level(self.log_level());
        builder.try_init().ok();
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();
    cli.init_logging();

    let mut config = AppConfig::load(cli.config.as_deref())?;
    cli.apply(&mut config);
    // Validated up front so a typo fails before anything is bound.
    config.server.socket_mode()?;
    debug!("effective config: {config:?}");

    if cli.print_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    run(config)
}

#[tokio::main]
async fn run(config: AppConfig) -> Result<()> {
    let shutdown = CancellationToken::new();
    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            tokio::select! {
                _ = sigint.recv() => info!("received SIGINT, shutting down"),
                _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
                _ = shutdown.cancelled() => return,
            }
            shutdown.cancel();
        }
    });

    let result = meshvisor::server::serve(&config, shutdown.clone()).await;
    shutdown.cancel();
    result
}
