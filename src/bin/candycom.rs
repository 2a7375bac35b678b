//! Candycom CLI binary.
//!
//! # Commands
//!
//! - `host` - Connect to a dispenser, request candy, print statistics
//! - `client` - Run a simulated dispenser that serves hosts one session at a time
//! - `tokens` - Print the token vocabulary

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use candycom::{
    protocol::{Semantic, Token},
    transport::default_candidates,
    Client, Config, Host, SimulatedDispenser, SoftRestart, StreamOptions, TcpLink, Transport,
    TransportKind, VERSION,
};

#[derive(Parser)]
#[command(name = "candycom")]
#[command(version = VERSION)]
#[command(about = "Candycom - host/dispenser link protocol", long_about = None)]
struct Cli {
    /// Config file (default: <config_dir>/candycom/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Transport (serial, tcp)
    #[arg(short, long, global = true)]
    transport: Option<TransportKind>,

    /// Serial device path
    #[arg(short, long, global = true)]
    device: Option<PathBuf>,

    /// Serial line rate
    #[arg(short, long, global = true)]
    baud: Option<u32>,

    /// TCP address
    #[arg(short, long, global = true)]
    address: Option<String>,

    /// Time unit in milliseconds
    #[arg(long, global = true)]
    time_unit_ms: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to a dispenser and request candy
    Host {
        /// Number of dispenses to request
        #[arg(short = 'n', long, default_value = "1")]
        count: u32,

        /// Seconds to wait for each dispense confirmation
        #[arg(long, default_value = "10")]
        wait: u64,

        /// Seconds to wait for the handshake
        #[arg(long, default_value = "30")]
        connect_timeout: u64,
    },

    /// Run a simulated dispenser
    Client {
        /// Sessions to serve before exiting (0 = forever)
        #[arg(short, long, default_value = "0")]
        sessions: u32,

        /// Hopper size (default: bottomless)
        #[arg(long)]
        stock: Option<u32>,

        /// Milliseconds after a dispense until the simulated pickup (0 = never)
        #[arg(long, default_value = "1500")]
        take_after_ms: u64,
    },

    /// Print the token vocabulary
    Tokens,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json_logs);

    let config = load_config(&cli)?;
    let runtime = tokio::runtime::Runtime::new()?;

    match cli.command {
        Commands::Host {
            count,
            wait,
            connect_timeout,
        } => runtime.block_on(cmd_host(
            config,
            count,
            Duration::from_secs(wait),
            Duration::from_secs(connect_timeout),
        )),
        Commands::Client {
            sessions,
            stock,
            take_after_ms,
        } => runtime.block_on(cmd_client(config, sessions, stock, take_after_ms)),
        Commands::Tokens => {
            cmd_tokens();
            Ok(())
        },
    }
}

fn init_logging(verbose: bool, json: bool) {
    let log_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?.with_env_overrides(),
        None => Config::load()?,
    };
    if let Some(kind) = cli.transport {
        config.transport.kind = kind;
    }
    if let Some(device) = &cli.device {
        config.transport.device = Some(device.clone());
    }
    if let Some(baud) = cli.baud {
        config.transport.baud_rate = baud;
    }
    if let Some(address) = &cli.address {
        config.transport.address.clone_from(address);
    }
    if let Some(ms) = cli.time_unit_ms {
        config.protocol.time_unit_ms = ms;
    }
    config.protocol.validate()?;
    Ok(config)
}

fn stream_options(config: &Config) -> StreamOptions {
    StreamOptions::default()
        .with_read_timeout(config.transport.read_timeout())
        .with_probe(config.transport.probe)
}

fn tcp_link(config: &Config) -> anyhow::Result<TcpLink> {
    let addr: SocketAddr = config
        .transport
        .address
        .parse()
        .with_context(|| format!("Invalid address: {}", config.transport.address))?;
    Ok(TcpLink::new(addr))
}

async fn host_transport(config: &Config) -> anyhow::Result<Box<dyn Transport>> {
    let options = stream_options(config);
    match config.transport.kind {
        TransportKind::Tcp => Ok(Box::new(tcp_link(config)?.connect(options).await?)),
        TransportKind::Serial => match &config.transport.device {
            Some(path) => Ok(Box::new(
                candycom::open_serial(path, config.transport.baud_rate, options).await?,
            )),
            None => {
                let (path, transport) = candycom::discover_serial(
                    &default_candidates(),
                    config.transport.baud_rate,
                    options,
                )
                .await?;
                tracing::info!(port = %path.display(), "Using discovered port");
                Ok(Box::new(transport))
            },
        },
    }
}

async fn cmd_host(
    config: Config,
    count: u32,
    wait: Duration,
    connect_timeout: Duration,
) -> anyhow::Result<()> {
    let transport = host_transport(&config).await?;
    let host = Host::new(transport, &config.protocol)?;

    tokio::time::timeout(connect_timeout, host.connect())
        .await
        .context("Handshake timed out")??;

    for n in 1..=count {
        host.dispense_candy()?;
        let before = host.dispense_stats();
        let confirmed = tokio::time::timeout(wait, async {
            loop {
                let now = host.dispense_stats();
                if now.dispensed > before.dispensed || now.jams > before.jams {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        match confirmed {
            Ok(()) if host.jammed() => tracing::warn!(n, "Dispenser jammed"),
            Ok(()) => tracing::info!(n, "Dispense confirmed"),
            Err(_) => tracing::warn!(n, "No dispense confirmation"),
        }
    }

    host.disconnect().await?;

    let report = serde_json::json!({
        "dispense": host.dispense_stats(),
        "link": host.stats(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn cmd_client(
    config: Config,
    sessions: u32,
    stock: Option<u32>,
    take_after_ms: u64,
) -> anyhow::Result<()> {
    let mut dispenser = SimulatedDispenser::new();
    if let Some(pieces) = stock {
        dispenser = dispenser.with_stock(pieces);
    }
    let dispenser = Arc::new(dispenser);
    let device = Arc::new(SoftRestart::new());

    if take_after_ms > 0 {
        tokio::spawn(simulate_pickups(
            Arc::clone(&dispenser),
            Duration::from_millis(take_after_ms),
        ));
    }

    let options = stream_options(&config);
    let listener = match config.transport.kind {
        TransportKind::Tcp => {
            let addr = tcp_link(&config)?.addr();
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("Failed to bind {addr}"))?;
            tracing::info!(%addr, "Dispenser listening");
            Some(listener)
        },
        TransportKind::Serial => None,
    };

    let mut served = 0;
    while sessions == 0 || served < sessions {
        let transport: Box<dyn Transport> = match &listener {
            Some(listener) => Box::new(TcpLink::accept_on(listener, options).await?),
            None => {
                let path = config
                    .transport
                    .device
                    .as_ref()
                    .context("Serial client needs --device")?;
                Box::new(candycom::open_serial(path, config.transport.baud_rate, options).await?)
            },
        };

        let client = Client::new(
            transport,
            Arc::clone(&dispenser),
            Arc::clone(&device),
            &config.protocol,
        )?;
        if let Err(e) = client.serve().await {
            tracing::warn!(error = %e, "Session failed");
        }
        served += 1;
        tracing::info!(
            served,
            restarts = device.count(),
            stats = %serde_json::to_string(&client.stats())?,
            "Session over"
        );
    }
    Ok(())
}

/// Pick up every dispensed piece after `delay`.
async fn simulate_pickups(dispenser: Arc<SimulatedDispenser>, delay: Duration) {
    let mut collected = dispenser.rotations();
    loop {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if dispenser.rotations() > collected {
            tokio::time::sleep(delay).await;
            dispenser.take_candy();
            collected += 1;
        }
    }
}

fn cmd_tokens() {
    println!("{:<22} {:<8} {:<8}", "NAME", "REQUEST", "ACK");
    for semantic in Semantic::ALL {
        println!(
            "{:<22} {:<8} {:<8}",
            semantic.name(),
            Token::Request(semantic).as_str(),
            Token::Ack(semantic).as_str()
        );
    }
}
