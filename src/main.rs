//! natpair - NAT traversal between two peers over WebSocket signaling

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use uuid::Uuid;

use natpair::config::NatConfig;
use natpair::network::{
    exchange_hello, first_usable, AliasResolver, Chained, LocalInterfaces, NatError, NatService,
    PublicIpSource, StaticIps, StunDiscovery, TraversalRole, WsChannel,
};
use natpair::protocol::PeerId;

#[derive(Parser)]
#[command(name = "natpair")]
#[command(about = "UDP NAT traversal and traversed pair management")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to a TOML config file
    #[arg(short, long, global = true, env = "NATPAIR_CONFIG")]
    config: Option<PathBuf>,

    /// Local peer identity (random if omitted)
    #[arg(long, global = true, env = "NATPAIR_ID")]
    id: Option<Uuid>,

    /// Public IP to advertise; may be repeated
    #[arg(long = "public-ip", global = true, env = "NATPAIR_PUBLIC_IP", value_delimiter = ',')]
    public_ip: Vec<IpAddr>,

    /// Ask STUN servers for the public IP
    #[arg(long, global = true)]
    stun: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept signaling connections and answer traversals and handovers
    Listen {
        /// Address for the WebSocket signaling listener
        #[arg(short, long, default_value = "0.0.0.0:9000")]
        bind: SocketAddr,
    },

    /// Traverse toward a listening peer
    Connect {
        /// Signaling URL of the peer (e.g., ws://198.51.100.7:9000)
        url: String,

        /// Take the pair over after this many seconds
        #[arg(long)]
        take_after: Option<u64>,
    },

    /// Show public IP candidates
    Discover,

    /// Print the effective configuration as TOML
    Config,
}

fn setup_logging(verbose: bool) -> Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")
}

fn load_config(path: Option<&PathBuf>) -> Result<NatConfig> {
    match path {
        Some(path) => NatConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(NatConfig::default()),
    }
}

fn ip_source(public_ips: Vec<IpAddr>, stun: bool) -> Arc<dyn PublicIpSource> {
    let mut sources: Vec<Box<dyn PublicIpSource>> = Vec::new();
    if !public_ips.is_empty() {
        sources.push(Box::new(StaticIps::new(public_ips)));
    }
    if stun {
        sources.push(Box::new(StunDiscovery::default()));
    }
    sources.push(Box::new(LocalInterfaces));
    Arc::new(Chained::new(sources))
}

async fn run_listen(service: Arc<NatService>, bind: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    info!("Listening for signaling on {} as {}", bind, service.local_id());

    let shutdown = CancellationToken::new();

    loop {
        let (stream, addr) = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            res = listener.accept() => res?,
        };
        info!("Signaling connection from {}", addr);

        let service = service.clone();
        let cancel = shutdown.child_token();
        tokio::spawn(async move {
            if let Err(e) = handle_peer(service, stream, cancel).await {
                warn!("Session with {} ended: {}", addr, e);
            }
        });
    }

    shutdown.cancel();
    service.shutdown();
    Ok(())
}

async fn handle_peer(
    service: Arc<NatService>,
    stream: tokio::net::TcpStream,
    cancel: CancellationToken,
) -> Result<()> {
    let ws_stream = tokio_tungstenite::accept_async(stream)
        .await
        .context("WebSocket handshake failed")?;
    let mut channel = WsChannel::new(ws_stream);

    let signal_timeout = service.config().traversal.signal_timeout();
    let peer = exchange_hello(&mut channel, service.local_id(), signal_timeout, &cancel).await?;

    let pair = service
        .traverse(&mut channel, TraversalRole::Responder, peer, &cancel)
        .await?;
    info!(
        "Pair {} established: {} <-> {}",
        pair.nonce(),
        pair.local_addr(),
        pair.remote_addr()
    );

    loop {
        match service.serve_handover(&mut channel, &cancel).await {
            Ok(retired) => info!("Handed over pair {}", retired.nonce),
            Err(NatError::ChannelClosed) | Err(NatError::Cancelled) => break,
            Err(e) if e.is_busy() || e.is_protocol() => warn!("Handover refused: {}", e),
            Err(e) => return Err(e.into()),
        }
    }

    debug!("Peer {} disconnected", peer);
    Ok(())
}

async fn run_connect(service: Arc<NatService>, url: String, take_after: Option<u64>) -> Result<()> {
    let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .with_context(|| format!("Failed to connect to {}", url))?;
    let mut channel = WsChannel::new(ws_stream);
    let cancel = CancellationToken::new();

    let signal_timeout = service.config().traversal.signal_timeout();
    let peer = exchange_hello(&mut channel, service.local_id(), signal_timeout, &cancel).await?;
    info!("Connected to peer {}", peer);

    let pair = service
        .traverse(&mut channel, TraversalRole::Initiator, peer, &cancel)
        .await?;
    println!(
        "pair {}  local {}  remote {}",
        pair.nonce(),
        pair.local_addr(),
        pair.remote_addr()
    );

    match take_after {
        Some(secs) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {
                    let retired = service.take_pair(pair.nonce(), &mut channel, &cancel).await?;
                    let local = retired.local_endpoint(&service.local_id()).endpoint;
                    let remote = retired.remote_addr(&service.local_id());
                    println!("took pair {}  local {}  remote {}", retired.nonce, local, remote);
                }
            }
        }
        None => {
            let mut ticker = tokio::time::interval(Duration::from_secs(5));
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    _ = ticker.tick() => {
                        for info in service.pairs() {
                            println!(
                                "pair {}  {}  idle {:?}",
                                info.nonce, info.state, info.idle_for
                            );
                        }
                    }
                }
            }
        }
    }

    service.shutdown();
    if let Err(e) = channel.close().await {
        debug!("Closing signaling channel: {}", e);
    }
    Ok(())
}

async fn run_discover(source: Arc<dyn PublicIpSource>, allow_loopback: bool) -> Result<()> {
    let candidates = source.candidates().await?;
    for ip in &candidates {
        println!("candidate {}", ip);
    }
    match first_usable(&candidates, allow_loopback) {
        Some(ip) => println!("advertised {}", ip),
        None => println!("no usable public IP"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose)?;

    let config = load_config(cli.config.as_ref())?;
    let source = ip_source(cli.public_ip, cli.stun);
    let local_id = cli.id.map(PeerId).unwrap_or_else(PeerId::random);

    match cli.command {
        Commands::Config => {
            print!("{}", config.to_toml_string()?);
        }
        Commands::Discover => {
            run_discover(source, config.traversal.allow_loopback).await?;
        }
        Commands::Listen { bind } => {
            let service = Arc::new(NatService::new(
                local_id,
                config,
                source,
                Arc::new(AliasResolver::new()),
            ));
            run_listen(service, bind).await?;
        }
        Commands::Connect { url, take_after } => {
            let service = Arc::new(NatService::new(
                local_id,
                config,
                source,
                Arc::new(AliasResolver::new()),
            ));
            run_connect(service, url, take_after).await?;
        }
    }

    Ok(())
}
