//! ShardFS Meta - metadata server daemon
//!
//! This binary hosts one metadata server: a local engine, the lease
//! table, and the RPC service. Cluster membership is a static address
//! list shared by every member.

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use shardfs_common::ServerOptions;
use shardfs_engine::FsStorage;
use shardfs_server::MetaServer;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "shardfs-meta")]
#[command(about = "ShardFS metadata server")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/shardfs/meta.toml")]
    config: String,

    /// This server's id in [0, num_servers)
    #[arg(long)]
    server_id: Option<u16>,

    /// Listen address for RPC
    #[arg(short, long)]
    listen: Option<String>,

    /// Data directory for the local engine
    #[arg(long)]
    data_dir: Option<String>,

    /// Peer addresses, one per server id, in order
    #[arg(long)]
    peers: Vec<String>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Configuration file structure
#[derive(Debug, Deserialize, Default)]
struct Config {
    #[serde(default)]
    server: ServerSection,
    #[serde(default)]
    cluster: ClusterSection,
    #[serde(default)]
    logging: LoggingSection,
    /// Engine, lease, index, and transport tuning; merged over the
    /// built-in defaults.
    #[serde(default)]
    options: Option<ServerOptions>,
}

#[derive(Debug, Deserialize, Default)]
struct ServerSection {
    #[serde(default)]
    server_id: Option<u16>,
    #[serde(default = "default_listen")]
    listen: String,
    #[serde(default = "default_data_dir")]
    data_dir: String,
}

#[derive(Debug, Deserialize, Default)]
struct ClusterSection {
    #[serde(default)]
    peers: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
struct LoggingSection {
    #[serde(default = "default_log_level")]
    level: String,
}

fn default_listen() -> String {
    "0.0.0.0:9410".to_string()
}

fn default_data_dir() -> String {
    "./shardfs-data".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn main() {
    if let Err(e) = run() {
        error!("fatal: {e:#}");
        eprintln!("fatal: {e:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    let config: Config = if std::path::Path::new(&args.config).exists() {
        let text = std::fs::read_to_string(&args.config)
            .with_context(|| format!("reading {}", args.config))?;
        toml::from_str(&text).with_context(|| format!("parsing {}", args.config))?
    } else {
        Config::default()
    };

    // CLI flags take precedence over the config file.
    let log_level = if args.log_level != "info" {
        args.log_level.clone()
    } else {
        config.logging.level.clone()
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let server_id = args
        .server_id
        .or(config.server.server_id)
        .context("no server id given (--server-id or [server].server_id)")?;
    let listen: SocketAddr = args
        .listen
        .unwrap_or(config.server.listen)
        .parse()
        .context("invalid listen address")?;
    let data_dir = PathBuf::from(args.data_dir.unwrap_or(config.server.data_dir));
    let peer_strings = if args.peers.is_empty() {
        config.cluster.peers
    } else {
        args.peers
    };
    let peers: Vec<SocketAddr> = peer_strings
        .iter()
        .map(|p| p.parse().with_context(|| format!("invalid peer address {p}")))
        .collect::<Result<_>>()?;

    let mut options = config.options.unwrap_or_default();
    options.server_id = server_id;
    options.data_dir = data_dir.clone();
    if !peers.is_empty() {
        options.index.num_servers = peers.len() as u32;
    }
    let options = options.sanitize();

    info!(
        server_id,
        %listen,
        data_dir = %data_dir.display(),
        peers = peers.len(),
        "starting ShardFS metadata server"
    );

    let server = MetaServer::new(options, FsStorage::new(), peers.clone())
        .context("initializing metadata server")?;
    let listener = server.serve(listen).context("binding RPC listener")?;
    info!(addr = %listener.local_addr(), "serving");

    // Serve until the process is terminated.
    loop {
        std::thread::park();
    }
}
