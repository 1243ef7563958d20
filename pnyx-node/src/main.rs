//! PnyxDB node daemon (`pnyxd`).
//!
//! Wires the keyring, store, mesh transport, consensus engine, and client
//! API together, then runs until SIGINT/SIGTERM.

mod config;

use std::fs::File;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use pnyx_api::ApiServer;
use pnyx_consensus::{Engine, EngineOptions, VetoEngine};
use pnyx_keyring::KeyRing;
use pnyx_net::{MeshConfig, Network, TcpMesh};
use pnyx_storage::{DiskStore, Store};

use config::Config;

/// Interval guard between activity-triggered snapshots.
const SNAPSHOT_THROTTLE: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "pnyxd", version, about = "PnyxDB consortium node")]
struct Args {
    /// Path to the node configuration file.
    #[arg(long, short, default_value = "pnyxdb.json")]
    config: std::path::PathBuf,

    /// Verbose logging (-v for debug, -vv for trace).
    #[arg(long, short, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate this node's keyring and exit.
    Init,
    /// Run the node (default).
    Run,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config = Config::load(&args.config)?;

    match args.command.unwrap_or(Command::Run) {
        Command::Init => init_keyring(&config),
        Command::Run => run(config).await,
    }
}

fn passphrase() -> anyhow::Result<Vec<u8>> {
    std::env::var("PNYXDB_PASSPHRASE")
        .map(String::into_bytes)
        .map_err(|_| anyhow::anyhow!("PNYXDB_PASSPHRASE is not set"))
}

fn init_keyring(config: &Config) -> anyhow::Result<()> {
    let path = config.keyring_path()?;
    if path.exists() {
        anyhow::bail!("refusing to overwrite existing keyring {}", path.display());
    }
    std::fs::create_dir_all(config.data_dir()?)?;

    let ring = KeyRing::new(config.identity.as_str());
    ring.create_private(&passphrase()?)?;
    std::fs::write(&path, ring.marshal()?)?;

    tracing::info!(path = %path.display(), identity = %config.identity, "keyring created");
    println!("{}", path.display());
    Ok(())
}

async fn run(config: Config) -> anyhow::Result<()> {
    tracing::info!("pnyxd v{} starting...", env!("CARGO_PKG_VERSION"));

    let keyring = Arc::new(load_keyring(&config)?);
    let store: Arc<dyn Store> = Arc::new(DiskStore::open(config.store_path()?)?);

    let mesh = TcpMesh::start(MeshConfig {
        listen: config.listen_peers,
        peers: config.peers.clone(),
        recovery_quorum: config.recovery_quorum,
    })
    .await?;
    let network: Arc<dyn Network> = Arc::new(mesh);

    let bbc = Arc::new(VetoEngine::new(
        network.clone(),
        keyring.clone(),
        config.participants,
    ));
    let engine = Engine::with_options(
        store.clone(),
        network.clone(),
        bbc,
        keyring,
        config.quorum,
        EngineOptions {
            demote_outdated: config.demote_outdated,
        },
    );

    // Restore pending consensus state from the last snapshot, if any.
    let snapshot_path = config.snapshot_path()?;
    match File::open(&snapshot_path) {
        Ok(file) => {
            engine.load(file)?;
            tracing::info!(path = %snapshot_path.display(), "engine snapshot loaded");
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let token = CancellationToken::new();
    engine.run(token.clone()).await?;

    let api = ApiServer::bind(engine.clone(), config.listen_api, token.child_token()).await?;
    tracing::info!(peers = %config.listen_peers, api = %api.local_addr(), "listening");

    // Periodic snapshotter driven by the engine's activity probe.
    {
        let engine = engine.clone();
        let token = token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = engine.activity_probe() => {}
                }

                if let Err(e) = write_snapshot(&engine, &snapshot_path) {
                    tracing::warn!(error = %e, "snapshot failed");
                }
                tokio::time::sleep(SNAPSHOT_THROTTLE).await;
            }
        });
    }

    tracing::info!("node ready. Press Ctrl+C to stop.");
    shutdown_signal().await;
    tracing::info!("shutdown signal received...");

    token.cancel();
    network.close().await;
    store.close()?;

    tracing::info!("node stopped");
    Ok(())
}

fn load_keyring(config: &Config) -> anyhow::Result<KeyRing> {
    let path = config.keyring_path()?;
    let raw = std::fs::read(&path)
        .map_err(|e| anyhow::anyhow!("cannot read keyring {}: {e}", path.display()))?;

    let ring = KeyRing::new(config.identity.as_str());
    ring.unmarshal(&raw)?;
    ring.unlock_private(&passphrase()?)?;

    tracing::info!(identity = %config.identity, "keyring unlocked");
    Ok(ring)
}

fn write_snapshot(engine: &Engine, path: &std::path::Path) -> anyhow::Result<()> {
    // Write-then-rename keeps a torn snapshot from replacing a good one.
    let tmp = path.with_extension("dump.tmp");
    let file = File::create(&tmp)?;
    engine.dump(&file)?;
    file.sync_all()?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn init_tracing(verbosity: u8) {
    let mut filter = EnvFilter::from_default_env();

    // Only apply defaults if RUST_LOG is not set.
    if std::env::var("RUST_LOG").is_err() {
        let level = match verbosity {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        filter = filter.add_directive(level.parse().expect("static directive parses"));
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = signal(SignalKind::interrupt()).expect("SIGINT handler installs");
        let mut sigterm = signal(SignalKind::terminate()).expect("SIGTERM handler installs");
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("Ctrl+C handler installs");
    }
}
