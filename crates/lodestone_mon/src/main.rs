// Lodestone monitor binary entry point.
//
// Wires the store, the replicated-log bookkeeping, the hosted map services,
// and the transport into one monitor and runs it until interrupted. The
// `mkfs` subcommand performs the one-shot initial format.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use uuid::Uuid;

use lodestone_mon::config::MonConfig;
use lodestone_mon::messages::{blank_addr, EntityInst};
use lodestone_mon::monitor::{load_monmap, mkfs, Event, Monitor};
use lodestone_mon::monmap::MonMap;
use lodestone_mon::paxos::LogBook;
use lodestone_mon::store::MonStore;
use lodestone_mon::transport::LocalMesh;
use lodestone_mon::default_services;

#[derive(Parser, Debug)]
#[command(name = "lodestone-mon")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a monitor.
    Mon(MonArgs),
    /// Format a monitor's store (one-shot, before first run).
    Mkfs(MkfsArgs),
}

#[derive(Parser, Debug)]
struct MonArgs {
    /// Monitor name (e.g. `a`).
    #[arg(long)]
    name: String,

    /// Listen address.
    #[arg(long)]
    addr: SocketAddr,

    #[arg(long, env = "LODESTONE_MON_DATA")]
    data_dir: PathBuf,

    /// Restrict a never-joined seed map to these members
    /// (comma-separated names).
    #[arg(long, env = "LODESTONE_MON_INITIAL_MEMBERS", default_value = "")]
    initial_members: String,

    /// Extra addresses to probe during bootstrap.
    #[arg(long = "peer-hint")]
    peer_hints: Vec<SocketAddr>,

    /// Probe phase stall timeout in seconds.
    #[arg(long, env = "LODESTONE_MON_PROBE_TIMEOUT", default_value_t = 2)]
    probe_timeout_secs: u64,

    /// Monitor tick interval in seconds.
    #[arg(long, env = "LODESTONE_MON_TICK_INTERVAL", default_value_t = 3)]
    tick_interval_secs: u64,
}

#[derive(Parser, Debug)]
struct MkfsArgs {
    #[arg(long)]
    name: String,

    #[arg(long)]
    addr: SocketAddr,

    #[arg(long, env = "LODESTONE_MON_DATA")]
    data_dir: PathBuf,

    /// Cluster fsid; generated when omitted.
    #[arg(long)]
    fsid: Option<Uuid>,

    /// Seed members, comma-separated `name@host:port` or bare `name`
    /// (address learned later by probing).
    #[arg(long)]
    members: String,

    /// Initial keyring file.
    #[arg(long)]
    keyring: Option<PathBuf>,

    /// Optional storage-daemon map seed blob.
    #[arg(long)]
    diskmap: Option<PathBuf>,
}

/// Parse `name@host:port` (or bare `name`) members into a seed map.
fn parse_members(fsid: Uuid, list: &str, my_name: &str, my_addr: SocketAddr) -> MonMap {
    let mut map = MonMap::new(fsid);
    for part in list.split(',').filter(|s| !s.trim().is_empty()) {
        match part.split_once('@') {
            Some((name, addr)) => match addr.parse() {
                Ok(addr) => map.add(name.trim(), addr),
                Err(_) => {
                    tracing::warn!(member = part, "ignoring member with bad address");
                }
            },
            None => map.add(part.trim(), blank_addr()),
        }
    }
    if map.contains(my_name) {
        map.set_addr(my_name, my_addr);
    } else {
        map.add(my_name, my_addr);
    }
    map
}

fn run_mkfs(args: MkfsArgs) -> anyhow::Result<()> {
    let store = MonStore::open(&args.data_dir).context("open monitor store")?;
    if load_monmap(&store)?.is_some() {
        anyhow::bail!("store already formatted");
    }
    let fsid = args.fsid.unwrap_or_else(Uuid::new_v4);
    let monmap = parse_members(fsid, &args.members, &args.name, args.addr);
    let keyring = match &args.keyring {
        Some(path) => std::fs::read(path).with_context(|| format!("read keyring {path:?}"))?,
        None => b"lodestone default keyring".to_vec(),
    };
    let diskmap = match &args.diskmap {
        Some(path) => Some(std::fs::read(path).with_context(|| format!("read diskmap {path:?}"))?),
        None => None,
    };
    mkfs(&store, &monmap, &keyring, diskmap.as_deref())?;
    println!("formatted monitor store for {} (fsid {fsid})", args.name);
    Ok(())
}

async fn run_mon(args: MonArgs) -> anyhow::Result<()> {
    let store = Arc::new(MonStore::open(&args.data_dir).context("open monitor store")?);
    let monmap = load_monmap(&store)?
        .ok_or_else(|| anyhow::anyhow!("no monmap in store; run `lodestone-mon mkfs` first"))?;

    let mut cfg = MonConfig::default();
    cfg.probe_timeout = std::time::Duration::from_secs(args.probe_timeout_secs.max(1));
    cfg.tick_interval = std::time::Duration::from_secs(args.tick_interval_secs.max(1));
    cfg.initial_members = args
        .initial_members
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|s| s.trim().to_string())
        .collect();

    let mesh = LocalMesh::new();
    let (tx, rx) = mpsc::unbounded_channel();
    let rank = monmap.rank_of_name(&args.name) as i64;
    let transport = mesh.register(EntityInst::mon(rank, args.addr), tx.clone());

    let paxos = Box::new(LogBook::new(store.clone()));
    let mut monitor = Monitor::new(
        cfg,
        args.name.clone(),
        monmap,
        store,
        transport,
        tx.clone(),
        paxos,
        default_services(),
    );
    for hint in args.peer_hints {
        monitor.add_probe_hint(hint);
    }

    let task = tokio::spawn(monitor.run(rx));

    tokio::signal::ctrl_c().await.ok();
    tracing::info!("interrupt received, shutting down");
    let _ = tx.send(Event::Shutdown(None));
    match task.await {
        Ok(result) => result,
        Err(err) => Err(anyhow::anyhow!("monitor task failed: {err}")),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match Args::parse().cmd {
        Command::Mon(args) => run_mon(args).await,
        Command::Mkfs(args) => run_mkfs(args),
    }
}
