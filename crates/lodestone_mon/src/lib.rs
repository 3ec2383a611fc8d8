//! Lodestone monitor: the coordination core of the cluster control plane.
//!
//! A small, odd-sized set of monitors maintains the authoritative replicated
//! cluster state. This crate implements the per-monitor engine around a
//! supervised replicated log: peer discovery and bootstrap, the
//! leader/peon election lifecycle, the store-synchronization protocol that
//! lets a lagging monitor catch up without corrupting its store, and the
//! routing layer that forwards client writes to the leader.
//!
//! The crate is embeddable: `start_embedded_mon` runs a full monitor inside
//! the calling process over a `LocalMesh`, which is how the integration
//! tests assemble whole clusters.

pub mod config;
pub mod elector;
pub mod health;
pub mod messages;
pub mod monitor;
pub mod monmap;
pub mod paxos;
mod router;
pub mod service;
pub mod session;
pub mod store;
mod sync;
pub mod transport;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::{mpsc, oneshot};

use crate::config::MonConfig;
use crate::messages::EntityInst;
use crate::monitor::{load_monmap, mkfs, Event, Monitor};
use crate::monmap::MonMap;
use crate::paxos::LogBook;
use crate::service::{MapService, PlaceholderService};
use crate::store::MonStore;
use crate::transport::LocalMesh;

/// The maps a monitor hosts by default.
pub fn default_services() -> Vec<Box<dyn MapService>> {
    vec![
        Box::new(PlaceholderService::new("monmap")),
        Box::new(PlaceholderService::new("diskmap")),
        Box::new(PlaceholderService::new("placemap")),
        Box::new(PlaceholderService::new("metamap")),
        Box::new(PlaceholderService::new("auth")),
        Box::new(PlaceholderService::new("logm")),
    ]
}

/// Configuration for running a monitor inside another process.
#[derive(Clone, Debug)]
pub struct EmbeddedMonConfig {
    pub name: String,
    pub addr: SocketAddr,
    pub data_dir: PathBuf,
    /// Seed membership map used to mkfs a store that has never been
    /// formatted. Ignored when the store already carries one.
    pub seed_monmap: Option<MonMap>,
    pub cfg: MonConfig,
}

pub struct EmbeddedMonHandle {
    pub addr: SocketAddr,
    tx: mpsc::UnboundedSender<Event>,
    task: tokio::task::JoinHandle<anyhow::Result<()>>,
    mesh: Arc<LocalMesh>,
}

impl EmbeddedMonHandle {
    /// Run an admin-surface command against the live monitor.
    pub async fn admin_command(&self, cmd: &[&str]) -> anyhow::Result<(i32, String)> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Event::Admin {
                cmd: cmd.iter().map(|s| s.to_string()).collect(),
                reply: reply_tx,
            })
            .map_err(|_| anyhow::anyhow!("monitor task is gone"))?;
        reply_rx
            .await
            .map_err(|_| anyhow::anyhow!("monitor dropped admin reply"))
    }

    /// Graceful shutdown: stops the monitor task and detaches the endpoint.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Event::Shutdown(Some(ack_tx))).is_ok() {
            let _ = ack_rx.await;
        }
        self.mesh.unregister(self.addr);
        match self.task.await {
            Ok(result) => result,
            Err(err) => Err(anyhow::anyhow!("monitor task join failed: {err}")),
        }
    }

    /// Hard stop, as close to a crash as an in-process monitor gets: the
    /// task is aborted mid-whatever and the endpoint vanishes from the mesh.
    pub fn kill(self) {
        self.task.abort();
        self.mesh.unregister(self.addr);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Start a monitor over the given in-process mesh.
///
/// Formats the store from the seed map on first boot, then spawns the
/// monitor task. The monitor proceeds through bootstrap on its own; use
/// `admin_command(["mon_status"])` to observe it.
pub async fn start_embedded_mon(
    mesh: &Arc<LocalMesh>,
    config: EmbeddedMonConfig,
) -> anyhow::Result<EmbeddedMonHandle> {
    let store = Arc::new(MonStore::open(&config.data_dir).context("open monitor store")?);

    if load_monmap(&store)?.is_none() {
        let seed = config
            .seed_monmap
            .clone()
            .ok_or_else(|| anyhow::anyhow!("store has no monmap and no seed was provided"))?;
        mkfs(&store, &seed, b"embedded keyring", None)?;
    }
    let monmap = load_monmap(&store)?
        .ok_or_else(|| anyhow::anyhow!("monmap missing after mkfs"))?;

    let (tx, rx) = mpsc::unbounded_channel();
    let rank = monmap.rank_of_name(&config.name) as i64;
    let transport = mesh.register(EntityInst::mon(rank, config.addr), tx.clone());

    let paxos = Box::new(LogBook::new(store.clone()));
    let monitor = Monitor::new(
        config.cfg.clone(),
        config.name.clone(),
        monmap,
        store,
        transport,
        tx.clone(),
        paxos,
        default_services(),
    );
    let task = tokio::spawn(monitor.run(rx));

    Ok(EmbeddedMonHandle {
        addr: config.addr,
        tx,
        task,
        mesh: mesh.clone(),
    })
}
