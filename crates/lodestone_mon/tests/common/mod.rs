//! Shared helpers for integration tests.
//!
//! Clusters are assembled in-process over a `LocalMesh`: every monitor is an
//! embedded node with its own temp store, and test "clients" are plain mesh
//! endpoints driven directly by the test body.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::mpsc;
use uuid::Uuid;

use lodestone_mon::config::MonConfig;
use lodestone_mon::messages::{EntityInst, MonMessage};
use lodestone_mon::monitor::{mkfs, Event};
use lodestone_mon::monmap::MonMap;
use lodestone_mon::store::{MonStore, Transaction};
use lodestone_mon::transport::{LocalMesh, MonTransport};
use lodestone_mon::{start_embedded_mon, EmbeddedMonConfig, EmbeddedMonHandle};

/// Outer deadline for cluster convergence.
pub const CONVERGE_TIMEOUT: Duration = Duration::from_secs(60);

static NEXT_PORT: AtomicU16 = AtomicU16::new(17000);

pub fn pick_addr() -> SocketAddr {
    let port = NEXT_PORT.fetch_add(1, Ordering::SeqCst);
    format!("127.0.0.1:{port}").parse().unwrap()
}

/// Timeouts shrunk so whole-cluster scenarios converge in seconds.
pub fn fast_config() -> MonConfig {
    let mut cfg = MonConfig::default();
    cfg.tick_interval = Duration::from_millis(100);
    cfg.lease = Duration::from_secs(1);
    cfg.probe_timeout = Duration::from_millis(400);
    cfg.election_timeout = Duration::from_millis(200);
    cfg.sync_trim_timeout = Duration::from_secs(2);
    cfg.sync_heartbeat_interval = Duration::from_millis(100);
    cfg.sync_heartbeat_timeout = Duration::from_millis(600);
    cfg.sync_timeout = Duration::from_millis(400);
    cfg.sync_backoff_timeout = Duration::from_millis(300);
    cfg.sync_chunk_bytes = 1024;
    cfg.exit_on_removal = false;
    cfg
}

/// A named seed map plus the address picked for each member.
pub fn seed_map(fsid: Uuid, names: &[&str]) -> MonMap {
    let mut map = MonMap::new(fsid);
    for name in names {
        map.add(*name, pick_addr());
    }
    map
}

/// Format a store and seed the replicated prefixes so the monitor boots with
/// a committed history at `paxos_last`.
pub fn format_and_seed(
    dir: &TempDir,
    map: &MonMap,
    paxos_first: u64,
    paxos_last: u64,
    payload_keys: usize,
) {
    let store = MonStore::open(dir.path()).unwrap();
    mkfs(&store, map, b"test keyring", None).unwrap();
    let mut tx = Transaction::new();
    tx.put_u64("paxos", "first_committed", paxos_first);
    tx.put_u64("paxos", "last_committed", paxos_last);
    for version in paxos_first..=paxos_last.min(paxos_first + payload_keys as u64) {
        tx.put(
            "paxos",
            format!("{version:08}"),
            format!("committed-entry-{version}").into_bytes(),
        );
    }
    tx.put_u64("auth", "last_committed", 1);
    tx.put("auth", "keys", b"test auth payload".to_vec());
    tx.put_u64("diskmap", "last_committed", 4);
    tx.put("diskmap", "full_4", b"diskmap payload".to_vec());
    store.apply_transaction(&tx).unwrap();
}

/// Format a store with nothing beyond the seed blobs (a brand-new monitor).
pub fn format_empty(dir: &TempDir, map: &MonMap) {
    let store = MonStore::open(dir.path()).unwrap();
    mkfs(&store, map, b"test keyring", None).unwrap();
}

pub struct TestMon {
    pub name: String,
    pub addr: SocketAddr,
    pub dir: TempDir,
    pub handle: Option<EmbeddedMonHandle>,
}

impl TestMon {
    pub fn handle(&self) -> &EmbeddedMonHandle {
        self.handle.as_ref().expect("monitor is running")
    }

    pub async fn admin(&self, cmd: &[&str]) -> (i32, String) {
        tokio::time::timeout(Duration::from_secs(10), self.handle().admin_command(cmd))
            .await
            .expect("admin command timed out")
            .expect("admin command failed")
    }

    pub async fn mon_status(&self) -> serde_json::Value {
        let (code, body) = self.admin(&["mon_status"]).await;
        assert_eq!(code, 0, "mon_status failed: {body}");
        serde_json::from_str(&body).expect("mon_status is json")
    }

    pub async fn shutdown(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.shutdown().await;
        }
    }

    /// Abort the monitor task without any teardown, like a crash.
    pub fn kill(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.kill();
        }
    }

    /// Start (or restart) the monitor over its existing store.
    pub async fn start(&mut self, mesh: &Arc<LocalMesh>, cfg: MonConfig) {
        assert!(self.handle.is_none(), "monitor already running");
        let handle = start_embedded_mon(
            mesh,
            EmbeddedMonConfig {
                name: self.name.clone(),
                addr: self.addr,
                data_dir: self.dir.path().to_path_buf(),
                seed_monmap: None,
                cfg,
            },
        )
        .await
        .expect("start monitor");
        self.handle = Some(handle);
    }
}

/// Spawn one monitor whose store was prepared by the caller.
pub async fn spawn_mon(
    mesh: &Arc<LocalMesh>,
    map: &MonMap,
    name: &str,
    dir: TempDir,
    cfg: MonConfig,
) -> TestMon {
    let addr = map.addr_of(name).expect("member in map");
    let mut mon = TestMon {
        name: name.to_string(),
        addr,
        dir,
        handle: None,
    };
    mon.start(mesh, cfg).await;
    mon
}

/// Poll a predicate over `mon_status` until it holds or the deadline hits.
pub async fn wait_for_status<F>(mon: &TestMon, what: &str, mut pred: F)
where
    F: FnMut(&serde_json::Value) -> bool,
{
    let deadline = tokio::time::Instant::now() + CONVERGE_TIMEOUT;
    loop {
        let status = mon.mon_status().await;
        if pred(&status) {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}; last mon_status: {status}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Wait until the monitor reports a quorum of exactly `size` members.
pub async fn wait_for_quorum(mon: &TestMon, size: usize) {
    wait_for_status(mon, "quorum", |status| {
        let in_quorum = status["quorum"].as_array().map(|q| q.len()).unwrap_or(0);
        let state = status["state"].as_str().unwrap_or("");
        in_quorum == size && (state == "leader" || state == "peon")
    })
    .await;
}

/// A bare mesh endpoint for driving the wire protocol from a test body.
pub struct TestClient {
    pub inst: EntityInst,
    pub transport: Arc<dyn MonTransport>,
    pub rx: mpsc::UnboundedReceiver<Event>,
    mesh: Arc<LocalMesh>,
}

impl TestClient {
    pub fn new(mesh: &Arc<LocalMesh>, inst: EntityInst) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport: Arc<dyn MonTransport> = mesh.register(inst, tx);
        Self {
            inst,
            transport,
            rx,
            mesh: mesh.clone(),
        }
    }

    pub fn client(mesh: &Arc<LocalMesh>, id: i64) -> Self {
        Self::new(mesh, EntityInst::client(id, pick_addr()))
    }

    pub fn send(&self, to: SocketAddr, msg: MonMessage) {
        self.transport.send(to, msg);
    }

    /// Receive the next delivered message, skipping connection resets.
    pub async fn recv(&mut self, timeout: Duration) -> Option<MonMessage> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .unwrap_or_default();
            match tokio::time::timeout(remaining, self.rx.recv()).await {
                Ok(Some(Event::Deliver(env))) => return Some(env.msg),
                Ok(Some(_)) => continue,
                Ok(None) => return None,
                Err(_) => return None,
            }
        }
    }

    /// Disconnect this endpoint, resetting its connections everywhere.
    pub fn disconnect(&self) {
        self.mesh.unregister(self.inst.addr);
    }
}
