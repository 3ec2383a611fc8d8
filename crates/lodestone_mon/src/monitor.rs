//! The monitor coordination core.
//!
//! One `Monitor` owns every piece of per-monitor state and is driven by a
//! single task consuming its event inbox: delivered messages, timer
//! firings, admin commands, and shutdown. Handlers run to completion before
//! the next event is taken, so every state transition caused by one message
//! is visible atomically and messages from one sender apply in arrival
//! order. Timers are tokens in a table; cancelling one just removes the
//! token, and a token that fires after removal is a no-op.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;

use crate::config::MonConfig;
use crate::elector::{Actions as ElectorActions, Elector, Outcome};
use crate::health::{collect_health, ClusterCounters};
use crate::messages::{
    blank_addr, EntityInst, MonCaps, MonCommand, MonCommandAck, MonElection, MonGetVersion,
    MonGetVersionReply, MonJoin, MonMessage, MonProbe, MonSubscribe, MonSubscribeAck, PaxosWire,
    ProbeOp, StoreKey,
};
use crate::monmap::MonMap;
use crate::paxos::ReplicatedLog;
use crate::router::RoutedRequest;
use crate::service::MapService;
use crate::session::SessionMap;
use crate::store::{MonStore, Synchronizer, Transaction};
use crate::transport::{ConnId, Envelope, MonTransport};

/// Prefix for the monitor's own durable keys.
pub const MONITOR_PREFIX: &str = "monitor";
/// Prefix for sync bookkeeping (`in_sync`, `force_sync`).
pub const SYNC_PREFIX: &str = "mon_sync";
/// Prefix for the seed blobs written by mkfs.
pub const MKFS_PREFIX: &str = "mkfs";
/// On-disk magic cookie.
pub const MAGIC: &str = "lodestone mon volume v011";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MonState {
    Probing,
    Synchronizing,
    Electing,
    Leader,
    Peon,
    Shutdown,
}

impl MonState {
    pub fn name(self) -> &'static str {
        match self {
            MonState::Probing => "probing",
            MonState::Synchronizing => "synchronizing",
            MonState::Electing => "electing",
            MonState::Leader => "leader",
            MonState::Peon => "peon",
            MonState::Shutdown => "shutdown",
        }
    }
}

/// Feature-compat descriptor persisted under `monitor/compat_set`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureCompat {
    pub compat: BTreeSet<String>,
    pub ro_compat: BTreeSet<String>,
    pub incompat: BTreeSet<String>,
}

pub fn mon_feature_compat_set() -> FeatureCompat {
    let mut set = FeatureCompat::default();
    set.incompat.insert("initial feature set".to_string());
    set
}

pub type TimerToken = u64;

#[derive(Clone, Debug)]
pub(crate) enum TimerKind {
    Tick,
    ProbeTimeout,
    ElectionExpire,
    /// Leader-side heartbeat window for one sync requester.
    TrimTimeout(EntityInst),
    /// Grace period before trim re-enables after the last sync session.
    TrimEnable,
    /// Requester waiting for the leader's start reply.
    SyncStartReplyTimeout,
    /// Requester waiting for the leader's finish reply.
    SyncFinishReplyTimeout,
    /// Requester backing off after a RETRY start reply.
    SyncStartRetry(EntityInst),
    /// Requester heartbeat cadence.
    HeartbeatInterval,
    /// Requester abort window when the sync leader goes silent.
    HeartbeatTimeout,
    /// Chunk round-trip window (provider role keys by requester; requester
    /// role keys by provider).
    SyncTimeout(EntityInst),
}

/// Everything that can wake the monitor task.
#[derive(Debug)]
pub enum Event {
    Deliver(Envelope),
    ConnReset(ConnId),
    Timer(TimerToken),
    Admin {
        cmd: Vec<String>,
        reply: oneshot::Sender<(i32, String)>,
    },
    Shutdown(Option<oneshot::Sender<()>>),
}

pub(crate) const SYNC_ROLE_NONE: u8 = 0;
pub(crate) const SYNC_ROLE_LEADER: u8 = 0x1;
pub(crate) const SYNC_ROLE_PROVIDER: u8 = 0x2;
pub(crate) const SYNC_ROLE_REQUESTER: u8 = 0x4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SyncState {
    None,
    Start,
    Chunks,
    Stop,
}

/// Requester-side record of the sync leader or provider.
pub(crate) struct SyncPeer {
    pub entity: EntityInst,
    pub timeout: Option<TimerToken>,
    pub last_received_key: StoreKey,
    pub attempts: u32,
    /// Rolling CRC over applied chunks; dropped after a provider switch,
    /// when the received span no longer matches any single provider cursor.
    pub crc: Option<crc32fast::Hasher>,
}

impl SyncPeer {
    pub(crate) fn new(entity: EntityInst) -> Self {
        Self {
            entity,
            timeout: None,
            last_received_key: StoreKey::default(),
            attempts: 0,
            crc: None,
        }
    }
}

/// Provider-side record for one requester being fed chunks. Provider state
/// is deliberately disjoint from the leader-side session state: one monitor
/// commonly wears both hats for the same requester, and tearing down one
/// role must not invalidate the other.
pub(crate) struct ProviderEntry {
    pub entity: EntityInst,
    pub version: u64,
    pub state: SyncState,
    pub synchronizer: Option<Synchronizer>,
    pub timeout: Option<TimerToken>,
}

pub struct Monitor {
    pub(crate) cfg: MonConfig,
    pub(crate) name: String,
    pub(crate) rank: i32,
    pub(crate) monmap: MonMap,
    pub(crate) store: Arc<MonStore>,
    pub(crate) transport: Arc<dyn MonTransport>,
    pub(crate) inbox: UnboundedSender<Event>,

    pub(crate) state: MonState,
    pub(crate) has_ever_joined: bool,
    pub(crate) compat: FeatureCompat,

    pub(crate) elector: Elector,
    pub(crate) leader: i32,
    pub(crate) quorum: BTreeSet<i32>,
    pub(crate) outside_quorum: BTreeSet<String>,
    pub(crate) extra_probe_peers: BTreeSet<SocketAddr>,
    pub(crate) leader_since: Option<Instant>,
    pub(crate) exited_quorum: Option<Instant>,

    pub(crate) timers: HashMap<TimerToken, TimerKind>,
    next_timer: TimerToken,
    pub(crate) probe_timeout_event: Option<TimerToken>,
    pub(crate) election_expire_event: Option<TimerToken>,
    pub(crate) tick_event: Option<TimerToken>,

    pub(crate) sync_role: u8,
    pub(crate) sync_state: SyncState,
    pub(crate) trim_timeouts: BTreeMap<EntityInst, TimerToken>,
    pub(crate) trim_states: BTreeMap<EntityInst, SyncState>,
    pub(crate) trim_enable_event: Option<TimerToken>,
    pub(crate) sync_entities: BTreeMap<EntityInst, ProviderEntry>,
    pub(crate) sync_leader: Option<SyncPeer>,
    pub(crate) sync_provider: Option<SyncPeer>,

    pub(crate) sessions: SessionMap,
    pub(crate) routed_requests: BTreeMap<u64, RoutedRequest>,
    pub(crate) routed_request_tid: u64,
    pub(crate) next_synthetic_conn: ConnId,
    pub(crate) waitfor_quorum: Vec<(Instant, Envelope)>,
    pub(crate) maybe_wait_for_quorum: Vec<(Instant, Envelope)>,

    pub(crate) paxos: Box<dyn ReplicatedLog>,
    pub(crate) services: Vec<Box<dyn MapService>>,
    pub(crate) counters: ClusterCounters,
}

/// Format the monitor's state machines to their initial on-disk layout.
///
/// Writes the magic cookie, the feature-compat blob, and the seed blobs the
/// first boot reads back, all in one transaction.
pub fn mkfs(
    store: &MonStore,
    monmap: &MonMap,
    keyring: &[u8],
    diskmap_seed: Option<&[u8]>,
) -> anyhow::Result<()> {
    let mut tx = Transaction::new();
    tx.put(MONITOR_PREFIX, "magic", format!("{MAGIC}\n").into_bytes());
    tx.put(
        MONITOR_PREFIX,
        "compat_set",
        serde_json::to_vec(&mon_feature_compat_set())?,
    );
    let mut seed = monmap.clone();
    seed.epoch = 0;
    tx.put(MKFS_PREFIX, "monmap", seed.encode());
    tx.put(MKFS_PREFIX, "keyring", keyring.to_vec());
    if let Some(blob) = diskmap_seed {
        tx.put(MKFS_PREFIX, "diskmap", blob.to_vec());
    }
    store.apply_transaction(&tx)
}

/// Load the freshest membership map from the store: a committed map if one
/// exists, else the mkfs seed.
pub fn load_monmap(store: &MonStore) -> anyhow::Result<Option<MonMap>> {
    if let Some(bytes) = store.get("monmap", "latest")? {
        return Ok(Some(MonMap::decode(&bytes)?));
    }
    if let Some(bytes) = store.get(MKFS_PREFIX, "monmap")? {
        return Ok(Some(MonMap::decode(&bytes)?));
    }
    Ok(None)
}

impl Monitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: MonConfig,
        name: String,
        monmap: MonMap,
        store: Arc<MonStore>,
        transport: Arc<dyn MonTransport>,
        inbox: UnboundedSender<Event>,
        paxos: Box<dyn ReplicatedLog>,
        services: Vec<Box<dyn MapService>>,
    ) -> Self {
        Self {
            cfg,
            name,
            rank: -1,
            monmap,
            store,
            transport,
            inbox,
            state: MonState::Probing,
            has_ever_joined: false,
            compat: FeatureCompat::default(),
            elector: Elector::new(0),
            leader: 0,
            quorum: BTreeSet::new(),
            outside_quorum: BTreeSet::new(),
            extra_probe_peers: BTreeSet::new(),
            leader_since: None,
            exited_quorum: Some(Instant::now()),
            timers: HashMap::new(),
            next_timer: 0,
            probe_timeout_event: None,
            election_expire_event: None,
            tick_event: None,
            sync_role: SYNC_ROLE_NONE,
            sync_state: SyncState::None,
            trim_timeouts: BTreeMap::new(),
            trim_states: BTreeMap::new(),
            trim_enable_event: None,
            sync_entities: BTreeMap::new(),
            sync_leader: None,
            sync_provider: None,
            sessions: SessionMap::default(),
            routed_requests: BTreeMap::new(),
            routed_request_tid: 0,
            next_synthetic_conn: 1 << 62,
            waitfor_quorum: Vec::new(),
            maybe_wait_for_quorum: Vec::new(),
            paxos,
            services,
            counters: ClusterCounters::default(),
        }
    }

    // -- small state accessors ---------------------------------------------

    pub(crate) fn is_probing(&self) -> bool {
        self.state == MonState::Probing
    }

    pub(crate) fn is_synchronizing(&self) -> bool {
        self.state == MonState::Synchronizing
    }

    pub(crate) fn is_leader(&self) -> bool {
        self.state == MonState::Leader
    }

    pub(crate) fn is_peon(&self) -> bool {
        self.state == MonState::Peon
    }

    pub fn get_epoch(&self) -> u64 {
        self.elector.epoch()
    }

    /// Seed an extra address to probe during bootstrap.
    pub fn add_probe_hint(&mut self, addr: SocketAddr) {
        self.extra_probe_peers.insert(addr);
    }

    /// Every state-carrying prefix a sync replaces: the log plus one per
    /// hosted service.
    pub(crate) fn sync_targets(&self) -> BTreeSet<String> {
        let mut targets = BTreeSet::new();
        targets.insert(self.paxos.name().to_string());
        for service in &self.services {
            targets.insert(service.service_name().to_string());
        }
        targets
    }

    // -- timers ------------------------------------------------------------

    pub(crate) fn arm_timer(&mut self, kind: TimerKind, after: Duration) -> TimerToken {
        self.next_timer += 1;
        let token = self.next_timer;
        self.timers.insert(token, kind);
        let tx = self.inbox.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(Event::Timer(token));
        });
        token
    }

    pub(crate) fn cancel_timer(&mut self, token: TimerToken) {
        self.timers.remove(&token);
    }

    // -- lifecycle ---------------------------------------------------------

    /// Bring the monitor up: load durable identity, discard a half-synced
    /// store, initialize the log and services, and enter probing.
    pub fn init(&mut self) -> anyhow::Result<()> {
        tracing::info!(fsid = %self.monmap.fsid, name = %self.name, "init");

        self.compat = match self.store.get(MONITOR_PREFIX, "compat_set")? {
            Some(bytes) => serde_json::from_slice(&bytes)?,
            None => mon_feature_compat_set(),
        };

        self.has_ever_joined = self.store.exists(MONITOR_PREFIX, "joined")?;
        tracing::debug!(has_ever_joined = self.has_ever_joined, "joined marker");

        if !self.has_ever_joined && !self.cfg.initial_members.is_empty() {
            let initial = self.cfg.initial_members.clone();
            tracing::info!(?initial, "filtering seed monmap to initial members");
            let my_addr = self.transport.local_addr();
            let name = self.name.clone();
            self.monmap
                .set_initial_members(&initial, &name, my_addr, &mut self.extra_probe_peers);
        }

        // A potentially inconsistent store state must be discarded before
        // anything reads it.
        let mut clear_store = false;
        if self.store.exists(SYNC_PREFIX, "in_sync")? {
            tracing::info!("cleaning up potentially inconsistent store state");
            clear_store = true;
        }
        if self.store.exists(SYNC_PREFIX, "force_sync")? {
            tracing::info!("force sync by clearing store state");
            clear_store = true;
        }
        if clear_store {
            let mut prefixes = self.sync_targets();
            prefixes.insert(SYNC_PREFIX.to_string());
            self.store.clear(&prefixes)?;
        }

        self.init_paxos()?;

        // Authentication bootstrap: without a seed keyring there is nothing
        // to form an initial quorum with.
        let auth_empty = self
            .services
            .iter()
            .find(|s| s.service_name() == "auth")
            .map(|s| s.version() == 0)
            .unwrap_or(false);
        if auth_empty && !self.store.exists(MKFS_PREFIX, "keyring")? {
            anyhow::bail!("unable to load initial keyring; did mkfs run?");
        }

        let epoch = self
            .store
            .get_u64(MONITOR_PREFIX, "election_epoch")?
            .unwrap_or(0);
        self.elector = Elector::new(epoch);

        self.new_tick();
        self.bootstrap();
        Ok(())
    }

    pub(crate) fn init_paxos(&mut self) -> anyhow::Result<()> {
        self.paxos.init()?;
        if self.paxos.is_consistent() {
            for service in &mut self.services {
                service.update_from_paxos(&self.store);
            }
        }
        Ok(())
    }

    /// The single entry point back to a blank slate.
    pub(crate) fn bootstrap(&mut self) {
        tracing::debug!("bootstrap");

        self.counters.unregister();
        self.cancel_probe_timeout();

        let my_addr = self.transport.local_addr();
        let newrank = self.monmap.rank_of_addr(my_addr);
        if newrank < 0 && self.rank >= 0 && self.has_ever_joined {
            tracing::error!("removed from the membership map after joining; exiting");
            if self.cfg.exit_on_removal {
                std::process::exit(0);
            }
            self.shutdown();
            return;
        }
        if newrank != self.rank {
            tracing::info!(new_rank = newrank, old_rank = self.rank, "rank changed");
            self.rank = newrank;
            self.transport
                .set_identity(EntityInst::mon(newrank as i64, my_addr));
            // Peers would otherwise keep talking to who we used to be.
            self.transport.mark_down_all();
        }

        self.reset_sync();
        self.state = MonState::Probing;
        self.reset();

        if self.monmap.size() == 1 && self.rank == 0 {
            self.win_standalone_election();
            return;
        }

        self.reset_probe_timeout();

        if self.monmap.contains(&self.name) {
            self.outside_quorum.insert(self.name.clone());
        }

        tracing::debug!("probing other monitors");
        let probe = MonProbe::probe(self.monmap.fsid, self.name.clone(), self.has_ever_joined);
        for rank in 0..self.monmap.size() as i32 {
            if rank == self.rank {
                continue;
            }
            if let Some(inst) = self.monmap.get_inst(rank) {
                if inst.addr != blank_addr() {
                    self.transport
                        .send(inst.addr, MonMessage::Probe(probe.clone()));
                }
            }
        }
        for addr in self.extra_probe_peers.clone() {
            if addr != my_addr {
                self.transport.send(addr, MonMessage::Probe(probe.clone()));
            }
        }
    }

    /// Called by bootstrap, and on leader|peon -> electing.
    pub(crate) fn reset(&mut self) {
        tracing::debug!("reset");
        self.leader_since = None;
        if !self.quorum.is_empty() {
            self.exited_quorum = Some(Instant::now());
        }
        self.quorum.clear();
        self.outside_quorum.clear();

        self.paxos.restart();
        for service in &mut self.services {
            service.restart();
        }
    }

    pub fn shutdown(&mut self) {
        if self.state == MonState::Shutdown {
            return;
        }
        tracing::info!("shutdown");
        self.state = MonState::Shutdown;
        self.elector.shutdown();
        for service in &mut self.services {
            service.shutdown();
        }
        // Drain the timer wheel wholesale; in-flight tokens become no-ops.
        self.timers.clear();
        self.probe_timeout_event = None;
        self.election_expire_event = None;
        self.tick_event = None;
        self.trim_enable_event = None;
    }

    // -- probe phase -------------------------------------------------------

    pub(crate) fn cancel_probe_timeout(&mut self) {
        if let Some(token) = self.probe_timeout_event.take() {
            self.cancel_timer(token);
        }
    }

    pub(crate) fn reset_probe_timeout(&mut self) {
        self.cancel_probe_timeout();
        let after = self.cfg.probe_timeout;
        let token = self.arm_timer(TimerKind::ProbeTimeout, after);
        self.probe_timeout_event = Some(token);
    }

    fn probe_timeout(&mut self) {
        tracing::debug!("probe timeout");
        self.probe_timeout_event = None;
        if self.is_probing() || self.is_synchronizing() {
            self.bootstrap();
        }
    }

    fn handle_probe(&mut self, env: &Envelope, m: &MonProbe) {
        if m.fsid != self.monmap.fsid {
            tracing::debug!(theirs = %m.fsid, ours = %self.monmap.fsid, "probe fsid mismatch");
            return;
        }
        match m.op {
            ProbeOp::Probe => self.handle_probe_probe(env, m),
            ProbeOp::Reply => self.handle_probe_reply(env, m),
        }
    }

    fn handle_probe_probe(&mut self, env: &Envelope, m: &MonProbe) {
        tracing::debug!(from = %env.from, peer = %m.name, "handle probe");
        let reply = MonProbe {
            fsid: self.monmap.fsid,
            op: ProbeOp::Reply,
            name: self.name.clone(),
            has_ever_joined: self.has_ever_joined,
            quorum: self.quorum.clone(),
            monmap_bytes: self.monmap.encode(),
            paxos_first: self.paxos.get_first_committed(),
            paxos_last: self.paxos.get_version(),
        };
        self.transport.send(env.from.addr, MonMessage::Probe(reply));

        // Did we discover a peer here?
        if self.monmap.rank_of_addr(env.from.addr) < 0 {
            tracing::info!(peer = %env.from.addr, "adding peer to probe hints");
            self.extra_probe_peers.insert(env.from.addr);
        }
    }

    fn handle_probe_reply(&mut self, env: &Envelope, m: &MonProbe) {
        tracing::debug!(from = %env.from, peer = %m.name, quorum = ?m.quorum, "probe reply");

        if !self.is_probing() {
            return;
        }

        // Newer map, or they have joined a quorum and we never have?
        // Equality short-circuits so identical maps cannot make us loop.
        let mybytes = self.monmap.encode();
        if mybytes != m.monmap_bytes {
            if let Ok(newmap) = MonMap::decode(&m.monmap_bytes) {
                if m.has_ever_joined && (newmap.epoch > self.monmap.epoch || !self.has_ever_joined)
                {
                    tracing::info!(
                        new_epoch = newmap.epoch,
                        old_epoch = self.monmap.epoch,
                        "adopting newer committed monmap"
                    );
                    self.monmap = newmap;
                    self.bootstrap();
                    return;
                }
            }
        }

        // Rename a seed-map placeholder to the peer's advertised name.
        if self.monmap.epoch == 0 {
            if let Some(peer_name) = self.monmap.name_of_addr(env.from.addr).cloned() {
                if peer_name.starts_with("noname-") && peer_name != m.name {
                    tracing::debug!(old = %peer_name, new = %m.name, "renaming placeholder peer");
                    self.monmap.rename(&peer_name, m.name.clone());
                }
            }
        }

        // Learn the address of a named member we only knew by name.
        if self.monmap.contains(&m.name) && self.monmap.addr_of(&m.name) == Some(blank_addr()) {
            tracing::info!(peer = %m.name, addr = %env.from.addr, "learned initial member address");
            self.monmap.set_addr(&m.name, env.from.addr);
            self.bootstrap();
            return;
        }

        if !m.quorum.is_empty() {
            // There is an existing quorum; do we need to catch up first?
            if self.paxos.get_version() + self.cfg.paxos_max_join_drift < m.paxos_last {
                tracing::info!(
                    peer_version = m.paxos_last,
                    our_version = self.paxos.get_version(),
                    "too far behind the quorum, synchronizing"
                );
                self.sync_start(env.from);
            } else if self.monmap.contains(&self.name)
                && self.monmap.addr_of(&self.name) != Some(blank_addr())
            {
                self.start_election();
            } else {
                tracing::debug!("not in the monmap or addr blank, sending join");
                if let Some(&first) = m.quorum.iter().next() {
                    if let Some(inst) = self.monmap.get_inst(first) {
                        self.transport.send(
                            inst.addr,
                            MonMessage::Join(MonJoin {
                                fsid: self.monmap.fsid,
                                name: self.name.clone(),
                                addr: self.transport.local_addr(),
                            }),
                        );
                    }
                }
            }
        } else {
            // No quorum yet: make sure our store is fresh enough to be part
            // of one that forms.
            if m.paxos_first > self.paxos.get_version() {
                self.sync_start(env.from);
            } else if self.paxos.get_first_committed() > m.paxos_last {
                tracing::debug!(
                    peer = %m.name,
                    our_fc = self.paxos.get_first_committed(),
                    their_lc = m.paxos_last,
                    "waiting for peer to sync from us"
                );
            } else {
                if self.monmap.contains(&m.name) {
                    self.outside_quorum.insert(m.name.clone());
                } else {
                    tracing::debug!(peer = %m.name, "ignoring peer not in monmap");
                }

                let need = self.monmap.size() / 2 + 1;
                tracing::debug!(outside = ?self.outside_quorum, need, "outside quorum tally");
                if self.outside_quorum.len() >= need {
                    if self.outside_quorum.contains(&self.name) {
                        self.start_election();
                    } else {
                        tracing::debug!("enough for a quorum, but it does not include me");
                    }
                }
            }
        }
    }

    // -- election supervisor -----------------------------------------------

    pub(crate) fn start_election(&mut self) {
        tracing::info!("calling new monitor election");
        self.cancel_probe_timeout();
        self.state = MonState::Electing;
        let actions = self.elector.start(self.rank, &self.monmap);
        self.apply_elector_actions(actions);
    }

    fn win_standalone_election(&mut self) {
        tracing::info!("winning standalone election");
        self.rank = self.monmap.rank_of_name(&self.name);
        let epoch = self.elector.standalone_epoch();
        self.persist_election_epoch(epoch);
        let mut quorum = BTreeSet::new();
        quorum.insert(self.rank);
        self.win_election(epoch, quorum);
    }

    fn persist_election_epoch(&mut self, epoch: u64) {
        let mut tx = Transaction::new();
        tx.put_u64(MONITOR_PREFIX, "election_epoch", epoch);
        if let Err(err) = self.store.apply_transaction(&tx) {
            tracing::warn!(error = ?err, "failed to persist election epoch");
        }
    }

    pub(crate) fn apply_elector_actions(&mut self, actions: ElectorActions) {
        if let Some(epoch) = actions.persist_epoch {
            self.persist_election_epoch(epoch);
        }
        for (rank, msg) in actions.send {
            if let Some(inst) = self.monmap.get_inst(rank) {
                if inst.addr != blank_addr() {
                    self.transport.send(inst.addr, MonMessage::Election(msg));
                }
            }
        }
        if actions.arm_expire {
            if let Some(token) = self.election_expire_event.take() {
                self.cancel_timer(token);
            }
            let after = self.cfg.election_timeout;
            let token = self.arm_timer(TimerKind::ElectionExpire, after);
            self.election_expire_event = Some(token);
        }
        match actions.outcome {
            Some(Outcome::Win { epoch, quorum }) => self.win_election(epoch, quorum),
            Some(Outcome::Lose {
                epoch,
                quorum,
                leader,
            }) => self.lose_election(epoch, quorum, leader),
            None => {}
        }
    }

    pub(crate) fn win_election(&mut self, epoch: u64, active: BTreeSet<i32>) {
        if self.state != MonState::Electing {
            self.reset();
        }
        self.state = MonState::Leader;
        self.leader_since = Some(Instant::now());
        self.leader = self.rank;
        self.quorum = active;
        self.outside_quorum.clear();
        if let Some(token) = self.election_expire_event.take() {
            self.cancel_timer(token);
        }
        tracing::info!(epoch, quorum = ?self.quorum, "won leader election");

        self.paxos.leader_init();
        for service in &mut self.services {
            service.election_finished();
        }
        self.finish_election();
    }

    pub(crate) fn lose_election(&mut self, epoch: u64, quorum: BTreeSet<i32>, leader: i32) {
        self.state = MonState::Peon;
        self.leader_since = None;
        self.leader = leader;
        self.quorum = quorum;
        self.outside_quorum.clear();
        if let Some(token) = self.election_expire_event.take() {
            self.cancel_timer(token);
        }
        tracing::info!(epoch, leader, quorum = ?self.quorum, "lost election");

        // Everyone currently syncing from us must abort: we no longer speak
        // for the quorum's trim state.
        self.abort_sync_leader_sessions();

        self.paxos.peon_init();
        for service in &mut self.services {
            service.election_finished();
        }
        self.finish_election();
    }

    fn finish_election(&mut self) {
        self.exited_quorum = None;

        if !self.has_ever_joined {
            let mut tx = Transaction::new();
            tx.put_u64(MONITOR_PREFIX, "joined", 1);
            if let Err(err) = self.store.apply_transaction(&tx) {
                tracing::warn!(error = ?err, "failed to persist joined marker");
            } else {
                self.has_ever_joined = true;
            }
        }

        let waiting: Vec<(Instant, Envelope)> = self
            .waitfor_quorum
            .drain(..)
            .chain(self.maybe_wait_for_quorum.drain(..))
            .collect();
        for (stamp, env) in waiting {
            self.dispatch(env, stamp);
        }

        self.resend_routed_requests();

        let num_mon = self.monmap.size();
        let in_quorum = self.quorum.len();
        self.counters.update(num_mon, in_quorum);
        self.counters.register();
        self.check_subs();

        // Am I named properly?
        let my_addr = self.transport.local_addr();
        let cur_name = self.monmap.name_of_addr(my_addr).cloned();
        if cur_name.as_deref() != Some(self.name.as_str()) {
            tracing::debug!(current = ?cur_name, want = %self.name, "renaming myself via join");
            if let Some(&first) = self.quorum.iter().next() {
                if let Some(inst) = self.monmap.get_inst(first) {
                    self.transport.send(
                        inst.addr,
                        MonMessage::Join(MonJoin {
                            fsid: self.monmap.fsid,
                            name: self.name.clone(),
                            addr: my_addr,
                        }),
                    );
                }
            }
        }
    }

    // -- dispatch ----------------------------------------------------------

    fn message_exempt_from_waitlist(msg: &MonMessage) -> bool {
        // Commands must get through under all circumstances; routed replies
        // and forwards only travel between monitors.
        matches!(msg, MonMessage::Command(_))
    }

    pub(crate) fn dispatch(&mut self, env: Envelope, recv_stamp: Instant) {
        if self.state == MonState::Shutdown {
            return;
        }

        let src_is_mon = env.from.is_mon();

        if !self.sessions.contains(env.conn) {
            if self.exited_quorum.is_some()
                && !src_is_mon
                && !Self::message_exempt_from_waitlist(&env.msg)
            {
                // Wait-list sufficiently new sessions until we are back in
                // quorum; everyone else gets sent elsewhere.
                if recv_stamp.elapsed() <= self.cfg.lease {
                    tracing::debug!(from = %env.from, msg = env.msg.type_name(),
                        "waitlisting message until we get in quorum");
                    self.maybe_wait_for_quorum.push((recv_stamp, env));
                } else {
                    tracing::info!(from = %env.from,
                        "discarding message and sending client elsewhere; not in quorum");
                    self.transport.mark_down(env.conn);
                }
                return;
            }
            let session = self.sessions.new_session(env.from, env.conn);
            if src_is_mon {
                session.caps = MonCaps::allow_all();
            } else {
                let mut caps = MonCaps::default();
                caps.allow.insert("r".to_string());
                caps.allow.insert("w".to_string());
                session.caps = caps;
                session.until = Some(Instant::now() + self.cfg.subscribe_interval);
            }
            tracing::debug!(from = %env.from, conn = env.conn, "new session");
        }

        match env.msg.clone() {
            MonMessage::Probe(m) => self.handle_probe(&env, &m),
            MonMessage::Sync(m) => self.handle_sync(&env, m),
            MonMessage::Election(m) => self.handle_election(&env, m),
            MonMessage::Paxos(wire) => self.handle_paxos(&env, wire),
            MonMessage::Command(m) => self.handle_command(env, m, recv_stamp),
            MonMessage::Forward(m) => self.handle_forward(&env, m),
            MonMessage::Route(m) => self.handle_route(&env, m),
            MonMessage::Join(m) => self.handle_join(env, m, recv_stamp),
            MonMessage::Subscribe(m) => self.handle_subscribe(&env, m),
            MonMessage::GetMap => self.send_latest_monmap(env.from.addr),
            MonMessage::GetVersion(m) => self.handle_get_version(&env, m),
            MonMessage::MonMap { .. }
            | MonMessage::CommandAck(_)
            | MonMessage::SubscribeAck(_)
            | MonMessage::GetVersionReply(_) => {
                tracing::trace!(msg = env.msg.type_name(), "ignoring reply-type message");
            }
        }
    }

    fn handle_election(&mut self, env: &Envelope, m: MonElection) {
        if m.fsid != self.monmap.fsid {
            tracing::debug!("election message fsid mismatch");
            return;
        }
        if !env.from.is_mon() {
            tracing::debug!(from = %env.from, "election message from non-monitor");
            return;
        }
        if self.is_probing() || self.is_synchronizing() {
            tracing::debug!("dropping election message while catching up");
            return;
        }
        let from_rank = self.monmap.rank_of_addr(env.from.addr);
        if from_rank < 0 {
            tracing::debug!(from = %env.from, "election message from unknown rank");
            return;
        }
        if self.state != MonState::Electing && matches!(m.op, crate::messages::ElectionOp::Propose)
        {
            // leader|peon -> electing
            self.reset();
            self.state = MonState::Electing;
        }
        let actions = self.elector.handle(self.rank, from_rank, &m, &self.monmap);
        if self.state != MonState::Electing && self.elector.is_electing() {
            self.state = MonState::Electing;
        }
        self.apply_elector_actions(actions);
    }

    fn handle_paxos(&mut self, env: &Envelope, wire: PaxosWire) {
        if !env.from.is_mon() {
            let allowed = self
                .sessions
                .get(env.conn)
                .map(|s| s.caps.check("x"))
                .unwrap_or(false);
            if !allowed {
                tracing::debug!(from = %env.from, "dropping log traffic without caps");
                return;
            }
        }
        if wire.epoch > self.get_epoch() {
            self.bootstrap();
            return;
        }
        if wire.epoch != self.get_epoch() {
            tracing::debug!(msg_epoch = wire.epoch, our_epoch = self.get_epoch(), "stale epoch");
            return;
        }
        let from_rank = self.monmap.rank_of_addr(env.from.addr);
        self.paxos.dispatch(from_rank, wire);
        if self.paxos.is_consistent() {
            for service in &mut self.services {
                service.update_from_paxos(&self.store);
            }
        }
    }

    fn handle_join(&mut self, env: Envelope, m: MonJoin, recv_stamp: Instant) {
        if m.fsid != self.monmap.fsid {
            tracing::debug!("join fsid mismatch");
            return;
        }
        if self.is_leader() {
            for service in &mut self.services {
                if service.service_name() == "monmap" {
                    service.handle_join(&m.name, m.addr);
                }
            }
        } else if self.is_peon() {
            self.forward_request_leader(&env);
        } else {
            self.waitfor_quorum.push((recv_stamp, env));
        }
    }

    fn handle_subscribe(&mut self, env: &Envelope, m: MonSubscribe) {
        tracing::debug!(from = %env.from, topics = m.what.len(), "handle subscribe");
        let Some(session) = self.sessions.get_mut(env.conn) else {
            tracing::debug!("no session, dropping subscribe");
            return;
        };
        session.until = Some(Instant::now() + self.cfg.subscribe_interval);

        let mut reply = false;
        for (topic, item) in &m.what {
            // Non-onetime subscriptions need an ack to start the client's
            // resubscribe timer.
            if !item.onetime {
                reply = true;
            }
            self.sessions
                .add_update_sub(env.conn, topic, item.start, item.onetime);
            if topic == "monmap" {
                self.check_sub(env.conn);
            }
        }

        if reply {
            let interval = self.cfg.subscribe_interval.as_secs() as u32;
            self.transport.send(
                env.from.addr,
                MonMessage::SubscribeAck(MonSubscribeAck {
                    fsid: self.monmap.fsid,
                    interval_secs: interval,
                }),
            );
        }
    }

    /// Push the latest monmap to one subscriber if its cursor is behind.
    fn check_sub(&mut self, conn: ConnId) {
        let epoch = self.monmap.epoch;
        let Some(session) = self.sessions.get_mut(conn) else {
            return;
        };
        let Some(sub) = session.subs.get_mut("monmap") else {
            return;
        };
        if sub.next > epoch {
            return;
        }
        let onetime = sub.onetime;
        if onetime {
            session.subs.remove("monmap");
        } else {
            sub.next = epoch + 1;
        }
        let addr = session.inst.addr;
        self.send_latest_monmap(addr);
    }

    /// Re-check every monmap subscriber (after a map change).
    pub(crate) fn check_subs(&mut self) {
        for conn in self.sessions.subscribers("monmap") {
            self.check_sub(conn);
        }
    }

    fn send_latest_monmap(&self, addr: SocketAddr) {
        self.transport.send(
            addr,
            MonMessage::MonMap {
                monmap_bytes: self.monmap.encode(),
            },
        );
    }

    fn handle_get_version(&mut self, env: &Envelope, m: MonGetVersion) {
        let (version, oldest) = if m.what == "monmap" {
            let oldest = self
                .services
                .iter()
                .find(|s| s.service_name() == "monmap")
                .map(|s| s.first_committed())
                .unwrap_or(0);
            (self.monmap.epoch, oldest)
        } else if let Some(service) = self
            .services
            .iter()
            .find(|s| s.service_name() == m.what)
        {
            (service.version(), service.first_committed())
        } else {
            tracing::warn!(what = %m.what, "invalid map type in get-version");
            (0, 0)
        };
        self.transport.send(
            env.from.addr,
            MonMessage::GetVersionReply(MonGetVersionReply {
                handle: m.handle,
                version,
                oldest_version: oldest,
            }),
        );
    }

    fn conn_reset(&mut self, conn: ConnId) {
        if self.state == MonState::Shutdown {
            return;
        }
        let Some(session) = self.sessions.get(conn) else {
            return;
        };
        // Lossless monitor sessions ride out resets.
        if session.inst.is_mon() {
            return;
        }
        tracing::debug!(conn, inst = %session.inst, "reset/close on session");
        self.remove_session(conn);
    }

    // -- commands ----------------------------------------------------------

    fn handle_command(&mut self, env: Envelope, m: MonCommand, recv_stamp: Instant) {
        if m.fsid != self.monmap.fsid {
            tracing::debug!(fsid = %m.fsid, "command fsid mismatch");
            self.reply_command(&env, &m, -1, "wrong fsid".to_string(), Vec::new());
            return;
        }
        let Some(session) = self.sessions.get(env.conn) else {
            self.reply_command(&env, &m, -13, "access denied".to_string(), Vec::new());
            return;
        };
        let caps = session.caps.clone();
        let access_r = caps.allow_all || caps.check("r");
        let access_all = caps.allow_all;

        if m.cmd.is_empty() {
            self.reply_command(&env, &m, -22, "unrecognized command".to_string(), Vec::new());
            return;
        }
        tracing::debug!(cmd = ?m.cmd, from = %env.from, "handle command");

        let word = m.cmd[0].as_str();

        // Service-addressed writes must run at the leader.
        if self.services.iter().any(|s| s.service_name() == word) {
            if !caps.check("w") && !access_all {
                self.reply_command(&env, &m, -13, "access denied".to_string(), Vec::new());
                return;
            }
            if self.is_leader() {
                let (code, rs) = self
                    .services
                    .iter_mut()
                    .find(|s| s.service_name() == word)
                    .map(|s| s.dispatch_command(&m.cmd))
                    .unwrap_or((-22, "unrecognized command".to_string()));
                self.reply_command(&env, &m, code, rs, Vec::new());
            } else if self.is_peon() {
                self.forward_request_leader(&env);
            } else {
                self.waitfor_quorum.push((recv_stamp, env));
            }
            return;
        }

        let (code, rs, data): (i32, String, Vec<u8>) = match word {
            "fsid" => (0, self.monmap.fsid.to_string(), Vec::new()),
            "log" => {
                if !access_r {
                    (-13, "access denied".to_string(), Vec::new())
                } else {
                    tracing::info!(entry = m.cmd[1..].join(" "), "cluster log");
                    (0, "ok".to_string(), Vec::new())
                }
            }
            "injectargs" => {
                if !access_all {
                    (-13, "access denied".to_string(), Vec::new())
                } else if m.cmd.len() == 2 {
                    let mut all_known = true;
                    for pair in m.cmd[1].split_whitespace() {
                        match pair.split_once('=') {
                            Some((key, value)) => {
                                if !self.cfg.inject(key.trim_start_matches("--"), value) {
                                    all_known = false;
                                }
                            }
                            None => all_known = false,
                        }
                    }
                    if all_known {
                        (0, "parsed options".to_string(), Vec::new())
                    } else {
                        (-22, "failed to parse some options".to_string(), Vec::new())
                    }
                } else {
                    (
                        -22,
                        "must supply options to be parsed in a single string".to_string(),
                        Vec::new(),
                    )
                }
            }
            "status" => {
                if !access_r {
                    (-13, "access denied".to_string(), Vec::new())
                } else {
                    (0, self.status_text(), Vec::new())
                }
            }
            "health" => {
                if !access_r {
                    (-13, "access denied".to_string(), Vec::new())
                } else {
                    let want_detail = m.cmd.get(1).map(|s| s == "detail").unwrap_or(false);
                    let (line, detail) = collect_health(&self.services, want_detail);
                    (0, line, detail.join("\n").into_bytes())
                }
            }
            "mon_status" => {
                if !access_r {
                    (-13, "access denied".to_string(), Vec::new())
                } else {
                    (0, self.mon_status_text(), Vec::new())
                }
            }
            "quorum_status" => {
                if !access_r {
                    (-13, "access denied".to_string(), Vec::new())
                } else if !self.is_leader() && !self.is_peon() {
                    tracing::debug!("waiting for quorum");
                    self.waitfor_quorum.push((recv_stamp, env));
                    return;
                } else {
                    (0, self.quorum_status_text(), Vec::new())
                }
            }
            "sync_status" => {
                if !access_r {
                    (-13, "access denied".to_string(), Vec::new())
                } else {
                    (0, self.sync_status_text(), Vec::new())
                }
            }
            "sync" => {
                if !access_r {
                    (-13, "access denied".to_string(), Vec::new())
                } else {
                    match m.cmd.get(1).map(String::as_str) {
                        Some("status") => (0, self.sync_status_text(), Vec::new()),
                        Some("force") => (0, self.sync_force(), Vec::new()),
                        _ => (-22, "unknown command".to_string(), Vec::new()),
                    }
                }
            }
            "add_bootstrap_peer_hint" => match m.cmd.get(1) {
                Some(raw) => {
                    let (code, rs) = self.add_bootstrap_peer_hint(raw);
                    (code, rs, Vec::new())
                }
                None => (
                    -22,
                    "syntax is 'add_bootstrap_peer_hint ip[:port]'".to_string(),
                    Vec::new(),
                ),
            },
            "quorum" => {
                if !access_all {
                    (-13, "access denied".to_string(), Vec::new())
                } else {
                    match m.cmd.get(1).map(String::as_str) {
                        Some("exit") => {
                            self.reset();
                            self.start_election();
                            self.elector.stop_participating();
                            (
                                0,
                                "stopped responding to quorum, initiated new election".to_string(),
                                Vec::new(),
                            )
                        }
                        Some("enter") => {
                            self.elector.start_participating();
                            self.reset();
                            self.start_election();
                            (
                                0,
                                "started responding to quorum, initiated new election".to_string(),
                                Vec::new(),
                            )
                        }
                        _ => (
                            -22,
                            "unknown quorum subcommand; use exit or enter".to_string(),
                            Vec::new(),
                        ),
                    }
                }
            }
            _ => (-22, "unrecognized command".to_string(), Vec::new()),
        };

        self.reply_command(&env, &m, code, rs, data);
    }

    fn reply_command(
        &mut self,
        env: &Envelope,
        m: &MonCommand,
        code: i32,
        rs: String,
        data: Vec<u8>,
    ) {
        // Don't reply to mon -> mon commands.
        if env.from.is_mon() {
            return;
        }
        let ack = MonMessage::CommandAck(MonCommandAck {
            cmd: m.cmd.clone(),
            code,
            rs,
            version: 0,
            data,
        });
        self.send_reply(env.conn, ack);
    }

    fn sync_force(&mut self) -> String {
        let mut tx = Transaction::new();
        tx.put_u64(SYNC_PREFIX, "force_sync", 1);
        match self.store.apply_transaction(&tx) {
            Ok(()) => "forcing store sync the next time the monitor starts".to_string(),
            Err(err) => format!("failed to set force_sync: {err}"),
        }
    }

    fn add_bootstrap_peer_hint(&mut self, raw: &str) -> (i32, String) {
        if self.is_leader() || self.is_peon() {
            return (0, "mon already active; ignoring bootstrap hint".to_string());
        }
        match raw.parse::<SocketAddr>() {
            Ok(addr) => {
                self.extra_probe_peers.insert(addr);
                (0, format!("adding peer {addr} to list: {:?}", self.extra_probe_peers))
            }
            Err(_) => (-22, format!("failed to parse addr '{raw}'")),
        }
    }

    // -- status output ------------------------------------------------------

    fn mon_status_text(&self) -> String {
        let mut obj = json!({
            "name": self.name,
            "rank": self.rank,
            "state": self.state.name(),
            "election_epoch": self.get_epoch(),
            "has_ever_joined": self.has_ever_joined,
            "quorum": self.quorum.iter().collect::<Vec<_>>(),
            "outside_quorum": self.outside_quorum.iter().collect::<Vec<_>>(),
            "routed_requests": self.routed_requests.len(),
            "features": serde_json::to_value(&self.compat).unwrap_or_default(),
            "monmap": serde_json::to_value(&self.monmap).unwrap_or_default(),
        });
        if self.is_leader() {
            if let Some(since) = self.leader_since {
                obj["leader_since_secs"] = json!(since.elapsed().as_secs());
            }
        }
        if self.is_synchronizing() {
            if let Some(leader) = &self.sync_leader {
                obj["sync_leader"] = json!(leader.entity.to_string());
            }
            if let Some(provider) = &self.sync_provider {
                obj["sync_provider"] = json!(provider.entity.to_string());
            }
        }
        serde_json::to_string_pretty(&obj).unwrap_or_default()
    }

    fn quorum_status_text(&self) -> String {
        let obj = json!({
            "election_epoch": self.get_epoch(),
            "quorum": self.quorum.iter().collect::<Vec<_>>(),
            "monmap": serde_json::to_value(&self.monmap).unwrap_or_default(),
        });
        serde_json::to_string_pretty(&obj).unwrap_or_default()
    }

    fn sync_status_text(&self) -> String {
        let mut obj = json!({
            "state": self.state.name(),
            "paxos_version": self.paxos.get_version(),
        });
        if self.is_leader() || (self.sync_role & SYNC_ROLE_LEADER) != 0 {
            obj["trim"] = json!({
                "disabled": self.paxos.is_trim_disabled(),
                "should_trim": self.paxos.should_trim(),
                "mons": self
                    .trim_timeouts
                    .keys()
                    .map(|e| e.to_string())
                    .collect::<Vec<_>>(),
            });
        }
        if !self.sync_entities.is_empty() || (self.sync_role & SYNC_ROLE_PROVIDER) != 0 {
            obj["on_going"] = json!(self
                .sync_entities
                .keys()
                .map(|e| e.to_string())
                .collect::<Vec<_>>());
        }
        if self.is_synchronizing() || (self.sync_role & SYNC_ROLE_REQUESTER) != 0 {
            obj["leader"] = json!(self
                .sync_leader
                .as_ref()
                .map(|p| p.entity.to_string()));
            obj["provider"] = json!(self
                .sync_provider
                .as_ref()
                .map(|p| p.entity.to_string()));
        }
        serde_json::to_string_pretty(&obj).unwrap_or_default()
    }

    fn status_text(&self) -> String {
        let (health_line, _) = collect_health(&self.services, false);
        let mut out = String::new();
        out.push_str(&format!("   health {health_line}\n"));
        out.push_str(&format!(
            "   monmap e{}: {} mons, quorum {:?}\n",
            self.monmap.epoch,
            self.monmap.size(),
            self.quorum
        ));
        for service in &self.services {
            if service.service_name() == "monmap" {
                continue;
            }
            out.push_str(&format!("   {}\n", service.summary_line()));
        }
        out
    }

    /// Admin-surface command execution (no session, full caps).
    fn do_admin_command(&mut self, cmd: Vec<String>) -> (i32, String) {
        if cmd.is_empty() {
            return (-22, "no command".to_string());
        }
        match cmd[0].as_str() {
            "mon_status" => (0, self.mon_status_text()),
            "quorum_status" => (0, self.quorum_status_text()),
            "sync_status" => (0, self.sync_status_text()),
            "sync_force" => (0, self.sync_force()),
            "status" => (0, self.status_text()),
            "health" => {
                let want_detail = cmd.get(1).map(|s| s == "detail").unwrap_or(false);
                let (line, detail) = collect_health(&self.services, want_detail);
                if detail.is_empty() {
                    (0, line)
                } else {
                    (0, format!("{line}\n{}", detail.join("\n")))
                }
            }
            "fsid" => (0, self.monmap.fsid.to_string()),
            "injectargs" => {
                if cmd.len() != 2 {
                    return (-22, "must supply options in a single string".to_string());
                }
                let mut ok = true;
                for pair in cmd[1].split_whitespace() {
                    match pair.split_once('=') {
                        Some((key, value)) => {
                            if !self.cfg.inject(key.trim_start_matches("--"), value) {
                                ok = false;
                            }
                        }
                        None => ok = false,
                    }
                }
                if ok {
                    (0, "parsed options".to_string())
                } else {
                    (-22, "failed to parse some options".to_string())
                }
            }
            "add_bootstrap_peer_hint" => match cmd.get(1) {
                Some(raw) => self.add_bootstrap_peer_hint(raw),
                None => (-22, "syntax is 'add_bootstrap_peer_hint ip[:port]'".to_string()),
            },
            "quorum" => match cmd.get(1).map(String::as_str) {
                Some("exit") => {
                    self.reset();
                    self.start_election();
                    self.elector.stop_participating();
                    (0, "stopped responding to quorum".to_string())
                }
                Some("enter") => {
                    self.elector.start_participating();
                    self.reset();
                    self.start_election();
                    (0, "started responding to quorum".to_string())
                }
                _ => (-22, "unknown quorum subcommand; use exit or enter".to_string()),
            },
            _ => (-22, "unrecognized command".to_string()),
        }
    }

    // -- tick --------------------------------------------------------------

    fn new_tick(&mut self) {
        if let Some(token) = self.tick_event.take() {
            self.cancel_timer(token);
        }
        let after = self.cfg.tick_interval;
        let token = self.arm_timer(TimerKind::Tick, after);
        self.tick_event = Some(token);
    }

    fn tick(&mut self) {
        tracing::trace!("tick");
        for service in &mut self.services {
            service.tick();
        }

        // Trim sessions; monitors are exempt.
        let now = Instant::now();
        for conn in self.sessions.conns() {
            let Some(session) = self.sessions.get(conn) else {
                continue;
            };
            if session.inst.is_mon() {
                continue;
            }
            let idle_expired = session.until.map(|until| until < now).unwrap_or(false);
            let out_too_long = self
                .exited_quorum
                .map(|exited| now > exited + 2 * self.cfg.lease)
                .unwrap_or(false);
            if idle_expired || out_too_long {
                tracing::debug!(inst = %session.inst, idle_expired, out_too_long, "trimming session");
                let addr = session.inst.addr;
                self.transport.mark_down_addr(addr);
                self.remove_session(conn);
            }
        }

        // Re-drive waitlisted messages; dispatch re-drops the ones that aged
        // out of the lease window.
        if !self.maybe_wait_for_quorum.is_empty() {
            let waiting: Vec<(Instant, Envelope)> = self.maybe_wait_for_quorum.drain(..).collect();
            for (stamp, env) in waiting {
                if stamp.elapsed() > self.cfg.lease && self.exited_quorum.is_some() {
                    tracing::debug!(from = %env.from, "dropping aged waitlisted message");
                    self.transport.mark_down(env.conn);
                } else {
                    self.dispatch(env, stamp);
                }
            }
        }

        if self.state != MonState::Shutdown {
            self.new_tick();
        }
    }

    fn on_timer(&mut self, token: TimerToken) {
        // A token missing from the table was cancelled; firing is a no-op.
        let Some(kind) = self.timers.remove(&token) else {
            return;
        };
        match kind {
            TimerKind::Tick => self.tick(),
            TimerKind::ProbeTimeout => self.probe_timeout(),
            TimerKind::ElectionExpire => {
                self.election_expire_event = None;
                let actions = self.elector.expire(self.rank, &self.monmap);
                self.apply_elector_actions(actions);
            }
            TimerKind::TrimTimeout(entity) => self.sync_finish(entity, true),
            TimerKind::TrimEnable => {
                self.trim_enable_event = None;
                self.paxos.trim_enable();
            }
            TimerKind::SyncStartReplyTimeout => self.sync_start_reply_timeout(),
            TimerKind::SyncFinishReplyTimeout => self.sync_finish_reply_timeout(),
            TimerKind::SyncStartRetry(entity) => self.sync_start(entity),
            TimerKind::HeartbeatInterval => self.sync_heartbeat_interval_fired(),
            TimerKind::HeartbeatTimeout => self.sync_heartbeat_timeout_fired(),
            TimerKind::SyncTimeout(entity) => self.sync_timeout(entity),
        }
    }

    // -- event loop --------------------------------------------------------

    /// Initialize and run until shutdown. This task is the serialization
    /// point for all monitor state.
    pub async fn run(mut self, mut rx: UnboundedReceiver<Event>) -> anyhow::Result<()> {
        self.init()?;

        while let Some(event) = rx.recv().await {
            match event {
                Event::Deliver(env) => {
                    let stamp = Instant::now();
                    self.dispatch(env, stamp);
                }
                Event::ConnReset(conn) => self.conn_reset(conn),
                Event::Timer(token) => self.on_timer(token),
                Event::Admin { cmd, reply } => {
                    let result = self.do_admin_command(cmd);
                    let _ = reply.send(result);
                }
                Event::Shutdown(ack) => {
                    self.shutdown();
                    if let Some(ack) = ack {
                        let _ = ack.send(());
                    }
                    break;
                }
            }
            if self.state == MonState::Shutdown {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use uuid::Uuid;

    #[test]
    fn feature_compat_round_trips() {
        let set = mon_feature_compat_set();
        let bytes = serde_json::to_vec(&set).unwrap();
        let got: FeatureCompat = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(got, set);
        assert!(got.incompat.contains("initial feature set"));
    }

    #[test]
    fn mkfs_writes_seed_blobs() {
        let dir = TempDir::new().unwrap();
        let store = MonStore::open(dir.path()).unwrap();
        let mut map = MonMap::new(Uuid::new_v4());
        map.add("a", "127.0.0.1:6789".parse().unwrap());
        map.epoch = 3;

        mkfs(&store, &map, b"keyring blob", Some(b"diskmap blob")).unwrap();

        let magic = store.get(MONITOR_PREFIX, "magic").unwrap().unwrap();
        assert!(String::from_utf8_lossy(&magic).starts_with(MAGIC));
        assert!(store.exists(MONITOR_PREFIX, "compat_set").unwrap());
        assert_eq!(
            store.get(MKFS_PREFIX, "keyring").unwrap().unwrap(),
            b"keyring blob".to_vec()
        );
        assert!(store.exists(MKFS_PREFIX, "diskmap").unwrap());

        // The seed map is stored at epoch 0 regardless of the input epoch.
        let loaded = load_monmap(&store).unwrap().unwrap();
        assert_eq!(loaded.epoch, 0);
        assert_eq!(loaded.fsid, map.fsid);
        assert!(loaded.contains("a"));
    }

    #[test]
    fn load_monmap_prefers_committed_map() {
        let dir = TempDir::new().unwrap();
        let store = MonStore::open(dir.path()).unwrap();
        let mut seed = MonMap::new(Uuid::nil());
        seed.add("a", "127.0.0.1:6789".parse().unwrap());
        mkfs(&store, &seed, b"k", None).unwrap();

        let mut committed = seed.clone();
        committed.epoch = 7;
        let mut tx = Transaction::new();
        tx.put("monmap", "latest", committed.encode());
        store.apply_transaction(&tx).unwrap();

        let loaded = load_monmap(&store).unwrap().unwrap();
        assert_eq!(loaded.epoch, 7);
    }
}
