//! Wire payloads exchanged between monitors, daemons, and clients.
//!
//! Framing and transport are outside this crate; every payload here is a
//! plain serde type and `encode_message`/`decode_message` are the only codec
//! entry points, so the whole protocol round-trips by construction.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What kind of entity sits on the far end of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Mon,
    Daemon,
    Client,
}

/// Identity plus address of a peer. Monitors use their rank as `id`; `-1`
/// means the rank is unknown (not yet a map member).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityInst {
    pub kind: EntityKind,
    pub id: i64,
    pub addr: SocketAddr,
}

impl EntityInst {
    pub fn mon(rank: i64, addr: SocketAddr) -> Self {
        Self {
            kind: EntityKind::Mon,
            id: rank,
            addr,
        }
    }

    pub fn client(id: i64, addr: SocketAddr) -> Self {
        Self {
            kind: EntityKind::Client,
            id,
            addr,
        }
    }

    pub fn is_mon(&self) -> bool {
        self.kind == EntityKind::Mon
    }
}

impl fmt::Display for EntityInst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            EntityKind::Mon => "mon",
            EntityKind::Daemon => "daemon",
            EntityKind::Client => "client",
        };
        write!(f, "{kind}.{}@{}", self.id, self.addr)
    }
}

/// The all-zero address used for seed-map members whose location is unknown.
pub fn blank_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
}

/// Capabilities carried by a session and inside forwarded requests.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonCaps {
    pub allow_all: bool,
    pub allow: BTreeSet<String>,
}

impl MonCaps {
    pub fn allow_all() -> Self {
        Self {
            allow_all: true,
            allow: BTreeSet::new(),
        }
    }

    pub fn check(&self, what: &str) -> bool {
        self.allow_all || self.allow.contains(what)
    }
}

/// A `(prefix, key)` position inside the store, used as the sync cursor.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StoreKey {
    pub prefix: String,
    pub key: String,
}

impl StoreKey {
    pub fn new(prefix: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            key: key.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.prefix.is_empty() && self.key.is_empty()
    }
}

// ---------------------------------------------------------------------------
// probe

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbeOp {
    Probe,
    Reply,
}

/// Peer discovery message. `Probe` carries only identity; `Reply` adds the
/// responder's quorum view, encoded membership map, and log version range.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MonProbe {
    pub fsid: Uuid,
    pub op: ProbeOp,
    pub name: String,
    pub has_ever_joined: bool,
    pub quorum: BTreeSet<i32>,
    pub monmap_bytes: Vec<u8>,
    pub paxos_first: u64,
    pub paxos_last: u64,
}

impl MonProbe {
    pub fn probe(fsid: Uuid, name: impl Into<String>, has_ever_joined: bool) -> Self {
        Self {
            fsid,
            op: ProbeOp::Probe,
            name: name.into(),
            has_ever_joined,
            quorum: BTreeSet::new(),
            monmap_bytes: Vec::new(),
            paxos_first: 0,
            paxos_last: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// store sync

pub const SYNC_FLAG_LAST: u8 = 0x01;
pub const SYNC_FLAG_RETRY: u8 = 0x02;
pub const SYNC_FLAG_REPLY_TO: u8 = 0x04;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncOp {
    Start = 1,
    StartReply = 2,
    Heartbeat = 3,
    HeartbeatReply = 4,
    Finish = 5,
    StartChunks = 6,
    Chunk = 7,
    ChunkReply = 8,
    FinishReply = 9,
    Abort = 10,
}

impl SyncOp {
    pub fn name(self) -> &'static str {
        match self {
            SyncOp::Start => "start",
            SyncOp::StartReply => "start_reply",
            SyncOp::Heartbeat => "heartbeat",
            SyncOp::HeartbeatReply => "heartbeat_reply",
            SyncOp::Finish => "finish",
            SyncOp::StartChunks => "start_chunks",
            SyncOp::Chunk => "chunk",
            SyncOp::ChunkReply => "chunk_reply",
            SyncOp::FinishReply => "finish_reply",
            SyncOp::Abort => "abort",
        }
    }
}

/// Store-sync protocol message. Only chunks populate `chunk_bytes`/`last_key`;
/// `reply_to` rides along when a start bounced through a non-leader.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MonSync {
    pub op: SyncOp,
    pub flags: u8,
    pub version: u64,
    pub chunk_bytes: Vec<u8>,
    pub last_key: StoreKey,
    pub crc: Option<u32>,
    pub reply_to: Option<EntityInst>,
}

impl MonSync {
    pub fn new(op: SyncOp) -> Self {
        Self {
            op,
            flags: 0,
            version: 0,
            chunk_bytes: Vec::new(),
            last_key: StoreKey::default(),
            crc: None,
            reply_to: None,
        }
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

impl fmt::Display for MonSync {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mon_sync({}", self.op.name())?;
        if self.version > 0 {
            write!(f, " v{}", self.version)?;
        }
        if self.has_flag(SYNC_FLAG_LAST) {
            write!(f, " last")?;
        }
        if self.has_flag(SYNC_FLAG_RETRY) {
            write!(f, " retry")?;
        }
        if !self.chunk_bytes.is_empty() {
            write!(f, " bl {} bytes", self.chunk_bytes.len())?;
        }
        if !self.last_key.is_empty() {
            write!(f, " last_key ({},{})", self.last_key.prefix, self.last_key.key)?;
        }
        write!(f, ")")
    }
}

// ---------------------------------------------------------------------------
// election

/// Rank election traffic. Epochs are odd while an election is in flight and
/// bumped to even on victory.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ElectionOp {
    Propose,
    Ack,
    Victory { quorum: BTreeSet<i32> },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MonElection {
    pub fsid: Uuid,
    pub epoch: u64,
    pub op: ElectionOp,
}

// ---------------------------------------------------------------------------
// commands, routing, subscriptions

/// Textual command addressed to the cluster (admin or service write).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MonCommand {
    pub fsid: Uuid,
    pub cmd: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MonCommandAck {
    pub cmd: Vec<String>,
    pub code: i32,
    pub rs: String,
    pub version: u64,
    pub data: Vec<u8>,
}

/// Write-class request forwarded from a contact monitor to the leader.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MForward {
    pub tid: u64,
    pub client: EntityInst,
    pub client_caps: MonCaps,
    pub msg_bytes: Vec<u8>,
}

/// Reply routed from the leader back through the contact monitor. A zero
/// `tid` means "not a routed request; deliver straight to `dest`".
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MRoute {
    pub tid: u64,
    pub dest: Option<EntityInst>,
    pub msg_bytes: Vec<u8>,
}

/// Member (or member-to-be) asking the quorum to record its name/address.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MonJoin {
    pub fsid: Uuid,
    pub name: String,
    pub addr: SocketAddr,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeItem {
    pub start: u64,
    pub onetime: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MonSubscribe {
    pub what: BTreeMap<String, SubscribeItem>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MonSubscribeAck {
    pub fsid: Uuid,
    pub interval_secs: u32,
}

/// Version query for a named map, answered without touching quorum state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MonGetVersion {
    pub what: String,
    pub handle: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MonGetVersionReply {
    pub handle: u64,
    pub version: u64,
    pub oldest_version: u64,
}

/// Opaque consensus traffic supervised (but not interpreted) by the monitor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PaxosWire {
    pub epoch: u64,
    pub data: Vec<u8>,
}

// ---------------------------------------------------------------------------
// envelope

/// Every payload a monitor can receive or send.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum MonMessage {
    Probe(MonProbe),
    Sync(MonSync),
    Election(MonElection),
    Command(MonCommand),
    CommandAck(MonCommandAck),
    Forward(MForward),
    Route(MRoute),
    Join(MonJoin),
    Subscribe(MonSubscribe),
    SubscribeAck(MonSubscribeAck),
    GetMap,
    MonMap { monmap_bytes: Vec<u8> },
    GetVersion(MonGetVersion),
    GetVersionReply(MonGetVersionReply),
    Paxos(PaxosWire),
}

impl MonMessage {
    pub fn type_name(&self) -> &'static str {
        match self {
            MonMessage::Probe(_) => "mon_probe",
            MonMessage::Sync(_) => "mon_sync",
            MonMessage::Election(_) => "mon_election",
            MonMessage::Command(_) => "mon_command",
            MonMessage::CommandAck(_) => "mon_command_ack",
            MonMessage::Forward(_) => "forward",
            MonMessage::Route(_) => "route",
            MonMessage::Join(_) => "mon_join",
            MonMessage::Subscribe(_) => "mon_subscribe",
            MonMessage::SubscribeAck(_) => "mon_subscribe_ack",
            MonMessage::GetMap => "mon_get_map",
            MonMessage::MonMap { .. } => "mon_map",
            MonMessage::GetVersion(_) => "mon_get_version",
            MonMessage::GetVersionReply(_) => "mon_get_version_reply",
            MonMessage::Paxos(_) => "paxos",
        }
    }
}

/// Encode a message for forwarding or routing. The same encoding is used for
/// the `msg_bytes` field of `MForward`/`MRoute`.
pub fn encode_message(msg: &MonMessage) -> Vec<u8> {
    serde_json::to_vec(msg).expect("message types always serialize")
}

pub fn decode_message(bytes: &[u8]) -> anyhow::Result<MonMessage> {
    Ok(serde_json::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn sync_message_round_trips() {
        let mut m = MonSync::new(SyncOp::Chunk);
        m.flags = SYNC_FLAG_LAST;
        m.version = 42;
        m.chunk_bytes = vec![1, 2, 3];
        m.last_key = StoreKey::new("paxos", "000017");
        m.crc = Some(0xdead_beef);
        let bytes = encode_message(&MonMessage::Sync(m.clone()));
        match decode_message(&bytes).unwrap() {
            MonMessage::Sync(got) => assert_eq!(got, m),
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn probe_message_round_trips() {
        let mut m = MonProbe::probe(Uuid::new_v4(), "a", true);
        m.op = ProbeOp::Reply;
        m.quorum = [0, 2].into_iter().collect();
        m.monmap_bytes = vec![9; 16];
        m.paxos_first = 5;
        m.paxos_last = 1000;
        let bytes = encode_message(&MonMessage::Probe(m.clone()));
        match decode_message(&bytes).unwrap() {
            MonMessage::Probe(got) => assert_eq!(got, m),
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn forward_and_route_round_trip() {
        let inner = MonMessage::Command(MonCommand {
            fsid: Uuid::nil(),
            cmd: vec!["diskmap".into(), "poke".into()],
        });
        let fwd = MonMessage::Forward(MForward {
            tid: 7,
            client: EntityInst::client(11, addr(9000)),
            client_caps: MonCaps::allow_all(),
            msg_bytes: encode_message(&inner),
        });
        let bytes = encode_message(&fwd);
        let MonMessage::Forward(got) = decode_message(&bytes).unwrap() else {
            panic!("expected forward");
        };
        assert_eq!(got.tid, 7);
        assert_eq!(decode_message(&got.msg_bytes).unwrap(), inner);

        let route = MonMessage::Route(MRoute {
            tid: 7,
            dest: None,
            msg_bytes: got.msg_bytes.clone(),
        });
        let bytes = encode_message(&route);
        match decode_message(&bytes).unwrap() {
            MonMessage::Route(r) => assert_eq!(r.tid, 7),
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn sync_flags_display() {
        let mut m = MonSync::new(SyncOp::StartReply);
        m.flags = SYNC_FLAG_RETRY;
        assert!(m.has_flag(SYNC_FLAG_RETRY));
        assert!(!m.has_flag(SYNC_FLAG_LAST));
        assert!(format!("{m}").contains("retry"));
    }
}
