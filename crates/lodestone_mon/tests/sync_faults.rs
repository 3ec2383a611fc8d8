//! Sync failure recovery: a leader that dies mid-protocol, and the
//! two-monitor no-alternative abort policy.
//!
//! The "leader" here is a scripted mesh endpoint the test drives by hand,
//! which pins the failure to an exact protocol step: it answers the probe
//! and the sync start, then goes silent forever.

mod common;

use std::collections::BTreeSet;
use std::time::Duration;

use tempfile::TempDir;
use uuid::Uuid;

use common::*;
use lodestone_mon::messages::{
    EntityInst, MonMessage, MonProbe, MonSync, ProbeOp, SyncOp,
};
use lodestone_mon::monmap::MonMap;
use lodestone_mon::transport::LocalMesh;

/// Answer probes and the first sync start on behalf of a fake quorum
/// leader, then fall silent.
async fn run_scripted_leader(
    client: &mut TestClient,
    map: &MonMap,
    name: &str,
    paxos_first: u64,
    paxos_last: u64,
) {
    let mut quorum = BTreeSet::new();
    quorum.insert(0);
    loop {
        let Some(msg) = client.recv(Duration::from_secs(30)).await else {
            panic!("scripted leader never saw a sync start");
        };
        match msg {
            MonMessage::Probe(probe) if probe.op == ProbeOp::Probe => {
                let reply = MonProbe {
                    fsid: map.fsid,
                    op: ProbeOp::Reply,
                    name: name.to_string(),
                    has_ever_joined: true,
                    quorum: quorum.clone(),
                    monmap_bytes: map.encode(),
                    paxos_first,
                    paxos_last,
                };
                // The prober is the only other endpoint talking to us.
                client.send(
                    map.addr_of(&probe.name).expect("prober in map"),
                    MonMessage::Probe(reply),
                );
            }
            MonMessage::Sync(sync) if sync.op == SyncOp::Start => {
                // Reply, then die: the requester is now committed to a sync
                // against a leader that will never speak again.
                let requester = sync.reply_to.map(|inst| inst.addr);
                let reply = MonSync::new(SyncOp::StartReply);
                if let Some(addr) = requester {
                    client.send(addr, MonMessage::Sync(reply));
                } else {
                    // Direct start: the sender is the requester. We cannot
                    // see the sender address from the payload alone, so
                    // answer every member; strays are dropped.
                    for member in map.names() {
                        if member != name {
                            if let Some(addr) = map.addr_of(member) {
                                client.send(addr, MonMessage::Sync(reply.clone()));
                            }
                        }
                    }
                }
                return;
            }
            _ => {}
        }
    }
}

#[tokio::test]
async fn leader_death_after_start_reply_recovers() {
    let mesh = LocalMesh::new();
    let fsid = Uuid::new_v4();
    let map = seed_map(fsid, &["a", "b", "c", "d"]);
    let a_addr = map.addr_of("a").unwrap();

    let mut fake_leader = TestClient::new(&mesh, EntityInst::mon(0, a_addr));

    // d boots alone against the scripted leader.
    let dir = TempDir::new().unwrap();
    format_empty(&dir, &map);
    let mut d = spawn_mon(&mesh, &map, "d", dir, fast_config()).await;

    run_scripted_leader(&mut fake_leader, &map, "a", 750, 1000).await;

    // d is now synchronizing against a dead leader. Bring up the real
    // monitors; d's timeouts abort the doomed sync, it re-bootstraps, and
    // re-syncs against a live peer.
    let mut mons = Vec::new();
    for name in ["b", "c"] {
        let dir = TempDir::new().unwrap();
        format_and_seed(&dir, &map, 750, 1000, 250);
        mons.push(spawn_mon(&mesh, &map, name, dir, fast_config()).await);
    }

    // Quorum of three forms out of the four-member map, without "a".
    wait_for_quorum(&d, 3).await;
    for mon in &mons {
        wait_for_quorum(mon, 3).await;
    }

    let (code, body) = d.admin(&["sync_status"]).await;
    assert_eq!(code, 0);
    let sync: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(sync["paxos_version"], 1000);

    let status = d.mon_status().await;
    assert!(!status["quorum"]
        .as_array()
        .unwrap()
        .iter()
        .any(|rank| *rank == 0), "dead leader cannot be in the quorum");

    fake_leader.disconnect();
    for mon in &mut mons {
        mon.shutdown().await;
    }
    d.shutdown().await;
}

#[tokio::test]
async fn two_monitor_cluster_gives_up_without_alternative() {
    let mesh = LocalMesh::new();
    let fsid = Uuid::new_v4();
    let map = seed_map(fsid, &["a", "b"]);
    let a_addr = map.addr_of("a").unwrap();

    let mut fake_leader = TestClient::new(&mesh, EntityInst::mon(0, a_addr));

    let dir = TempDir::new().unwrap();
    format_empty(&dir, &map);
    let mut b = spawn_mon(&mesh, &map, "b", dir, fast_config()).await;

    run_scripted_leader(&mut fake_leader, &map, "a", 750, 1000).await;

    // b has entered the requester role against the silent leader.
    wait_for_status(&b, "synchronizing", |status| {
        status["state"] == "synchronizing"
    })
    .await;

    // With only two monitors there is no alternative provider: the first
    // chunk timeout aborts the whole attempt instead of retrying.
    wait_for_status(&b, "back to probing", |status| status["state"] == "probing").await;
    let (code, body) = b.admin(&["sync_status"]).await;
    assert_eq!(code, 0);
    let sync: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(sync["state"], "probing");
    assert_eq!(sync["paxos_version"], 0);

    fake_leader.disconnect();
    b.shutdown().await;
}
