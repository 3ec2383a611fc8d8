//! Request routing and session scenarios: forwarding client writes from a
//! peon to the leader, routed replies, session close, and subscriptions.

mod common;

use std::collections::BTreeMap;
use std::time::Duration;

use tempfile::TempDir;
use uuid::Uuid;

use common::*;
use lodestone_mon::messages::{
    MonCommand, MonMessage, MonSubscribe, SubscribeItem,
};
use lodestone_mon::transport::LocalMesh;

async fn quorum_of_three(
    mesh: &std::sync::Arc<LocalMesh>,
    fsid: Uuid,
) -> (lodestone_mon::monmap::MonMap, Vec<TestMon>) {
    let map = seed_map(fsid, &["a", "b", "c"]);
    let mut mons = Vec::new();
    for name in ["a", "b", "c"] {
        let dir = TempDir::new().unwrap();
        format_empty(&dir, &map);
        mons.push(spawn_mon(mesh, &map, name, dir, fast_config()).await);
    }
    for mon in &mons {
        wait_for_quorum(mon, 3).await;
    }
    (map, mons)
}

/// Index of a monitor in `peon` state.
async fn find_peon(mons: &[TestMon]) -> usize {
    for (i, mon) in mons.iter().enumerate() {
        if mon.mon_status().await["state"] == "peon" {
            return i;
        }
    }
    panic!("no peon found");
}

#[tokio::test]
async fn write_command_routes_through_peon() {
    let mesh = LocalMesh::new();
    let fsid = Uuid::new_v4();
    let (_map, mut mons) = quorum_of_three(&mesh, fsid).await;
    let peon = find_peon(&mons).await;

    let mut client = TestClient::client(&mesh, 1);
    client.send(
        mons[peon].addr,
        MonMessage::Command(MonCommand {
            fsid,
            cmd: vec!["diskmap".into(), "poke".into()],
        }),
    );

    let msg = client
        .recv(Duration::from_secs(10))
        .await
        .expect("routed reply should arrive on the original connection");
    match msg {
        MonMessage::CommandAck(ack) => {
            assert_eq!(ack.code, 0, "unexpected ack: {}", ack.rs);
            assert_eq!(ack.rs, "accepted");
            assert_eq!(ack.cmd, vec!["diskmap".to_string(), "poke".to_string()]);
        }
        other => panic!("expected command ack, got {other:?}"),
    }

    // The routed reply retired the tid.
    wait_for_status(&mons[peon], "empty routed table", |status| {
        status["routed_requests"] == 0
    })
    .await;

    // Closing the client connection sweeps anything it still owned and
    // leaves the peon healthy.
    client.disconnect();
    let mut probe_client = TestClient::client(&mesh, 2);
    probe_client.send(
        mons[peon].addr,
        MonMessage::Command(MonCommand {
            fsid,
            cmd: vec!["mon_status".into()],
        }),
    );
    let msg = probe_client.recv(Duration::from_secs(10)).await.unwrap();
    match msg {
        MonMessage::CommandAck(ack) => assert_eq!(ack.code, 0),
        other => panic!("expected command ack, got {other:?}"),
    }

    for mon in &mut mons {
        mon.shutdown().await;
    }
}

#[tokio::test]
async fn command_with_wrong_fsid_is_rejected() {
    let mesh = LocalMesh::new();
    let fsid = Uuid::new_v4();
    let (_map, mut mons) = quorum_of_three(&mesh, fsid).await;

    let mut client = TestClient::client(&mesh, 3);
    client.send(
        mons[0].addr,
        MonMessage::Command(MonCommand {
            fsid: Uuid::new_v4(),
            cmd: vec!["status".into()],
        }),
    );
    let msg = client.recv(Duration::from_secs(10)).await.unwrap();
    match msg {
        MonMessage::CommandAck(ack) => {
            assert_eq!(ack.code, -1);
            assert_eq!(ack.rs, "wrong fsid");
        }
        other => panic!("expected command ack, got {other:?}"),
    }

    for mon in &mut mons {
        mon.shutdown().await;
    }
}

#[tokio::test]
async fn admin_only_command_needs_full_caps() {
    let mesh = LocalMesh::new();
    let fsid = Uuid::new_v4();
    let (_map, mut mons) = quorum_of_three(&mesh, fsid).await;

    let mut client = TestClient::client(&mesh, 4);
    client.send(
        mons[0].addr,
        MonMessage::Command(MonCommand {
            fsid,
            cmd: vec!["injectargs".into(), "mon_sync_timeout=5".into()],
        }),
    );
    let msg = client.recv(Duration::from_secs(10)).await.unwrap();
    match msg {
        MonMessage::CommandAck(ack) => {
            assert_eq!(ack.code, -13);
            assert_eq!(ack.rs, "access denied");
        }
        other => panic!("expected command ack, got {other:?}"),
    }

    for mon in &mut mons {
        mon.shutdown().await;
    }
}

#[tokio::test]
async fn monmap_subscription_pushes_map_and_acks() {
    let mesh = LocalMesh::new();
    let fsid = Uuid::new_v4();
    let (map, mut mons) = quorum_of_three(&mesh, fsid).await;

    let mut client = TestClient::client(&mesh, 5);
    let mut what = BTreeMap::new();
    what.insert(
        "monmap".to_string(),
        SubscribeItem {
            start: 0,
            onetime: false,
        },
    );
    client.send(mons[0].addr, MonMessage::Subscribe(MonSubscribe { what }));

    let mut got_map = false;
    let mut got_ack = false;
    for _ in 0..2 {
        match client.recv(Duration::from_secs(10)).await {
            Some(MonMessage::MonMap { monmap_bytes }) => {
                let pushed = lodestone_mon::monmap::MonMap::decode(&monmap_bytes).unwrap();
                assert_eq!(pushed.fsid, map.fsid);
                got_map = true;
            }
            Some(MonMessage::SubscribeAck(ack)) => {
                assert_eq!(ack.fsid, fsid);
                assert!(ack.interval_secs > 0);
                got_ack = true;
            }
            other => panic!("unexpected subscription response: {other:?}"),
        }
    }
    assert!(got_map && got_ack);

    for mon in &mut mons {
        mon.shutdown().await;
    }
}

#[tokio::test]
async fn get_version_answers_for_hosted_maps() {
    let mesh = LocalMesh::new();
    let fsid = Uuid::new_v4();
    let (_map, mut mons) = quorum_of_three(&mesh, fsid).await;

    let mut client = TestClient::client(&mesh, 6);
    client.send(
        mons[1].addr,
        MonMessage::GetVersion(lodestone_mon::messages::MonGetVersion {
            what: "monmap".into(),
            handle: 99,
        }),
    );
    let msg = client.recv(Duration::from_secs(10)).await.unwrap();
    match msg {
        MonMessage::GetVersionReply(reply) => {
            assert_eq!(reply.handle, 99);
        }
        other => panic!("expected get-version reply, got {other:?}"),
    }

    for mon in &mut mons {
        mon.shutdown().await;
    }
}
