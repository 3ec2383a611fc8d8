//! Bootstrap and election scenarios: standalone clusters, cold starts, and
//! seed maps with incomplete addresses.

mod common;

use std::sync::Arc;

use tempfile::TempDir;
use uuid::Uuid;

use common::*;
use lodestone_mon::messages::blank_addr;
use lodestone_mon::monmap::MonMap;
use lodestone_mon::transport::LocalMesh;

#[tokio::test]
async fn standalone_mkfs_becomes_leader() {
    let mesh = LocalMesh::new();
    let fsid = Uuid::new_v4();
    let map = seed_map(fsid, &["a"]);

    let dir = TempDir::new().unwrap();
    format_empty(&dir, &map);
    let mut mon = spawn_mon(&mesh, &map, "a", dir, fast_config()).await;

    wait_for_status(&mon, "standalone leader", |status| {
        status["state"] == "leader"
            && status["quorum"].as_array().map(|q| q.len()) == Some(1)
            && status["has_ever_joined"] == true
    })
    .await;

    let status = mon.mon_status().await;
    assert_eq!(status["rank"], 0);
    assert_eq!(status["quorum"][0], 0);

    let (code, body) = mon.admin(&["quorum_status"]).await;
    assert_eq!(code, 0);
    let quorum: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(quorum["quorum"].as_array().unwrap().len(), 1);

    mon.shutdown().await;
}

#[tokio::test]
async fn three_node_cold_start_forms_quorum() {
    let mesh = LocalMesh::new();
    let fsid = Uuid::new_v4();
    let map = seed_map(fsid, &["a", "b", "c"]);

    let mut mons = Vec::new();
    for name in ["a", "b", "c"] {
        let dir = TempDir::new().unwrap();
        format_empty(&dir, &map);
        mons.push(spawn_mon(&mesh, &map, name, dir, fast_config()).await);
    }

    for mon in &mons {
        wait_for_quorum(mon, 3).await;
    }

    // Exactly one leader, and everyone agrees on the quorum.
    let mut leaders = 0;
    let mut quorums = Vec::new();
    for mon in &mons {
        let status = mon.mon_status().await;
        if status["state"] == "leader" {
            leaders += 1;
        }
        quorums.push(status["quorum"].clone());
    }
    assert_eq!(leaders, 1, "expected exactly one leader");
    assert!(quorums.windows(2).all(|w| w[0] == w[1]));

    for mon in &mut mons {
        mon.shutdown().await;
    }
}

#[tokio::test]
async fn blank_seed_address_is_learned_from_probe() {
    let mesh = LocalMesh::new();
    let fsid = Uuid::new_v4();

    // Both members are named, but b's seed map does not know a's address.
    let a_addr = pick_addr();
    let b_addr = pick_addr();
    let mut full_map = MonMap::new(fsid);
    full_map.add("a", a_addr);
    full_map.add("b", b_addr);
    let mut blank_map = MonMap::new(fsid);
    blank_map.add("a", blank_addr());
    blank_map.add("b", b_addr);

    let dir_a = TempDir::new().unwrap();
    format_empty(&dir_a, &full_map);
    let dir_b = TempDir::new().unwrap();
    format_empty(&dir_b, &blank_map);

    let mut a = spawn_mon(&mesh, &full_map, "a", dir_a, fast_config()).await;
    let mut b = TestMon {
        name: "b".to_string(),
        addr: b_addr,
        dir: dir_b,
        handle: None,
    };
    b.start(&mesh, fast_config()).await;

    // b learns a's address from a's probe traffic and the two form a quorum.
    wait_for_quorum(&a, 2).await;
    wait_for_quorum(&b, 2).await;

    let status = b.mon_status().await;
    let members = &status["monmap"]["members"];
    assert_eq!(
        members["a"].as_str().unwrap(),
        a_addr.to_string(),
        "b should have learned a's address"
    );

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn late_monitor_joins_existing_quorum() {
    let mesh = LocalMesh::new();
    let fsid = Uuid::new_v4();
    let map = seed_map(fsid, &["a", "b", "c"]);

    let mut mons = Vec::new();
    for name in ["a", "b"] {
        let dir = TempDir::new().unwrap();
        format_empty(&dir, &map);
        mons.push(spawn_mon(&mesh, &map, name, dir, fast_config()).await);
    }
    // Two of three are enough to form the first quorum.
    for mon in &mons {
        wait_for_quorum(mon, 2).await;
    }

    let dir = TempDir::new().unwrap();
    format_empty(&dir, &map);
    let mut c = spawn_mon(&mesh, &map, "c", dir, fast_config()).await;
    for mon in mons.iter().chain([&c]) {
        wait_for_quorum(mon, 3).await;
    }

    for mon in &mut mons {
        mon.shutdown().await;
    }
    c.shutdown().await;
}

#[tokio::test]
async fn quorum_exit_and_enter_cycle() {
    let mesh = LocalMesh::new();
    let fsid = Uuid::new_v4();
    let map = seed_map(fsid, &["a", "b", "c"]);

    let mut mons = Vec::new();
    for name in ["a", "b", "c"] {
        let dir = TempDir::new().unwrap();
        format_empty(&dir, &map);
        mons.push(spawn_mon(&mesh, &map, name, dir, fast_config()).await);
    }
    for mon in &mons {
        wait_for_quorum(mon, 3).await;
    }

    // Drop one member out of the quorum; the others re-elect without it.
    let (code, _) = mons[2].admin(&["quorum", "exit"]).await;
    assert_eq!(code, 0);
    for mon in &mons[..2] {
        wait_for_quorum(mon, 2).await;
    }

    let (code, _) = mons[2].admin(&["quorum", "enter"]).await;
    assert_eq!(code, 0);
    for mon in &mons {
        wait_for_quorum(mon, 3).await;
    }

    for mon in &mut mons {
        mon.shutdown().await;
    }
}

#[tokio::test]
async fn status_commands_answer_while_probing() {
    let mesh: Arc<LocalMesh> = LocalMesh::new();
    let fsid = Uuid::new_v4();
    // Three-member map with one monitor running: no quorum can form, the
    // monitor stays probing, and the admin surface still answers.
    let map = seed_map(fsid, &["a", "b", "c"]);
    let dir = TempDir::new().unwrap();
    format_empty(&dir, &map);
    let mut mon = spawn_mon(&mesh, &map, "a", dir, fast_config()).await;

    wait_for_status(&mon, "probing state", |status| status["state"] == "probing").await;
    let (code, body) = mon.admin(&["sync_status"]).await;
    assert_eq!(code, 0);
    let sync: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(sync["state"], "probing");
    assert_eq!(sync["paxos_version"], 0);

    mon.shutdown().await;
}
