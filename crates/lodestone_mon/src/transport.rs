//! Message transport seam.
//!
//! The monitor core only ever calls fire-and-forget sends and connection
//! mark-downs, so the whole wire layer sits behind `MonTransport`. The
//! in-process `LocalMesh` implementation carries whole clusters inside one
//! process and is what the integration tests and the embedded node API use;
//! an on-the-wire messenger would implement the same trait.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::UnboundedSender;

use crate::messages::{EntityInst, MonMessage};
use crate::monitor::Event;

/// Identifier of one live connection between two endpoints. Stable for the
/// life of the connection; a reconnect between the same pair gets a fresh id.
pub type ConnId = u64;

/// A delivered message plus where it came from.
#[derive(Clone, Debug)]
pub struct Envelope {
    pub from: EntityInst,
    pub conn: ConnId,
    pub msg: MonMessage,
}

/// Outbound surface the monitor drives. Sends never block and never fail
/// visibly; a dead peer simply stops answering.
pub trait MonTransport: Send + Sync + 'static {
    fn local_addr(&self) -> SocketAddr;
    fn send(&self, to: SocketAddr, msg: MonMessage);
    fn mark_down(&self, conn: ConnId);
    fn mark_down_addr(&self, addr: SocketAddr);
    fn mark_down_all(&self);
    /// Update the identity stamped on our outgoing messages (rank changes).
    fn set_identity(&self, inst: EntityInst);

    fn send_inst(&self, to: &EntityInst, msg: MonMessage) {
        self.send(to.addr, msg);
    }
}

struct MeshEndpoint {
    inst: EntityInst,
    tx: UnboundedSender<Event>,
}

#[derive(Default)]
struct MeshInner {
    endpoints: HashMap<SocketAddr, MeshEndpoint>,
    conn_of_pair: HashMap<(SocketAddr, SocketAddr), ConnId>,
    pair_of_conn: HashMap<ConnId, (SocketAddr, SocketAddr)>,
    next_conn: ConnId,
}

impl MeshInner {
    fn pair_key(a: SocketAddr, b: SocketAddr) -> (SocketAddr, SocketAddr) {
        if a <= b {
            (a, b)
        } else {
            (b, a)
        }
    }

    fn conn_for(&mut self, a: SocketAddr, b: SocketAddr) -> ConnId {
        let key = Self::pair_key(a, b);
        if let Some(id) = self.conn_of_pair.get(&key) {
            return *id;
        }
        self.next_conn += 1;
        let id = self.next_conn;
        self.conn_of_pair.insert(key, id);
        self.pair_of_conn.insert(id, key);
        id
    }

    fn drop_conn(&mut self, conn: ConnId, notify: Option<SocketAddr>) {
        let Some(pair) = self.pair_of_conn.remove(&conn) else {
            return;
        };
        self.conn_of_pair.remove(&pair);
        if let Some(peer) = notify {
            if let Some(endpoint) = self.endpoints.get(&peer) {
                let _ = endpoint.tx.send(Event::ConnReset(conn));
            }
        }
    }
}

/// In-process mesh connecting monitors, daemons, and test clients.
pub struct LocalMesh {
    inner: Mutex<MeshInner>,
}

impl LocalMesh {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(MeshInner::default()),
        })
    }

    /// Attach an endpoint; its inbox will receive `Event::Deliver` and
    /// `Event::ConnReset`. Returns the transport handle for sending.
    pub fn register(
        self: &Arc<Self>,
        inst: EntityInst,
        tx: UnboundedSender<Event>,
    ) -> Arc<MeshTransport> {
        let addr = inst.addr;
        if let Ok(mut inner) = self.inner.lock() {
            inner.endpoints.insert(addr, MeshEndpoint { inst, tx });
        }
        Arc::new(MeshTransport {
            mesh: self.clone(),
            addr,
        })
    }

    /// Detach an endpoint, resetting every connection it participated in.
    pub fn unregister(&self, addr: SocketAddr) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        inner.endpoints.remove(&addr);
        let conns: Vec<(ConnId, (SocketAddr, SocketAddr))> = inner
            .pair_of_conn
            .iter()
            .filter(|(_, (a, b))| *a == addr || *b == addr)
            .map(|(id, pair)| (*id, *pair))
            .collect();
        for (conn, (a, b)) in conns {
            let peer = if a == addr { b } else { a };
            inner.drop_conn(conn, Some(peer));
        }
    }

    fn send_from(&self, from_addr: SocketAddr, to: SocketAddr, msg: MonMessage) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        let Some(from_inst) = inner.endpoints.get(&from_addr).map(|e| e.inst) else {
            return;
        };
        if !inner.endpoints.contains_key(&to) {
            tracing::trace!(%to, msg = msg.type_name(), "dropping send to unknown endpoint");
            return;
        }
        let conn = inner.conn_for(from_addr, to);
        if let Some(endpoint) = inner.endpoints.get(&to) {
            let _ = endpoint.tx.send(Event::Deliver(Envelope {
                from: from_inst,
                conn,
                msg,
            }));
        }
    }
}

/// Per-endpoint handle implementing `MonTransport` over a `LocalMesh`.
pub struct MeshTransport {
    mesh: Arc<LocalMesh>,
    addr: SocketAddr,
}

impl MonTransport for MeshTransport {
    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    fn send(&self, to: SocketAddr, msg: MonMessage) {
        if to == self.addr {
            // Local loopback: deliver to our own inbox.
            let inner = self.mesh.inner.lock();
            if let Ok(mut inner) = inner {
                let conn = inner.conn_for(self.addr, self.addr);
                if let Some(endpoint) = inner.endpoints.get(&self.addr) {
                    let from = endpoint.inst;
                    let _ = endpoint.tx.send(Event::Deliver(Envelope { from, conn, msg }));
                }
            }
            return;
        }
        self.mesh.send_from(self.addr, to, msg);
    }

    fn mark_down(&self, conn: ConnId) {
        let Ok(mut inner) = self.mesh.inner.lock() else {
            return;
        };
        let peer = inner.pair_of_conn.get(&conn).map(|(a, b)| {
            if *a == self.addr {
                *b
            } else {
                *a
            }
        });
        inner.drop_conn(conn, peer);
    }

    fn mark_down_addr(&self, addr: SocketAddr) {
        let Ok(mut inner) = self.mesh.inner.lock() else {
            return;
        };
        let key = MeshInner::pair_key(self.addr, addr);
        if let Some(conn) = inner.conn_of_pair.get(&key).copied() {
            inner.drop_conn(conn, Some(addr));
        }
    }

    fn mark_down_all(&self) {
        let Ok(mut inner) = self.mesh.inner.lock() else {
            return;
        };
        let conns: Vec<(ConnId, (SocketAddr, SocketAddr))> = inner
            .pair_of_conn
            .iter()
            .filter(|(_, (a, b))| *a == self.addr || *b == self.addr)
            .map(|(id, pair)| (*id, *pair))
            .collect();
        for (conn, (a, b)) in conns {
            let peer = if a == self.addr { b } else { a };
            inner.drop_conn(conn, Some(peer));
        }
    }

    fn set_identity(&self, inst: EntityInst) {
        let Ok(mut inner) = self.mesh.inner.lock() else {
            return;
        };
        if let Some(endpoint) = inner.endpoints.get_mut(&self.addr) {
            endpoint.inst = inst;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::MonMessage;
    use tokio::sync::mpsc;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[tokio::test]
    async fn delivers_between_endpoints() {
        let mesh = LocalMesh::new();
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = mesh.register(EntityInst::mon(0, addr(7001)), tx_a);
        let _b = mesh.register(EntityInst::mon(1, addr(7002)), tx_b);

        a.send(addr(7002), MonMessage::GetMap);
        match rx_b.recv().await.unwrap() {
            Event::Deliver(env) => {
                assert_eq!(env.from.addr, addr(7001));
                assert!(matches!(env.msg, MonMessage::GetMap));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn mark_down_resets_peer() {
        let mesh = LocalMesh::new();
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = mesh.register(EntityInst::mon(0, addr(7003)), tx_a);
        let _b = mesh.register(EntityInst::mon(1, addr(7004)), tx_b);

        a.send(addr(7004), MonMessage::GetMap);
        let conn = match rx_b.recv().await.unwrap() {
            Event::Deliver(env) => env.conn,
            other => panic!("unexpected event: {other:?}"),
        };
        a.mark_down(conn);
        match rx_b.recv().await.unwrap() {
            Event::ConnReset(reset) => assert_eq!(reset, conn),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn reconnect_gets_fresh_conn_id() {
        let mesh = LocalMesh::new();
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = mesh.register(EntityInst::mon(0, addr(7005)), tx_a);
        let _b = mesh.register(EntityInst::mon(1, addr(7006)), tx_b);

        a.send(addr(7006), MonMessage::GetMap);
        let first = match rx_b.recv().await.unwrap() {
            Event::Deliver(env) => env.conn,
            other => panic!("unexpected event: {other:?}"),
        };
        a.mark_down_addr(addr(7006));
        let _ = rx_b.recv().await;
        a.send(addr(7006), MonMessage::GetMap);
        match rx_b.recv().await.unwrap() {
            Event::Deliver(env) => assert_ne!(env.conn, first),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
