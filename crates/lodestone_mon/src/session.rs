//! Per-connection sessions and topic subscriptions.
//!
//! The session table owns all per-connection state; routed requests hold a
//! non-owning connection id back into it, so removing a session is the one
//! place that sweeps everything a connection left behind.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::SocketAddr;
use std::time::Instant;

use crate::messages::{EntityInst, MonCaps};
use crate::transport::ConnId;

#[derive(Clone, Debug)]
pub struct Subscription {
    pub topic: String,
    pub next: u64,
    pub onetime: bool,
}

#[derive(Debug)]
pub struct Session {
    pub inst: EntityInst,
    pub conn: ConnId,
    pub caps: MonCaps,
    /// Idle deadline; `None` for peer monitors, which are never trimmed.
    pub until: Option<Instant>,
    pub subs: BTreeMap<String, Subscription>,
    /// Tids of routed requests this connection originated.
    pub routed_tids: BTreeSet<u64>,
    /// Set on synthetic leader-side sessions materialized for forwarded
    /// requests: the contact monitor's address and the forwarded tid. The
    /// synthetic session deliberately holds no connection back to the real
    /// client, so destroying it can never close the client's connection.
    pub proxy: Option<(SocketAddr, u64)>,
}

impl Session {
    fn new(inst: EntityInst, conn: ConnId) -> Self {
        Self {
            inst,
            conn,
            caps: MonCaps::default(),
            until: None,
            subs: BTreeMap::new(),
            routed_tids: BTreeSet::new(),
            proxy: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct SessionMap {
    sessions: HashMap<ConnId, Session>,
}

impl SessionMap {
    pub fn new_session(&mut self, inst: EntityInst, conn: ConnId) -> &mut Session {
        self.sessions.insert(conn, Session::new(inst, conn));
        self.sessions.get_mut(&conn).expect("just inserted")
    }

    pub fn get(&self, conn: ConnId) -> Option<&Session> {
        self.sessions.get(&conn)
    }

    pub fn get_mut(&mut self, conn: ConnId) -> Option<&mut Session> {
        self.sessions.get_mut(&conn)
    }

    pub fn contains(&self, conn: ConnId) -> bool {
        self.sessions.contains_key(&conn)
    }

    pub fn remove(&mut self, conn: ConnId) -> Option<Session> {
        self.sessions.remove(&conn)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    /// Connection ids snapshot, for trimming passes that mutate the table.
    pub fn conns(&self) -> Vec<ConnId> {
        self.sessions.keys().copied().collect()
    }

    /// Add or refresh a subscription on a session.
    pub fn add_update_sub(&mut self, conn: ConnId, topic: &str, start: u64, onetime: bool) {
        if let Some(session) = self.sessions.get_mut(&conn) {
            session.subs.insert(
                topic.to_string(),
                Subscription {
                    topic: topic.to_string(),
                    next: start,
                    onetime,
                },
            );
        }
    }

    /// All sessions subscribed to `topic`.
    pub fn subscribers(&self, topic: &str) -> Vec<ConnId> {
        self.sessions
            .values()
            .filter(|s| s.subs.contains_key(topic))
            .map(|s| s.conn)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inst(port: u16) -> EntityInst {
        EntityInst::client(1, format!("127.0.0.1:{port}").parse().unwrap())
    }

    #[test]
    fn sessions_track_subscriptions() {
        let mut map = SessionMap::default();
        map.new_session(inst(9001), 1);
        map.new_session(inst(9002), 2);
        map.add_update_sub(1, "monmap", 3, false);
        map.add_update_sub(2, "monmap", 0, true);
        map.add_update_sub(2, "diskmap", 0, false);

        assert_eq!(map.subscribers("monmap").len(), 2);
        assert_eq!(map.subscribers("diskmap"), vec![2]);

        let removed = map.remove(2).unwrap();
        assert_eq!(removed.subs.len(), 2);
        assert_eq!(map.subscribers("monmap"), vec![1]);
    }

    #[test]
    fn routed_tids_live_on_the_session() {
        let mut map = SessionMap::default();
        let session = map.new_session(inst(9003), 7);
        session.routed_tids.insert(41);
        session.routed_tids.insert(42);
        assert_eq!(map.get(7).unwrap().routed_tids.len(), 2);
    }
}
