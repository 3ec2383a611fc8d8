//! Request routing between contact monitors and the leader.
//!
//! Clients connect to any monitor. A write-class message arriving at a
//! non-leader is wrapped in a `Forward` with a fresh tid and shipped to the
//! leader; the leader materializes a synthetic session carrying the
//! client's capabilities and re-dispatches the inner message locally.
//! Replies for proxied sessions travel back as `Route(tid, reply)` through
//! the contact monitor, which still owns the client connection.

use std::time::Instant;

use crate::messages::{decode_message, encode_message, EntityInst, MForward, MonMessage, MRoute};
use crate::monitor::Monitor;
use crate::transport::{ConnId, Envelope};

/// A forwarded request awaiting its routed reply. Holds a non-owning
/// connection id back into the session table; removing the session sweeps
/// these by tid.
pub(crate) struct RoutedRequest {
    pub tid: u64,
    pub client: EntityInst,
    pub msg_bytes: Vec<u8>,
    pub conn: ConnId,
}

impl Monitor {
    /// Forward a client request to the leader, recording it for the reply
    /// path and leader changes.
    pub(crate) fn forward_request_leader(&mut self, env: &Envelope) {
        let leader = self.leader;
        let Some(leader_inst) = self.monmap.get_inst(leader) else {
            tracing::debug!(leader, "no leader instance to forward to");
            return;
        };
        if env.from.is_mon() {
            // Forwarding a forward would double-wrap; monitors talk to the
            // leader directly.
            tracing::debug!(from = %env.from, "won't double-forward a monitor request");
            return;
        }
        let Some(session) = self.sessions.get_mut(env.conn) else {
            tracing::debug!(from = %env.from, "no session for request, dropping forward");
            return;
        };
        if session.proxy.is_some() {
            // Already forwarded once; the contact monitor owns the tid.
            tracing::debug!(from = %env.from, "won't double-forward request");
            return;
        }

        self.routed_request_tid += 1;
        let tid = self.routed_request_tid;
        let msg_bytes = encode_message(&env.msg);
        let caps = session.caps.clone();
        session.routed_tids.insert(tid);
        self.routed_requests.insert(
            tid,
            RoutedRequest {
                tid,
                client: env.from,
                msg_bytes: msg_bytes.clone(),
                conn: env.conn,
            },
        );
        tracing::debug!(tid, client = %env.from, "forwarding request to leader");

        self.transport.send(
            leader_inst.addr,
            MonMessage::Forward(MForward {
                tid,
                client: env.from,
                client_caps: caps,
                msg_bytes,
            }),
        );
    }

    /// Leader side: unwrap a forwarded request into a synthetic session and
    /// run it through the normal dispatch path.
    pub(crate) fn handle_forward(&mut self, env: &Envelope, m: MForward) {
        tracing::debug!(tid = m.tid, client = %m.client, via = %env.from, "received forwarded message");
        let has_caps = self
            .sessions
            .get(env.conn)
            .map(|s| s.caps.allow_all)
            .unwrap_or(false);
        if !has_caps {
            tracing::warn!(via = %env.from, "forward from entity with insufficient caps");
            return;
        }
        let inner = match decode_message(&m.msg_bytes) {
            Ok(inner) => inner,
            Err(err) => {
                tracing::warn!(error = ?err, "failed to decode forwarded message");
                return;
            }
        };

        // The synthetic session stands in for the remote client. It holds
        // the contact monitor's address and tid instead of any connection to
        // the real client, so tearing it down cannot touch that connection.
        self.next_synthetic_conn += 1;
        let conn = self.next_synthetic_conn;
        let session = self.sessions.new_session(m.client, conn);
        session.caps = m.client_caps.clone();
        session.proxy = Some((env.from.addr, m.tid));

        let synthetic = Envelope {
            from: m.client,
            conn,
            msg: inner,
        };
        self.dispatch(synthetic, Instant::now());

        // One-shot: the synthetic session exists only for this dispatch.
        self.sessions.remove(conn);
    }

    /// Send a reply for a request, routing through the contact monitor when
    /// the request arrived on a proxied session.
    pub(crate) fn send_reply(&mut self, conn: ConnId, reply: MonMessage) {
        let Some(session) = self.sessions.get(conn) else {
            tracing::debug!(conn, "send_reply: no session, dropping reply");
            return;
        };
        match session.proxy {
            Some((proxy_addr, proxy_tid)) => {
                tracing::debug!(tid = proxy_tid, via = %proxy_addr, "routing reply via contact monitor");
                self.transport.send(
                    proxy_addr,
                    MonMessage::Route(MRoute {
                        tid: proxy_tid,
                        dest: None,
                        msg_bytes: encode_message(&reply),
                    }),
                );
            }
            None => {
                self.transport.send(session.inst.addr, reply);
            }
        }
    }

    /// Contact-monitor side: deliver a routed reply to the original client
    /// connection and retire the tid.
    pub(crate) fn handle_route(&mut self, env: &Envelope, m: MRoute) {
        let has_caps = self
            .sessions
            .get(env.conn)
            .map(|s| s.caps.allow_all)
            .unwrap_or(false);
        if !has_caps {
            tracing::warn!(from = %env.from, "route from entity without appropriate perms");
            return;
        }
        let reply = match decode_message(&m.msg_bytes) {
            Ok(reply) => reply,
            Err(err) => {
                tracing::warn!(error = ?err, "failed to decode routed reply");
                return;
            }
        };

        if m.tid != 0 {
            let Some(rr) = self.routed_requests.remove(&m.tid) else {
                tracing::debug!(tid = m.tid, "don't have routed request tid");
                return;
            };
            // Re-encoded on the way out: the client's features may differ
            // from the leader's.
            self.transport.send(rr.client.addr, reply);
            if let Some(session) = self.sessions.get_mut(rr.conn) {
                session.routed_tids.remove(&rr.tid);
            }
        } else if let Some(dest) = m.dest {
            tracing::debug!(dest = %dest, "not a routed request, sending anyway");
            self.transport.send(dest.addr, reply);
        }
    }

    /// Re-forward every pending routed request to the (possibly new) leader.
    pub(crate) fn resend_routed_requests(&mut self) {
        if self.routed_requests.is_empty() {
            return;
        }
        let Some(leader_inst) = self.monmap.get_inst(self.leader) else {
            return;
        };
        // If we became the leader ourselves the forwards loop back to us and
        // are unwrapped locally like any other.
        tracing::debug!(count = self.routed_requests.len(), "resending routed requests");
        for rr in self.routed_requests.values() {
            let caps = self
                .sessions
                .get(rr.conn)
                .map(|s| s.caps.clone())
                .unwrap_or_default();
            tracing::debug!(tid = rr.tid, leader = self.leader, "resend routed request");
            self.transport.send(
                leader_inst.addr,
                MonMessage::Forward(MForward {
                    tid: rr.tid,
                    client: rr.client,
                    client_caps: caps,
                    msg_bytes: rr.msg_bytes.clone(),
                }),
            );
        }
    }

    /// Remove a session and invalidate everything it owns: its routed
    /// request tids and its subscriptions go with it.
    pub(crate) fn remove_session(&mut self, conn: ConnId) {
        let Some(session) = self.sessions.remove(conn) else {
            return;
        };
        for tid in &session.routed_tids {
            if self.routed_requests.remove(tid).is_some() {
                tracing::debug!(tid, "dropping routed request");
            }
        }
    }
}
