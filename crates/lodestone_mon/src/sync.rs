//! Store synchronization engine.
//!
//! Three roles with disjoint state machines share the `MonSync` opcodes:
//!
//! * **Requester** — the lagging monitor. Marks its store inconsistent,
//!   clears the sync-target prefixes, and pulls chunks from a provider
//!   while heartbeating the leader.
//! * **Leader** — the quorum leader. Admits requesters, freezes log trim
//!   for as long as any session is open (plus a grace window), and aborts
//!   everyone on loss of leadership.
//! * **Provider** — any up-to-date monitor feeding chunks from a
//!   synchronizer cursor.
//!
//! Dispatch is gated on the role bitmask: an opcode arriving in the wrong
//! role is dropped as a stray rather than corrupting another role's state.

use std::time::Duration;

use crate::config::killpoint;
use crate::messages::{
    EntityInst, MonMessage, MonSync, SyncOp, SYNC_FLAG_LAST, SYNC_FLAG_REPLY_TO, SYNC_FLAG_RETRY,
};
use crate::monitor::{
    Monitor, MonState, ProviderEntry, SyncPeer, SyncState, TimerKind, SYNC_PREFIX,
    SYNC_ROLE_LEADER, SYNC_ROLE_NONE, SYNC_ROLE_PROVIDER, SYNC_ROLE_REQUESTER,
};
use crate::store::Transaction;
use crate::transport::Envelope;

/// How long trim stays frozen after the last sync session closes, to absorb
/// late stragglers.
const TRIM_ENABLE_GRACE: Duration = Duration::from_secs(30);

impl Monitor {
    pub(crate) fn handle_sync(&mut self, env: &Envelope, m: MonSync) {
        tracing::debug!(from = %env.from, msg = %m, "handle sync");
        match m.op {
            SyncOp::Start => self.handle_sync_start(env, m),
            SyncOp::StartReply => self.handle_sync_start_reply(env, m),
            SyncOp::Heartbeat => self.handle_sync_heartbeat(env, m),
            SyncOp::HeartbeatReply => self.handle_sync_heartbeat_reply(env, m),
            SyncOp::Finish => self.handle_sync_finish(env, m),
            SyncOp::StartChunks => self.handle_sync_start_chunks(env, m),
            SyncOp::Chunk => self.handle_sync_chunk(env, m),
            SyncOp::ChunkReply => self.handle_sync_chunk_reply(env, m),
            SyncOp::FinishReply => self.handle_sync_finish_reply(env, m),
            SyncOp::Abort => self.handle_sync_abort(env, m),
        }
    }

    /// Drop every piece of lingering sync/trim state. Called from bootstrap.
    pub(crate) fn reset_sync(&mut self) {
        tracing::debug!("reset sync");
        let trim_tokens: Vec<_> = self.trim_timeouts.values().copied().collect();
        for token in trim_tokens {
            self.cancel_timer(token);
        }
        self.trim_timeouts.clear();
        self.trim_states.clear();

        let provider_tokens: Vec<_> = self
            .sync_entities
            .values_mut()
            .filter_map(|entry| entry.timeout.take())
            .collect();
        for token in provider_tokens {
            self.cancel_timer(token);
        }
        self.sync_entities.clear();

        if let Some(token) = self.sync_leader.as_mut().and_then(|p| p.timeout.take()) {
            self.cancel_timer(token);
        }
        self.sync_leader = None;
        if let Some(token) = self.sync_provider.as_mut().and_then(|p| p.timeout.take()) {
            self.cancel_timer(token);
        }
        self.sync_provider = None;

        self.sync_state = SyncState::None;
        self.sync_role = SYNC_ROLE_NONE;
    }

    fn sync_send_heartbeat(&self, other: EntityInst, reply: bool) {
        tracing::debug!(%other, reply, "sync heartbeat");
        let op = if reply {
            SyncOp::HeartbeatReply
        } else {
            SyncOp::Heartbeat
        };
        self.transport
            .send(other.addr, MonMessage::Sync(MonSync::new(op)));
    }

    fn apply_tx_or_warn(&self, tx: &Transaction, what: &str) -> bool {
        match self.store.apply_transaction(tx) {
            Ok(()) => true,
            Err(err) => {
                tracing::error!(error = ?err, what, "store transaction failed");
                false
            }
        }
    }

    // -- leader role --------------------------------------------------------

    fn handle_sync_start(&mut self, env: &Envelope, m: MonSync) {
        // Some monitor picked us as its point of entry to the quorum; if we
        // are not the leader, bounce the start to it with the original
        // sender attached so the reply can address them directly.
        if !self.is_leader() && !self.quorum.is_empty() {
            let Some(leader) = self.monmap.get_inst(self.leader) else {
                return;
            };
            let mut bounced = m.clone();
            bounced.reply_to = Some(env.from);
            bounced.flags |= SYNC_FLAG_REPLY_TO;
            tracing::debug!(to = %leader, "forwarding sync start to leader");
            killpoint(self.cfg.sync_provider_kill_at, "sync_provider", 1);
            self.transport.send(leader.addr, MonMessage::Sync(bounced));
            killpoint(self.cfg.sync_provider_kill_at, "sync_provider", 2);
            return;
        }

        let other = if m.has_flag(SYNC_FLAG_REPLY_TO) {
            m.reply_to.unwrap_or(env.from)
        } else {
            env.from
        };

        killpoint(self.cfg.sync_leader_kill_at, "sync_leader", 1);

        if self.trim_timeouts.contains_key(&other) {
            tracing::info!(%other, "sync session already in progress");
            if self
                .trim_states
                .get(&other)
                .map(|s| *s != SyncState::None)
                .unwrap_or(false)
            {
                tracing::info!("ignore stray sync start");
                return;
            }
            tracing::info!("destroying current sync session state and creating new");
            if let Some(token) = self.trim_timeouts.remove(&other) {
                self.cancel_timer(token);
            }
            self.trim_states.remove(&other);
        }

        let mut reply = MonSync::new(SyncOp::StartReply);
        let trim_pending = !self.quorum.is_empty() && self.paxos.should_trim();
        if trim_pending || self.trim_enable_event.is_some() {
            reply.flags |= SYNC_FLAG_RETRY;
        } else {
            let after = self.cfg.sync_trim_timeout;
            let token = self.arm_timer(TimerKind::TrimTimeout(other), after);
            self.trim_timeouts.insert(other, token);
            self.trim_states.insert(other, SyncState::Start);
            self.sync_role |= SYNC_ROLE_LEADER;
            // The trim freeze is what keeps referenced keys alive while the
            // requester streams them.
            self.paxos.trim_disable();
        }
        self.transport.send(other.addr, MonMessage::Sync(reply));
        killpoint(self.cfg.sync_leader_kill_at, "sync_leader", 2);
    }

    fn handle_sync_heartbeat(&mut self, env: &Envelope, m: MonSync) {
        let other = env.from;
        if (self.sync_role & SYNC_ROLE_LEADER) == 0
            || self
                .trim_states
                .get(&other)
                .map(|s| *s != SyncState::Start)
                .unwrap_or(true)
        {
            tracing::info!(from = %other, msg = %m, "ignored stray sync heartbeat");
            return;
        }

        if !self.is_leader() && !self.quorum.is_empty() && self.trim_timeouts.contains_key(&other)
        {
            // We must have been the leader once, but lost it to someone else.
            self.sync_finish(other, true);
            return;
        }

        if let Some(token) = self.trim_timeouts.remove(&other) {
            self.cancel_timer(token);
        }
        let after = self.cfg.sync_trim_timeout;
        let token = self.arm_timer(TimerKind::TrimTimeout(other), after);
        self.trim_timeouts.insert(other, token);

        killpoint(self.cfg.sync_leader_kill_at, "sync_leader", 3);
        self.sync_send_heartbeat(other, true);
        killpoint(self.cfg.sync_leader_kill_at, "sync_leader", 4);
    }

    /// Close one leader-side sync session, optionally telling the requester
    /// to abort. Once the last session is gone, trim re-enables after a
    /// grace window, and only if we are still the leader.
    pub(crate) fn sync_finish(&mut self, entity: EntityInst, abort: bool) {
        tracing::debug!(%entity, abort, "sync finish");

        let Some(token) = self.trim_timeouts.remove(&entity) else {
            tracing::info!(%entity, "we know of no sync effort from this peer, ignoring");
            return;
        };
        self.cancel_timer(token);
        self.trim_states.remove(&entity);

        if abort {
            killpoint(self.cfg.sync_leader_kill_at, "sync_leader", 5);
            self.transport
                .send(entity.addr, MonMessage::Sync(MonSync::new(SyncOp::Abort)));
            killpoint(self.cfg.sync_leader_kill_at, "sync_leader", 6);
        }

        if !self.trim_timeouts.is_empty() {
            return;
        }

        tracing::info!("no longer a sync leader");
        self.sync_role &= !SYNC_ROLE_LEADER;

        // We may have been the leader, but by now we may no longer be.
        if self.is_leader() && self.paxos.is_trim_disabled() {
            let token = self.arm_timer(TimerKind::TrimEnable, TRIM_ENABLE_GRACE);
            self.trim_enable_event = Some(token);
        }
    }

    fn handle_sync_finish(&mut self, env: &Envelope, m: MonSync) {
        let other = env.from;
        if !self.trim_timeouts.contains_key(&other)
            || self
                .trim_states
                .get(&other)
                .map(|s| *s != SyncState::Start)
                .unwrap_or(true)
        {
            tracing::info!(from = %other, msg = %m, "ignored stray sync finish");
            return;
        }

        // We may no longer be the leader; their sync finished either way, so
        // there is no use in scrapping the whole thing now. Acknowledge.
        if !self.is_leader() {
            tracing::debug!("no longer the leader; replying nonetheless");
        }

        killpoint(self.cfg.sync_leader_kill_at, "sync_leader", 7);
        self.transport.send(
            other.addr,
            MonMessage::Sync(MonSync::new(SyncOp::FinishReply)),
        );
        killpoint(self.cfg.sync_leader_kill_at, "sync_leader", 8);

        self.sync_finish(other, false);
    }

    /// Loss of leadership: every requester syncing against us must abort.
    pub(crate) fn abort_sync_leader_sessions(&mut self) {
        let sessions: Vec<(EntityInst, u64)> = self
            .trim_timeouts
            .iter()
            .map(|(entity, token)| (*entity, *token))
            .collect();
        for (entity, token) in sessions {
            self.cancel_timer(token);
            self.transport
                .send(entity.addr, MonMessage::Sync(MonSync::new(SyncOp::Abort)));
            self.trim_states.remove(&entity);
        }
        self.trim_timeouts.clear();
        self.sync_role &= !SYNC_ROLE_LEADER;
    }

    // -- provider role ------------------------------------------------------

    fn handle_sync_start_chunks(&mut self, env: &Envelope, m: MonSync) {
        let other = env.from;

        // An existing session for this peer means either a stray message or
        // a peer that failed and came back before our timeout fired. Either
        // way the timers own the cleanup; refuse until they have run.
        if self.sync_entities.contains_key(&other) {
            tracing::info!(%other, "sync session already in progress, assumed stray");
            return;
        }

        let resume = if m.last_key.is_empty() {
            None
        } else {
            tracing::debug!(prefix = %m.last_key.prefix, key = %m.last_key.key,
                "resuming chunks after last received key");
            Some(m.last_key.clone())
        };

        let targets = self.sync_targets();
        let synchronizer =
            match self
                .store
                .synchronizer(&targets, resume, self.cfg.sync_chunk_bytes)
            {
                Ok(sync) => sync,
                Err(err) => {
                    tracing::error!(error = ?err, "failed to open synchronizer");
                    return;
                }
            };

        let entry = ProviderEntry {
            entity: other,
            version: self.paxos.get_version(),
            state: SyncState::Start,
            synchronizer: Some(synchronizer),
            timeout: None,
        };
        self.sync_entities.insert(other, entry);
        self.sync_role |= SYNC_ROLE_PROVIDER;

        self.sync_send_chunks(other);
    }

    fn handle_sync_chunk_reply(&mut self, env: &Envelope, m: MonSync) {
        let other = env.from;
        if (self.sync_role & SYNC_ROLE_PROVIDER) == 0
            || self
                .sync_entities
                .get(&other)
                .map(|entry| entry.state != SyncState::Start)
                .unwrap_or(true)
        {
            tracing::info!(from = %other, "ignored stray chunk reply");
            return;
        }

        if m.has_flag(SYNC_FLAG_LAST) {
            // They acked the last chunk; clean up.
            self.sync_provider_cleanup(other);
            return;
        }

        self.sync_send_chunks(other);
    }

    fn sync_send_chunks(&mut self, entity: EntityInst) {
        let Some(mut entry) = self.sync_entities.remove(&entity) else {
            return;
        };
        if let Some(token) = entry.timeout.take() {
            self.cancel_timer(token);
        }

        let Some(mut synchronizer) = entry.synchronizer.take() else {
            tracing::warn!(%entity, "chunk requested but cursor already exhausted");
            if self.sync_entities.is_empty() {
                self.sync_role &= !SYNC_ROLE_PROVIDER;
            }
            return;
        };

        let chunk = match synchronizer.next_chunk() {
            Ok(Some(chunk)) => chunk,
            Ok(None) | Err(_) => {
                tracing::error!(%entity, "synchronizer failed to produce a chunk");
                if self.sync_entities.is_empty() {
                    self.sync_role &= !SYNC_ROLE_PROVIDER;
                }
                return;
            }
        };

        let mut msg = MonSync::new(SyncOp::Chunk);
        msg.version = entry.version;
        msg.chunk_bytes = chunk.tx.encode();
        msg.last_key = chunk.last_key;
        tracing::debug!(%entity, prefix = %msg.last_key.prefix, key = %msg.last_key.key,
            last = chunk.last, "sending chunk");

        let last = chunk.last;
        if last {
            msg.flags |= SYNC_FLAG_LAST;
            msg.crc = Some(synchronizer.crc());
        } else {
            entry.synchronizer = Some(synchronizer);
        }

        let after = self.cfg.sync_timeout;
        let token = self.arm_timer(TimerKind::SyncTimeout(entity), after);
        entry.timeout = Some(token);
        self.sync_entities.insert(entity, entry);

        killpoint(self.cfg.sync_provider_kill_at, "sync_provider", 3);
        self.transport.send(entity.addr, MonMessage::Sync(msg));
        killpoint(self.cfg.sync_provider_kill_at, "sync_provider", 4);
        if last {
            killpoint(self.cfg.sync_provider_kill_at, "sync_provider", 5);
        }
    }

    fn sync_provider_cleanup(&mut self, entity: EntityInst) {
        tracing::debug!(%entity, "sync provider cleanup");
        if let Some(mut entry) = self.sync_entities.remove(&entity) {
            if let Some(token) = entry.timeout.take() {
                self.cancel_timer(token);
            }
        }
        if self.sync_entities.is_empty() {
            tracing::info!("no longer a sync provider");
            self.sync_role &= !SYNC_ROLE_PROVIDER;
        }
    }

    /// A chunk round-trip window expired, either on a provider waiting for a
    /// reply or on a requester waiting for its provider.
    pub(crate) fn sync_timeout(&mut self, entity: EntityInst) {
        if self.state == MonState::Synchronizing {
            if self.sync_role != SYNC_ROLE_REQUESTER || self.sync_state != SyncState::Chunks {
                tracing::debug!("spurious sync timeout while synchronizing");
                return;
            }
            tracing::info!(%entity, "sync provider timed out");

            let attempts = {
                let Some(provider) = self.sync_provider.as_mut() else {
                    return;
                };
                provider.attempts += 1;
                provider.attempts
            };
            if attempts > self.cfg.sync_max_retries || self.monmap.size() == 2 {
                // Too many tries, or there is just us and the monitor we
                // were syncing from. Start fresh whenever someone comes back.
                self.sync_requester_abort();
                return;
            }

            let entity_name = self
                .monmap
                .name_of_addr(entity.addr)
                .cloned()
                .unwrap_or_default();
            let debug_provider = self.cfg.sync_debug_provider.clone().unwrap_or_default();
            let debug_fallback = self
                .cfg
                .sync_debug_provider_fallback
                .clone()
                .unwrap_or_default();

            // Pick another monitor at random, but not forever.
            for _ in 0..(2 * self.monmap.size()) {
                let mut new_mon = match self.monmap.pick_random_name() {
                    Some(name) => name,
                    None => break,
                };
                if !debug_fallback.is_empty() {
                    if entity_name != debug_fallback {
                        new_mon = debug_fallback.clone();
                    } else if !debug_provider.is_empty() && entity_name != debug_provider {
                        new_mon = debug_provider.clone();
                    }
                }

                if new_mon != self.name && new_mon != entity_name {
                    let rank = self.monmap.rank_of_name(&new_mon);
                    let Some(inst) = self.monmap.get_inst(rank) else {
                        continue;
                    };
                    if let Some(provider) = self.sync_provider.as_mut() {
                        provider.entity = inst;
                        provider.crc = None;
                    }
                    self.sync_state = SyncState::Start;
                    self.sync_start_chunks();
                    return;
                }
            }

            tracing::error!("unable to find a new monitor to sync from");
            self.sync_requester_abort();
        } else if (self.sync_role & SYNC_ROLE_PROVIDER) != 0 {
            tracing::debug!(%entity, "provider-side chunk timeout, cleaning up");
            self.sync_provider_cleanup(entity);
        } else {
            tracing::debug!(%entity, "spurious sync timeout");
        }
    }

    // -- requester role -----------------------------------------------------

    /// Enter the requester role against `other` (the contact point; the
    /// true leader is learned from the start reply).
    pub(crate) fn sync_start(&mut self, other: EntityInst) {
        self.cancel_probe_timeout();

        tracing::info!(%other, "sync start");
        if self.state == MonState::Synchronizing && self.sync_role == SYNC_ROLE_REQUESTER {
            tracing::info!("already synchronizing, dropping request to start");
            return;
        }
        if self.sync_role != SYNC_ROLE_NONE || self.sync_state != SyncState::None {
            tracing::warn!(role = self.sync_role, "sync roles still active at sync start, resetting");
            self.reset_sync();
        }

        self.state = MonState::Synchronizing;
        self.sync_role = SYNC_ROLE_REQUESTER;
        self.sync_state = SyncState::Start;

        // Record intent first: a crash anywhere past this point is detected
        // at the next startup and the partial state discarded. Then clear
        // the whole slate, since the sync restarts from the bare beginning.
        let mut tx = Transaction::new();
        tx.put_u64(SYNC_PREFIX, "in_sync", 1);
        if !self.apply_tx_or_warn(&tx, "record in_sync") {
            self.sync_requester_abort();
            return;
        }
        let targets = self.sync_targets();
        if let Err(err) = self.store.clear(&targets) {
            tracing::error!(error = ?err, "failed to clear sync targets");
            self.sync_requester_abort();
            return;
        }

        // Assume `other` for both hats until the start reply tells us who
        // the leader really is.
        let mut leader = other;
        let mut provider = other;
        if let Some(name) = &self.cfg.sync_debug_leader {
            if let Some(inst) = self.monmap.get_inst(self.monmap.rank_of_name(name)) {
                tracing::debug!(%inst, "assuming debug sync leader");
                leader = inst;
            }
        }
        if let Some(name) = &self.cfg.sync_debug_provider {
            if let Some(inst) = self.monmap.get_inst(self.monmap.rank_of_name(name)) {
                tracing::debug!(%inst, "assuming debug sync provider");
                provider = inst;
            }
        }

        self.sync_leader = Some(SyncPeer::new(leader));
        self.sync_provider = Some(SyncPeer::new(provider));

        // The start may bounce through `other` to reach the leader, so give
        // the reply extra breathing room.
        let after = 2 * self.cfg.sync_trim_timeout;
        let token = self.arm_timer(TimerKind::SyncStartReplyTimeout, after);
        if let Some(peer) = self.sync_leader.as_mut() {
            peer.timeout = Some(token);
        }

        self.transport
            .send(other.addr, MonMessage::Sync(MonSync::new(SyncOp::Start)));
        killpoint(self.cfg.sync_requester_kill_at, "sync_requester", 1);
    }

    /// Ask the chosen provider for chunks, resuming from the last received
    /// key if this is a provider switch.
    fn sync_start_chunks(&mut self) {
        if self.sync_role != SYNC_ROLE_REQUESTER || self.sync_state != SyncState::Start {
            tracing::debug!("stray start-chunks attempt");
            return;
        }
        self.sync_state = SyncState::Chunks;

        let Some(entity) = self.sync_provider.as_ref().map(|p| p.entity) else {
            return;
        };
        let last_key = self
            .sync_provider
            .as_ref()
            .map(|p| p.last_received_key.clone())
            .unwrap_or_default();

        let after = self.cfg.sync_timeout;
        let token = self.arm_timer(TimerKind::SyncTimeout(entity), after);
        if let Some(provider) = self.sync_provider.as_mut() {
            provider.timeout = Some(token);
            // A fresh cursor can be audited; a resumed one cannot.
            provider.crc = if last_key.is_empty() {
                Some(crc32fast::Hasher::new())
            } else {
                None
            };
        }

        let mut msg = MonSync::new(SyncOp::StartChunks);
        if !last_key.is_empty() {
            msg.last_key = last_key;
        }

        killpoint(self.cfg.sync_requester_kill_at, "sync_requester", 4);
        self.transport.send(entity.addr, MonMessage::Sync(msg));
        killpoint(self.cfg.sync_requester_kill_at, "sync_requester", 5);
    }

    /// The leader never answered our start; restart the whole attempt.
    pub(crate) fn sync_start_reply_timeout(&mut self) {
        if self.state != MonState::Synchronizing
            || self.sync_role != SYNC_ROLE_REQUESTER
            || self.sync_state != SyncState::Start
        {
            tracing::debug!("spurious start-reply timeout");
            return;
        }
        // Not much work to lose; starting over is the right move while we
        // are still waiting on the leader.
        self.sync_requester_abort();
    }

    fn handle_sync_start_reply(&mut self, env: &Envelope, m: MonSync) {
        if self.sync_role != SYNC_ROLE_REQUESTER || self.sync_state != SyncState::Start {
            // Either the leader sent this before we failed, or it answered a
            // stray of ours. We cannot tell, and we must not poke at its
            // state on a guess; the timeouts will sort it out. Eventually.
            tracing::info!(from = %env.from, "stray sync start reply, dropping");
            return;
        }

        // We now know for sure who the leader is.
        if let Some(token) = self.sync_leader.as_mut().and_then(|p| p.timeout.take()) {
            self.cancel_timer(token);
        }
        if let Some(leader) = self.sync_leader.as_mut() {
            leader.entity = env.from;
        }

        if m.has_flag(SYNC_FLAG_RETRY) {
            tracing::debug!("leader busy, retrying sync at a later time");
            self.sync_role = SYNC_ROLE_NONE;
            self.sync_state = SyncState::None;
            let entity = env.from;
            let after = self.cfg.sync_backoff_timeout;
            let token = self.arm_timer(TimerKind::SyncStartRetry(entity), after);
            if let Some(leader) = self.sync_leader.as_mut() {
                leader.timeout = Some(token);
            }
            return;
        }

        let after = self.cfg.sync_heartbeat_timeout;
        let token = self.arm_timer(TimerKind::HeartbeatTimeout, after);
        if let Some(leader) = self.sync_leader.as_mut() {
            leader.timeout = Some(token);
        }

        killpoint(self.cfg.sync_requester_kill_at, "sync_requester", 2);
        self.sync_send_heartbeat(env.from, false);
        killpoint(self.cfg.sync_requester_kill_at, "sync_requester", 3);

        self.sync_start_chunks();
    }

    fn handle_sync_heartbeat_reply(&mut self, env: &Envelope, _m: MonSync) {
        let other = env.from;
        let leader_matches = self
            .sync_leader
            .as_ref()
            .map(|p| p.entity == other)
            .unwrap_or(false);
        if self.sync_role != SYNC_ROLE_REQUESTER
            || self.sync_state == SyncState::None
            || !leader_matches
        {
            tracing::info!(from = %other, "stray sync heartbeat reply, dropping");
            return;
        }

        if let Some(token) = self.sync_leader.as_mut().and_then(|p| p.timeout.take()) {
            self.cancel_timer(token);
        }
        let after = self.cfg.sync_heartbeat_interval;
        let token = self.arm_timer(TimerKind::HeartbeatInterval, after);
        if let Some(leader) = self.sync_leader.as_mut() {
            leader.timeout = Some(token);
        }
    }

    /// The heartbeat cadence timer fired: send the next heartbeat and start
    /// the silent-leader window.
    pub(crate) fn sync_heartbeat_interval_fired(&mut self) {
        if self.sync_role != SYNC_ROLE_REQUESTER {
            return;
        }
        let Some(entity) = self.sync_leader.as_ref().map(|p| p.entity) else {
            return;
        };
        let after = self.cfg.sync_heartbeat_timeout;
        let token = self.arm_timer(TimerKind::HeartbeatTimeout, after);
        if let Some(leader) = self.sync_leader.as_mut() {
            leader.timeout = Some(token);
        }
        self.sync_send_heartbeat(entity, false);
    }

    /// The leader went silent past the heartbeat window.
    pub(crate) fn sync_heartbeat_timeout_fired(&mut self) {
        if self.sync_role != SYNC_ROLE_REQUESTER {
            return;
        }
        tracing::info!("sync leader heartbeat timed out");
        self.sync_requester_abort();
    }

    fn handle_sync_chunk(&mut self, env: &Envelope, m: MonSync) {
        let other = env.from;
        let provider_matches = self
            .sync_provider
            .as_ref()
            .map(|p| p.entity == other)
            .unwrap_or(false);
        if self.sync_role != SYNC_ROLE_REQUESTER
            || self.sync_state != SyncState::Chunks
            || !provider_matches
        {
            tracing::info!(from = %other, "stray sync chunk, dropping");
            return;
        }

        if let Some(token) = self.sync_provider.as_mut().and_then(|p| p.timeout.take()) {
            self.cancel_timer(token);
        }

        let tx = match Transaction::decode(&m.chunk_bytes) {
            Ok(tx) => tx,
            Err(err) => {
                tracing::error!(error = ?err, "failed to decode sync chunk");
                self.sync_requester_abort();
                return;
            }
        };

        let after = self.cfg.sync_timeout;
        let token = self.arm_timer(TimerKind::SyncTimeout(other), after);
        if let Some(provider) = self.sync_provider.as_mut() {
            provider.timeout = Some(token);
            provider.last_received_key = m.last_key.clone();
        }

        let mut reply = MonSync::new(SyncOp::ChunkReply);
        let mut stop = false;
        if m.has_flag(SYNC_FLAG_LAST) {
            reply.flags |= SYNC_FLAG_LAST;
            stop = true;
        }
        killpoint(self.cfg.sync_requester_kill_at, "sync_requester", 8);
        self.transport.send(other.addr, MonMessage::Sync(reply));

        if !self.apply_tx_or_warn(&tx, "apply sync chunk") {
            self.sync_requester_abort();
            return;
        }
        if let Some(hasher) = self.sync_provider.as_mut().and_then(|p| p.crc.as_mut()) {
            tx.crc_update(hasher);
        }

        if self.cfg.sync_debug {
            if let Some(expected) = m.crc {
                let got = self
                    .sync_provider
                    .as_ref()
                    .and_then(|p| p.crc.as_ref())
                    .map(|h| h.clone().finalize());
                if let Some(got) = got {
                    tracing::debug!(expected, got, "checking chunk crc");
                    if got != expected {
                        tracing::error!(expected, got, "sync chunk crc mismatch");
                        self.sync_requester_abort();
                        return;
                    }
                }
            }
        }

        if stop {
            self.sync_stop();
        }
    }

    fn sync_stop(&mut self) {
        tracing::debug!("sync stop");
        if self.sync_role != SYNC_ROLE_REQUESTER || self.sync_state != SyncState::Chunks {
            return;
        }
        self.sync_state = SyncState::Stop;

        if let Some(token) = self.sync_leader.as_mut().and_then(|p| p.timeout.take()) {
            self.cancel_timer(token);
        }
        if let Some(token) = self.sync_provider.as_mut().and_then(|p| p.timeout.take()) {
            self.cancel_timer(token);
        }
        self.sync_provider = None;

        let Some(leader) = self.sync_leader.as_ref().map(|p| p.entity) else {
            return;
        };
        let after = self.cfg.sync_timeout;
        let token = self.arm_timer(TimerKind::SyncFinishReplyTimeout, after);
        if let Some(peer) = self.sync_leader.as_mut() {
            peer.timeout = Some(token);
        }

        killpoint(self.cfg.sync_requester_kill_at, "sync_requester", 9);
        self.transport
            .send(leader.addr, MonMessage::Sync(MonSync::new(SyncOp::Finish)));
        killpoint(self.cfg.sync_requester_kill_at, "sync_requester", 10);
    }

    pub(crate) fn sync_finish_reply_timeout(&mut self) {
        if self.state != MonState::Synchronizing
            || self.sync_role != SYNC_ROLE_REQUESTER
            || self.sync_state != SyncState::Stop
        {
            tracing::debug!("spurious finish-reply timeout");
            return;
        }
        self.sync_requester_abort();
    }

    fn handle_sync_finish_reply(&mut self, env: &Envelope, _m: MonSync) {
        let leader_matches = self
            .sync_leader
            .as_ref()
            .map(|p| p.entity == env.from)
            .unwrap_or(false);
        if self.sync_role != SYNC_ROLE_REQUESTER
            || self.sync_state != SyncState::Stop
            || !leader_matches
        {
            tracing::info!(from = %env.from, "stray sync finish reply, dropping");
            return;
        }

        self.sync_role = SYNC_ROLE_NONE;
        self.sync_state = SyncState::None;

        if let Some(token) = self.sync_leader.as_mut().and_then(|p| p.timeout.take()) {
            self.cancel_timer(token);
        }
        self.sync_leader = None;

        let mut tx = Transaction::new();
        tx.erase(SYNC_PREFIX, "in_sync");
        self.apply_tx_or_warn(&tx, "erase in_sync");

        // The store just changed underneath the log and the services;
        // everyone re-reads it.
        if let Err(err) = self.init_paxos() {
            tracing::error!(error = ?err, "log re-init after sync failed");
        }

        killpoint(self.cfg.sync_requester_kill_at, "sync_requester", 11);
        tracing::info!("store sync complete");

        self.bootstrap();
    }

    fn handle_sync_abort(&mut self, env: &Envelope, _m: MonSync) {
        // Who aborts what depends on the hat we are wearing: a requester
        // told by its leader must scrap the sync (a trim may already be
        // under way at a new leader); a provider told by its requester just
        // drops the session.
        let other = env.from;
        let leader_matches = self
            .sync_leader
            .as_ref()
            .map(|p| p.entity == other)
            .unwrap_or(false);
        if self.sync_role == SYNC_ROLE_REQUESTER && leader_matches {
            self.sync_requester_abort();
        } else if (self.sync_role & SYNC_ROLE_PROVIDER) != 0
            && self
                .sync_entities
                .get(&other)
                .map(|entry| entry.state == SyncState::Start)
                .unwrap_or(false)
        {
            self.sync_provider_cleanup(other);
        } else {
            tracing::info!(from = %other, "stray sync abort, dropping");
        }
    }

    /// Scrap the whole requester-side sync: the store is presumed
    /// inconsistent, so clear it and start from scratch.
    pub(crate) fn sync_requester_abort(&mut self) {
        tracing::info!(
            leader = ?self.sync_leader.as_ref().map(|p| p.entity.to_string()),
            provider = ?self.sync_provider.as_ref().map(|p| p.entity.to_string()),
            "sync requester abort, clearing potentially inconsistent store"
        );

        if let Some(token) = self.sync_leader.as_mut().and_then(|p| p.timeout.take()) {
            self.cancel_timer(token);
        }
        self.sync_leader = None;

        if let Some(token) = self.sync_provider.as_mut().and_then(|p| p.timeout.take()) {
            self.cancel_timer(token);
        }
        if let Some(provider) = self.sync_provider.take() {
            self.transport.send(
                provider.entity.addr,
                MonMessage::Sync(MonSync::new(SyncOp::Abort)),
            );
        }

        let mut targets = self.sync_targets();
        targets.insert(SYNC_PREFIX.to_string());
        if let Err(err) = self.store.clear(&targets) {
            tracing::error!(error = ?err, "failed to clear store on abort");
        }

        tracing::info!("no longer a sync requester");
        self.sync_role = SYNC_ROLE_NONE;
        self.sync_state = SyncState::None;

        self.bootstrap();
    }
}
