//! Rank election driven by the election supervisor.
//!
//! Lowest rank wins: a proposer broadcasts `Propose`, higher-ranked peers
//! defer with `Ack`, and the proposer declares `Victory` once every member
//! acked or a majority acked by the end of the round. Epochs are odd while
//! an election is in flight and bumped to even on victory. The elector is a
//! pure state machine: every entry point returns the sends, timer arms, and
//! outcome for the monitor to apply, which keeps it unit-testable without a
//! transport.

use std::collections::BTreeSet;

use crate::messages::{ElectionOp, MonElection};
use crate::monmap::MonMap;

#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    Win {
        epoch: u64,
        quorum: BTreeSet<i32>,
    },
    Lose {
        epoch: u64,
        quorum: BTreeSet<i32>,
        leader: i32,
    },
}

/// Side effects of one elector entry point.
#[derive(Debug, Default)]
pub struct Actions {
    /// `(target_rank, message)` pairs to send.
    pub send: Vec<(i32, MonElection)>,
    /// Arm (or re-arm) the election expiry timer.
    pub arm_expire: bool,
    /// Epoch value to persist before anything is sent.
    pub persist_epoch: Option<u64>,
    /// Election outcome to apply via `win_election`/`lose_election`.
    pub outcome: Option<Outcome>,
}

pub struct Elector {
    epoch: u64,
    electing: bool,
    participating: bool,
    acked_me: BTreeSet<i32>,
    leader_acked: Option<i32>,
}

impl Elector {
    pub fn new(epoch: u64) -> Self {
        Self {
            epoch,
            electing: false,
            participating: true,
            acked_me: BTreeSet::new(),
            leader_acked: None,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_electing(&self) -> bool {
        self.electing
    }

    pub fn start_participating(&mut self) {
        self.participating = true;
    }

    /// Stop answering election traffic (the `quorum exit` command).
    pub fn stop_participating(&mut self) {
        self.participating = false;
        self.electing = false;
        self.acked_me.clear();
        self.leader_acked = None;
    }

    pub fn shutdown(&mut self) {
        self.stop_participating();
    }

    /// Epoch for a standalone victory, bumped past any election in flight.
    pub fn standalone_epoch(&mut self) -> u64 {
        self.epoch += if self.epoch % 2 == 1 { 1 } else { 2 };
        self.electing = false;
        self.epoch
    }

    /// Begin (or restart) an election round proposing ourselves.
    pub fn start(&mut self, my_rank: i32, monmap: &MonMap) -> Actions {
        let mut actions = Actions::default();
        if !self.participating {
            return actions;
        }
        if self.epoch % 2 == 0 {
            self.epoch += 1;
            actions.persist_epoch = Some(self.epoch);
        }
        self.electing = true;
        self.leader_acked = None;
        self.acked_me.clear();
        self.acked_me.insert(my_rank);

        for rank in 0..monmap.size() as i32 {
            if rank != my_rank {
                actions.send.push((
                    rank,
                    MonElection {
                        fsid: monmap.fsid,
                        epoch: self.epoch,
                        op: ElectionOp::Propose,
                    },
                ));
            }
        }
        actions.arm_expire = true;
        actions
    }

    /// Election traffic from a peer.
    pub fn handle(
        &mut self,
        my_rank: i32,
        from_rank: i32,
        msg: &MonElection,
        monmap: &MonMap,
    ) -> Actions {
        if !self.participating {
            return Actions::default();
        }
        match &msg.op {
            ElectionOp::Propose => self.handle_propose(my_rank, from_rank, msg.epoch, monmap),
            ElectionOp::Ack => self.handle_ack(my_rank, from_rank, msg.epoch, monmap),
            ElectionOp::Victory { quorum } => {
                self.handle_victory(from_rank, msg.epoch, quorum.clone())
            }
        }
    }

    fn handle_propose(
        &mut self,
        my_rank: i32,
        from_rank: i32,
        epoch: u64,
        monmap: &MonMap,
    ) -> Actions {
        let mut actions = Actions::default();
        if epoch > self.epoch {
            self.epoch = epoch;
            actions.persist_epoch = Some(self.epoch);
        } else if epoch < self.epoch {
            // The proposer is behind; answering would split the round. Open
            // a fresh round at our epoch so it catches up.
            return self.merge_start(my_rank, monmap, actions);
        }

        let defer_ok = self.leader_acked.is_none() || from_rank <= self.leader_acked.unwrap_or(i32::MAX);
        if from_rank < my_rank && defer_ok {
            self.electing = true;
            self.leader_acked = Some(from_rank);
            self.acked_me.clear();
            actions.send.push((
                from_rank,
                MonElection {
                    fsid: monmap.fsid,
                    epoch: self.epoch,
                    op: ElectionOp::Ack,
                },
            ));
            actions.arm_expire = true;
        } else if !self.electing {
            // A higher rank proposed; counter-propose ourselves.
            return self.merge_start(my_rank, monmap, actions);
        }
        actions
    }

    fn handle_ack(&mut self, my_rank: i32, from_rank: i32, epoch: u64, monmap: &MonMap) -> Actions {
        let mut actions = Actions::default();
        if !self.electing || epoch != self.epoch || self.leader_acked.is_some() {
            tracing::debug!(from_rank, epoch, "stray election ack");
            return actions;
        }
        self.acked_me.insert(from_rank);
        if self.acked_me.len() == monmap.size() {
            // Everyone answered; no need to wait out the round.
            return self.declare_victory(my_rank, monmap);
        }
        actions
    }

    fn handle_victory(&mut self, from_rank: i32, epoch: u64, quorum: BTreeSet<i32>) -> Actions {
        let mut actions = Actions::default();
        if epoch < self.epoch {
            tracing::debug!(from_rank, epoch, our_epoch = self.epoch, "stale victory");
            return actions;
        }
        self.epoch = epoch;
        actions.persist_epoch = Some(self.epoch);
        self.electing = false;
        self.leader_acked = None;
        self.acked_me.clear();
        actions.outcome = Some(Outcome::Lose {
            epoch,
            quorum,
            leader: from_rank,
        });
        actions
    }

    /// The round timer fired: tally acks or start over.
    pub fn expire(&mut self, my_rank: i32, monmap: &MonMap) -> Actions {
        if !self.electing {
            return Actions::default();
        }
        let need = monmap.size() / 2 + 1;
        if self.leader_acked.is_none() && self.acked_me.len() >= need {
            return self.declare_victory(my_rank, monmap);
        }
        // Deferred to a proposer that never won, or not enough acks: retry.
        self.electing = false;
        self.start(my_rank, monmap)
    }

    fn declare_victory(&mut self, my_rank: i32, monmap: &MonMap) -> Actions {
        let mut actions = Actions::default();
        self.epoch += 1;
        actions.persist_epoch = Some(self.epoch);
        self.electing = false;
        self.leader_acked = None;
        let quorum = std::mem::take(&mut self.acked_me);
        for rank in &quorum {
            if *rank != my_rank {
                actions.send.push((
                    *rank,
                    MonElection {
                        fsid: monmap.fsid,
                        epoch: self.epoch,
                        op: ElectionOp::Victory {
                            quorum: quorum.clone(),
                        },
                    },
                ));
            }
        }
        actions.outcome = Some(Outcome::Win {
            epoch: self.epoch,
            quorum,
        });
        actions
    }

    fn merge_start(&mut self, my_rank: i32, monmap: &MonMap, mut actions: Actions) -> Actions {
        let mut started = self.start(my_rank, monmap);
        if actions.persist_epoch.is_some() && started.persist_epoch.is_none() {
            started.persist_epoch = actions.persist_epoch.take();
        }
        started
    }
}
