//! Cluster membership map.
//!
//! An immutable-per-epoch snapshot of monitor identities. Ranks are derived
//! from position in name order; epoch 0 marks a seed map whose addresses may
//! still be blank or whose members may carry `noname-` placeholders.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::net::SocketAddr;

use anyhow::Context;
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::messages::{blank_addr, EntityInst};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MonMap {
    pub fsid: Uuid,
    pub epoch: u64,
    members: BTreeMap<String, SocketAddr>,
}

impl MonMap {
    pub fn new(fsid: Uuid) -> Self {
        Self {
            fsid,
            epoch: 0,
            members: BTreeMap::new(),
        }
    }

    /// Build a seed map from bare addresses, giving each a `noname-<n>`
    /// placeholder until probing learns real names.
    pub fn from_addrs(fsid: Uuid, addrs: &[SocketAddr]) -> Self {
        let mut map = Self::new(fsid);
        for (i, addr) in addrs.iter().enumerate() {
            map.members.insert(format!("noname-{i}"), *addr);
        }
        map
    }

    pub fn add(&mut self, name: impl Into<String>, addr: SocketAddr) {
        self.members.insert(name.into(), addr);
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.members.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.members.keys()
    }

    pub fn addr_of(&self, name: &str) -> Option<SocketAddr> {
        self.members.get(name).copied()
    }

    pub fn name_of_addr(&self, addr: SocketAddr) -> Option<&String> {
        self.members
            .iter()
            .find(|(_, a)| **a == addr)
            .map(|(name, _)| name)
    }

    /// Rank of a member by name: its position in name order, or -1.
    pub fn rank_of_name(&self, name: &str) -> i32 {
        match self.members.keys().position(|n| n == name) {
            Some(i) => i as i32,
            None => -1,
        }
    }

    /// Rank of a member by address, or -1 when the address is unknown.
    pub fn rank_of_addr(&self, addr: SocketAddr) -> i32 {
        match self.members.values().position(|a| *a == addr) {
            Some(i) => i as i32,
            None => -1,
        }
    }

    pub fn get_inst(&self, rank: i32) -> Option<EntityInst> {
        if rank < 0 {
            return None;
        }
        self.members
            .values()
            .nth(rank as usize)
            .map(|addr| EntityInst::mon(rank as i64, *addr))
    }

    pub fn rename(&mut self, old: &str, new: impl Into<String>) {
        if let Some(addr) = self.members.remove(old) {
            self.members.insert(new.into(), addr);
        }
    }

    pub fn set_addr(&mut self, name: &str, addr: SocketAddr) {
        if let Some(slot) = self.members.get_mut(name) {
            *slot = addr;
        }
    }

    /// Pick a uniformly random member name.
    pub fn pick_random_name(&self) -> Option<String> {
        if self.members.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..self.members.len());
        self.members.keys().nth(idx).cloned()
    }

    /// Restrict a seed map to the configured initial member list.
    ///
    /// Members named in `initial` but absent from the map are added with a
    /// blank address; members present but not named are dropped, their
    /// addresses returned as probe hints. Our own entry always carries our
    /// address.
    pub fn set_initial_members(
        &mut self,
        initial: &[String],
        my_name: &str,
        my_addr: SocketAddr,
        extra_probe_peers: &mut BTreeSet<SocketAddr>,
    ) {
        let keep: BTreeSet<&String> = initial.iter().collect();
        let old = std::mem::take(&mut self.members);
        for (name, addr) in old {
            if keep.contains(&name) {
                self.members.insert(name, addr);
            } else if addr != blank_addr() {
                extra_probe_peers.insert(addr);
            }
        }
        for name in initial {
            self.members.entry(name.clone()).or_insert_with(blank_addr);
        }
        if self.members.contains_key(my_name) {
            self.members.insert(my_name.to_string(), my_addr);
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("monmap always serializes")
    }

    pub fn decode(bytes: &[u8]) -> anyhow::Result<Self> {
        serde_json::from_slice(bytes).context("decode monmap")
    }
}
