//! Prefixed key/value store backing the monitor.
//!
//! One fjall partition per prefix; cross-prefix writes commit through a
//! single `Transaction` applied as one atomic batch. The `Synchronizer`
//! walks every sync-target prefix in order and re-chunks the contents into
//! transactions small enough to ship to a lagging peer, keeping a rolling
//! CRC so the receiver can audit the transfer.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::RwLock;

use anyhow::Context;
use fjall::{Keyspace, PartitionCreateOptions, PersistMode};
use serde::{Deserialize, Serialize};

use crate::messages::StoreKey;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
enum Op {
    Put {
        prefix: String,
        key: String,
        value: Vec<u8>,
    },
    Erase {
        prefix: String,
        key: String,
    },
    ErasePrefix {
        prefix: String,
    },
}

/// An ordered batch of store mutations applied atomically.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    ops: Vec<Op>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, prefix: impl Into<String>, key: impl Into<String>, value: Vec<u8>) {
        self.ops.push(Op::Put {
            prefix: prefix.into(),
            key: key.into(),
            value,
        });
    }

    pub fn put_u64(&mut self, prefix: impl Into<String>, key: impl Into<String>, value: u64) {
        self.put(prefix, key, value.to_be_bytes().to_vec());
    }

    pub fn erase(&mut self, prefix: impl Into<String>, key: impl Into<String>) {
        self.ops.push(Op::Erase {
            prefix: prefix.into(),
            key: key.into(),
        });
    }

    pub fn erase_prefix(&mut self, prefix: impl Into<String>) {
        self.ops.push(Op::ErasePrefix {
            prefix: prefix.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Approximate encoded weight, used to bound sync chunk sizes.
    pub fn byte_weight(&self) -> usize {
        self.ops
            .iter()
            .map(|op| match op {
                Op::Put { prefix, key, value } => prefix.len() + key.len() + value.len(),
                Op::Erase { prefix, key } => prefix.len() + key.len(),
                Op::ErasePrefix { prefix } => prefix.len(),
            })
            .sum()
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("transactions always serialize")
    }

    pub fn decode(bytes: &[u8]) -> anyhow::Result<Self> {
        serde_json::from_slice(bytes).context("decode store transaction")
    }

    /// Append the ops of an encoded transaction (sync chunk payloads).
    pub fn append_from_encoded(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
        let other = Self::decode(bytes)?;
        self.ops.extend(other.ops);
        Ok(())
    }

    /// Feed the put ops into a rolling CRC, in order, hashing exactly what
    /// the synchronizer hashes on the sending side.
    pub fn crc_update(&self, hasher: &mut crc32fast::Hasher) {
        for op in &self.ops {
            if let Op::Put { prefix, key, value } = op {
                hasher.update(prefix.as_bytes());
                hasher.update(key.as_bytes());
                hasher.update(value);
            }
        }
    }
}

/// Monitor store: prefixed get/put/clear plus atomic transactions.
pub struct MonStore {
    keyspace: Keyspace,
    partitions: RwLock<HashMap<String, fjall::PartitionHandle>>,
}

impl MonStore {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let keyspace = fjall::Config::new(path.as_ref())
            .open()
            .context("open monitor store keyspace")?;
        Ok(Self {
            keyspace,
            partitions: RwLock::new(HashMap::new()),
        })
    }

    fn partition(&self, prefix: &str) -> anyhow::Result<fjall::PartitionHandle> {
        if let Some(handle) = self
            .partitions
            .read()
            .ok()
            .and_then(|guard| guard.get(prefix).cloned())
        {
            return Ok(handle);
        }
        let handle = self
            .keyspace
            .open_partition(prefix, PartitionCreateOptions::default())
            .with_context(|| format!("open store partition {prefix}"))?;
        if let Ok(mut guard) = self.partitions.write() {
            guard.insert(prefix.to_string(), handle.clone());
        }
        Ok(handle)
    }

    pub fn get(&self, prefix: &str, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let part = self.partition(prefix)?;
        Ok(part.get(key)?.map(|slice| slice.to_vec()))
    }

    pub fn exists(&self, prefix: &str, key: &str) -> anyhow::Result<bool> {
        Ok(self.get(prefix, key)?.is_some())
    }

    pub fn get_u64(&self, prefix: &str, key: &str) -> anyhow::Result<Option<u64>> {
        let Some(bytes) = self.get(prefix, key)? else {
            return Ok(None);
        };
        let arr: [u8; 8] = bytes
            .as_slice()
            .try_into()
            .with_context(|| format!("store key {prefix}/{key} is not a u64"))?;
        Ok(Some(u64::from_be_bytes(arr)))
    }

    /// Apply a transaction as one atomic batch and flush it durably.
    pub fn apply_transaction(&self, tx: &Transaction) -> anyhow::Result<()> {
        let mut batch = self.keyspace.batch();
        for op in &tx.ops {
            match op {
                Op::Put { prefix, key, value } => {
                    let part = self.partition(prefix)?;
                    batch.insert(&part, key.as_bytes(), value.clone());
                }
                Op::Erase { prefix, key } => {
                    let part = self.partition(prefix)?;
                    batch.remove(&part, key.as_bytes());
                }
                Op::ErasePrefix { prefix } => {
                    let part = self.partition(prefix)?;
                    for item in part.iter() {
                        let (key, _) = item?;
                        batch.remove(&part, key.to_vec());
                    }
                }
            }
        }
        batch.commit().context("commit store transaction")?;
        self.keyspace
            .persist(PersistMode::SyncAll)
            .context("persist store transaction")?;
        Ok(())
    }

    /// Clear every key under the given prefixes in one atomic batch.
    pub fn clear(&self, prefixes: &BTreeSet<String>) -> anyhow::Result<()> {
        let mut tx = Transaction::new();
        for prefix in prefixes {
            tx.erase_prefix(prefix.clone());
        }
        self.apply_transaction(&tx)
    }

    /// Full contents of one prefix, for status output and tests.
    pub fn snapshot(&self, prefix: &str) -> anyhow::Result<BTreeMap<String, Vec<u8>>> {
        let part = self.partition(prefix)?;
        let mut out = BTreeMap::new();
        for item in part.iter() {
            let (key, value) = item?;
            out.insert(String::from_utf8_lossy(&key).into_owned(), value.to_vec());
        }
        Ok(out)
    }

    /// Create a chunk cursor over `prefixes`, optionally resuming after
    /// `after` (the requester's last received key).
    pub fn synchronizer(
        &self,
        prefixes: &BTreeSet<String>,
        after: Option<StoreKey>,
        chunk_bytes: usize,
    ) -> anyhow::Result<Synchronizer> {
        let mut parts = Vec::with_capacity(prefixes.len());
        for prefix in prefixes {
            parts.push((prefix.clone(), self.partition(prefix)?));
        }
        let (prefix_idx, last_key) = match after {
            Some(pos) if !pos.is_empty() => {
                match parts.iter().position(|(name, _)| *name == pos.prefix) {
                    Some(idx) => (idx, Some(pos.key)),
                    None => (0, None),
                }
            }
            _ => (0, None),
        };
        Ok(Synchronizer {
            parts,
            prefix_idx,
            last_key,
            done: false,
            chunk_bytes: chunk_bytes.max(1),
            crc: crc32fast::Hasher::new(),
        })
    }
}

/// One shippable slice of store state.
pub struct SyncChunk {
    pub tx: Transaction,
    pub last_key: StoreKey,
    pub last: bool,
}

/// Cursor that walks sync-target prefixes in order and cuts the key space
/// into bounded chunks.
pub struct Synchronizer {
    parts: Vec<(String, fjall::PartitionHandle)>,
    prefix_idx: usize,
    last_key: Option<String>,
    done: bool,
    chunk_bytes: usize,
    crc: crc32fast::Hasher,
}

impl Synchronizer {
    pub fn has_next_chunk(&self) -> bool {
        !self.done
    }

    /// Rolling CRC over every key/value shipped so far.
    pub fn crc(&self) -> u32 {
        self.crc.clone().finalize()
    }

    fn next_entry(&mut self) -> anyhow::Result<Option<(String, String, Vec<u8>)>> {
        while self.prefix_idx < self.parts.len() {
            let (prefix, part) = &self.parts[self.prefix_idx];
            let next = match &self.last_key {
                Some(last) => {
                    use std::ops::Bound;
                    part.range((
                        Bound::Excluded(last.as_bytes().to_vec()),
                        Bound::<Vec<u8>>::Unbounded,
                    ))
                    .next()
                }
                None => part.iter().next(),
            };
            match next {
                Some(item) => {
                    let (key, value) = item?;
                    let key = String::from_utf8_lossy(&key).into_owned();
                    self.last_key = Some(key.clone());
                    return Ok(Some((prefix.clone(), key, value.to_vec())));
                }
                None => {
                    self.prefix_idx += 1;
                    self.last_key = None;
                }
            }
        }
        Ok(None)
    }

    /// Produce the next chunk. Returns `None` once the terminal chunk has
    /// been handed out.
    pub fn next_chunk(&mut self) -> anyhow::Result<Option<SyncChunk>> {
        if self.done {
            return Ok(None);
        }
        let mut tx = Transaction::new();
        let mut last_key = StoreKey::default();
        while tx.byte_weight() < self.chunk_bytes {
            match self.next_entry()? {
                Some((prefix, key, value)) => {
                    self.crc.update(prefix.as_bytes());
                    self.crc.update(key.as_bytes());
                    self.crc.update(&value);
                    last_key = StoreKey::new(prefix.clone(), key.clone());
                    tx.put(prefix, key, value);
                }
                None => {
                    self.done = true;
                    return Ok(Some(SyncChunk {
                        tx,
                        last_key,
                        last: true,
                    }));
                }
            }
        }
        Ok(Some(SyncChunk {
            tx,
            last_key,
            last: false,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store() -> (TempDir, MonStore) {
        let dir = TempDir::new().unwrap();
        let store = MonStore::open(dir.path()).unwrap();
        (dir, store)
    }

    fn seed(store: &MonStore, prefix: &str, count: usize) {
        let mut tx = Transaction::new();
        for i in 0..count {
            tx.put(prefix, format!("{i:06}"), format!("value-{prefix}-{i}").into_bytes());
        }
        store.apply_transaction(&tx).unwrap();
    }

    #[test]
    fn transaction_apply_and_clear() {
        let (_dir, store) = open_store();
        let mut tx = Transaction::new();
        tx.put("monitor", "magic", b"lodestone".to_vec());
        tx.put_u64("paxos", "last_committed", 12);
        store.apply_transaction(&tx).unwrap();

        assert_eq!(
            store.get("monitor", "magic").unwrap().unwrap(),
            b"lodestone".to_vec()
        );
        assert_eq!(store.get_u64("paxos", "last_committed").unwrap(), Some(12));

        let mut prefixes = BTreeSet::new();
        prefixes.insert("paxos".to_string());
        store.clear(&prefixes).unwrap();
        assert!(store.get("paxos", "last_committed").unwrap().is_none());
        assert!(store.exists("monitor", "magic").unwrap());
    }

    #[test]
    fn erase_inside_transaction() {
        let (_dir, store) = open_store();
        seed(&store, "log", 3);
        let mut tx = Transaction::new();
        tx.erase("log", "000001");
        store.apply_transaction(&tx).unwrap();
        let snap = store.snapshot("log").unwrap();
        assert_eq!(snap.len(), 2);
        assert!(!snap.contains_key("000001"));
    }

    #[test]
    fn synchronizer_copies_everything() {
        let (_dir, src) = open_store();
        seed(&src, "auth", 10);
        seed(&src, "paxos", 200);
        let (_dir2, dst) = open_store();

        let prefixes: BTreeSet<String> =
            ["auth".to_string(), "paxos".to_string()].into_iter().collect();
        let mut sync = src.synchronizer(&prefixes, None, 512).unwrap();
        let mut chunks = 0;
        loop {
            let chunk = sync.next_chunk().unwrap().expect("chunk before last");
            dst.apply_transaction(&chunk.tx).unwrap();
            chunks += 1;
            if chunk.last {
                break;
            }
        }
        assert!(chunks > 1, "expected multiple chunks, got {chunks}");
        assert_eq!(src.snapshot("auth").unwrap(), dst.snapshot("auth").unwrap());
        assert_eq!(src.snapshot("paxos").unwrap(), dst.snapshot("paxos").unwrap());
        assert!(sync.next_chunk().unwrap().is_none());
    }

    #[test]
    fn synchronizer_resumes_after_key() {
        let (_dir, src) = open_store();
        seed(&src, "paxos", 10);
        let prefixes: BTreeSet<String> = ["paxos".to_string()].into_iter().collect();

        let mut first = src.synchronizer(&prefixes, None, 64).unwrap();
        let chunk = first.next_chunk().unwrap().unwrap();
        assert!(!chunk.last);

        let mut resumed = src
            .synchronizer(&prefixes, Some(chunk.last_key.clone()), 1 << 20)
            .unwrap();
        let rest = resumed.next_chunk().unwrap().unwrap();
        assert!(rest.last);
        let resumed_keys: Vec<String> = {
            let (_dir3, dst) = open_store();
            dst.apply_transaction(&rest.tx).unwrap();
            dst.snapshot("paxos").unwrap().keys().cloned().collect()
        };
        assert!(!resumed_keys.contains(&chunk.last_key.key));
        assert!(resumed_keys.iter().all(|k| k > &chunk.last_key.key));
    }

    #[test]
    fn empty_store_yields_single_terminal_chunk() {
        let (_dir, store) = open_store();
        let prefixes: BTreeSet<String> = ["paxos".to_string()].into_iter().collect();
        let mut sync = store.synchronizer(&prefixes, None, 1024).unwrap();
        let chunk = sync.next_chunk().unwrap().unwrap();
        assert!(chunk.last);
        assert!(chunk.tx.is_empty());
        assert!(sync.next_chunk().unwrap().is_none());
    }
}
