//! Supervised replicated-log seam.
//!
//! The monitor does not implement consensus; it hosts a replicated log and
//! steers it through this interface: lifecycle resets around elections,
//! version accessors for probe/sync decisions, and the trim switch the sync
//! leader freezes during a transfer.

use std::sync::Arc;

use crate::messages::PaxosWire;
use crate::store::MonStore;

/// Versions the log keeps trimmed down to, before trim kicks in.
const TRIM_MIN: u64 = 250;

pub trait ReplicatedLog: Send + 'static {
    /// Prefix under which the log persists its state.
    fn name(&self) -> &str;
    /// Load (or reload) durable state. Called at startup and after a
    /// completed store sync so the log re-reads what the sync wrote.
    fn init(&mut self) -> anyhow::Result<()>;
    /// Drop volatile protocol state when the monitor leaves a quorum.
    fn restart(&mut self);
    fn leader_init(&mut self);
    fn peon_init(&mut self);
    /// Hand the log one piece of its own protocol traffic.
    fn dispatch(&mut self, from_rank: i32, wire: PaxosWire);
    fn get_version(&self) -> u64;
    fn get_first_committed(&self) -> u64;
    fn is_consistent(&self) -> bool;
    fn trim_disable(&mut self);
    fn trim_enable(&mut self);
    fn is_trim_disabled(&self) -> bool;
    fn should_trim(&self) -> bool;
}

/// Store-backed version bookkeeping for the replicated log.
///
/// Tracks exactly what the monitor core needs to supervise a log
/// implementation: the committed version range and the trim switch.
pub struct LogBook {
    store: Arc<MonStore>,
    first_committed: u64,
    last_committed: u64,
    trim_disabled: bool,
}

impl LogBook {
    pub const PREFIX: &'static str = "paxos";

    pub fn new(store: Arc<MonStore>) -> Self {
        Self {
            store,
            first_committed: 0,
            last_committed: 0,
            trim_disabled: false,
        }
    }

    fn reload(&mut self) -> anyhow::Result<()> {
        self.first_committed = self
            .store
            .get_u64(Self::PREFIX, "first_committed")?
            .unwrap_or(0);
        self.last_committed = self
            .store
            .get_u64(Self::PREFIX, "last_committed")?
            .unwrap_or(0);
        Ok(())
    }
}

impl ReplicatedLog for LogBook {
    fn name(&self) -> &str {
        Self::PREFIX
    }

    fn init(&mut self) -> anyhow::Result<()> {
        self.reload()?;
        tracing::debug!(
            first = self.first_committed,
            last = self.last_committed,
            "replicated log init"
        );
        Ok(())
    }

    fn restart(&mut self) {
        if let Err(err) = self.reload() {
            tracing::warn!(error = ?err, "replicated log restart reload failed");
        }
    }

    fn leader_init(&mut self) {
        tracing::debug!(last = self.last_committed, "replicated log leader init");
    }

    fn peon_init(&mut self) {
        tracing::debug!(last = self.last_committed, "replicated log peon init");
    }

    fn dispatch(&mut self, from_rank: i32, wire: PaxosWire) {
        // Protocol handling lives in the log implementation proper; the
        // bookkeeping stand-in only tracks committed versions.
        tracing::trace!(from_rank, epoch = wire.epoch, "log traffic ignored by bookkeeping");
    }

    fn get_version(&self) -> u64 {
        self.last_committed
    }

    fn get_first_committed(&self) -> u64 {
        self.first_committed
    }

    fn is_consistent(&self) -> bool {
        self.first_committed <= self.last_committed
    }

    fn trim_disable(&mut self) {
        self.trim_disabled = true;
    }

    fn trim_enable(&mut self) {
        self.trim_disabled = false;
    }

    fn is_trim_disabled(&self) -> bool {
        self.trim_disabled
    }

    fn should_trim(&self) -> bool {
        !self.trim_disabled && self.last_committed.saturating_sub(self.first_committed) > TRIM_MIN
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Transaction;
    use tempfile::TempDir;

    #[test]
    fn versions_track_store_and_trim_gates() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MonStore::open(dir.path()).unwrap());
        let mut tx = Transaction::new();
        tx.put_u64(LogBook::PREFIX, "first_committed", 10);
        tx.put_u64(LogBook::PREFIX, "last_committed", 1000);
        store.apply_transaction(&tx).unwrap();

        let mut log = LogBook::new(store);
        log.init().unwrap();
        assert_eq!(log.get_first_committed(), 10);
        assert_eq!(log.get_version(), 1000);
        assert!(log.is_consistent());
        assert!(log.should_trim());

        log.trim_disable();
        assert!(log.is_trim_disabled());
        assert!(!log.should_trim());
        log.trim_enable();
        assert!(log.should_trim());
    }
}
