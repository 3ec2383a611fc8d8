//! Runtime tunables for the monitor.
//!
//! Every timeout the coordination engine arms lives here so tests can shrink
//! them and operators can stretch them. Killpoints are deterministic crash
//! switches used by the black-box fault-recovery suites.

use std::time::Duration;

/// Monitor runtime configuration.
///
/// Defaults mirror what a small production cluster runs with. All durations
/// are wall-clock; the tick interval bounds how stale session expiry and
/// waitlist re-drives can get.
#[derive(Clone, Debug)]
pub struct MonConfig {
    /// Interval between monitor ticks (service ticks, session trimming).
    pub tick_interval: Duration,
    /// Lease used to bound waitlisted-session age while out of quorum.
    pub lease: Duration,
    /// Probe phase stall timeout; expiry re-enters bootstrap.
    pub probe_timeout: Duration,
    /// Election round length before the elector tallies its acks.
    pub election_timeout: Duration,
    /// Leader-side window without a requester heartbeat before the sync
    /// session is dropped and trim may re-enable.
    pub sync_trim_timeout: Duration,
    /// Requester heartbeat send cadence.
    pub sync_heartbeat_interval: Duration,
    /// Requester abort window when the sync leader goes silent.
    pub sync_heartbeat_timeout: Duration,
    /// Chunk round-trip timeout, armed on both provider and requester.
    pub sync_timeout: Duration,
    /// Back-off before retrying a sync start that was answered with RETRY.
    pub sync_backoff_timeout: Duration,
    /// Provider re-selection attempts before the requester gives up.
    pub sync_max_retries: u32,
    /// Maximum encoded bytes per sync chunk.
    pub sync_chunk_bytes: usize,
    /// Verify provider CRCs on received chunks that carry one.
    pub sync_debug: bool,
    /// Default lifetime handed out in subscription acks.
    pub subscribe_interval: Duration,
    /// Maximum replicated-log drift tolerated before a probing monitor must
    /// sync instead of joining the quorum by election.
    pub paxos_max_join_drift: u64,
    /// Comma-separated member list applied to a seed map on first boot.
    pub initial_members: Vec<String>,
    /// Exit the process when this monitor finds itself removed from the map
    /// after having joined. Embedded monitors shut down instead.
    pub exit_on_removal: bool,

    /// Pin the assumed sync leader to a named monitor.
    pub sync_debug_leader: Option<String>,
    /// Pin the first chunk provider to a named monitor.
    pub sync_debug_provider: Option<String>,
    /// Pin the fallback provider picked after a provider timeout.
    pub sync_debug_provider_fallback: Option<String>,

    /// Deterministic crash points inside the sync leader role.
    pub sync_leader_kill_at: Option<u32>,
    /// Deterministic crash points inside the sync provider role.
    pub sync_provider_kill_at: Option<u32>,
    /// Deterministic crash points inside the sync requester role.
    pub sync_requester_kill_at: Option<u32>,
}

impl Default for MonConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(3),
            lease: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(2),
            election_timeout: Duration::from_secs(5),
            sync_trim_timeout: Duration::from_secs(30),
            sync_heartbeat_interval: Duration::from_secs(5),
            sync_heartbeat_timeout: Duration::from_secs(30),
            sync_timeout: Duration::from_secs(30),
            sync_backoff_timeout: Duration::from_secs(30),
            sync_max_retries: 5,
            sync_chunk_bytes: 1 << 20,
            sync_debug: false,
            subscribe_interval: Duration::from_secs(300),
            paxos_max_join_drift: 10,
            initial_members: Vec::new(),
            exit_on_removal: true,
            sync_debug_leader: None,
            sync_debug_provider: None,
            sync_debug_provider_fallback: None,
            sync_leader_kill_at: None,
            sync_provider_kill_at: None,
            sync_requester_kill_at: None,
        }
    }
}

impl MonConfig {
    /// Apply an `injectargs`-style `key=value` pair to the live config.
    /// Returns false for unknown keys.
    pub fn inject(&mut self, key: &str, value: &str) -> bool {
        fn secs(value: &str) -> Option<Duration> {
            value.parse::<u64>().ok().map(Duration::from_secs)
        }
        match key {
            "mon_tick_interval" => secs(value).map(|d| self.tick_interval = d).is_some(),
            "mon_lease" => secs(value).map(|d| self.lease = d).is_some(),
            "mon_probe_timeout" => secs(value).map(|d| self.probe_timeout = d).is_some(),
            "mon_sync_trim_timeout" => secs(value).map(|d| self.sync_trim_timeout = d).is_some(),
            "mon_sync_heartbeat_interval" => secs(value)
                .map(|d| self.sync_heartbeat_interval = d)
                .is_some(),
            "mon_sync_heartbeat_timeout" => secs(value)
                .map(|d| self.sync_heartbeat_timeout = d)
                .is_some(),
            "mon_sync_timeout" => secs(value).map(|d| self.sync_timeout = d).is_some(),
            "mon_sync_backoff_timeout" => {
                secs(value).map(|d| self.sync_backoff_timeout = d).is_some()
            }
            "mon_sync_max_retries" => value
                .parse::<u32>()
                .ok()
                .map(|v| self.sync_max_retries = v)
                .is_some(),
            "paxos_max_join_drift" => value
                .parse::<u64>()
                .ok()
                .map(|v| self.paxos_max_join_drift = v)
                .is_some(),
            "mon_sync_debug" => value
                .parse::<bool>()
                .ok()
                .map(|v| self.sync_debug = v)
                .is_some(),
            _ => false,
        }
    }
}

/// Crash deliberately when a configured killpoint is reached.
///
/// The positions are stable by name and number so black-box recovery suites
/// can inject a crash at an exact protocol step.
pub fn killpoint(configured: Option<u32>, role: &str, at: u32) {
    if configured == Some(at) {
        tracing::warn!(role, at, "killpoint reached, aborting");
        std::process::abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inject_updates_known_keys() {
        let mut cfg = MonConfig::default();
        assert!(cfg.inject("mon_sync_timeout", "7"));
        assert_eq!(cfg.sync_timeout, Duration::from_secs(7));
        assert!(cfg.inject("mon_sync_max_retries", "2"));
        assert_eq!(cfg.sync_max_retries, 2);
        assert!(!cfg.inject("mon_bogus", "1"));
    }
}
