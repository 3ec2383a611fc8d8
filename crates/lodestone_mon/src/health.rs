//! Cluster health aggregation.
//!
//! Each map curator contributes summary (and optionally detail) lines; the
//! monitor collates them into one overall severity for `health` and
//! `status` output.

use serde::{Deserialize, Serialize};

use crate::service::MapService;

/// Severity lattice. `Err` orders below `Warn` below `Ok` so the overall
/// status is simply the minimum across contributions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HealthStatus {
    Err,
    Warn,
    Ok,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            HealthStatus::Err => "HEALTH_ERR",
            HealthStatus::Warn => "HEALTH_WARN",
            HealthStatus::Ok => "HEALTH_OK",
        };
        f.write_str(text)
    }
}

/// Collate health from every service. Returns the status line and, when
/// requested, the accumulated detail lines.
pub fn collect_health(
    services: &[Box<dyn MapService>],
    want_detail: bool,
) -> (String, Vec<String>) {
    let mut summary: Vec<(HealthStatus, String)> = Vec::new();
    let mut detail: Vec<String> = Vec::new();
    for service in services {
        service.get_health(&mut summary, want_detail.then_some(&mut detail));
    }

    let overall = summary
        .iter()
        .map(|(status, _)| *status)
        .min()
        .unwrap_or(HealthStatus::Ok);
    let mut line = overall.to_string();
    if !summary.is_empty() {
        line.push(' ');
        line.push_str(
            &summary
                .iter()
                .map(|(_, text)| text.as_str())
                .collect::<Vec<_>>()
                .join("; "),
        );
    }
    (line, detail)
}

/// Quorum-level counters exposed while this monitor is in a quorum.
///
/// Registration follows quorum membership: `finish_election` registers,
/// `bootstrap` unregisters.
#[derive(Debug, Default)]
pub struct ClusterCounters {
    registered: bool,
    pub num_mon: usize,
    pub num_mon_quorum: usize,
}

impl ClusterCounters {
    pub fn register(&mut self) {
        if !self.registered {
            self.registered = true;
            tracing::debug!("cluster counters registered");
        }
    }

    pub fn unregister(&mut self) {
        if self.registered {
            self.registered = false;
            tracing::debug!("cluster counters unregistered");
        }
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    pub fn update(&mut self, num_mon: usize, num_mon_quorum: usize) {
        self.num_mon = num_mon;
        self.num_mon_quorum = num_mon_quorum;
        if self.registered {
            tracing::trace!(num_mon, num_mon_quorum, "cluster counters updated");
        }
    }
}
