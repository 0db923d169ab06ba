//! Per-procedure call and response-time counters

use std::collections::BTreeMap;
use std::time::Duration;

use crate::registry::ProcedureKey;

/// Counters for one (program, version, procedure)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcedureStats {
    pub calls: u64,
    pub replies: u64,
    pub min_rtt: Option<Duration>,
    pub max_rtt: Option<Duration>,
    pub total_rtt: Duration,
    /// Replies that carried a response time
    pub rtt_samples: u64,
}

impl ProcedureStats {
    pub fn average_rtt(&self) -> Option<Duration> {
        let samples = u32::try_from(self.rtt_samples).ok().filter(|n| *n > 0)?;
        Some(self.total_rtt / samples)
    }
}

/// Capture-wide statistics, filled on the first pass only
#[derive(Debug, Clone, Default)]
pub struct RpcStats {
    procedures: BTreeMap<ProcedureKey, ProcedureStats>,
}

impl RpcStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_call(&mut self, key: ProcedureKey) {
        self.procedures.entry(key).or_default().calls += 1;
    }

    pub fn record_reply(&mut self, key: ProcedureKey, rtt: Option<Duration>) {
        let stats = self.procedures.entry(key).or_default();
        stats.replies += 1;
        if let Some(rtt) = rtt {
            stats.min_rtt = Some(stats.min_rtt.map_or(rtt, |min| min.min(rtt)));
            stats.max_rtt = Some(stats.max_rtt.map_or(rtt, |max| max.max(rtt)));
            stats.total_rtt += rtt;
            stats.rtt_samples += 1;
        }
    }

    pub fn get(&self, key: ProcedureKey) -> Option<&ProcedureStats> {
        self.procedures.get(&key)
    }

    /// Procedures in (program, version, procedure) order
    pub fn iter(&self) -> impl Iterator<Item = (&ProcedureKey, &ProcedureStats)> {
        self.procedures.iter()
    }

    pub fn total_calls(&self) -> u64 {
        self.procedures.values().map(|s| s.calls).sum()
    }

    pub fn total_replies(&self) -> u64 {
        self.procedures.values().map(|s| s.replies).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.procedures.is_empty()
    }
}
