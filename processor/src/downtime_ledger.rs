use std::{collections::BTreeMap, sync::Arc};

use anyhow::{anyhow, Result};
use data_model::DowntimeInterval;
use serde::{Deserialize, Serialize};
use state_store::SafetyNetState;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DowntimeReport {
    pub account_id: String,
    pub from: u64,
    pub to: u64,
    pub count: usize,
    pub total_seconds: u64,
    /// Total seconds per workload.
    pub by_workload: BTreeMap<String, u64>,
    pub intervals: Vec<DowntimeInterval>,
}

/// Read side of the append-only downtime log. Intervals are written in
/// the same transaction that installs an emergency replacement.
pub struct DowntimeLedger {
    state: Arc<SafetyNetState>,
}

impl DowntimeLedger {
    pub fn new(state: Arc<SafetyNetState>) -> Self {
        Self { state }
    }

    /// Intervals for `account_id` with `from <= start < to`.
    pub fn query(&self, account_id: &str, from: u64, to: u64) -> Result<DowntimeReport> {
        if from > to {
            return Err(anyhow!("invalid window: from {} is after to {}", from, to));
        }
        let intervals = self
            .state
            .reader()
            .downtime_intervals(account_id, from, to)?;
        let mut by_workload = BTreeMap::new();
        for interval in &intervals {
            *by_workload.entry(interval.workload_id.clone()).or_insert(0) +=
                interval.duration_secs;
        }
        Ok(DowntimeReport {
            account_id: account_id.to_string(),
            from,
            to,
            count: intervals.len(),
            total_seconds: intervals.iter().map(|i| i.duration_secs).sum(),
            by_workload,
            intervals,
        })
    }
}
