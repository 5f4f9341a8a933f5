use std::{collections::BTreeMap, time::Duration};

use anyhow::{anyhow, Result};
use safety_net_utils::{retry::Backoff, MS_PER_DAY, MS_PER_HOUR, MS_PER_SECOND};
use serde::{Deserialize, Serialize};

/// Tuning knobs of the safety net.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyNetConfig {
    pub replica_ttl_secs: u64,
    pub pool_cooldown_secs: u64,
    /// Expected share of rebalance signals that turn out to be false
    /// alarms. Reported next to the observed ratio on every sweep.
    pub false_alarm_ratio: f64,
    pub sweep_interval_secs: u64,
    /// Upper bound on launching and polling a standby after a rebalance.
    pub rebalance_deadline_secs: u64,
    /// Upper bound on launching and polling an emergency replacement.
    pub termination_deadline_secs: u64,
    pub describe_poll_interval_ms: u64,
    /// A `Provisioning` reservation older than this is considered leaked.
    pub provisioning_timeout_secs: u64,
    /// A termination claim older than this is considered stuck.
    pub claim_timeout_secs: u64,
    pub notice_workers: usize,
    pub notice_queue_length: usize,
    pub provider_retry: RetryPolicy,
}

impl Default for SafetyNetConfig {
    fn default() -> Self {
        Self {
            replica_ttl_secs: 6 * 60 * 60,
            pool_cooldown_secs: 15 * 24 * 60 * 60,
            false_alarm_ratio: 0.4,
            sweep_interval_secs: 60 * 60,
            rebalance_deadline_secs: 10 * 60,
            termination_deadline_secs: 90,
            describe_poll_interval_ms: 2_000,
            provisioning_timeout_secs: 30 * 60,
            claim_timeout_secs: 15 * 60,
            notice_workers: 16,
            notice_queue_length: 1_024,
            provider_retry: RetryPolicy::default(),
        }
    }
}

impl SafetyNetConfig {
    pub fn replica_ttl_ms(&self) -> u64 {
        self.replica_ttl_secs * MS_PER_SECOND
    }

    pub fn pool_cooldown_ms(&self) -> u64 {
        self.pool_cooldown_secs * MS_PER_SECOND
    }

    pub fn provisioning_timeout_ms(&self) -> u64 {
        self.provisioning_timeout_secs * MS_PER_SECOND
    }

    pub fn claim_timeout_ms(&self) -> u64 {
        self.claim_timeout_secs * MS_PER_SECOND
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn rebalance_deadline(&self) -> Duration {
        Duration::from_secs(self.rebalance_deadline_secs)
    }

    pub fn termination_deadline(&self) -> Duration {
        Duration::from_secs(self.termination_deadline_secs)
    }

    pub fn describe_poll_interval(&self) -> Duration {
        Duration::from_millis(self.describe_poll_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.false_alarm_ratio) {
            return Err(anyhow!(
                "false_alarm_ratio must be within [0, 1], got {}",
                self.false_alarm_ratio
            ));
        }
        for (name, value) in [
            ("replica_ttl_secs", self.replica_ttl_secs),
            ("pool_cooldown_secs", self.pool_cooldown_secs),
            ("sweep_interval_secs", self.sweep_interval_secs),
            ("rebalance_deadline_secs", self.rebalance_deadline_secs),
            ("termination_deadline_secs", self.termination_deadline_secs),
            ("describe_poll_interval_ms", self.describe_poll_interval_ms),
            ("provisioning_timeout_secs", self.provisioning_timeout_secs),
            ("claim_timeout_secs", self.claim_timeout_secs),
        ] {
            if value == 0 {
                return Err(anyhow!("{} must be positive", name));
            }
        }
        if self.notice_workers == 0 || self.notice_queue_length == 0 {
            return Err(anyhow!(
                "notice_workers and notice_queue_length must be positive"
            ));
        }
        if self.pool_cooldown_ms() > 365 * MS_PER_DAY {
            return Err(anyhow!("pool_cooldown_secs exceeds one year"));
        }
        if self.replica_ttl_ms() > 7 * MS_PER_DAY {
            return Err(anyhow!(
                "replica_ttl_secs exceeds a week, standbys that long cost more than they save"
            ));
        }
        self.provider_retry.validate()
    }
}

/// Bounded exponential backoff for provider calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 4,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self) -> Backoff {
        Backoff::Exponential {
            initial: Duration::from_millis(self.initial_backoff_ms),
            max: Duration::from_millis(self.max_backoff_ms),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(anyhow!(
                "provider_retry.initial_backoff_ms {} exceeds max_backoff_ms {}",
                self.initial_backoff_ms,
                self.max_backoff_ms
            ));
        }
        Ok(())
    }
}

/// Families that can stand in for one another, with the hourly rate used
/// when the provider has no spot price for a pool.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct FamilyCatalog {
    pub compatible: Vec<String>,
    pub hourly_rate_usd: Option<f64>,
}

/// Static inventory of placement pools: which zones each region has and
/// which families are interchangeable.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct PoolCatalogConfig {
    pub regions: BTreeMap<String, Vec<String>>,
    pub families: BTreeMap<String, FamilyCatalog>,
}

impl PoolCatalogConfig {
    pub fn validate(&self) -> Result<()> {
        for (region, zones) in &self.regions {
            if zones.is_empty() {
                return Err(anyhow!("region {} has no zones", region));
            }
            for zone in zones {
                let owners = self.regions.values().filter(|z| z.contains(zone)).count();
                if owners > 1 {
                    return Err(anyhow!("zone {} is listed under more than one region", zone));
                }
            }
        }
        for (family, entry) in &self.families {
            if family.to_lowercase() != *family {
                return Err(anyhow!("family {} must be lower case", family));
            }
            if entry.compatible.iter().any(|c| c == family) {
                return Err(anyhow!("family {} lists itself as compatible", family));
            }
            if entry.hourly_rate_usd.is_some_and(|rate| rate < 0.0) {
                return Err(anyhow!("family {} has a negative hourly rate", family));
            }
        }
        Ok(())
    }
}
