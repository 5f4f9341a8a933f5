pub mod test_objects;

use std::{
    collections::HashMap,
    fmt::{self, Display},
    str::FromStr,
};

use anyhow::{anyhow, Result};
use derive_builder::Builder;
use safety_net_utils::{get_epoch_time_in_ms, sortable_ts, MS_PER_HOUR, MS_PER_SECOND};
use serde::{Deserialize, Serialize};
use strum::AsRefStr;

/// Internal identifier of a protected instance. Generated when the row is
/// first written, stable across promotion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(id: String) -> Self {
        Self(id)
    }

    pub fn generate() -> Self {
        Self(nanoid::nanoid!())
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

impl Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Identifier the cloud provider assigned to an instance, e.g. `i-0abc`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProviderInstanceId(String);

impl ProviderInstanceId {
    pub fn new(id: String) -> Self {
        Self(id)
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

impl Display for ProviderInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ProviderInstanceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Lower-cased instance family: the part of the instance type before the
/// first `.` (`C5.XLarge` -> `c5`).
pub fn instance_family(instance_type: &str) -> String {
    instance_type
        .split('.')
        .next()
        .unwrap_or_default()
        .trim()
        .to_lowercase()
}

/// Same size, different family: `instance_type_in_family("c5.xlarge", "c5a")`
/// is `c5a.xlarge`.
pub fn instance_type_in_family(instance_type: &str, family: &str) -> String {
    match instance_type.split_once('.') {
        Some((_, size)) => format!("{}.{}", family, size),
        None => family.to_string(),
    }
}

/// A placement pool: the unit of spot capacity the provider prices and
/// evicts. Rendered as `family:zone`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PoolId {
    pub family: String,
    pub zone: String,
}

impl PoolId {
    pub fn new(family: &str, zone: &str) -> Self {
        Self {
            family: family.trim().to_lowercase(),
            zone: zone.trim().to_string(),
        }
    }

    pub fn from_instance_type(instance_type: &str, zone: &str) -> Result<Self> {
        let family = instance_family(instance_type);
        if family.is_empty() {
            return Err(anyhow!("instance type is empty, cannot derive pool"));
        }
        if zone.trim().is_empty() {
            return Err(anyhow!(
                "availability zone is empty for instance type {}",
                instance_type
            ));
        }
        Ok(Self::new(&family, zone))
    }
}

impl Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.family, self.zone)
    }
}

impl FromStr for PoolId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (family, zone) = s
            .split_once(':')
            .ok_or(anyhow!("pool id must be family:zone, got {}", s))?;
        if family.is_empty() || zone.is_empty() {
            return Err(anyhow!("pool id must be family:zone, got {}", s));
        }
        Ok(Self::new(family, zone))
    }
}

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, AsRefStr, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReplicaState {
    Provisioning,
    Active,
    Promoted,
    ExpiredCleaned,
}

impl ReplicaState {
    pub fn is_outstanding(&self) -> bool {
        matches!(self, ReplicaState::Provisioning | ReplicaState::Active)
    }
}

/// Why an instance stopped being active.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, AsRefStr, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeactivationCause {
    /// Terminated by the provider, its standby took over.
    ReplacedByReplica,
    /// Terminated by the provider with no standby; replaced on the
    /// emergency path.
    NoReplica,
    /// Standby expired while its primary stayed healthy.
    FalseAlarm,
    /// Standby left over after the workload was already served elsewhere.
    Redundant,
    /// Reservation never reached `Active`.
    StaleProvisioning,
    /// Standby received its own termination notice.
    ReplicaInterrupted,
}

/// Why a standby is being reclaimed.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, AsRefStr, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReclaimCause {
    FalseAlarm,
    Redundant,
    StaleProvisioning,
    Interrupted,
}

impl From<ReclaimCause> for DeactivationCause {
    fn from(value: ReclaimCause) -> Self {
        match value {
            ReclaimCause::FalseAlarm => DeactivationCause::FalseAlarm,
            ReclaimCause::Redundant => DeactivationCause::Redundant,
            ReclaimCause::StaleProvisioning => DeactivationCause::StaleProvisioning,
            ReclaimCause::Interrupted => DeactivationCause::ReplicaInterrupted,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct InstanceMetadata {
    pub termination_reason: Option<String>,
    pub deactivation_cause: Option<DeactivationCause>,
    pub deactivated_at: Option<u64>,
    pub risk_model_version: Option<String>,
    pub flagged_for_review: bool,
    /// For a promoted standby or an emergency replacement, the primary it
    /// took over from.
    pub replaces: Option<InstanceId>,
    /// For a deactivated primary, the instance that took over.
    pub replaced_by: Option<InstanceId>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Builder)]
#[builder(build_fn(skip), setter(into))]
pub struct ProtectedInstance {
    pub id: InstanceId,
    /// Absent only while a standby reservation is still provisioning.
    pub instance_id: Option<ProviderInstanceId>,
    pub account_id: String,
    pub pool: PoolId,
    pub instance_type: String,
    pub region: String,
    pub workload_id: String,
    pub is_replica: bool,
    pub replica_of: Option<InstanceId>,
    pub replica_expires_at: Option<u64>,
    pub replica_state: Option<ReplicaState>,
    /// On a primary: the standby most recently reserved for it.
    pub current_replica: Option<InstanceId>,
    pub is_active: bool,
    /// Set while an emergency replacement is in flight for this primary.
    pub termination_notice_at: Option<u64>,
    /// Deactivated in storage but not yet confirmed terminated at the
    /// provider.
    pub termination_pending: bool,
    pub metadata: InstanceMetadata,
    pub version: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

impl ProtectedInstance {
    pub fn key(&self) -> String {
        self.id.to_string()
    }

    pub fn key_from(id: &InstanceId) -> String {
        id.to_string()
    }

    /// Reserve a standby for `primary` in `pool`. The row starts out in
    /// `Provisioning` with no provider id.
    pub fn new_replica(primary: &ProtectedInstance, pool: PoolId, expires_at: u64, now: u64) -> Self {
        let instance_type = instance_type_in_family(&primary.instance_type, &pool.family);
        Self {
            id: InstanceId::generate(),
            instance_id: None,
            account_id: primary.account_id.clone(),
            pool,
            instance_type,
            region: primary.region.clone(),
            workload_id: primary.workload_id.clone(),
            is_replica: true,
            replica_of: Some(primary.id.clone()),
            replica_expires_at: Some(expires_at),
            replica_state: Some(ReplicaState::Provisioning),
            current_replica: None,
            is_active: true,
            termination_notice_at: None,
            termination_pending: false,
            metadata: InstanceMetadata {
                risk_model_version: primary.metadata.risk_model_version.clone(),
                labels: primary.metadata.labels.clone(),
                ..Default::default()
            },
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// A fresh primary launched on the emergency path to replace `old`.
    pub fn new_replacement(
        old: &ProtectedInstance,
        pool: PoolId,
        instance_id: ProviderInstanceId,
        now: u64,
    ) -> Self {
        let instance_type = instance_type_in_family(&old.instance_type, &pool.family);
        Self {
            id: InstanceId::generate(),
            instance_id: Some(instance_id),
            account_id: old.account_id.clone(),
            pool,
            instance_type,
            region: old.region.clone(),
            workload_id: old.workload_id.clone(),
            is_replica: false,
            replica_of: None,
            replica_expires_at: None,
            replica_state: None,
            current_replica: None,
            is_active: true,
            termination_notice_at: None,
            termination_pending: false,
            metadata: InstanceMetadata {
                risk_model_version: old.metadata.risk_model_version.clone(),
                replaces: Some(old.id.clone()),
                labels: old.metadata.labels.clone(),
                ..Default::default()
            },
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.replica_expires_at.is_some_and(|expires| expires < now)
    }

    /// A standby that still counts against the one-standby-per-primary
    /// limit.
    pub fn is_outstanding_replica(&self, now: u64) -> bool {
        self.is_replica &&
            self.is_active &&
            self.replica_state.is_some_and(|s| s.is_outstanding()) &&
            !self.is_expired(now)
    }

    pub fn is_promotable(&self, now: u64) -> bool {
        self.is_replica &&
            self.is_active &&
            self.replica_state == Some(ReplicaState::Active) &&
            self.instance_id.is_some() &&
            !self.is_expired(now)
    }

    /// Turn this standby into the primary for its workload.
    pub fn promote(&mut self, replaced: &InstanceId, now: u64) {
        self.is_replica = false;
        self.replica_of = None;
        self.replica_expires_at = None;
        self.replica_state = Some(ReplicaState::Promoted);
        self.metadata.replaces = Some(replaced.clone());
        self.updated_at = now;
    }

    pub fn deactivate(&mut self, cause: DeactivationCause, reason: Option<String>, now: u64) {
        self.is_active = false;
        self.metadata.deactivation_cause = Some(cause);
        self.metadata.deactivated_at = Some(now);
        if reason.is_some() {
            self.metadata.termination_reason = reason;
        }
        self.updated_at = now;
    }

    pub fn check_invariants(&self) -> Result<()> {
        if !self.is_replica && self.replica_of.is_some() {
            return Err(anyhow!(
                "instance {} is not a replica but references {:?}",
                self.id,
                self.replica_of
            ));
        }
        if self.is_replica && self.replica_of.is_none() {
            return Err(anyhow!("replica {} has no primary", self.id));
        }
        let expiry_expected =
            self.is_replica && self.replica_state != Some(ReplicaState::Promoted);
        if expiry_expected != self.replica_expires_at.is_some() {
            return Err(anyhow!(
                "instance {} replica expiry does not match replica state {:?}",
                self.id,
                self.replica_state
            ));
        }
        if self.instance_id.is_none() && self.replica_state != Some(ReplicaState::Provisioning) {
            // Abandoned or stale reservations are the only rows allowed to
            // outlive provisioning without a provider id.
            if self.replica_state != Some(ReplicaState::ExpiredCleaned) {
                return Err(anyhow!("instance {} has no provider instance id", self.id));
            }
        }
        Ok(())
    }
}

impl ProtectedInstanceBuilder {
    /// Builds a primary. Standbys and emergency replacements are created
    /// through [`ProtectedInstance::new_replica`] and
    /// [`ProtectedInstance::new_replacement`].
    pub fn build(&self) -> Result<ProtectedInstance> {
        let instance_id = self
            .instance_id
            .clone()
            .flatten()
            .ok_or(anyhow!("provider instance id is not present"))?;
        let account_id = self
            .account_id
            .clone()
            .ok_or(anyhow!("account id is not present"))?;
        let instance_type = self
            .instance_type
            .clone()
            .ok_or(anyhow!("instance type is not present"))?;
        let region = self.region.clone().ok_or(anyhow!("region is not present"))?;
        let pool = self.pool.clone().ok_or(anyhow!("pool is not present"))?;
        if instance_family(&instance_type) != pool.family {
            return Err(anyhow!(
                "instance type {} does not belong to pool {}",
                instance_type,
                pool
            ));
        }
        let id = self.id.clone().unwrap_or_else(InstanceId::generate);
        let workload_id = self
            .workload_id
            .clone()
            .unwrap_or_else(|| id.to_string());
        let now = self.created_at.unwrap_or_else(get_epoch_time_in_ms);
        Ok(ProtectedInstance {
            id,
            instance_id: Some(instance_id),
            account_id,
            pool,
            instance_type,
            region,
            workload_id,
            is_replica: false,
            replica_of: None,
            replica_expires_at: None,
            replica_state: None,
            current_replica: None,
            is_active: true,
            termination_notice_at: None,
            termination_pending: false,
            metadata: self.metadata.clone().unwrap_or_default(),
            version: 0,
            created_at: now,
            updated_at: now,
        })
    }
}

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, AsRefStr, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PoolRiskKind {
    RebalanceNotice,
    TerminationNotice,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolRiskEvent {
    pub pool: PoolId,
    pub kind: PoolRiskKind,
    pub timestamp: u64,
    pub account_id: String,
    pub instance_id: ProviderInstanceId,
}

impl PoolRiskEvent {
    /// `<pool>|<ts>|<kind>|<instance>`. A re-delivered notice maps to the
    /// same key.
    pub fn key(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.pool,
            sortable_ts(self.timestamp),
            self.kind,
            self.instance_id
        )
    }

    pub fn key_prefix_for_pool(pool: &PoolId) -> String {
        format!("{}|", pool)
    }

    pub fn key_for_pool_at(pool: &PoolId, ts: u64) -> String {
        format!("{}|{}", pool, sortable_ts(ts))
    }
}

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, AsRefStr, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DowntimeCause {
    NoReplica,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DowntimeDetails {
    pub pool: Option<PoolId>,
    pub replacement: Option<InstanceId>,
    pub replacement_instance_id: Option<ProviderInstanceId>,
    pub degraded_placement: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DowntimeInterval {
    pub id: String,
    pub account_id: String,
    pub primary: InstanceId,
    pub primary_instance_id: Option<ProviderInstanceId>,
    pub workload_id: String,
    pub start: u64,
    pub end: u64,
    pub duration_secs: u64,
    pub cause: DowntimeCause,
    pub details: DowntimeDetails,
}

impl DowntimeInterval {
    /// `end` is clamped to `start` when the provider reports an earlier
    /// healthy time than the notice.
    pub fn new(
        primary: &ProtectedInstance,
        start: u64,
        end: u64,
        cause: DowntimeCause,
        details: DowntimeDetails,
    ) -> Self {
        let end = end.max(start);
        Self {
            id: nanoid::nanoid!(),
            account_id: primary.account_id.clone(),
            primary: primary.id.clone(),
            primary_instance_id: primary.instance_id.clone(),
            workload_id: primary.workload_id.clone(),
            start,
            end,
            duration_secs: (end - start) / MS_PER_SECOND,
            cause,
            details,
        }
    }

    pub fn key(&self) -> String {
        format!("{}|{}|{}", self.account_id, sortable_ts(self.start), self.id)
    }

    pub fn key_prefix_for_account(account_id: &str) -> String {
        format!("{}|", account_id)
    }

    pub fn key_for_account_at(account_id: &str, ts: u64) -> String {
        format!("{}|{}", account_id, sortable_ts(ts))
    }
}

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, AsRefStr, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AnomalyKind {
    OrphanedReplica,
    StaleProvisioning,
    StuckTerminationClaim,
    EmergencyLaunchFailed,
    ReclaimFailed,
    LateLaunchTerminateFailed,
}

/// A record for manual review. Anomalies are never auto-resolved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Anomaly {
    pub id: String,
    pub kind: AnomalyKind,
    pub instance: Option<InstanceId>,
    pub primary: Option<InstanceId>,
    pub pool: Option<PoolId>,
    pub detected_at: u64,
    pub details: String,
}

impl Anomaly {
    pub fn new(kind: AnomalyKind, detected_at: u64, details: impl Into<String>) -> Self {
        Self {
            id: nanoid::nanoid!(),
            kind,
            instance: None,
            primary: None,
            pool: None,
            detected_at,
            details: details.into(),
        }
    }

    pub fn for_instance(mut self, instance: &ProtectedInstance) -> Self {
        self.instance = Some(instance.id.clone());
        self.primary = instance.replica_of.clone();
        self.pool = Some(instance.pool.clone());
        self
    }

    pub fn key(&self) -> String {
        format!("{}|{}", sortable_ts(self.detected_at), self.id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SweepFailure {
    pub instance: InstanceId,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SweepReport {
    pub started_at: u64,
    pub finished_at: u64,
    pub reclaimed_false_alarms: u64,
    pub cost_avoided_usd: f64,
    pub already_resolved: u64,
    pub redundant_reclaimed: u64,
    pub orphans_promoted: u64,
    pub anomalies_flagged: u64,
    pub terminations_retried: u64,
    pub stale_reservations_released: u64,
    pub failures: Vec<SweepFailure>,
    pub observed_false_alarm_ratio: Option<f64>,
    pub configured_false_alarm_ratio: f64,
}

impl SweepReport {
    pub fn key(&self) -> String {
        sortable_ts(self.started_at)
    }
}

/// Running totals maintained in the same transactions as the transitions
/// they count.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SafetyNetStats {
    pub replicas_provisioned: u64,
    pub promotions: u64,
    pub false_alarm_reclaims: u64,
    pub cost_avoided_usd: f64,
    pub redundant_reclaims: u64,
    pub emergency_replacements: u64,
    pub orphans_adopted: u64,
}

impl SafetyNetStats {
    pub const KEY: &'static str = "safety_net";

    /// Share of standbys that ended up unused: reclaims / (reclaims +
    /// promotions).
    pub fn observed_false_alarm_ratio(&self) -> Option<f64> {
        let total = self.false_alarm_reclaims + self.promotions;
        if total == 0 {
            return None;
        }
        Some(self.false_alarm_reclaims as f64 / total as f64)
    }
}

/// Estimated spend avoided by reclaiming a standby early: the full TTL at
/// the pool's hourly rate.
pub fn cost_avoided_usd(ttl_ms: u64, hourly_rate_usd: f64) -> f64 {
    (ttl_ms as f64 / MS_PER_HOUR as f64) * hourly_rate_usd
}

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, AsRefStr, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NoticeKind {
    Rebalance,
    Termination,
    #[serde(other)]
    Unrecognized,
}

/// A provider interruption notification for a single instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InterruptionNotice {
    pub instance_id: ProviderInstanceId,
    pub kind: NoticeKind,
    pub instance_type: String,
    pub availability_zone: String,
    pub account_id: String,
    pub timestamp: u64,
}

impl InterruptionNotice {
    pub fn pool_id(&self) -> Result<PoolId> {
        PoolId::from_instance_type(&self.instance_type, &self.availability_zone)
    }

    pub fn pool_risk_kind(&self) -> Option<PoolRiskKind> {
        match self.kind {
            NoticeKind::Rebalance => Some(PoolRiskKind::RebalanceNotice),
            NoticeKind::Termination => Some(PoolRiskKind::TerminationNotice),
            NoticeKind::Unrecognized => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StateMachineMetadata {
    pub db_version: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_objects::tests::{mock_primary, TEST_ACCOUNT};

    #[test]
    fn test_pool_id_is_derived_from_instance_type() {
        let pool = PoolId::from_instance_type("C5.XLarge", "az-1").unwrap();
        assert_eq!(pool.to_string(), "c5:az-1");
        assert_eq!("c5:az-1".parse::<PoolId>().unwrap(), pool);

        assert!(PoolId::from_instance_type("", "az-1").is_err());
        assert!(PoolId::from_instance_type("m5.large", " ").is_err());
        assert!("c5".parse::<PoolId>().is_err());
    }

    #[test]
    fn test_instance_type_in_family() {
        assert_eq!(instance_type_in_family("c5.xlarge", "c5a"), "c5a.xlarge");
        assert_eq!(instance_type_in_family("metal", "c5"), "c5");
    }

    #[test]
    fn test_builder_rejects_mismatched_pool() {
        let res = ProtectedInstanceBuilder::default()
            .instance_id(ProviderInstanceId::from("i-1"))
            .account_id(TEST_ACCOUNT)
            .instance_type("m5.large")
            .region("region-1")
            .pool(PoolId::new("c5", "az-1"))
            .build();
        assert!(res.is_err());
    }

    #[test]
    fn test_replica_lifecycle_invariants() {
        let primary = mock_primary("i-A", "az-1");
        primary.check_invariants().unwrap();
        assert_eq!(primary.workload_id, primary.id.to_string());

        let mut replica =
            ProtectedInstance::new_replica(&primary, PoolId::new("c5", "az-2"), 10_000, 1_000);
        replica.check_invariants().unwrap();
        assert!(replica.is_outstanding_replica(5_000));
        assert!(!replica.is_promotable(5_000));

        replica.instance_id = Some(ProviderInstanceId::from("i-A-replica"));
        replica.replica_state = Some(ReplicaState::Active);
        assert!(replica.is_promotable(10_000));
        assert!(!replica.is_promotable(10_001));
        assert!(!replica.is_outstanding_replica(10_001));

        replica.promote(&primary.id, 6_000);
        replica.check_invariants().unwrap();
        assert!(!replica.is_replica);
        assert_eq!(replica.metadata.replaces, Some(primary.id.clone()));
        assert_eq!(replica.workload_id, primary.workload_id);
    }

    #[test]
    fn test_downtime_interval_clamps_end() {
        let primary = mock_primary("i-C", "az-1");
        let interval = DowntimeInterval::new(
            &primary,
            10_000,
            4_000,
            DowntimeCause::NoReplica,
            DowntimeDetails::default(),
        );
        assert_eq!(interval.end, interval.start);
        assert_eq!(interval.duration_secs, 0);

        let interval = DowntimeInterval::new(
            &primary,
            10_000,
            52_500,
            DowntimeCause::NoReplica,
            DowntimeDetails::default(),
        );
        assert_eq!(interval.duration_secs, 42);
    }

    #[test]
    fn test_notice_kind_parsing() {
        let notice: InterruptionNotice = serde_json::from_value(serde_json::json!({
            "instance_id": "i-1",
            "kind": "maintenance",
            "instance_type": "c5.large",
            "availability_zone": "az-1",
            "account_id": "acct",
            "timestamp": 1
        }))
        .unwrap();
        assert_eq!(notice.kind, NoticeKind::Unrecognized);
        assert_eq!(notice.pool_risk_kind(), None);
    }

    #[test]
    fn test_observed_false_alarm_ratio() {
        let mut stats = SafetyNetStats::default();
        assert_eq!(stats.observed_false_alarm_ratio(), None);
        stats.false_alarm_reclaims = 2;
        stats.promotions = 3;
        assert_eq!(stats.observed_false_alarm_ratio(), Some(0.4));
        assert_eq!(cost_avoided_usd(6 * MS_PER_HOUR, 0.5), 3.0);
    }
}
