use std::sync::Arc;

use anyhow::{anyhow, Result};
use data_model::{
    Anomaly,
    AnomalyKind,
    DowntimeCause,
    DowntimeDetails,
    DowntimeInterval,
    InstanceId,
    InterruptionNotice,
    NoticeKind,
    PoolId,
    PoolRiskKind,
    ProtectedInstance,
    ReclaimCause,
};
use metrics::Timer;
use opentelemetry::KeyValue;
use safety_net_utils::Clock;
use serde::{Deserialize, Serialize};
use state_store::{
    requests::{
        ClaimTerminationRequest,
        Conflict,
        EmergencyReplacementRequest,
        ReleaseTerminationRequest,
        RequestPayload,
        StateMachineUpdateRequest,
        UpdateOutcome,
    },
    SafetyNetState,
};
use tracing::{error, info, warn};

use crate::{
    config::SafetyNetConfig,
    inventory::PoolCatalog,
    pool_risk::{Placement, PoolRiskRegistry},
    provider::LaunchRequest,
    replica_lifecycle::{LifecycleError, PromoteOutcome, ProvisionOutcome, ReplicaLifecycleManager},
};

/// What handling one notice decided. Returned to synchronous callers and
/// counted in metrics by [`NoticeOutcome::label`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum NoticeOutcome {
    Discarded {
        reason: String,
    },
    /// The notice was about a standby; only the pool event was kept.
    PoolEventRecorded,
    /// A standby got its own termination notice and no longer covers its
    /// primary.
    ReplicaInterrupted {
        replica: InstanceId,
    },
    ReplicaProvisioned {
        replica: InstanceId,
        pool: PoolId,
        degraded: bool,
    },
    ReplicaAlreadyActive {
        replica: InstanceId,
    },
    ProvisioningFailed {
        pool: PoolId,
        error: String,
    },
    NoPlacement,
    Promoted {
        old_primary: InstanceId,
        new_primary: InstanceId,
    },
    EmergencyReplaced {
        replacement: InstanceId,
        pool: PoolId,
        degraded: bool,
        downtime_secs: u64,
    },
    EmergencyFailed {
        error: String,
    },
    /// Another delivery of the same termination owns the emergency path.
    DuplicateTermination,
}

impl NoticeOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            NoticeOutcome::Discarded { .. } => "discarded",
            NoticeOutcome::PoolEventRecorded => "pool_event_recorded",
            NoticeOutcome::ReplicaInterrupted { .. } => "replica_interrupted",
            NoticeOutcome::ReplicaProvisioned { .. } => "replica_provisioned",
            NoticeOutcome::ReplicaAlreadyActive { .. } => "replica_already_active",
            NoticeOutcome::ProvisioningFailed { .. } => "provisioning_failed",
            NoticeOutcome::NoPlacement => "no_placement",
            NoticeOutcome::Promoted { .. } => "promoted",
            NoticeOutcome::EmergencyReplaced { .. } => "emergency_replaced",
            NoticeOutcome::EmergencyFailed { .. } => "emergency_failed",
            NoticeOutcome::DuplicateTermination => "duplicate_termination",
        }
    }

    fn discarded(reason: impl Into<String>) -> Self {
        NoticeOutcome::Discarded {
            reason: reason.into(),
        }
    }
}

const INTERRUPTED_RECLAIM_ATTEMPTS: usize = 3;

/// Entry point for provider notices. Every branch re-reads the instance
/// from storage; nothing is cached between notices.
pub struct InterruptionHandler {
    state: Arc<SafetyNetState>,
    registry: Arc<PoolRiskRegistry>,
    lifecycle: Arc<ReplicaLifecycleManager>,
    catalog: Arc<PoolCatalog>,
    clock: Arc<dyn Clock>,
    config: Arc<SafetyNetConfig>,
    metrics: Arc<metrics::safety_net::Metrics>,
}

impl InterruptionHandler {
    pub fn new(
        state: Arc<SafetyNetState>,
        registry: Arc<PoolRiskRegistry>,
        lifecycle: Arc<ReplicaLifecycleManager>,
        catalog: Arc<PoolCatalog>,
        clock: Arc<dyn Clock>,
        config: Arc<SafetyNetConfig>,
        metrics: Arc<metrics::safety_net::Metrics>,
    ) -> Self {
        Self {
            state,
            registry,
            lifecycle,
            catalog,
            clock,
            config,
            metrics,
        }
    }

    #[tracing::instrument(
        skip_all,
        fields(
            instance_id = notice.instance_id.get(),
            kind = notice.kind.as_ref(),
            account = %notice.account_id,
        )
    )]
    pub async fn handle(&self, notice: &InterruptionNotice) -> Result<NoticeOutcome> {
        let kind_kv = [KeyValue::new("kind", notice.kind.to_string())];
        let _timer = Timer::start_with_labels(&self.metrics.notice_duration, &kind_kv);

        let outcome = match notice.kind {
            NoticeKind::Rebalance => self.handle_rebalance(notice).await?,
            NoticeKind::Termination => self.handle_termination(notice).await?,
            NoticeKind::Unrecognized => NoticeOutcome::discarded("unrecognized notice kind"),
        };
        if let NoticeOutcome::Discarded { reason } = &outcome {
            info!(reason, "notice discarded");
        }
        self.metrics.notices.add(
            1,
            &[
                KeyValue::new("kind", notice.kind.to_string()),
                KeyValue::new("outcome", outcome.label()),
            ],
        );
        Ok(outcome)
    }

    /// Resolves the notice to an active instance and its pool. Notices for
    /// unknown or inactive instances, or with an unparseable pool, are
    /// discarded before any pool event is recorded, whatever their kind.
    fn resolve(
        &self,
        notice: &InterruptionNotice,
    ) -> Result<Result<(ProtectedInstance, PoolId), NoticeOutcome>> {
        let Some(instance) = self
            .state
            .reader()
            .get_instance_by_provider_id(&notice.instance_id)?
        else {
            return Ok(Err(NoticeOutcome::discarded("unknown instance")));
        };
        if !instance.is_active {
            return Ok(Err(NoticeOutcome::discarded("instance no longer active")));
        }
        match notice.pool_id() {
            Ok(pool) => Ok(Ok((instance, pool))),
            Err(err) => Ok(Err(NoticeOutcome::discarded(format!("invalid pool: {}", err)))),
        }
    }

    async fn handle_rebalance(&self, notice: &InterruptionNotice) -> Result<NoticeOutcome> {
        let (instance, failing_pool) = match self.resolve(notice)? {
            Ok(resolved) => resolved,
            Err(discarded) => return Ok(discarded),
        };
        self.registry
            .record_event(
                &failing_pool,
                PoolRiskKind::RebalanceNotice,
                notice.timestamp,
                &notice.account_id,
                &notice.instance_id,
            )
            .await?;
        if instance.is_replica {
            return Ok(NoticeOutcome::PoolEventRecorded);
        }

        let now = self.clock.now_ms();
        if let Some(existing) = self.outstanding_replica(&instance, now)? {
            return Ok(NoticeOutcome::ReplicaAlreadyActive { replica: existing });
        }

        let candidates = self.catalog.candidate_pools(&instance);
        let Some(placement) = self
            .registry
            .choose_placement(&candidates, &failing_pool, now)?
        else {
            warn!(pool = failing_pool.to_string(), "no candidate pools for standby");
            return Ok(NoticeOutcome::NoPlacement);
        };

        let provisioned = self
            .lifecycle
            .provision_replica(
                &instance.id,
                &placement.pool,
                self.config.replica_ttl_ms(),
                self.config.rebalance_deadline(),
            )
            .await;
        let outcome = match provisioned {
            Ok(ProvisionOutcome::Provisioned(replica)) => NoticeOutcome::ReplicaProvisioned {
                replica: replica.id,
                pool: placement.pool,
                degraded: placement.degraded,
            },
            Ok(ProvisionOutcome::AlreadyHasActiveReplica(replica)) => {
                NoticeOutcome::ReplicaAlreadyActive { replica }
            }
            Ok(ProvisionOutcome::NotEligible(conflict)) => {
                NoticeOutcome::discarded(format!("primary not eligible: {}", conflict))
            }
            Ok(ProvisionOutcome::ReservationLost) => {
                NoticeOutcome::discarded("reservation released while launching")
            }
            Err(LifecycleError::ProvisioningFailed { pool, reason, .. }) => {
                NoticeOutcome::ProvisioningFailed {
                    pool,
                    error: reason,
                }
            }
            Err(err) => return Err(err.into()),
        };
        Ok(outcome)
    }

    /// A standby that already covers `primary`, read without locks. The
    /// reservation write remains the authority.
    fn outstanding_replica(
        &self,
        primary: &ProtectedInstance,
        now: u64,
    ) -> Result<Option<InstanceId>> {
        let Some(current) = &primary.current_replica else {
            return Ok(None);
        };
        Ok(self
            .state
            .reader()
            .get_instance(current)?
            .filter(|r| r.is_outstanding_replica(now))
            .map(|r| r.id))
    }

    async fn handle_termination(&self, notice: &InterruptionNotice) -> Result<NoticeOutcome> {
        let (instance, failing_pool) = match self.resolve(notice)? {
            Ok(resolved) => resolved,
            Err(discarded) => return Ok(discarded),
        };
        self.registry
            .record_event(
                &failing_pool,
                PoolRiskKind::TerminationNotice,
                notice.timestamp,
                &notice.account_id,
                &notice.instance_id,
            )
            .await?;
        if instance.is_replica {
            return self.retire_interrupted_replica(instance).await;
        }

        let reason = format!("spot termination notice at {}", notice.timestamp);
        match self.lifecycle.promote_replica(&instance.id, &reason).await? {
            PromoteOutcome::Promoted(record) => Ok(NoticeOutcome::Promoted {
                old_primary: record.old_primary.id,
                new_primary: record.new_primary.id,
            }),
            PromoteOutcome::NotEligible(conflict) => Ok(NoticeOutcome::discarded(format!(
                "primary not eligible: {}",
                conflict
            ))),
            PromoteOutcome::NoReplicaAvailable => {
                self.emergency_replace(&instance, notice, &failing_pool, reason)
                    .await
            }
        }
    }

    /// The provider is taking a standby back. Reclaim it so a later
    /// termination of its primary takes the emergency path and records
    /// the downtime.
    async fn retire_interrupted_replica(
        &self,
        mut replica: ProtectedInstance,
    ) -> Result<NoticeOutcome> {
        for _ in 0..INTERRUPTED_RECLAIM_ATTEMPTS {
            if !replica.is_active || !replica.replica_state.is_some_and(|s| s.is_outstanding()) {
                return Ok(NoticeOutcome::PoolEventRecorded);
            }
            let now = self.clock.now_ms();
            if let Some(reclaimed) = self
                .lifecycle
                .reclaim(&replica, ReclaimCause::Interrupted, 0.0, now)
                .await?
            {
                warn!(
                    replica = reclaimed.id.get(),
                    primary = ?reclaimed.replica_of,
                    "standby interrupted, primary is uncovered"
                );
                if let Err(err) = self.lifecycle.terminate_reclaimed(&reclaimed).await {
                    warn!(error = %err, "termination of interrupted standby left to the sweeper");
                }
                return Ok(NoticeOutcome::ReplicaInterrupted {
                    replica: reclaimed.id,
                });
            }
            match self.state.reader().get_instance(&replica.id)? {
                Some(latest) => replica = latest,
                None => return Ok(NoticeOutcome::PoolEventRecorded),
            }
        }
        Err(anyhow!("standby {} kept changing while being retired", replica.id))
    }

    /// Launch a fresh primary under the strict termination deadline and
    /// record the gap in service.
    #[tracing::instrument(skip_all, fields(primary = primary.id.get(), pool = failing_pool.to_string()))]
    async fn emergency_replace(
        &self,
        primary: &ProtectedInstance,
        notice: &InterruptionNotice,
        failing_pool: &PoolId,
        reason: String,
    ) -> Result<NoticeOutcome> {
        self.metrics
            .emergency_fallbacks
            .add(1, &[KeyValue::new("pool", failing_pool.to_string())]);
        warn!("no standby available, emergency replacement");

        let claim = self
            .state
            .write(StateMachineUpdateRequest::new(RequestPayload::ClaimTermination(
                ClaimTerminationRequest {
                    primary: primary.id.clone(),
                    notice_at: notice.timestamp,
                    reason: reason.clone(),
                    now: self.clock.now_ms(),
                },
            )))
            .await?;
        match claim {
            UpdateOutcome::Applied => {}
            UpdateOutcome::Conflict(Conflict::AlreadyClaimed) => {
                return Ok(NoticeOutcome::DuplicateTermination)
            }
            UpdateOutcome::Conflict(conflict) => {
                return Ok(NoticeOutcome::discarded(format!(
                    "primary not eligible: {}",
                    conflict
                )))
            }
            other => return Err(anyhow!("unexpected claim outcome: {:?}", other)),
        }

        let now = self.clock.now_ms();
        let candidates = self.catalog.candidate_pools(primary);
        let Some(placement) = self
            .registry
            .choose_placement(&candidates, failing_pool, now)?
        else {
            return self
                .fail_emergency(primary, failing_pool, "no candidate pools".to_string())
                .await;
        };

        let request = LaunchRequest {
            account_id: primary.account_id.clone(),
            region: primary.region.clone(),
            pool: placement.pool.clone(),
            instance_type: data_model::instance_type_in_family(
                &primary.instance_type,
                &placement.pool.family,
            ),
            workload_id: primary.workload_id.clone(),
            client_token: format!("emergency-{}-{}", primary.id, notice.timestamp),
        };
        let description = match self
            .lifecycle
            .launch_until_running(&request, self.config.termination_deadline())
            .await
        {
            Ok(description) => description,
            Err(failure) => {
                if let Some(launched) = &failure.launched {
                    self.lifecycle.terminate_best_effort(launched).await;
                }
                return self
                    .fail_emergency(primary, &placement.pool, failure.reason)
                    .await;
            }
        };

        self.complete_emergency(primary, notice, placement, description, reason)
            .await
    }

    async fn complete_emergency(
        &self,
        primary: &ProtectedInstance,
        notice: &InterruptionNotice,
        placement: Placement,
        description: crate::provider::InstanceDescription,
        reason: String,
    ) -> Result<NoticeOutcome> {
        let now = self.clock.now_ms();
        let healthy_at = description.healthy_at.unwrap_or(now);
        let replacement = ProtectedInstance::new_replacement(
            primary,
            placement.pool.clone(),
            description.instance_id.clone(),
            now,
        );
        let interval = DowntimeInterval::new(
            primary,
            notice.timestamp,
            healthy_at,
            DowntimeCause::NoReplica,
            DowntimeDetails {
                pool: Some(placement.pool.clone()),
                replacement: Some(replacement.id.clone()),
                replacement_instance_id: Some(description.instance_id.clone()),
                degraded_placement: placement.degraded,
            },
        );
        let downtime_secs = interval.duration_secs;

        let outcome = self
            .state
            .write(StateMachineUpdateRequest::new(
                RequestPayload::CompleteEmergencyReplacement(EmergencyReplacementRequest {
                    primary: primary.id.clone(),
                    replacement,
                    interval,
                    reason,
                    now,
                }),
            ))
            .await?;
        match outcome {
            UpdateOutcome::Replaced(replacement) => {
                info!(
                    replacement = replacement.id.get(),
                    instance_id = description.instance_id.get(),
                    pool = placement.pool.to_string(),
                    degraded = placement.degraded,
                    downtime_secs,
                    "emergency replacement healthy, downtime recorded"
                );
                Ok(NoticeOutcome::EmergencyReplaced {
                    replacement: replacement.id,
                    pool: placement.pool,
                    degraded: placement.degraded,
                    downtime_secs,
                })
            }
            UpdateOutcome::Conflict(conflict) => {
                // A late standby promotion won; the replacement is surplus.
                warn!(%conflict, instance_id = description.instance_id.get(), "emergency claim lost, terminating replacement");
                self.lifecycle
                    .terminate_best_effort(&description.instance_id)
                    .await;
                Ok(NoticeOutcome::discarded("workload already served"))
            }
            other => Err(anyhow!("unexpected emergency outcome: {:?}", other)),
        }
    }

    async fn fail_emergency(
        &self,
        primary: &ProtectedInstance,
        pool: &PoolId,
        reason: String,
    ) -> Result<NoticeOutcome> {
        self.metrics
            .emergency_failures
            .add(1, &[KeyValue::new("pool", pool.to_string())]);
        error!(pool = pool.to_string(), reason, "emergency replacement failed");

        let mut anomaly = Anomaly::new(
            AnomalyKind::EmergencyLaunchFailed,
            self.clock.now_ms(),
            format!("emergency replacement in {} failed: {}", pool, reason),
        )
        .for_instance(primary);
        anomaly.pool = Some(pool.clone());
        self.state
            .write(StateMachineUpdateRequest::new(
                RequestPayload::ReleaseTermination(ReleaseTerminationRequest {
                    primary: primary.id.clone(),
                    anomaly: Some(anomaly),
                    now: self.clock.now_ms(),
                }),
            ))
            .await?;
        Ok(NoticeOutcome::EmergencyFailed { error: reason })
    }
}
