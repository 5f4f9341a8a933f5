use std::{future::Future, sync::Arc, time::Duration};

use anyhow::anyhow;
use data_model::{
    cost_avoided_usd,
    Anomaly,
    AnomalyKind,
    InstanceId,
    PoolId,
    ProtectedInstance,
    ProviderInstanceId,
    ReclaimCause,
    ReplicaState,
};
use metrics::Timer;
use opentelemetry::KeyValue;
use safety_net_utils::{
    retry::{retry_until_deadline, retry_with_backoff},
    Clock,
};
use serde::{Deserialize, Serialize};
use state_store::{
    requests::{
        AbandonReplicaRequest,
        ActivateReplicaRequest,
        Conflict,
        FlagForReviewRequest,
        MarkReplicaTerminatedRequest,
        PromoteReplicaRequest,
        PromotionRecord,
        ReclaimReplicaRequest,
        RequestPayload,
        ReserveReplicaRequest,
        StateMachineUpdateRequest,
        UpdateOutcome,
    },
    SafetyNetState,
};
use tracing::{debug, error, info, warn};

use crate::{
    config::SafetyNetConfig,
    inventory::PoolCatalog,
    provider::{CloudProvider, InstanceDescription, LaunchRequest, ProviderError, ProviderInstanceState},
};

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("provisioning standby for {primary} in pool {pool} failed: {reason}")]
    ProvisioningFailed {
        primary: InstanceId,
        pool: PoolId,
        reason: String,
    },

    #[error("terminating reclaimed standby {replica} failed: {source}")]
    ReclaimFailed {
        replica: InstanceId,
        #[source]
        source: ProviderError,
    },

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProvisionOutcome {
    Provisioned(ProtectedInstance),
    /// Rebalance for a primary that already has a standby is a no-op.
    AlreadyHasActiveReplica(InstanceId),
    /// The primary is unknown, inactive, a standby or mid emergency.
    NotEligible(Conflict),
    /// The reservation was released while the launch was in flight; the
    /// launched instance was handed back to the provider.
    ReservationLost,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PromoteOutcome {
    Promoted(PromotionRecord),
    NoReplicaAvailable,
    NotEligible(Conflict),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReclaimResult {
    Reclaimed {
        replica: InstanceId,
        cost_avoided_usd: f64,
        terminated: bool,
    },
    /// The primary is gone; left for orphan handling.
    AlreadyResolved { replica: InstanceId },
    /// A concurrent promotion or reclaim got there first.
    Raced { replica: InstanceId },
    Failed { replica: InstanceId, error: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct LaunchFailure {
    /// Set when the instance was created but never became healthy.
    pub launched: Option<ProviderInstanceId>,
    pub reason: String,
}

/// Owns the standby state machine. Storage transitions go through
/// [`SafetyNetState::write`]; provider calls happen between them, never
/// inside one.
pub struct ReplicaLifecycleManager {
    state: Arc<SafetyNetState>,
    provider: Arc<dyn CloudProvider>,
    catalog: Arc<PoolCatalog>,
    clock: Arc<dyn Clock>,
    config: Arc<SafetyNetConfig>,
    metrics: Arc<metrics::safety_net::Metrics>,
}

impl ReplicaLifecycleManager {
    pub fn new(
        state: Arc<SafetyNetState>,
        provider: Arc<dyn CloudProvider>,
        catalog: Arc<PoolCatalog>,
        clock: Arc<dyn Clock>,
        config: Arc<SafetyNetConfig>,
        metrics: Arc<metrics::safety_net::Metrics>,
    ) -> Self {
        Self {
            state,
            provider,
            catalog,
            clock,
            config,
            metrics,
        }
    }

    #[tracing::instrument(skip_all, fields(primary = primary.get(), pool = pool.to_string()))]
    pub async fn provision_replica(
        &self,
        primary: &InstanceId,
        pool: &PoolId,
        ttl_ms: u64,
        deadline: Duration,
    ) -> Result<ProvisionOutcome, LifecycleError> {
        let outcome = self
            .state
            .write(StateMachineUpdateRequest::new(RequestPayload::ReserveReplica(
                ReserveReplicaRequest {
                    primary: primary.clone(),
                    pool: pool.clone(),
                    ttl_ms,
                    now: self.clock.now_ms(),
                },
            )))
            .await?;
        let replica = match outcome {
            UpdateOutcome::ReplicaReserved(replica) => replica,
            UpdateOutcome::Conflict(Conflict::AlreadyHasActiveReplica(existing)) => {
                info!(replica = existing.get(), "standby already outstanding, ttl not refreshed");
                return Ok(ProvisionOutcome::AlreadyHasActiveReplica(existing));
            }
            UpdateOutcome::Conflict(conflict) => {
                info!(%conflict, "primary not eligible for a standby");
                return Ok(ProvisionOutcome::NotEligible(conflict));
            }
            other => return Err(anyhow!("unexpected reserve outcome: {:?}", other).into()),
        };

        let request = LaunchRequest {
            account_id: replica.account_id.clone(),
            region: replica.region.clone(),
            pool: replica.pool.clone(),
            instance_type: replica.instance_type.clone(),
            workload_id: replica.workload_id.clone(),
            client_token: replica.id.to_string(),
        };
        let description = match self.launch_until_running(&request, deadline).await {
            Ok(description) => description,
            Err(failure) => {
                if let Some(launched) = &failure.launched {
                    self.terminate_best_effort(launched).await;
                }
                self.state
                    .write(StateMachineUpdateRequest::new(RequestPayload::AbandonReplica(
                        AbandonReplicaRequest {
                            replica: replica.id.clone(),
                        },
                    )))
                    .await?;
                self.metrics
                    .provisioning_failures
                    .add(1, &[KeyValue::new("pool", pool.to_string())]);
                error!(replica = replica.id.get(), reason = failure.reason, "standby launch failed, reservation released");
                return Err(LifecycleError::ProvisioningFailed {
                    primary: primary.clone(),
                    pool: pool.clone(),
                    reason: failure.reason,
                });
            }
        };

        let outcome = self
            .state
            .write(StateMachineUpdateRequest::new(RequestPayload::ActivateReplica(
                ActivateReplicaRequest {
                    replica: replica.id.clone(),
                    instance_id: description.instance_id.clone(),
                    now: self.clock.now_ms(),
                },
            )))
            .await?;
        match outcome {
            UpdateOutcome::ReplicaActivated(active) => {
                self.metrics
                    .replicas_provisioned
                    .add(1, &[KeyValue::new("pool", pool.to_string())]);
                info!(
                    replica = active.id.get(),
                    instance_id = description.instance_id.get(),
                    expires_at = active.replica_expires_at,
                    "standby active"
                );
                Ok(ProvisionOutcome::Provisioned(active))
            }
            UpdateOutcome::Conflict(conflict) => {
                warn!(
                    replica = replica.id.get(),
                    instance_id = description.instance_id.get(),
                    %conflict,
                    "reservation released while launching, terminating late instance"
                );
                self.terminate_late_launch(&replica, &description.instance_id)
                    .await?;
                Ok(ProvisionOutcome::ReservationLost)
            }
            other => Err(anyhow!("unexpected activate outcome: {:?}", other).into()),
        }
    }

    #[tracing::instrument(skip_all, fields(primary = primary.get()))]
    pub async fn promote_replica(
        &self,
        primary: &InstanceId,
        reason: &str,
    ) -> anyhow::Result<PromoteOutcome> {
        let outcome = self
            .state
            .write(StateMachineUpdateRequest::new(RequestPayload::PromoteReplica(
                PromoteReplicaRequest {
                    primary: primary.clone(),
                    reason: reason.to_string(),
                    now: self.clock.now_ms(),
                },
            )))
            .await?;
        match outcome {
            UpdateOutcome::Promoted(record) => {
                self.metrics
                    .promotions
                    .add(1, &[KeyValue::new("pool", record.new_primary.pool.to_string())]);
                info!(
                    old_primary = record.old_primary.id.get(),
                    new_primary = record.new_primary.id.get(),
                    workload_id = record.new_primary.workload_id,
                    "standby promoted, zero downtime"
                );
                Ok(PromoteOutcome::Promoted(record))
            }
            UpdateOutcome::Conflict(Conflict::NoReplicaAvailable) => {
                Ok(PromoteOutcome::NoReplicaAvailable)
            }
            UpdateOutcome::Conflict(conflict) => Ok(PromoteOutcome::NotEligible(conflict)),
            other => Err(anyhow!("unexpected promote outcome: {:?}", other)),
        }
    }

    /// Reclaim every `Active` standby past its expiry whose primary is
    /// still serving. Each standby is handled on its own; failures are
    /// reported, not raised.
    pub async fn reclaim_expired(&self, now: u64) -> anyhow::Result<Vec<ReclaimResult>> {
        let reader = self.state.reader();
        let expired = reader
            .replicas()?
            .into_iter()
            .filter(|r| {
                r.is_active && r.replica_state == Some(ReplicaState::Active) && r.is_expired(now)
            })
            .collect::<Vec<_>>();

        let mut results = Vec::with_capacity(expired.len());
        for replica in expired {
            let result = match self.reclaim_false_alarm(&replica, now).await {
                Ok(result) => result,
                Err(err) => {
                    error!(replica = replica.id.get(), error = %err, "reclaim failed");
                    ReclaimResult::Failed {
                        replica: replica.id.clone(),
                        error: err.to_string(),
                    }
                }
            };
            results.push(result);
        }
        Ok(results)
    }

    async fn reclaim_false_alarm(
        &self,
        replica: &ProtectedInstance,
        now: u64,
    ) -> Result<ReclaimResult, LifecycleError> {
        let primary_active = match &replica.replica_of {
            Some(primary) => self
                .state
                .reader()
                .get_instance(primary)?
                .is_some_and(|p| p.is_active),
            None => false,
        };
        if !primary_active {
            info!(replica = replica.id.get(), "expired standby already resolved, primary gone");
            return Ok(ReclaimResult::AlreadyResolved {
                replica: replica.id.clone(),
            });
        }

        let cost = self.cost_avoided(replica).await;
        let Some(reclaimed) = self
            .reclaim(replica, ReclaimCause::FalseAlarm, cost, now)
            .await?
        else {
            return Ok(ReclaimResult::Raced {
                replica: replica.id.clone(),
            });
        };
        info!(
            replica = reclaimed.id.get(),
            cost_avoided_usd = cost,
            "false alarm standby reclaimed"
        );
        let terminated = match self.terminate_reclaimed(&reclaimed).await {
            Ok(()) => true,
            Err(LifecycleError::ReclaimFailed { replica, source }) => {
                warn!(replica = replica.get(), error = %source, "termination failed, will retry next sweep");
                false
            }
            Err(err) => return Err(err),
        };
        Ok(ReclaimResult::Reclaimed {
            replica: reclaimed.id,
            cost_avoided_usd: cost,
            terminated,
        })
    }

    /// Conditional reclaim against the version in `replica`. `None` when
    /// the row moved on.
    pub async fn reclaim(
        &self,
        replica: &ProtectedInstance,
        cause: ReclaimCause,
        cost_avoided_usd: f64,
        now: u64,
    ) -> anyhow::Result<Option<ProtectedInstance>> {
        let outcome = self
            .state
            .write(StateMachineUpdateRequest::new(RequestPayload::ReclaimReplica(
                ReclaimReplicaRequest {
                    replica: replica.id.clone(),
                    expected_version: replica.version,
                    cause,
                    cost_avoided_usd,
                    now,
                },
            )))
            .await?;
        match outcome {
            UpdateOutcome::Reclaimed(reclaimed) => Ok(Some(reclaimed)),
            UpdateOutcome::Conflict(conflict) => {
                debug!(replica = replica.id.get(), %conflict, cause = cause.as_ref(), "reclaim raced");
                Ok(None)
            }
            other => Err(anyhow!("unexpected reclaim outcome: {:?}", other)),
        }
    }

    /// Hand a reclaimed standby back to the provider and clear its
    /// pending flag. An instance the provider no longer knows counts as
    /// terminated.
    pub async fn terminate_reclaimed(&self, replica: &ProtectedInstance) -> Result<(), LifecycleError> {
        if let Some(instance_id) = &replica.instance_id {
            match self.terminate_with_retry(instance_id).await {
                Ok(()) | Err(ProviderError::NotFound(_)) => {}
                Err(source) => {
                    return Err(LifecycleError::ReclaimFailed {
                        replica: replica.id.clone(),
                        source,
                    })
                }
            }
        }
        self.state
            .write(StateMachineUpdateRequest::new(
                RequestPayload::MarkReplicaTerminated(MarkReplicaTerminatedRequest {
                    replica: replica.id.clone(),
                    now: self.clock.now_ms(),
                }),
            ))
            .await?;
        Ok(())
    }

    /// Spend avoided by reclaiming `replica` early: its full TTL at the
    /// pool's spot price, or the catalog rate when no price is published.
    pub async fn cost_avoided(&self, replica: &ProtectedInstance) -> f64 {
        let ttl_ms = replica
            .replica_expires_at
            .map(|expires| expires.saturating_sub(replica.created_at))
            .unwrap_or_else(|| self.config.replica_ttl_ms());
        let spot = match self
            .provider
            .spot_price(&replica.pool, &replica.instance_type)
            .await
        {
            Ok(price) => price,
            Err(err) => {
                warn!(pool = replica.pool.to_string(), error = %err, "spot price unavailable");
                None
            }
        };
        match spot.or_else(|| self.catalog.hourly_rate(&replica.pool.family)) {
            Some(rate) => cost_avoided_usd(ttl_ms, rate),
            None => {
                warn!(pool = replica.pool.to_string(), "no hourly rate known, cost avoided not counted");
                0.0
            }
        }
    }

    /// Launch with retries and poll until running, all within `deadline`.
    pub(crate) async fn launch_until_running(
        &self,
        request: &LaunchRequest,
        deadline: Duration,
    ) -> Result<InstanceDescription, LaunchFailure> {
        let started = tokio::time::Instant::now();
        let retry = &self.config.provider_retry;
        let launch = tokio::time::timeout(
            deadline,
            retry_with_backoff(
                retry.max_retries,
                retry.backoff(),
                "launch instance",
                || self.observe("launch", self.provider.launch(request)),
                ProviderError::is_retryable,
            ),
        )
        .await;
        let instance_id = match launch {
            Ok(Ok(instance_id)) => instance_id,
            Ok(Err(err)) => {
                return Err(LaunchFailure {
                    launched: None,
                    reason: err.to_string(),
                })
            }
            Err(_) => {
                return Err(LaunchFailure {
                    launched: None,
                    reason: format!("launch did not complete within {:?}", deadline),
                })
            }
        };

        let remaining = deadline.saturating_sub(started.elapsed());
        let polled = retry_until_deadline(
            remaining,
            self.config.describe_poll_interval(),
            "wait for instance to run",
            || async {
                let description = self
                    .observe("describe", self.provider.describe(&instance_id))
                    .await?;
                if description.state == ProviderInstanceState::Pending {
                    return Err(anyhow!("instance {} still pending", instance_id));
                }
                Ok::<_, anyhow::Error>(description)
            },
        )
        .await;
        match polled {
            Ok(description) if description.state == ProviderInstanceState::Running => {
                Ok(description)
            }
            Ok(description) => Err(LaunchFailure {
                launched: Some(instance_id),
                reason: format!("instance entered state {} before running", description.state),
            }),
            Err(err) => Err(LaunchFailure {
                launched: Some(instance_id),
                reason: err.to_string(),
            }),
        }
    }

    pub(crate) async fn terminate_with_retry(
        &self,
        instance_id: &ProviderInstanceId,
    ) -> Result<(), ProviderError> {
        let retry = &self.config.provider_retry;
        retry_with_backoff(
            retry.max_retries,
            retry.backoff(),
            "terminate instance",
            || self.observe("terminate", self.provider.terminate(instance_id)),
            ProviderError::is_retryable,
        )
        .await
    }

    pub(crate) async fn terminate_best_effort(&self, instance_id: &ProviderInstanceId) {
        if let Err(err) = self.terminate_with_retry(instance_id).await {
            error!(instance_id = instance_id.get(), error = %err, "failed to terminate unused instance");
        }
    }

    async fn terminate_late_launch(
        &self,
        replica: &ProtectedInstance,
        instance_id: &ProviderInstanceId,
    ) -> anyhow::Result<()> {
        match self.terminate_with_retry(instance_id).await {
            Ok(()) | Err(ProviderError::NotFound(_)) => Ok(()),
            Err(err) => {
                let anomaly = Anomaly::new(
                    AnomalyKind::LateLaunchTerminateFailed,
                    self.clock.now_ms(),
                    format!(
                        "instance {} launched for released reservation could not be terminated: {}",
                        instance_id, err
                    ),
                )
                .for_instance(replica);
                self.state
                    .write(StateMachineUpdateRequest::new(RequestPayload::FlagForReview(
                        FlagForReviewRequest {
                            instance: None,
                            anomaly,
                        },
                    )))
                    .await?;
                Ok(())
            }
        }
    }

    async fn observe<T>(&self, operation: &'static str, call: impl Future<Output = T>) -> T {
        let labels = [KeyValue::new("operation", operation)];
        let _timer = Timer::start_with_labels(&self.metrics.provider_calls, &labels);
        call.await
    }
}
