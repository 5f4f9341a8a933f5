use std::{collections::HashSet, sync::Arc, time::Instant};

use anyhow::{anyhow, Result};
use data_model::{
    Anomaly,
    AnomalyKind,
    DeactivationCause,
    InstanceId,
    ProtectedInstance,
    ReclaimCause,
    ReplicaState,
    SweepFailure,
    SweepReport,
};
use opentelemetry::KeyValue;
use safety_net_utils::Clock;
use state_store::{
    requests::{
        AdoptOrphanRequest,
        Conflict,
        FlagForReviewRequest,
        RequestPayload,
        StateMachineUpdateRequest,
        UpdateOutcome,
    },
    SafetyNetState,
};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::{
    config::SafetyNetConfig,
    replica_lifecycle::{LifecycleError, ReclaimResult, ReplicaLifecycleManager},
};

/// Periodic reconciliation: reclaims false alarm standbys and cleans up
/// after handlers that crashed mid flight.
pub struct ReconciliationSweeper {
    state: Arc<SafetyNetState>,
    lifecycle: Arc<ReplicaLifecycleManager>,
    clock: Arc<dyn Clock>,
    config: Arc<SafetyNetConfig>,
    metrics: Arc<metrics::sweeper::Metrics>,
    trigger_tx: watch::Sender<()>,
    // Serializes timer and on demand runs.
    run_lock: tokio::sync::Mutex<()>,
}

impl ReconciliationSweeper {
    pub fn new(
        state: Arc<SafetyNetState>,
        lifecycle: Arc<ReplicaLifecycleManager>,
        clock: Arc<dyn Clock>,
        config: Arc<SafetyNetConfig>,
    ) -> Self {
        let (trigger_tx, _) = watch::channel(());
        Self {
            state,
            lifecycle,
            clock,
            config,
            metrics: Arc::new(metrics::sweeper::Metrics::new()),
            trigger_tx,
            run_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Ask the background loop for an extra run.
    pub fn trigger(&self) {
        self.trigger_tx.send_replace(());
    }

    pub async fn start(&self, mut shutdown_rx: watch::Receiver<()>) {
        info!(
            interval_secs = self.config.sweep_interval_secs,
            "starting reconciliation sweeper"
        );
        let mut trigger_rx = self.trigger_tx.subscribe();
        let mut ticker = tokio::time::interval(self.config.sweep_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {},
                _ = trigger_rx.changed() => {},
                _ = shutdown_rx.changed() => {
                    info!("reconciliation sweeper shutting down");
                    break;
                }
            }
            trigger_rx.borrow_and_update();
            if let Err(err) = self.run_once().await {
                error!(error = %err, "reconciliation sweep failed");
            }
        }
    }

    /// One full pass. Per instance failures land in the report; only a
    /// failure to list state or persist the report is returned.
    pub async fn run_once(&self) -> Result<SweepReport> {
        let _guard = self.run_lock.lock().await;
        let started = Instant::now();
        let now = self.clock.now_ms();
        let mut report = SweepReport {
            started_at: now,
            configured_false_alarm_ratio: self.config.false_alarm_ratio,
            ..Default::default()
        };

        let attempted = self.reclaim_expired(now, &mut report).await?;
        self.retry_pending_terminations(&attempted, &mut report)
            .await?;
        self.reconcile_orphans(now, &mut report).await?;
        self.release_stale_reservations(now, &mut report).await?;
        self.flag_stuck_claims(now, &mut report).await?;

        report.observed_false_alarm_ratio = self.state.reader().stats()?.observed_false_alarm_ratio();
        report.finished_at = self.clock.now_ms();
        self.state
            .write(StateMachineUpdateRequest::new(RequestPayload::SaveSweepReport(
                report.clone(),
            )))
            .await?;

        self.metrics.runs.add(1, &[]);
        self.metrics
            .duration
            .record(started.elapsed().as_secs_f64(), &[]);
        if !report.failures.is_empty() {
            self.metrics.failures.add(report.failures.len() as u64, &[]);
        }
        info!(
            reclaimed_false_alarms = report.reclaimed_false_alarms,
            cost_avoided_usd = report.cost_avoided_usd,
            already_resolved = report.already_resolved,
            redundant_reclaimed = report.redundant_reclaimed,
            orphans_promoted = report.orphans_promoted,
            anomalies_flagged = report.anomalies_flagged,
            terminations_retried = report.terminations_retried,
            stale_reservations_released = report.stale_reservations_released,
            failures = report.failures.len(),
            observed_false_alarm_ratio = report.observed_false_alarm_ratio,
            configured_false_alarm_ratio = report.configured_false_alarm_ratio,
            "reconciliation sweep finished"
        );
        if let Some(observed) = report.observed_false_alarm_ratio {
            if observed > self.config.false_alarm_ratio {
                warn!(
                    observed,
                    configured = self.config.false_alarm_ratio,
                    "false alarm ratio above expectation"
                );
            }
        }
        Ok(report)
    }

    /// Returns the standbys whose termination was already attempted.
    async fn reclaim_expired(&self, now: u64, report: &mut SweepReport) -> Result<HashSet<InstanceId>> {
        let mut attempted = HashSet::new();
        for result in self.lifecycle.reclaim_expired(now).await? {
            match result {
                ReclaimResult::Reclaimed {
                    replica,
                    cost_avoided_usd,
                    terminated,
                } => {
                    report.reclaimed_false_alarms += 1;
                    report.cost_avoided_usd += cost_avoided_usd;
                    self.metrics.reclaimed.add(1, &[KeyValue::new("cause", "false_alarm")]);
                    self.metrics.cost_avoided_usd.add(cost_avoided_usd, &[]);
                    if !terminated {
                        report.failures.push(SweepFailure {
                            instance: replica.clone(),
                            error: "provider termination failed, retrying next sweep".to_string(),
                        });
                    }
                    attempted.insert(replica);
                }
                ReclaimResult::AlreadyResolved { .. } => report.already_resolved += 1,
                ReclaimResult::Raced { replica } => {
                    debug!(replica = replica.get(), "reclaim raced with another writer");
                }
                ReclaimResult::Failed { replica, error } => {
                    report.failures.push(SweepFailure {
                        instance: replica,
                        error,
                    });
                }
            }
        }
        Ok(attempted)
    }

    async fn retry_pending_terminations(
        &self,
        skip: &HashSet<InstanceId>,
        report: &mut SweepReport,
    ) -> Result<()> {
        let pending = self
            .state
            .reader()
            .replicas()?
            .into_iter()
            .filter(|r| r.termination_pending && !skip.contains(&r.id))
            .collect::<Vec<_>>();
        for replica in pending {
            report.terminations_retried += 1;
            match self.lifecycle.terminate_reclaimed(&replica).await {
                Ok(()) => info!(replica = replica.id.get(), "pending termination completed"),
                Err(err) => {
                    if let LifecycleError::ReclaimFailed { .. } = err {
                        self.flag(
                            &replica,
                            AnomalyKind::ReclaimFailed,
                            format!("provider termination keeps failing: {}", err),
                            report,
                        )
                        .await
                        .unwrap_or_else(|e| record_failure(report, &replica.id, &e));
                    }
                    record_failure(report, &replica.id, &anyhow!(err));
                }
            }
        }
        Ok(())
    }

    async fn reconcile_orphans(&self, now: u64, report: &mut SweepReport) -> Result<()> {
        let reader = self.state.reader();
        let candidates = reader
            .replicas()?
            .into_iter()
            .filter(|r| r.is_active && r.replica_state == Some(ReplicaState::Active))
            .collect::<Vec<_>>();
        for replica in candidates {
            if let Err(err) = self.reconcile_orphan(&replica, now, report).await {
                record_failure(report, &replica.id, &err);
            }
        }
        Ok(())
    }

    async fn reconcile_orphan(
        &self,
        replica: &ProtectedInstance,
        now: u64,
        report: &mut SweepReport,
    ) -> Result<()> {
        let reader = self.state.reader();
        let primary = match &replica.replica_of {
            Some(id) => reader.get_instance(id)?,
            None => None,
        };
        if primary.as_ref().is_some_and(|p| p.is_active) {
            return Ok(());
        }

        let others_serving = reader
            .active_instances_for_workload(&replica.workload_id)?
            .into_iter()
            .any(|i| i.id != replica.id && !i.is_replica);
        if !others_serving {
            let outcome = self
                .state
                .write(StateMachineUpdateRequest::new(RequestPayload::AdoptOrphan(
                    AdoptOrphanRequest {
                        replica: replica.id.clone(),
                        expected_version: replica.version,
                        now,
                    },
                )))
                .await?;
            if let UpdateOutcome::Adopted(adopted) = outcome {
                report.orphans_promoted += 1;
                warn!(
                    replica = adopted.id.get(),
                    workload_id = adopted.workload_id,
                    "orphaned standby adopted as primary"
                );
            }
            return Ok(());
        }

        let replaced_on_emergency_path = primary.as_ref().is_some_and(|p| {
            p.metadata.deactivation_cause == Some(DeactivationCause::NoReplica)
        });
        if replaced_on_emergency_path {
            let Some(reclaimed) = self
                .lifecycle
                .reclaim(replica, ReclaimCause::Redundant, 0.0, now)
                .await?
            else {
                return Ok(());
            };
            report.redundant_reclaimed += 1;
            self.metrics.reclaimed.add(1, &[KeyValue::new("cause", "redundant")]);
            info!(replica = reclaimed.id.get(), "redundant standby reclaimed");
            if let Err(err) = self.lifecycle.terminate_reclaimed(&reclaimed).await {
                record_failure(report, &reclaimed.id, &anyhow!(err));
            }
            return Ok(());
        }

        self.flag(
            replica,
            AnomalyKind::OrphanedReplica,
            format!(
                "standby of missing or inactive primary {:?} while workload {} is served elsewhere",
                replica.replica_of.as_ref().map(|p| p.to_string()),
                replica.workload_id
            ),
            report,
        )
        .await
    }

    async fn release_stale_reservations(&self, now: u64, report: &mut SweepReport) -> Result<()> {
        let timeout = self.config.provisioning_timeout_ms();
        let stale = self
            .state
            .reader()
            .replicas()?
            .into_iter()
            .filter(|r| {
                r.is_active &&
                    r.replica_state == Some(ReplicaState::Provisioning) &&
                    now.saturating_sub(r.created_at) > timeout
            })
            .collect::<Vec<_>>();
        for replica in stale {
            let released = match self
                .lifecycle
                .reclaim(&replica, ReclaimCause::StaleProvisioning, 0.0, now)
                .await
            {
                Ok(released) => released,
                Err(err) => {
                    record_failure(report, &replica.id, &err);
                    continue;
                }
            };
            let Some(released) = released else {
                continue;
            };
            report.stale_reservations_released += 1;
            self.metrics
                .reclaimed
                .add(1, &[KeyValue::new("cause", "stale_provisioning")]);
            let details = format!(
                "reservation stuck in provisioning since {}, a provider instance may have leaked",
                released.created_at
            );
            if let Err(err) = self
                .flag(&released, AnomalyKind::StaleProvisioning, details, report)
                .await
            {
                record_failure(report, &released.id, &err);
            }
        }
        Ok(())
    }

    async fn flag_stuck_claims(&self, now: u64, report: &mut SweepReport) -> Result<()> {
        let timeout = self.config.claim_timeout_ms();
        let stuck = self
            .state
            .reader()
            .all_instances()?
            .into_iter()
            .filter(|i| {
                i.is_active &&
                    i.termination_notice_at
                        .is_some_and(|at| now.saturating_sub(at) > timeout)
            })
            .collect::<Vec<_>>();
        for instance in stuck {
            let details = format!(
                "emergency replacement claimed at {:?} never completed",
                instance.termination_notice_at
            );
            if let Err(err) = self
                .flag(&instance, AnomalyKind::StuckTerminationClaim, details, report)
                .await
            {
                record_failure(report, &instance.id, &err);
            }
        }
        Ok(())
    }

    /// Record an anomaly for `instance` unless it is already flagged.
    async fn flag(
        &self,
        instance: &ProtectedInstance,
        kind: AnomalyKind,
        details: String,
        report: &mut SweepReport,
    ) -> Result<()> {
        let anomaly = Anomaly::new(kind, self.clock.now_ms(), details).for_instance(instance);
        let outcome = self
            .state
            .write(StateMachineUpdateRequest::new(RequestPayload::FlagForReview(
                FlagForReviewRequest {
                    instance: Some(instance.id.clone()),
                    anomaly,
                },
            )))
            .await?;
        match outcome {
            UpdateOutcome::Applied => {
                report.anomalies_flagged += 1;
                self.metrics
                    .anomalies
                    .add(1, &[KeyValue::new("kind", kind.to_string())]);
                Ok(())
            }
            UpdateOutcome::Conflict(Conflict::AlreadyFlagged) => Ok(()),
            UpdateOutcome::Conflict(conflict) => {
                debug!(instance = instance.id.get(), %conflict, "flag skipped");
                Ok(())
            }
            other => Err(anyhow!("unexpected flag outcome: {:?}", other)),
        }
    }
}

fn record_failure(report: &mut SweepReport, instance: &InstanceId, err: &anyhow::Error) {
    error!(instance = instance.get(), error = %err, "sweep step failed for instance");
    report.failures.push(SweepFailure {
        instance: instance.clone(),
        error: err.to_string(),
    });
}

#[cfg(test)]
mod tests {
    use data_model::{test_objects::tests::mock_primary, NoticeKind, PoolId};
    use safety_net_utils::{MS_PER_HOUR, MS_PER_SECOND};
    use state_store::{
        driver::Writer,
        requests::{ClaimTerminationRequest, ReserveReplicaRequest},
    };

    use super::*;
    use crate::{
        interruption_handler::{tests::HandlerFixture, NoticeOutcome},
        provider::ProviderError,
        replica_lifecycle::tests::{test_config, TTL},
    };

    fn sweeper(fixture: &HandlerFixture) -> ReconciliationSweeper {
        ReconciliationSweeper::new(
            fixture.store().state.clone(),
            fixture.base.lifecycle.clone(),
            Arc::new(fixture.base.clock.clone()),
            Arc::new(test_config()),
        )
    }

    #[tokio::test]
    async fn test_sweep_reclaims_false_alarm() -> Result<()> {
        let fixture = HandlerFixture::new().await?;
        let primary = fixture.store().register(mock_primary("i-1", "az-1")).await?;
        fixture.notice("i-1", NoticeKind::Rebalance).await;
        let sweeper = sweeper(&fixture);

        fixture.base.clock.advance(MS_PER_HOUR);
        let report = sweeper.run_once().await?;
        assert_eq!(report.reclaimed_false_alarms, 0);

        fixture.base.clock.advance(TTL);
        let report = sweeper.run_once().await?;
        assert_eq!(report.reclaimed_false_alarms, 1);
        assert!((report.cost_avoided_usd - 0.6).abs() < 1e-9);
        assert!(report.failures.is_empty());
        assert_eq!(report.observed_false_alarm_ratio, Some(1.0));
        assert_eq!(report.configured_false_alarm_ratio, 0.4);

        let reader = fixture.store().state.reader();
        assert_eq!(reader.latest_sweep_report()?, Some(report));
        assert!(reader.get_instance(&primary.id)?.unwrap().is_active);
        assert!(fixture.provider().running().await.is_empty());

        // Nothing left to do.
        let report = sweeper.run_once().await?;
        assert_eq!(report.reclaimed_false_alarms, 0);
        assert_eq!(report.terminations_retried, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_sweep_retries_failed_termination() -> Result<()> {
        let fixture = HandlerFixture::new().await?;
        fixture.store().register(mock_primary("i-1", "az-1")).await?;
        fixture.notice("i-1", NoticeKind::Rebalance).await;
        let sweeper = sweeper(&fixture);
        fixture
            .provider()
            .fail_next_terminations([ProviderError::Unavailable("down".to_string())])
            .await;

        fixture.base.clock.advance(TTL + 1);
        let report = sweeper.run_once().await?;
        assert_eq!(report.reclaimed_false_alarms, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.terminations_retried, 0);

        let report = sweeper.run_once().await?;
        assert_eq!(report.terminations_retried, 1);
        assert!(report.failures.is_empty());
        assert!(fixture.provider().running().await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_promoted_standby_is_left_alone() -> Result<()> {
        let fixture = HandlerFixture::new().await?;
        fixture.store().register(mock_primary("i-1", "az-1")).await?;
        fixture.notice("i-1", NoticeKind::Rebalance).await;
        fixture.base.clock.advance(2 * MS_PER_HOUR);
        assert!(matches!(
            fixture.notice("i-1", NoticeKind::Termination).await,
            NoticeOutcome::Promoted { .. }
        ));

        fixture.base.clock.advance(5 * MS_PER_HOUR);
        let report = sweeper(&fixture).run_once().await?;
        assert_eq!(report, SweepReport {
            started_at: report.started_at,
            finished_at: report.finished_at,
            observed_false_alarm_ratio: Some(0.0),
            configured_false_alarm_ratio: 0.4,
            ..Default::default()
        });
        assert_eq!(fixture.provider().running().await.len(), 1);
        Ok(())
    }

    async fn deactivate_primary_directly(
        fixture: &HandlerFixture,
        primary: &ProtectedInstance,
    ) -> Result<()> {
        // Simulates a handler that died between claiming and replacing:
        // the primary is gone and nothing took over.
        let mut dead = fixture
            .store()
            .state
            .reader()
            .get_instance(&primary.id)?
            .unwrap();
        dead.deactivate(DeactivationCause::ReplacedByReplica, None, fixture.base.clock.now_ms());
        let txn = fixture.store().state.db.transaction();
        txn.compare_and_swap(
            state_store::state_machine::SafetyNetColumns::Instances,
            dead.key(),
            Some(dead.version),
            &mut dead,
        )?;
        txn.commit()?;
        Ok(())
    }

    #[tokio::test]
    async fn test_orphan_without_server_is_adopted() -> Result<()> {
        let fixture = HandlerFixture::new().await?;
        let primary = fixture.store().register(mock_primary("i-1", "az-1")).await?;
        let NoticeOutcome::ReplicaProvisioned { replica, .. } =
            fixture.notice("i-1", NoticeKind::Rebalance).await
        else {
            panic!("expected standby");
        };
        deactivate_primary_directly(&fixture, &primary).await?;

        let report = sweeper(&fixture).run_once().await?;
        assert_eq!(report.orphans_promoted, 1);
        let reader = fixture.store().state.reader();
        let adopted = reader.get_instance(&replica)?.unwrap();
        assert!(!adopted.is_replica);
        assert_eq!(adopted.replica_state, Some(ReplicaState::Promoted));
        assert_eq!(
            reader.instance_serving_workload(&primary.workload_id)?.unwrap().id,
            replica
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_late_standby_after_emergency_is_redundant() -> Result<()> {
        let fixture = HandlerFixture::new().await?;
        let primary = fixture.store().register(mock_primary("i-1", "az-1")).await?;
        let now = fixture.base.clock.now_ms();

        // A standby reservation that completes after the emergency path ran.
        let UpdateOutcome::ReplicaReserved(reserved) = fixture
            .store()
            .state
            .write(StateMachineUpdateRequest::new(RequestPayload::ReserveReplica(
                ReserveReplicaRequest {
                    primary: primary.id.clone(),
                    pool: PoolId::new("c5", "az-2"),
                    ttl_ms: TTL,
                    now,
                },
            )))
            .await?
        else {
            panic!("expected reservation");
        };
        fixture
            .store()
            .state
            .write(StateMachineUpdateRequest::new(RequestPayload::ActivateReplica(
                state_store::requests::ActivateReplicaRequest {
                    replica: reserved.id.clone(),
                    instance_id: "i-late".into(),
                    now,
                },
            )))
            .await?;
        // Force the emergency path by claiming first, then completing it.
        fixture
            .store()
            .state
            .write(StateMachineUpdateRequest::new(RequestPayload::ClaimTermination(
                ClaimTerminationRequest {
                    primary: primary.id.clone(),
                    notice_at: now,
                    reason: "termination".to_string(),
                    now,
                },
            )))
            .await?;
        let replacement = ProtectedInstance::new_replacement(
            &primary,
            PoolId::new("c5", "az-3"),
            "i-emergency".into(),
            now,
        );
        let interval = data_model::DowntimeInterval::new(
            &primary,
            now,
            now + 30 * MS_PER_SECOND,
            data_model::DowntimeCause::NoReplica,
            Default::default(),
        );
        fixture
            .store()
            .state
            .write(StateMachineUpdateRequest::new(
                RequestPayload::CompleteEmergencyReplacement(
                    state_store::requests::EmergencyReplacementRequest {
                        primary: primary.id.clone(),
                        replacement,
                        interval,
                        reason: "termination".to_string(),
                        now,
                    },
                ),
            ))
            .await?;

        let report = sweeper(&fixture).run_once().await?;
        assert_eq!(report.redundant_reclaimed, 1);
        assert_eq!(report.orphans_promoted, 0);
        let stored = fixture
            .store()
            .state
            .reader()
            .get_instance(&reserved.id)?
            .unwrap();
        assert_eq!(stored.replica_state, Some(ReplicaState::ExpiredCleaned));
        assert_eq!(stored.metadata.deactivation_cause, Some(DeactivationCause::Redundant));
        Ok(())
    }

    #[tokio::test]
    async fn test_orphan_with_other_server_is_flagged_once() -> Result<()> {
        let fixture = HandlerFixture::new().await?;
        let primary = fixture.store().register(mock_primary("i-1", "az-1")).await?;
        let NoticeOutcome::ReplicaProvisioned { replica, .. } =
            fixture.notice("i-1", NoticeKind::Rebalance).await
        else {
            panic!("expected standby");
        };
        deactivate_primary_directly(&fixture, &primary).await?;
        // Another primary registered for the same workload.
        let mut other = mock_primary("i-2", "az-3");
        other.workload_id = primary.workload_id.clone();
        fixture.store().register(other).await?;

        let sweeper = sweeper(&fixture);
        let report = sweeper.run_once().await?;
        assert_eq!(report.anomalies_flagged, 1);
        assert_eq!(report.orphans_promoted, 0);
        let report = sweeper.run_once().await?;
        assert_eq!(report.anomalies_flagged, 0);

        let reader = fixture.store().state.reader();
        let anomalies = reader.anomalies(None)?;
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].kind, AnomalyKind::OrphanedReplica);
        assert!(reader.get_instance(&replica)?.unwrap().is_active);
        Ok(())
    }

    #[tokio::test]
    async fn test_stale_reservation_and_stuck_claim() -> Result<()> {
        let fixture = HandlerFixture::new().await?;
        let primary = fixture.store().register(mock_primary("i-1", "az-1")).await?;
        let other = fixture.store().register(mock_primary("i-2", "az-1")).await?;
        let now = fixture.base.clock.now_ms();
        let UpdateOutcome::ReplicaReserved(reserved) = fixture
            .store()
            .state
            .write(StateMachineUpdateRequest::new(RequestPayload::ReserveReplica(
                ReserveReplicaRequest {
                    primary: primary.id.clone(),
                    pool: PoolId::new("c5", "az-2"),
                    ttl_ms: TTL,
                    now,
                },
            )))
            .await?
        else {
            panic!("expected reservation");
        };
        fixture
            .store()
            .state
            .write(StateMachineUpdateRequest::new(RequestPayload::ClaimTermination(
                ClaimTerminationRequest {
                    primary: other.id.clone(),
                    notice_at: now,
                    reason: "termination".to_string(),
                    now,
                },
            )))
            .await?;

        let sweeper = sweeper(&fixture);
        let report = sweeper.run_once().await?;
        assert_eq!(report.stale_reservations_released, 0);
        assert_eq!(report.anomalies_flagged, 0);

        fixture.base.clock.advance(MS_PER_HOUR);
        let report = sweeper.run_once().await?;
        assert_eq!(report.stale_reservations_released, 1);
        assert_eq!(report.anomalies_flagged, 2);

        let reader = fixture.store().state.reader();
        let stale = reader.get_instance(&reserved.id)?.unwrap();
        assert_eq!(stale.replica_state, Some(ReplicaState::ExpiredCleaned));
        assert!(!stale.is_active);
        assert_eq!(reader.get_instance(&primary.id)?.unwrap().current_replica, None);
        let kinds = reader
            .anomalies(None)?
            .into_iter()
            .map(|a| a.kind)
            .collect::<HashSet<_>>();
        assert!(kinds.contains(&AnomalyKind::StaleProvisioning));
        assert!(kinds.contains(&AnomalyKind::StuckTerminationClaim));
        Ok(())
    }

    #[tokio::test]
    async fn test_trigger_runs_background_sweep() -> Result<()> {
        let fixture = HandlerFixture::new().await?;
        let sweeper = Arc::new(sweeper(&fixture));
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let background = {
            let sweeper = sweeper.clone();
            tokio::spawn(async move { sweeper.start(shutdown_rx).await })
        };

        sweeper.trigger();
        safety_net_utils::retry::retry_until_deadline(
            std::time::Duration::from_secs(5),
            std::time::Duration::from_millis(10),
            "sweep report",
            || async {
                fixture
                    .store()
                    .state
                    .reader()
                    .latest_sweep_report()?
                    .ok_or(anyhow!("no sweep yet"))
            },
        )
        .await?;
        shutdown_tx.send(())?;
        background.await?;
        Ok(())
    }
}
