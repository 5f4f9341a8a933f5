#[cfg(test)]
mod tests {
    use anyhow::Result;
    use data_model::{
        Anomaly,
        AnomalyKind,
        NoticeKind,
        ReplicaState,
        SweepReport,
    };
    use processor::{
        downtime_ledger::DowntimeReport,
        interruption_handler::NoticeOutcome,
        pool_risk::PoolStatus,
        provider::ProviderError,
    };
    use reqwest::StatusCode;
    use safety_net_utils::{MS_PER_HOUR, MS_PER_SECOND};

    use crate::{
        http_objects::{InstanceView, NoticeAccepted, StatsResponse, WorkloadView},
        testing::{TestService, TEST_ACCOUNT},
    };

    #[tokio::test]
    async fn test_standby_is_promoted_on_termination() -> Result<()> {
        let test_srv = TestService::new().await?;
        let primary = test_srv.register("i-A", "az-1").await?;

        let outcome = test_srv.notice("i-A", NoticeKind::Rebalance).await?;
        let NoticeOutcome::ReplicaProvisioned {
            replica,
            pool,
            degraded,
        } = outcome
        else {
            panic!("expected a standby, got {:?}", outcome);
        };
        assert!(!degraded);
        assert_ne!(pool.zone, "az-1");

        // Re-delivery of the same rebalance does not launch a second standby.
        assert_eq!(
            test_srv.notice("i-A", NoticeKind::Rebalance).await?,
            NoticeOutcome::ReplicaAlreadyActive {
                replica: replica.clone()
            }
        );
        assert_eq!(test_srv.provider.launches().await.len(), 1);

        test_srv.clock.advance(20 * 60 * MS_PER_SECOND);
        let outcome = test_srv.notice("i-A", NoticeKind::Termination).await?;
        assert_eq!(
            outcome,
            NoticeOutcome::Promoted {
                old_primary: primary.id.clone(),
                new_primary: replica.clone(),
            }
        );

        let workload: WorkloadView = test_srv
            .get(&format!("/v1/workloads/{}", primary.workload_id))
            .await?;
        assert_eq!(workload.serving, Some(replica.clone()));
        let promoted = workload.instance.unwrap();
        assert!(!promoted.is_replica);
        assert_eq!(promoted.replica_state, Some(ReplicaState::Promoted));
        assert_eq!(promoted.metadata.replaces, Some(primary.id.clone()));

        let downtime: DowntimeReport = test_srv
            .get(&format!("/v1/accounts/{}/downtime", TEST_ACCOUNT))
            .await?;
        assert_eq!(downtime.count, 0);

        // The old primary is gone, a late duplicate changes nothing.
        assert!(matches!(
            test_srv.notice("i-A", NoticeKind::Termination).await?,
            NoticeOutcome::Discarded { .. }
        ));

        let stats: StatsResponse = test_srv.get("/v1/stats").await?;
        assert_eq!(stats.stats.replicas_provisioned, 1);
        assert_eq!(stats.stats.promotions, 1);
        assert_eq!(stats.observed_false_alarm_ratio, Some(0.0));
        assert_eq!(stats.configured_false_alarm_ratio, 0.4);

        let status: PoolStatus = test_srv.get("/v1/pools/c5:az-1").await?;
        assert!(status.poisoned);
        assert_eq!(status.events_in_window, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_unused_standby_is_reclaimed_after_ttl() -> Result<()> {
        let test_srv = TestService::new().await?;
        test_srv.register("i-B", "az-1").await?;

        let outcome = test_srv.notice("i-B", NoticeKind::Rebalance).await?;
        assert!(matches!(outcome, NoticeOutcome::ReplicaProvisioned { .. }));
        let view: InstanceView = test_srv.get("/v1/instances/i-B").await?;
        assert_eq!(view.replicas.len(), 1);
        let standby_provider_id = view.replicas[0].instance_id.clone().unwrap();
        assert_eq!(test_srv.provider.running().await, vec![standby_provider_id.clone()]);

        // Not expired yet: the sweep leaves it alone.
        let report: SweepReport = test_srv.post("/v1/sweeps", &()).await?;
        assert_eq!(report.reclaimed_false_alarms, 0);

        test_srv.clock.advance(6 * MS_PER_HOUR + MS_PER_SECOND);
        let report: SweepReport = test_srv.post("/v1/sweeps", &()).await?;
        assert_eq!(report.reclaimed_false_alarms, 1);
        assert!((report.cost_avoided_usd - 0.6).abs() < 1e-9);
        assert!(report.failures.is_empty());
        assert_eq!(
            test_srv.provider.terminations().await,
            vec![standby_provider_id.clone()]
        );
        assert!(test_srv.provider.running().await.is_empty());

        let view: InstanceView = test_srv.get("/v1/instances/i-B").await?;
        assert!(view.instance.is_active);
        assert_eq!(
            view.replicas[0].replica_state,
            Some(ReplicaState::ExpiredCleaned)
        );
        assert!(!view.replicas[0].is_active);

        let latest: SweepReport = test_srv.get("/v1/sweeps/latest").await?;
        assert_eq!(latest.reclaimed_false_alarms, 1);

        // A second pass finds nothing left to do.
        let report: SweepReport = test_srv.post("/v1/sweeps", &()).await?;
        assert_eq!(report.reclaimed_false_alarms, 0);
        assert_eq!(test_srv.provider.terminations().await.len(), 1);

        let stats: StatsResponse = test_srv.get("/v1/stats").await?;
        assert_eq!(stats.stats.false_alarm_reclaims, 1);
        assert!((stats.stats.cost_avoided_usd - 0.6).abs() < 1e-9);
        assert_eq!(stats.observed_false_alarm_ratio, Some(1.0));
        Ok(())
    }

    #[tokio::test]
    async fn test_termination_without_standby_records_downtime() -> Result<()> {
        let test_srv = TestService::new().await?;
        let primary = test_srv.register("i-C", "az-1").await?;
        test_srv.provider.set_pending_polls(2).await;

        let outcome = test_srv.notice("i-C", NoticeKind::Termination).await?;
        let NoticeOutcome::EmergencyReplaced {
            replacement, pool, ..
        } = outcome
        else {
            panic!("expected an emergency replacement, got {:?}", outcome);
        };
        assert_ne!(pool.zone, "az-1");

        let downtime: DowntimeReport = test_srv
            .get(&format!("/v1/accounts/{}/downtime", TEST_ACCOUNT))
            .await?;
        assert_eq!(downtime.count, 1);
        assert_eq!(downtime.intervals[0].primary, primary.id);
        assert_eq!(
            downtime.intervals[0].details.replacement,
            Some(replacement.clone())
        );
        assert!(downtime.by_workload.contains_key(&primary.workload_id));

        let workload: WorkloadView = test_srv
            .get(&format!("/v1/workloads/{}", primary.workload_id))
            .await?;
        assert_eq!(workload.serving, Some(replacement));

        assert!(matches!(
            test_srv.notice("i-C", NoticeKind::Termination).await?,
            NoticeOutcome::Discarded { .. }
        ));
        assert_eq!(test_srv.provider.launches().await.len(), 1);

        let stats: StatsResponse = test_srv.get("/v1/stats").await?;
        assert_eq!(stats.stats.emergency_replacements, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_emergency_is_flagged_for_review() -> Result<()> {
        let test_srv = TestService::new().await?;
        test_srv.register("i-D", "az-1").await?;
        test_srv
            .provider
            .fail_next_launches([ProviderError::Unavailable("gateway down".to_string())])
            .await;

        let outcome = test_srv.notice("i-D", NoticeKind::Termination).await?;
        assert!(matches!(outcome, NoticeOutcome::EmergencyFailed { .. }));

        let anomalies: Vec<Anomaly> = test_srv.get("/v1/anomalies?limit=10").await?;
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].kind, AnomalyKind::EmergencyLaunchFailed);

        let downtime: DowntimeReport = test_srv
            .get(&format!("/v1/accounts/{}/downtime", TEST_ACCOUNT))
            .await?;
        assert_eq!(downtime.count, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_rebalance_delivery() -> Result<()> {
        let test_srv = TestService::new().await?;
        test_srv.register("i-E", "az-1").await?;

        let notice = test_srv.notice_for("i-E", NoticeKind::Rebalance);
        let deliveries = (0..8).map(|_| {
            test_srv.post::<_, NoticeOutcome>("/v1/notices/sync", &notice)
        });
        let outcomes = futures::future::try_join_all(deliveries).await?;

        let provisioned = outcomes
            .iter()
            .filter(|o| matches!(o, NoticeOutcome::ReplicaProvisioned { .. }))
            .count();
        assert_eq!(provisioned, 1);
        assert!(outcomes.iter().all(|o| matches!(
            o,
            NoticeOutcome::ReplicaProvisioned { .. } | NoticeOutcome::ReplicaAlreadyActive { .. }
        )));
        assert_eq!(test_srv.provider.launches().await.len(), 1);

        let view: InstanceView = test_srv.get("/v1/instances/i-E").await?;
        assert_eq!(view.replicas.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_queued_notices_are_processed_by_workers() -> Result<()> {
        let test_srv = TestService::new().await?;
        for id in ["i-F1", "i-F2", "i-F3"] {
            test_srv.register(id, "az-1").await?;
        }
        for id in ["i-F1", "i-F2", "i-F3"] {
            let accepted: NoticeAccepted = test_srv
                .post("/v1/notices", &test_srv.notice_for(id, NoticeKind::Rebalance))
                .await?;
            assert!(accepted.queued >= 1);
        }
        test_srv.process_notices().await;

        for id in ["i-F1", "i-F2", "i-F3"] {
            let view: InstanceView = test_srv.get(&format!("/v1/instances/{}", id)).await?;
            assert_eq!(view.replicas.len(), 1, "{} has no standby", id);
            assert_eq!(view.replicas[0].replica_state, Some(ReplicaState::Active));
        }
        assert_eq!(test_srv.provider.running().await.len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_http_errors() -> Result<()> {
        let test_srv = TestService::new().await?;
        assert_eq!(
            test_srv.get_status("/v1/instances/i-missing").await?,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            test_srv.get_status("/v1/workloads/wl-missing").await?,
            StatusCode::NOT_FOUND
        );
        assert_eq!(test_srv.get_status("/v1/pools/bogus").await?, StatusCode::BAD_REQUEST);
        assert_eq!(
            test_srv
                .get_status(&format!("/v1/accounts/{}/downtime?from=10&to=1", TEST_ACCOUNT))
                .await?,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            test_srv.get_status("/v1/sweeps/latest").await?,
            StatusCode::NOT_FOUND
        );

        // Unknown zone with no region cannot be placed in the catalog.
        let mut unknown_zone = test_srv.notice_for("i-G", NoticeKind::Rebalance);
        unknown_zone.availability_zone = "az-9".to_string();
        assert_eq!(
            test_srv
                .post_status(
                    "/v1/instances",
                    &serde_json::json!({
                        "instance_id": "i-G",
                        "account_id": TEST_ACCOUNT,
                        "instance_type": "c5.xlarge",
                        "availability_zone": "az-9",
                    }),
                )
                .await?,
            StatusCode::BAD_REQUEST
        );

        // Notices for instances nobody registered are dropped, not errors.
        assert!(matches!(
            test_srv.post::<_, NoticeOutcome>("/v1/notices/sync", &unknown_zone).await?,
            NoticeOutcome::Discarded { .. }
        ));
        Ok(())
    }
}
