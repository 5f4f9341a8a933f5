use anyhow::{anyhow, Result};
use data_model::{
    Anomaly,
    DeactivationCause,
    InstanceId,
    PoolRiskEvent,
    ProtectedInstance,
    ProviderInstanceId,
    ReclaimCause,
    ReplicaState,
    SafetyNetStats,
    StateMachineMetadata,
    SweepReport,
};
use strum::AsRefStr;
use tracing::{debug, info, warn};

use crate::{
    driver::{Reader, Transaction, Writer},
    requests::{
        AbandonReplicaRequest,
        ActivateReplicaRequest,
        AdoptOrphanRequest,
        ClaimTerminationRequest,
        Conflict,
        EmergencyReplacementRequest,
        FlagForReviewRequest,
        MarkReplicaTerminatedRequest,
        PromoteReplicaRequest,
        PromotionRecord,
        ReclaimReplicaRequest,
        ReleaseTerminationRequest,
        ReserveReplicaRequest,
        UpdateOutcome,
        UpsertInstanceRequest,
    },
    serializer::{JsonEncode, JsonEncoder},
};

pub const SM_META_KEY: &[u8] = b"sm_meta";

#[derive(AsRefStr, strum::Display, strum::EnumIter)]
pub enum SafetyNetColumns {
    StateMachineMetadata, //  StateMachineMetadata
    Instances,            //  InstanceId -> ProtectedInstance
    ProviderInstanceIds,  //  ProviderInstanceId -> InstanceId
    Workloads,            //  WorkloadId -> InstanceId serving it

    /// Pool instability events, append only.
    ///
    /// Keys:
    /// - `<Pool>|<Ts>|<Kind>|<ProviderInstanceId> -> PoolRiskEvent`
    PoolRiskEvents,
    /// Keys:
    /// - `<Account>|<Start>|<Id> -> DowntimeInterval`
    DowntimeIntervals,
    Anomalies,    //  DetectedAt|Id -> Anomaly
    SweepReports, //  StartedAt -> SweepReport

    Stats, // Stats
}

fn conflict(conflict: Conflict) -> Result<UpdateOutcome> {
    Ok(UpdateOutcome::Conflict(conflict))
}

fn decode_instance(bytes: Option<Vec<u8>>) -> Result<Option<ProtectedInstance>> {
    bytes.map(|b| JsonEncoder::decode(&b)).transpose()
}

pub(crate) fn get_instance(txn: &Transaction, id: &InstanceId) -> Result<Option<ProtectedInstance>> {
    decode_instance(txn.get(
        SafetyNetColumns::Instances,
        ProtectedInstance::key_from(id),
    )?)
}

pub(crate) fn get_instance_for_update(
    txn: &Transaction,
    id: &InstanceId,
) -> Result<Option<ProtectedInstance>> {
    decode_instance(txn.get_for_update(
        SafetyNetColumns::Instances,
        ProtectedInstance::key_from(id),
    )?)
}

/// Writes the instance guarded by the version it was read at. Fresh rows
/// carry version 0 and must not exist yet.
fn put_instance(txn: &Transaction, instance: &mut ProtectedInstance) -> Result<()> {
    instance.check_invariants()?;
    let expected = match instance.version {
        0 => None,
        v => Some(v),
    };
    let key = instance.key();
    txn.compare_and_swap(SafetyNetColumns::Instances, key, expected, instance)?;
    Ok(())
}

fn put_provider_index(
    txn: &Transaction,
    instance_id: &ProviderInstanceId,
    id: &InstanceId,
) -> Result<()> {
    txn.put(
        SafetyNetColumns::ProviderInstanceIds,
        instance_id.get(),
        JsonEncoder::encode(id)?,
    )?;
    Ok(())
}

fn lookup_provider_index_for_update(
    txn: &Transaction,
    instance_id: &ProviderInstanceId,
) -> Result<Option<InstanceId>> {
    txn.get_for_update(SafetyNetColumns::ProviderInstanceIds, instance_id.get())?
        .map(|b| JsonEncoder::decode(&b))
        .transpose()
}

fn workload_primary_for_update(txn: &Transaction, workload_id: &str) -> Result<Option<InstanceId>> {
    txn.get_for_update(SafetyNetColumns::Workloads, workload_id)?
        .map(|b| JsonEncoder::decode(&b))
        .transpose()
}

fn set_workload_primary(txn: &Transaction, workload_id: &str, id: &InstanceId) -> Result<()> {
    txn.put(SafetyNetColumns::Workloads, workload_id, JsonEncoder::encode(id)?)?;
    debug!(workload_id, instance = id.get(), "workload repointed");
    Ok(())
}

fn update_stats(txn: &Transaction, f: impl FnOnce(&mut SafetyNetStats)) -> Result<()> {
    let mut stats: SafetyNetStats = txn
        .get_for_update(SafetyNetColumns::Stats, SafetyNetStats::KEY)?
        .map(|b| JsonEncoder::decode(&b))
        .transpose()?
        .unwrap_or_default();
    f(&mut stats);
    txn.put(
        SafetyNetColumns::Stats,
        SafetyNetStats::KEY,
        JsonEncoder::encode(&stats)?,
    )?;
    Ok(())
}

fn insert_anomaly(txn: &Transaction, anomaly: &Anomaly) -> Result<()> {
    txn.put(
        SafetyNetColumns::Anomalies,
        anomaly.key(),
        JsonEncoder::encode(anomaly)?,
    )?;
    warn!(
        kind = anomaly.kind.as_ref(),
        instance = anomaly.instance.as_ref().map(|i| i.to_string()),
        pool = anomaly.pool.as_ref().map(|p| p.to_string()),
        details = anomaly.details,
        "anomaly flagged for review"
    );
    Ok(())
}

pub(crate) fn upsert_instance(
    txn: &Transaction,
    req: &UpsertInstanceRequest,
    now: u64,
) -> Result<UpdateOutcome> {
    let instance = &req.instance;
    if instance.is_replica {
        return Err(anyhow!(
            "standby {} cannot be registered through inventory",
            instance.id
        ));
    }
    let provider_id = instance
        .instance_id
        .as_ref()
        .ok_or(anyhow!("registered instance {} has no provider id", instance.id))?;

    if let Some(id) = lookup_provider_index_for_update(txn, provider_id)? {
        let Some(mut existing) = get_instance_for_update(txn, &id)? else {
            return conflict(Conflict::NotFound);
        };
        if !existing.is_active {
            return conflict(Conflict::NotEligible);
        }
        existing.account_id = instance.account_id.clone();
        existing.instance_type = instance.instance_type.clone();
        existing.pool = instance.pool.clone();
        existing.region = instance.region.clone();
        existing.metadata.labels = instance.metadata.labels.clone();
        if instance.metadata.risk_model_version.is_some() {
            existing.metadata.risk_model_version = instance.metadata.risk_model_version.clone();
        }
        existing.updated_at = now;
        put_instance(txn, &mut existing)?;
        return Ok(UpdateOutcome::Upserted(existing));
    }

    let mut fresh = instance.clone();
    fresh.version = 0;
    put_instance(txn, &mut fresh)?;
    put_provider_index(txn, provider_id, &fresh.id)?;

    let serving = match workload_primary_for_update(txn, &fresh.workload_id)? {
        Some(id) => get_instance(txn, &id)?.filter(|i| i.is_active),
        None => None,
    };
    if serving.is_none() {
        set_workload_primary(txn, &fresh.workload_id, &fresh.id)?;
    }
    info!(
        instance_id = provider_id.get(),
        pool = fresh.pool.to_string(),
        account = fresh.account_id,
        "registered protected instance"
    );
    Ok(UpdateOutcome::Upserted(fresh))
}

pub(crate) fn reserve_replica(txn: &Transaction, req: &ReserveReplicaRequest) -> Result<UpdateOutcome> {
    let Some(mut primary) = get_instance_for_update(txn, &req.primary)? else {
        return conflict(Conflict::NotFound);
    };
    if !primary.is_active || primary.is_replica || primary.termination_notice_at.is_some() {
        return conflict(Conflict::NotEligible);
    }

    if let Some(current) = primary.current_replica.clone() {
        if let Some(existing) = get_instance_for_update(txn, &current)? {
            if existing.is_outstanding_replica(req.now) {
                return conflict(Conflict::AlreadyHasActiveReplica(existing.id));
            }
        }
    }

    let mut replica = ProtectedInstance::new_replica(
        &primary,
        req.pool.clone(),
        req.now + req.ttl_ms,
        req.now,
    );
    put_instance(txn, &mut replica)?;

    primary.current_replica = Some(replica.id.clone());
    primary.updated_at = req.now;
    put_instance(txn, &mut primary)?;

    Ok(UpdateOutcome::ReplicaReserved(replica))
}

pub(crate) fn activate_replica(
    txn: &Transaction,
    req: &ActivateReplicaRequest,
) -> Result<UpdateOutcome> {
    let Some(mut replica) = get_instance_for_update(txn, &req.replica)? else {
        return conflict(Conflict::NotFound);
    };
    if !replica.is_active || replica.replica_state != Some(ReplicaState::Provisioning) {
        return conflict(Conflict::StateChanged);
    }
    replica.instance_id = Some(req.instance_id.clone());
    replica.replica_state = Some(ReplicaState::Active);
    replica.updated_at = req.now;
    put_instance(txn, &mut replica)?;
    put_provider_index(txn, &req.instance_id, &replica.id)?;
    update_stats(txn, |s| s.replicas_provisioned += 1)?;
    Ok(UpdateOutcome::ReplicaActivated(replica))
}

pub(crate) fn abandon_replica(txn: &Transaction, req: &AbandonReplicaRequest) -> Result<UpdateOutcome> {
    let Some(peek) = get_instance(txn, &req.replica)? else {
        return conflict(Conflict::NotFound);
    };
    let primary = match &peek.replica_of {
        Some(primary_id) => get_instance_for_update(txn, primary_id)?,
        None => None,
    };
    let Some(replica) = get_instance_for_update(txn, &req.replica)? else {
        return conflict(Conflict::NotFound);
    };
    if replica.replica_state != Some(ReplicaState::Provisioning) {
        return conflict(Conflict::StateChanged);
    }

    // A reservation that never launched leaves no row behind.
    txn.delete(SafetyNetColumns::Instances, replica.key())?;

    if let Some(mut primary) = primary {
        if primary.current_replica.as_ref() == Some(&replica.id) {
            primary.current_replica = None;
            put_instance(txn, &mut primary)?;
        }
    }
    Ok(UpdateOutcome::Applied)
}

pub(crate) fn promote_replica(txn: &Transaction, req: &PromoteReplicaRequest) -> Result<UpdateOutcome> {
    let Some(mut primary) = get_instance_for_update(txn, &req.primary)? else {
        return conflict(Conflict::NotFound);
    };
    if !primary.is_active || primary.is_replica {
        return conflict(Conflict::NotEligible);
    }
    let Some(replica_id) = primary.current_replica.clone() else {
        return conflict(Conflict::NoReplicaAvailable);
    };
    let Some(mut replica) = get_instance_for_update(txn, &replica_id)? else {
        return conflict(Conflict::NoReplicaAvailable);
    };
    if !replica.is_promotable(req.now) || replica.replica_of.as_ref() != Some(&primary.id) {
        return conflict(Conflict::NoReplicaAvailable);
    }

    replica.promote(&primary.id, req.now);
    put_instance(txn, &mut replica)?;

    primary.deactivate(
        DeactivationCause::ReplacedByReplica,
        Some(req.reason.clone()),
        req.now,
    );
    primary.termination_notice_at = None;
    primary.metadata.replaced_by = Some(replica.id.clone());
    put_instance(txn, &mut primary)?;

    // The workload row is locked so concurrent repoints serialize.
    workload_primary_for_update(txn, &primary.workload_id)?;
    set_workload_primary(txn, &primary.workload_id, &replica.id)?;
    update_stats(txn, |s| s.promotions += 1)?;

    Ok(UpdateOutcome::Promoted(PromotionRecord {
        old_primary: primary,
        new_primary: replica,
    }))
}

pub(crate) fn claim_termination(
    txn: &Transaction,
    req: &ClaimTerminationRequest,
) -> Result<UpdateOutcome> {
    let Some(mut primary) = get_instance_for_update(txn, &req.primary)? else {
        return conflict(Conflict::NotFound);
    };
    if !primary.is_active || primary.is_replica {
        return conflict(Conflict::NotEligible);
    }
    if primary.termination_notice_at.is_some() {
        return conflict(Conflict::AlreadyClaimed);
    }
    primary.termination_notice_at = Some(req.notice_at);
    primary.metadata.termination_reason = Some(req.reason.clone());
    primary.updated_at = req.now;
    put_instance(txn, &mut primary)?;
    Ok(UpdateOutcome::Applied)
}

pub(crate) fn release_termination(
    txn: &Transaction,
    req: &ReleaseTerminationRequest,
) -> Result<UpdateOutcome> {
    let Some(mut primary) = get_instance_for_update(txn, &req.primary)? else {
        return conflict(Conflict::NotFound);
    };
    if primary.termination_notice_at.is_none() {
        return conflict(Conflict::StateChanged);
    }
    primary.termination_notice_at = None;
    primary.updated_at = req.now;
    put_instance(txn, &mut primary)?;
    if let Some(anomaly) = &req.anomaly {
        insert_anomaly(txn, anomaly)?;
    }
    Ok(UpdateOutcome::Applied)
}

pub(crate) fn complete_emergency_replacement(
    txn: &Transaction,
    req: &EmergencyReplacementRequest,
) -> Result<UpdateOutcome> {
    let Some(mut primary) = get_instance_for_update(txn, &req.primary)? else {
        return conflict(Conflict::NotFound);
    };
    if !primary.is_active || primary.termination_notice_at.is_none() {
        return conflict(Conflict::StateChanged);
    }

    let mut replacement = req.replacement.clone();
    replacement.version = 0;
    let provider_id = replacement
        .instance_id
        .clone()
        .ok_or(anyhow!("emergency replacement {} has no provider id", replacement.id))?;
    put_instance(txn, &mut replacement)?;
    put_provider_index(txn, &provider_id, &replacement.id)?;

    primary.deactivate(
        DeactivationCause::NoReplica,
        Some(req.reason.clone()),
        req.now,
    );
    primary.termination_notice_at = None;
    primary.metadata.replaced_by = Some(replacement.id.clone());
    put_instance(txn, &mut primary)?;

    workload_primary_for_update(txn, &primary.workload_id)?;
    set_workload_primary(txn, &primary.workload_id, &replacement.id)?;

    txn.put(
        SafetyNetColumns::DowntimeIntervals,
        req.interval.key(),
        JsonEncoder::encode(&req.interval)?,
    )?;
    update_stats(txn, |s| s.emergency_replacements += 1)?;
    Ok(UpdateOutcome::Replaced(replacement))
}

pub(crate) fn reclaim_replica(txn: &Transaction, req: &ReclaimReplicaRequest) -> Result<UpdateOutcome> {
    let Some(peek) = get_instance(txn, &req.replica)? else {
        return conflict(Conflict::NotFound);
    };
    // Lock order is primary then standby, same as promotion.
    let mut primary = match &peek.replica_of {
        Some(primary_id) => get_instance_for_update(txn, primary_id)?,
        None => None,
    };
    let Some(mut replica) = get_instance_for_update(txn, &req.replica)? else {
        return conflict(Conflict::NotFound);
    };
    if replica.version != req.expected_version ||
        !replica.is_replica ||
        !replica.is_active ||
        !replica.replica_state.is_some_and(|s| s.is_outstanding())
    {
        return conflict(Conflict::StateChanged);
    }

    let primary_active = primary.as_ref().is_some_and(|p| p.is_active);
    let eligible = match req.cause {
        ReclaimCause::FalseAlarm => {
            replica.replica_state == Some(ReplicaState::Active) &&
                replica.is_expired(req.now) &&
                primary_active
        }
        ReclaimCause::Redundant => !primary_active,
        ReclaimCause::StaleProvisioning => {
            replica.replica_state == Some(ReplicaState::Provisioning)
        }
        // The provider is taking the standby back, expired or not.
        ReclaimCause::Interrupted => true,
    };
    if !eligible {
        return conflict(Conflict::StateChanged);
    }

    replica.replica_state = Some(ReplicaState::ExpiredCleaned);
    replica.termination_pending = replica.instance_id.is_some();
    replica.deactivate(req.cause.into(), None, req.now);
    put_instance(txn, &mut replica)?;

    if let Some(primary) = primary.as_mut() {
        if primary.current_replica.as_ref() == Some(&replica.id) {
            primary.current_replica = None;
            primary.updated_at = req.now;
            put_instance(txn, primary)?;
        }
    }

    match req.cause {
        ReclaimCause::FalseAlarm => update_stats(txn, |s| {
            s.false_alarm_reclaims += 1;
            s.cost_avoided_usd += req.cost_avoided_usd;
        })?,
        ReclaimCause::Redundant => update_stats(txn, |s| s.redundant_reclaims += 1)?,
        ReclaimCause::StaleProvisioning | ReclaimCause::Interrupted => {}
    }
    Ok(UpdateOutcome::Reclaimed(replica))
}

pub(crate) fn mark_replica_terminated(
    txn: &Transaction,
    req: &MarkReplicaTerminatedRequest,
) -> Result<UpdateOutcome> {
    let Some(mut replica) = get_instance_for_update(txn, &req.replica)? else {
        return conflict(Conflict::NotFound);
    };
    if !replica.termination_pending {
        return Ok(UpdateOutcome::Applied);
    }
    replica.termination_pending = false;
    replica.updated_at = req.now;
    put_instance(txn, &mut replica)?;
    Ok(UpdateOutcome::Applied)
}

pub(crate) fn adopt_orphan(txn: &Transaction, req: &AdoptOrphanRequest) -> Result<UpdateOutcome> {
    let Some(peek) = get_instance(txn, &req.replica)? else {
        return conflict(Conflict::NotFound);
    };
    let Some(primary_id) = peek.replica_of.clone() else {
        return conflict(Conflict::StateChanged);
    };
    let mut primary = get_instance_for_update(txn, &primary_id)?;
    let Some(mut replica) = get_instance_for_update(txn, &req.replica)? else {
        return conflict(Conflict::NotFound);
    };
    if replica.version != req.expected_version ||
        !replica.is_active ||
        replica.replica_state != Some(ReplicaState::Active) ||
        primary.as_ref().is_some_and(|p| p.is_active)
    {
        return conflict(Conflict::StateChanged);
    }

    if let Some(serving) = workload_primary_for_update(txn, &replica.workload_id)? {
        if serving != replica.id && get_instance(txn, &serving)?.is_some_and(|i| i.is_active) {
            return conflict(Conflict::StateChanged);
        }
    }

    replica.promote(&primary_id, req.now);
    put_instance(txn, &mut replica)?;
    set_workload_primary(txn, &replica.workload_id, &replica.id)?;

    if let Some(primary) = primary.as_mut() {
        primary.metadata.replaced_by = Some(replica.id.clone());
        if primary.current_replica.as_ref() == Some(&replica.id) {
            primary.current_replica = None;
        }
        primary.updated_at = req.now;
        put_instance(txn, primary)?;
    }
    update_stats(txn, |s| s.orphans_adopted += 1)?;
    Ok(UpdateOutcome::Adopted(replica))
}

pub(crate) fn flag_for_review(txn: &Transaction, req: &FlagForReviewRequest) -> Result<UpdateOutcome> {
    if let Some(id) = &req.instance {
        let Some(mut instance) = get_instance_for_update(txn, id)? else {
            return conflict(Conflict::NotFound);
        };
        if instance.metadata.flagged_for_review {
            return conflict(Conflict::AlreadyFlagged);
        }
        instance.metadata.flagged_for_review = true;
        put_instance(txn, &mut instance)?;
    }
    insert_anomaly(txn, &req.anomaly)?;
    Ok(UpdateOutcome::Applied)
}

pub(crate) fn record_pool_risk_event(txn: &Transaction, event: &PoolRiskEvent) -> Result<UpdateOutcome> {
    txn.put(
        SafetyNetColumns::PoolRiskEvents,
        event.key(),
        JsonEncoder::encode(event)?,
    )?;
    Ok(UpdateOutcome::Applied)
}

pub(crate) fn save_sweep_report(txn: &Transaction, report: &SweepReport) -> Result<UpdateOutcome> {
    txn.put(
        SafetyNetColumns::SweepReports,
        report.key(),
        JsonEncoder::encode(report)?,
    )?;
    Ok(UpdateOutcome::Applied)
}

pub(crate) fn read_sm_meta<D: Reader>(db: &D) -> Result<Option<StateMachineMetadata>> {
    db.get(SafetyNetColumns::StateMachineMetadata, SM_META_KEY)?
        .map(|b| JsonEncoder::decode(&b))
        .transpose()
}

pub(crate) fn write_sm_meta<D: Writer>(db: &D, meta: &StateMachineMetadata) -> Result<()> {
    db.put(
        SafetyNetColumns::StateMachineMetadata,
        SM_META_KEY,
        JsonEncoder::encode(meta)?,
    )?;
    Ok(())
}
