use data_model::{
    Anomaly,
    DowntimeInterval,
    InstanceId,
    PoolId,
    PoolRiskEvent,
    ProtectedInstance,
    ProviderInstanceId,
    ReclaimCause,
    SweepReport,
};

#[derive(Debug, Clone)]
pub struct StateMachineUpdateRequest {
    pub payload: RequestPayload,
}

impl StateMachineUpdateRequest {
    pub fn new(payload: RequestPayload) -> Self {
        Self { payload }
    }
}

#[derive(Debug, Clone, strum::Display)]
pub enum RequestPayload {
    UpsertInstance(UpsertInstanceRequest),
    ReserveReplica(ReserveReplicaRequest),
    ActivateReplica(ActivateReplicaRequest),
    AbandonReplica(AbandonReplicaRequest),
    PromoteReplica(PromoteReplicaRequest),
    ClaimTermination(ClaimTerminationRequest),
    ReleaseTermination(ReleaseTerminationRequest),
    CompleteEmergencyReplacement(EmergencyReplacementRequest),
    ReclaimReplica(ReclaimReplicaRequest),
    MarkReplicaTerminated(MarkReplicaTerminatedRequest),
    AdoptOrphan(AdoptOrphanRequest),
    FlagForReview(FlagForReviewRequest),
    RecordPoolRiskEvent(PoolRiskEvent),
    SaveSweepReport(SweepReport),
}

/// Register a primary discovered by inventory, or refresh its inventory
/// fields if the provider id is already known.
#[derive(Debug, Clone)]
pub struct UpsertInstanceRequest {
    pub instance: ProtectedInstance,
}

#[derive(Debug, Clone)]
pub struct ReserveReplicaRequest {
    pub primary: InstanceId,
    pub pool: PoolId,
    pub ttl_ms: u64,
    pub now: u64,
}

#[derive(Debug, Clone)]
pub struct ActivateReplicaRequest {
    pub replica: InstanceId,
    pub instance_id: ProviderInstanceId,
    pub now: u64,
}

/// Drop a `Provisioning` reservation whose launch failed.
#[derive(Debug, Clone)]
pub struct AbandonReplicaRequest {
    pub replica: InstanceId,
}

#[derive(Debug, Clone)]
pub struct PromoteReplicaRequest {
    pub primary: InstanceId,
    pub reason: String,
    pub now: u64,
}

#[derive(Debug, Clone)]
pub struct ClaimTerminationRequest {
    pub primary: InstanceId,
    pub notice_at: u64,
    pub reason: String,
    pub now: u64,
}

#[derive(Debug, Clone)]
pub struct ReleaseTerminationRequest {
    pub primary: InstanceId,
    pub anomaly: Option<Anomaly>,
    pub now: u64,
}

#[derive(Debug, Clone)]
pub struct EmergencyReplacementRequest {
    pub primary: InstanceId,
    pub replacement: ProtectedInstance,
    pub interval: DowntimeInterval,
    pub reason: String,
    pub now: u64,
}

#[derive(Debug, Clone)]
pub struct ReclaimReplicaRequest {
    pub replica: InstanceId,
    /// Version observed when the sweeper picked the row; any change since
    /// refuses the reclaim.
    pub expected_version: u64,
    pub cause: ReclaimCause,
    pub cost_avoided_usd: f64,
    pub now: u64,
}

#[derive(Debug, Clone)]
pub struct MarkReplicaTerminatedRequest {
    pub replica: InstanceId,
    pub now: u64,
}

#[derive(Debug, Clone)]
pub struct AdoptOrphanRequest {
    pub replica: InstanceId,
    pub expected_version: u64,
    pub now: u64,
}

/// Record an anomaly. When `instance` is set the instance is flagged and
/// the anomaly is only recorded the first time.
#[derive(Debug, Clone)]
pub struct FlagForReviewRequest {
    pub instance: Option<InstanceId>,
    pub anomaly: Anomaly,
}

/// Old and new primary after a standby took over.
#[derive(Debug, Clone, PartialEq)]
pub struct PromotionRecord {
    pub old_primary: ProtectedInstance,
    pub new_primary: ProtectedInstance,
}

/// Expected refusals of a conditional write. These are outcomes callers
/// branch on, not errors.
#[derive(Debug, Clone, PartialEq, Eq, strum::Display)]
pub enum Conflict {
    NotFound,
    /// The instance is inactive or is itself a standby.
    NotEligible,
    AlreadyHasActiveReplica(InstanceId),
    NoReplicaAvailable,
    AlreadyClaimed,
    AlreadyFlagged,
    /// The row moved on since it was read.
    StateChanged,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    Applied,
    Upserted(ProtectedInstance),
    ReplicaReserved(ProtectedInstance),
    ReplicaActivated(ProtectedInstance),
    Promoted(PromotionRecord),
    Replaced(ProtectedInstance),
    Reclaimed(ProtectedInstance),
    Adopted(ProtectedInstance),
    Conflict(Conflict),
}

impl UpdateOutcome {
    pub fn conflict(&self) -> Option<&Conflict> {
        match self {
            UpdateOutcome::Conflict(conflict) => Some(conflict),
            _ => None,
        }
    }
}
