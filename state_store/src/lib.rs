use std::{fs, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use data_model::StateMachineMetadata;
use driver::{rocksdb::RocksDBDriver, Error as DriverError, Writer};
use metrics::Timer;
use opentelemetry::KeyValue;
use requests::{Conflict, RequestPayload, StateMachineUpdateRequest, UpdateOutcome};
use rocksdb::{ColumnFamilyDescriptor, Options};
use safety_net_utils::retry::{retry_with_backoff, Backoff};
use state_machine::SafetyNetColumns;
use strum::IntoEnumIterator;
use tracing::{debug, info, span};

pub mod driver;
pub mod requests;
pub mod scanner;
pub mod serializer;
pub mod state_machine;
pub mod test_state_store;

pub const DB_VERSION: u64 = 1;

const LOCK_TIMEOUT_MS: i64 = 1_000;
const WRITE_RETRIES: u32 = 5;
const WRITE_BACKOFF: Backoff = Backoff::Exponential {
    initial: Duration::from_millis(10),
    max: Duration::from_millis(500),
};

pub struct SafetyNetState {
    pub db: Arc<RocksDBDriver>,
    pub db_version: u64,
    pub metrics: Arc<metrics::state_store::Metrics>,
}

impl SafetyNetState {
    pub async fn new(path: PathBuf) -> Result<Arc<Self>> {
        fs::create_dir_all(path.clone())
            .map_err(|e| anyhow!("failed to create state store dir: {}", e))?;

        info!("opening state store database at {}", path.display());
        let column_families = SafetyNetColumns::iter()
            .map(|cf| ColumnFamilyDescriptor::new(cf.to_string(), Options::default()))
            .collect::<Vec<_>>();
        let db = driver::open_database(driver::ConnectionOptions::RocksDB(
            driver::rocksdb::Options {
                path,
                column_families,
                lock_timeout_ms: LOCK_TIMEOUT_MS,
            },
        ))?;

        let sm_meta = match state_machine::read_sm_meta(&db)? {
            Some(meta) => meta,
            None => {
                let meta = StateMachineMetadata {
                    db_version: DB_VERSION,
                };
                state_machine::write_sm_meta(&db, &meta)?;
                meta
            }
        };
        if sm_meta.db_version > DB_VERSION {
            return Err(anyhow!(
                "state store was written by a newer version: db version {}, supported {}",
                sm_meta.db_version,
                DB_VERSION
            ));
        }
        info!(db_version = sm_meta.db_version, "db version discovered");

        Ok(Arc::new(Self {
            db: Arc::new(db),
            db_version: sm_meta.db_version,
            metrics: Arc::new(metrics::state_store::Metrics::new()),
        }))
    }

    /// Apply one update in a single transaction. Busy or timed out row
    /// locks are retried with backoff; logical refusals come back as
    /// [`UpdateOutcome::Conflict`].
    #[tracing::instrument(
        skip(self, request),
        fields(
            request_type = request.payload.to_string(),
        )
    )]
    pub async fn write(&self, request: StateMachineUpdateRequest) -> Result<UpdateOutcome> {
        let timer_kv = &[KeyValue::new("request", request.payload.to_string())];
        let _timer = Timer::start_with_labels(&self.metrics.state_write, timer_kv);

        let outcome = retry_with_backoff(
            WRITE_RETRIES,
            WRITE_BACKOFF,
            "state machine write",
            || std::future::ready(self.apply(&request.payload)),
            |err: &anyhow::Error| {
                let retryable = DriverError::is_retryable_anyhow(err);
                if retryable {
                    self.metrics.write_retries.add(1, timer_kv);
                }
                retryable
            },
        )
        .await?;

        if let Some(conflict) = outcome.conflict() {
            debug!(%conflict, "state machine write refused");
            self.metrics.write_conflicts.add(
                1,
                &[
                    KeyValue::new("request", request.payload.to_string()),
                    KeyValue::new("conflict", conflict.to_string()),
                ],
            );
        }
        Ok(outcome)
    }

    fn apply(&self, payload: &RequestPayload) -> Result<UpdateOutcome> {
        let txn = self.db.transaction();
        let result = match payload {
            RequestPayload::UpsertInstance(req) => {
                state_machine::upsert_instance(&txn, req, req.instance.updated_at)
            }
            RequestPayload::ReserveReplica(req) => {
                let _enter = span!(
                    tracing::Level::INFO,
                    "reserve_replica",
                    primary = req.primary.get(),
                    pool = req.pool.to_string(),
                );
                state_machine::reserve_replica(&txn, req)
            }
            RequestPayload::ActivateReplica(req) => state_machine::activate_replica(&txn, req),
            RequestPayload::AbandonReplica(req) => state_machine::abandon_replica(&txn, req),
            RequestPayload::PromoteReplica(req) => {
                let _enter = span!(
                    tracing::Level::INFO,
                    "promote_replica",
                    primary = req.primary.get(),
                );
                state_machine::promote_replica(&txn, req)
            }
            RequestPayload::ClaimTermination(req) => state_machine::claim_termination(&txn, req),
            RequestPayload::ReleaseTermination(req) => {
                state_machine::release_termination(&txn, req)
            }
            RequestPayload::CompleteEmergencyReplacement(req) => {
                state_machine::complete_emergency_replacement(&txn, req)
            }
            RequestPayload::ReclaimReplica(req) => state_machine::reclaim_replica(&txn, req),
            RequestPayload::MarkReplicaTerminated(req) => {
                state_machine::mark_replica_terminated(&txn, req)
            }
            RequestPayload::AdoptOrphan(req) => state_machine::adopt_orphan(&txn, req),
            RequestPayload::FlagForReview(req) => state_machine::flag_for_review(&txn, req),
            RequestPayload::RecordPoolRiskEvent(event) => {
                state_machine::record_pool_risk_event(&txn, event)
            }
            RequestPayload::SaveSweepReport(report) => {
                state_machine::save_sweep_report(&txn, report)
            }
        };

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => {
                // The transaction is dropped without commit, rolling back
                // anything written so far.
                if let Some(DriverError::VersionMismatch { table, key, .. }) =
                    err.downcast_ref::<DriverError>()
                {
                    debug!(table, key, "version mismatch inside transaction");
                    return Ok(UpdateOutcome::Conflict(Conflict::StateChanged));
                }
                return Err(err);
            }
        };

        if let UpdateOutcome::Conflict(_) = outcome {
            return Ok(outcome);
        }
        txn.commit()?;
        Ok(outcome)
    }

    pub fn reader(&self) -> scanner::StateReader {
        scanner::StateReader::new(self.db.clone())
    }
}
