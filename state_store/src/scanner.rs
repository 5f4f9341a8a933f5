use std::sync::Arc;

use anyhow::Result;
use data_model::{
    Anomaly,
    DowntimeInterval,
    InstanceId,
    PoolId,
    PoolRiskEvent,
    ProtectedInstance,
    ProviderInstanceId,
    SafetyNetStats,
    SweepReport,
};
use safety_net_utils::sortable_ts;
use serde::de::DeserializeOwned;

use super::state_machine::SafetyNetColumns;
use crate::{
    driver::{prefix_upper_bound, rocksdb::RocksDBDriver, RangeOptions, RangeOptionsBuilder, Reader},
    serializer::{JsonEncode, JsonEncoder},
};

/// Read-only view over the committed state. Every call reads the latest
/// committed data; nothing is cached.
pub struct StateReader {
    db: Arc<RocksDBDriver>,
}

impl StateReader {
    pub fn new(db: Arc<RocksDBDriver>) -> Self {
        Self { db }
    }

    pub fn get_from_cf<K, V>(&self, column: &SafetyNetColumns, key: K) -> Result<Option<V>>
    where
        K: AsRef<[u8]>,
        V: DeserializeOwned,
    {
        self.db
            .get(column, key)?
            .map(|bytes| JsonEncoder::decode(&bytes))
            .transpose()
    }

    pub fn get_rows_from_cf<V>(&self, column: SafetyNetColumns, options: RangeOptions) -> Result<Vec<V>>
    where
        V: DeserializeOwned,
    {
        self.db
            .range(column, options)?
            .iter()
            .map(|(_, value)| JsonEncoder::decode(value))
            .collect()
    }

    pub fn get_all_rows_from_cf<V>(&self, column: SafetyNetColumns) -> Result<Vec<(String, V)>>
    where
        V: DeserializeOwned,
    {
        self.db
            .range(column, RangeOptions::default())?
            .iter()
            .map(|(key, value)| {
                let key = String::from_utf8_lossy(key).to_string();
                JsonEncoder::decode(value).map(|v| (key, v))
            })
            .collect()
    }

    pub fn get_instance(&self, id: &InstanceId) -> Result<Option<ProtectedInstance>> {
        self.get_from_cf(&SafetyNetColumns::Instances, ProtectedInstance::key_from(id))
    }

    pub fn get_instance_by_provider_id(
        &self,
        instance_id: &ProviderInstanceId,
    ) -> Result<Option<ProtectedInstance>> {
        let id: Option<InstanceId> =
            self.get_from_cf(&SafetyNetColumns::ProviderInstanceIds, instance_id.get())?;
        match id {
            Some(id) => self.get_instance(&id),
            None => Ok(None),
        }
    }

    /// The instance the workload index currently points at.
    pub fn instance_serving_workload(&self, workload_id: &str) -> Result<Option<ProtectedInstance>> {
        let id: Option<InstanceId> = self.get_from_cf(&SafetyNetColumns::Workloads, workload_id)?;
        match id {
            Some(id) => self.get_instance(&id),
            None => Ok(None),
        }
    }

    pub fn all_instances(&self) -> Result<Vec<ProtectedInstance>> {
        self.get_rows_from_cf(SafetyNetColumns::Instances, RangeOptions::default())
    }

    pub fn replicas(&self) -> Result<Vec<ProtectedInstance>> {
        Ok(self
            .all_instances()?
            .into_iter()
            .filter(|i| i.is_replica)
            .collect())
    }

    pub fn replicas_of(&self, primary: &InstanceId) -> Result<Vec<ProtectedInstance>> {
        Ok(self
            .all_instances()?
            .into_iter()
            .filter(|i| i.replica_of.as_ref() == Some(primary))
            .collect())
    }

    pub fn active_instances_for_workload(&self, workload_id: &str) -> Result<Vec<ProtectedInstance>> {
        Ok(self
            .all_instances()?
            .into_iter()
            .filter(|i| i.is_active && i.workload_id == workload_id)
            .collect())
    }

    /// Events for `pool` with `from <= timestamp <= to`, oldest first.
    pub fn pool_risk_events(&self, pool: &PoolId, from: u64, to: u64) -> Result<Vec<PoolRiskEvent>> {
        if from > to {
            return Ok(vec![]);
        }
        let options = RangeOptionsBuilder::default()
            .lower_bound(PoolRiskEvent::key_for_pool_at(pool, from).into_bytes())
            .upper_bound(pool_ts_upper_bound(pool, to))
            .build()?;
        self.get_rows_from_cf(SafetyNetColumns::PoolRiskEvents, options)
    }

    /// Most recent event for `pool` at or before `as_of`.
    pub fn latest_pool_risk_event(&self, pool: &PoolId, as_of: u64) -> Result<Option<PoolRiskEvent>> {
        let options = RangeOptionsBuilder::default()
            .lower_bound(PoolRiskEvent::key_prefix_for_pool(pool).into_bytes())
            .upper_bound(pool_ts_upper_bound(pool, as_of))
            .reverse(true)
            .limit(1)
            .build()?;
        Ok(self
            .get_rows_from_cf(SafetyNetColumns::PoolRiskEvents, options)?
            .into_iter()
            .next())
    }

    /// Intervals for `account` with `from <= start < to`.
    pub fn downtime_intervals(&self, account_id: &str, from: u64, to: u64) -> Result<Vec<DowntimeInterval>> {
        if from >= to {
            return Ok(vec![]);
        }
        let options = RangeOptionsBuilder::default()
            .lower_bound(DowntimeInterval::key_for_account_at(account_id, from).into_bytes())
            .upper_bound(DowntimeInterval::key_for_account_at(account_id, to).into_bytes())
            .build()?;
        self.get_rows_from_cf(SafetyNetColumns::DowntimeIntervals, options)
    }

    /// Newest first.
    pub fn anomalies(&self, limit: Option<usize>) -> Result<Vec<Anomaly>> {
        let mut builder = RangeOptionsBuilder::default();
        builder.reverse(true);
        if let Some(limit) = limit {
            builder.limit(limit);
        }
        self.get_rows_from_cf(SafetyNetColumns::Anomalies, builder.build()?)
    }

    pub fn latest_sweep_report(&self) -> Result<Option<SweepReport>> {
        let options = RangeOptionsBuilder::default().reverse(true).limit(1).build()?;
        Ok(self
            .get_rows_from_cf(SafetyNetColumns::SweepReports, options)?
            .into_iter()
            .next())
    }

    pub fn stats(&self) -> Result<SafetyNetStats> {
        Ok(self
            .get_from_cf(&SafetyNetColumns::Stats, SafetyNetStats::KEY)?
            .unwrap_or_default())
    }
}

/// Upper bound that includes every event of `pool` stamped at `ts`.
fn pool_ts_upper_bound(pool: &PoolId, ts: u64) -> Vec<u8> {
    prefix_upper_bound(format!("{}|{}", pool, sortable_ts(ts)).as_bytes())
}

#[cfg(test)]
mod tests {
    use data_model::{PoolRiskKind, ProviderInstanceId};

    use super::*;
    use crate::{
        requests::{RequestPayload, StateMachineUpdateRequest},
        test_state_store::TestStateStore,
    };

    fn event(pool: &PoolId, ts: u64, instance: &str) -> PoolRiskEvent {
        PoolRiskEvent {
            pool: pool.clone(),
            kind: PoolRiskKind::RebalanceNotice,
            timestamp: ts,
            account_id: "acct-1".to_string(),
            instance_id: ProviderInstanceId::from(instance),
        }
    }

    #[tokio::test]
    async fn test_pool_risk_event_ranges() -> Result<()> {
        let store = TestStateStore::new().await?;
        let pool = PoolId::new("c5", "az-1");
        let other = PoolId::new("c5", "az-10");
        for (p, ts, i) in [(&pool, 100, "i-1"), (&pool, 200, "i-2"), (&other, 150, "i-3")] {
            store
                .state
                .write(StateMachineUpdateRequest::new(RequestPayload::RecordPoolRiskEvent(
                    event(p, ts, i),
                )))
                .await?;
        }
        // Re-delivery lands on the same key.
        store
            .state
            .write(StateMachineUpdateRequest::new(RequestPayload::RecordPoolRiskEvent(
                event(&pool, 200, "i-2"),
            )))
            .await?;

        let reader = store.state.reader();
        assert_eq!(reader.pool_risk_events(&pool, 0, u64::MAX)?.len(), 2);
        assert_eq!(reader.pool_risk_events(&pool, 100, 100)?.len(), 1);
        assert_eq!(reader.pool_risk_events(&pool, 101, 199)?.len(), 0);

        assert_eq!(reader.latest_pool_risk_event(&pool, 99)?, None);
        assert_eq!(reader.latest_pool_risk_event(&pool, 150)?.unwrap().timestamp, 100);
        assert_eq!(reader.latest_pool_risk_event(&pool, 200)?.unwrap().timestamp, 200);
        assert_eq!(reader.latest_pool_risk_event(&other, 1_000)?.unwrap().timestamp, 150);
        Ok(())
    }
}
