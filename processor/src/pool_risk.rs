use std::sync::Arc;

use anyhow::Result;
use data_model::{PoolId, PoolRiskEvent, PoolRiskKind, ProviderInstanceId};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use state_store::{
    requests::{RequestPayload, StateMachineUpdateRequest},
    SafetyNetState,
};
use tracing::{debug, warn};

/// Where a replacement goes, and whether it had to settle for a pool that
/// is still cooling down.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub pool: PoolId,
    pub degraded: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolStatus {
    pub pool: PoolId,
    pub poisoned: bool,
    pub last_event: Option<PoolRiskEvent>,
    pub events_in_window: usize,
    /// First instant at which the pool is offered again, if poisoned.
    pub poisoned_until: Option<u64>,
}

/// Tracks unstable pools. A pool is poisoned while its most recent event
/// is younger than the cooldown; all state lives in the pool risk table.
pub struct PoolRiskRegistry {
    state: Arc<SafetyNetState>,
    cooldown_ms: u64,
    metrics: Arc<metrics::safety_net::Metrics>,
}

impl PoolRiskRegistry {
    pub fn new(
        state: Arc<SafetyNetState>,
        cooldown_ms: u64,
        metrics: Arc<metrics::safety_net::Metrics>,
    ) -> Self {
        Self {
            state,
            cooldown_ms,
            metrics,
        }
    }

    pub fn cooldown_ms(&self) -> u64 {
        self.cooldown_ms
    }

    pub async fn record_event(
        &self,
        pool: &PoolId,
        kind: PoolRiskKind,
        timestamp: u64,
        account_id: &str,
        instance_id: &ProviderInstanceId,
    ) -> Result<()> {
        let event = PoolRiskEvent {
            pool: pool.clone(),
            kind,
            timestamp,
            account_id: account_id.to_string(),
            instance_id: instance_id.clone(),
        };
        self.state
            .write(StateMachineUpdateRequest::new(
                RequestPayload::RecordPoolRiskEvent(event),
            ))
            .await?;
        self.metrics.pool_risk_events.add(
            1,
            &[
                KeyValue::new("kind", kind.to_string()),
                KeyValue::new("pool", pool.to_string()),
            ],
        );
        debug!(pool = pool.to_string(), kind = kind.as_ref(), timestamp, "pool risk event recorded");
        Ok(())
    }

    /// True iff an event exists with `as_of - cooldown < ts <= as_of`.
    pub fn is_poisoned(&self, pool: &PoolId, as_of: u64) -> Result<bool> {
        Ok(self
            .state
            .reader()
            .latest_pool_risk_event(pool, as_of)?
            .is_some_and(|event| as_of - event.timestamp < self.cooldown_ms))
    }

    /// Best unpoisoned candidate other than `failing`: a different zone
    /// first, then the same family before a compatible one.
    pub fn select_safe_pool(
        &self,
        candidates: &[PoolId],
        failing: &PoolId,
        as_of: u64,
    ) -> Result<Option<PoolId>> {
        let mut safe = Vec::new();
        for pool in candidates.iter().filter(|p| *p != failing) {
            if !self.is_poisoned(pool, as_of)? {
                safe.push(pool);
            }
        }
        Ok(safe
            .into_iter()
            .min_by_key(|pool| placement_rank(pool, failing))
            .cloned())
    }

    /// The candidate whose latest event is oldest. Only meaningful once
    /// every candidate is poisoned.
    pub fn least_recently_poisoned(
        &self,
        candidates: &[PoolId],
        failing: &PoolId,
        as_of: u64,
    ) -> Result<Option<PoolId>> {
        let others = candidates.iter().filter(|p| *p != failing).collect::<Vec<_>>();
        // The failing pool is only reused when nothing else exists.
        let pool_set = if others.is_empty() {
            candidates.iter().collect::<Vec<_>>()
        } else {
            others
        };
        let mut ranked = Vec::with_capacity(pool_set.len());
        for pool in pool_set {
            let last = self
                .state
                .reader()
                .latest_pool_risk_event(pool, as_of)?
                .map(|e| e.timestamp)
                .unwrap_or(0);
            ranked.push((last, placement_rank(pool, failing), pool));
        }
        Ok(ranked.into_iter().min().map(|(_, _, pool)| pool.clone()))
    }

    /// A safe pool if there is one, otherwise the least recently poisoned
    /// candidate flagged as degraded. `None` only when there are no
    /// candidates at all.
    pub fn choose_placement(
        &self,
        candidates: &[PoolId],
        failing: &PoolId,
        as_of: u64,
    ) -> Result<Option<Placement>> {
        if let Some(pool) = self.select_safe_pool(candidates, failing, as_of)? {
            return Ok(Some(Placement {
                pool,
                degraded: false,
            }));
        }
        let Some(pool) = self.least_recently_poisoned(candidates, failing, as_of)? else {
            return Ok(None);
        };
        warn!(
            failing_pool = failing.to_string(),
            pool = pool.to_string(),
            candidates = candidates.len(),
            "all candidate pools poisoned, degraded placement"
        );
        self.metrics
            .degraded_placements
            .add(1, &[KeyValue::new("pool", pool.to_string())]);
        Ok(Some(Placement {
            pool,
            degraded: true,
        }))
    }

    pub fn pool_status(&self, pool: &PoolId, as_of: u64) -> Result<PoolStatus> {
        let reader = self.state.reader();
        let from = as_of.saturating_add(1).saturating_sub(self.cooldown_ms);
        let events_in_window = reader.pool_risk_events(pool, from, as_of)?.len();
        let last_event = reader.latest_pool_risk_event(pool, as_of)?;
        let poisoned_until = last_event
            .as_ref()
            .map(|e| e.timestamp + self.cooldown_ms)
            .filter(|until| *until > as_of);
        Ok(PoolStatus {
            pool: pool.clone(),
            poisoned: poisoned_until.is_some(),
            last_event,
            events_in_window,
            poisoned_until,
        })
    }
}

/// Lower is better: other zones before the failing zone, the failing
/// family before compatible ones, then the pool id for a stable order.
fn placement_rank(pool: &PoolId, failing: &PoolId) -> (bool, bool, String) {
    (
        pool.zone == failing.zone,
        pool.family != failing.family,
        pool.to_string(),
    )
}

#[cfg(test)]
mod tests {
    use safety_net_utils::MS_PER_DAY;
    use state_store::test_state_store::TestStateStore;

    use super::*;

    const COOLDOWN: u64 = 15 * MS_PER_DAY;

    fn registry(store: &TestStateStore) -> PoolRiskRegistry {
        PoolRiskRegistry::new(
            store.state.clone(),
            COOLDOWN,
            Arc::new(metrics::safety_net::Metrics::new()),
        )
    }

    async fn poison(registry: &PoolRiskRegistry, pool: &PoolId, ts: u64) -> Result<()> {
        registry
            .record_event(
                pool,
                PoolRiskKind::RebalanceNotice,
                ts,
                "acct-1",
                &ProviderInstanceId::from("i-1"),
            )
            .await
    }

    #[tokio::test]
    async fn test_poison_window_boundaries() -> Result<()> {
        let store = TestStateStore::new().await?;
        let registry = registry(&store);
        let pool = PoolId::new("c5", "az-1");
        let t0 = 100 * MS_PER_DAY;
        poison(&registry, &pool, t0).await?;

        assert!(!registry.is_poisoned(&pool, t0 - 1)?);
        assert!(registry.is_poisoned(&pool, t0)?);
        assert!(registry.is_poisoned(&pool, t0 + 14 * MS_PER_DAY)?);
        assert!(registry.is_poisoned(&pool, t0 + COOLDOWN - 1)?);
        assert!(!registry.is_poisoned(&pool, t0 + COOLDOWN)?);
        assert!(!registry.is_poisoned(&pool, t0 + 16 * MS_PER_DAY)?);
        assert!(!registry.is_poisoned(&PoolId::new("c5", "az-2"), t0)?);
        Ok(())
    }

    #[tokio::test]
    async fn test_select_safe_pool_prefers_other_zone_then_same_family() -> Result<()> {
        let store = TestStateStore::new().await?;
        let registry = registry(&store);
        let failing = PoolId::new("c5", "az-1");
        let candidates = vec![
            PoolId::new("c5", "az-1"),
            PoolId::new("m5", "az-1"),
            PoolId::new("m5", "az-2"),
            PoolId::new("c5", "az-3"),
            PoolId::new("c5", "az-2"),
        ];
        let now = 10 * MS_PER_DAY;
        assert_eq!(
            registry.select_safe_pool(&candidates, &failing, now)?,
            Some(PoolId::new("c5", "az-2"))
        );

        poison(&registry, &PoolId::new("c5", "az-2"), now).await?;
        poison(&registry, &PoolId::new("c5", "az-3"), now).await?;
        assert_eq!(
            registry.select_safe_pool(&candidates, &failing, now)?,
            Some(PoolId::new("m5", "az-2"))
        );

        poison(&registry, &PoolId::new("m5", "az-2"), now).await?;
        assert_eq!(
            registry.select_safe_pool(&candidates, &failing, now)?,
            Some(PoolId::new("m5", "az-1"))
        );

        poison(&registry, &PoolId::new("m5", "az-1"), now).await?;
        assert_eq!(registry.select_safe_pool(&candidates, &failing, now)?, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_degraded_placement_picks_least_recently_poisoned() -> Result<()> {
        let store = TestStateStore::new().await?;
        let registry = registry(&store);
        let failing = PoolId::new("c5", "az-1");
        let candidates = vec![
            failing.clone(),
            PoolId::new("c5", "az-2"),
            PoolId::new("c5", "az-3"),
        ];
        let now = 20 * MS_PER_DAY;
        poison(&registry, &failing, now).await?;
        poison(&registry, &PoolId::new("c5", "az-2"), now - 2 * MS_PER_DAY).await?;
        poison(&registry, &PoolId::new("c5", "az-3"), now - 5 * MS_PER_DAY).await?;

        let placement = registry
            .choose_placement(&candidates, &failing, now)?
            .unwrap();
        assert_eq!(
            placement,
            Placement {
                pool: PoolId::new("c5", "az-3"),
                degraded: true,
            }
        );
        assert_eq!(registry.choose_placement(&[], &failing, now)?, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_pool_status() -> Result<()> {
        let store = TestStateStore::new().await?;
        let registry = registry(&store);
        let pool = PoolId::new("c5", "az-1");
        let t0 = 30 * MS_PER_DAY;
        poison(&registry, &pool, t0 - 20 * MS_PER_DAY).await?;
        poison(&registry, &pool, t0).await?;

        let status = registry.pool_status(&pool, t0 + MS_PER_DAY)?;
        assert!(status.poisoned);
        assert_eq!(status.events_in_window, 1);
        assert_eq!(status.poisoned_until, Some(t0 + COOLDOWN));

        let later = registry.pool_status(&pool, t0 + COOLDOWN)?;
        assert!(!later.poisoned);
        assert_eq!(later.events_in_window, 0);
        assert_eq!(later.last_event.map(|e| e.timestamp), Some(t0));
        Ok(())
    }
}
