use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use async_trait::async_trait;
use data_model::{PoolId, ProviderInstanceId};
use safety_net_utils::Clock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LaunchRequest {
    pub account_id: String,
    pub region: String,
    pub pool: PoolId,
    pub instance_type: String,
    pub workload_id: String,
    /// Repeating a launch with the same token returns the same instance.
    pub client_token: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProviderInstanceState {
    Pending,
    Running,
    ShuttingDown,
    Terminated,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceDescription {
    pub instance_id: ProviderInstanceId,
    pub state: ProviderInstanceState,
    /// When the provider first reported the instance healthy.
    pub healthy_at: Option<u64>,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum ProviderError {
    #[error("provider rate limited the request: {0}")]
    RateLimited(String),

    #[error("insufficient capacity in pool {0}")]
    InsufficientCapacity(PoolId),

    #[error("provider call timed out: {0}")]
    Timeout(String),

    #[error("instance not found: {0}")]
    NotFound(ProviderInstanceId),

    /// The provider API cannot be reached at all.
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("provider rejected the request: {0}")]
    Rejected(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited(_) |
                ProviderError::InsufficientCapacity(_) |
                ProviderError::Timeout(_)
        )
    }
}

/// The cloud capabilities the safety net needs. Implementations must be
/// safe to call concurrently and are never called with a storage
/// transaction open.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    async fn launch(&self, request: &LaunchRequest) -> Result<ProviderInstanceId, ProviderError>;

    async fn describe(
        &self,
        instance_id: &ProviderInstanceId,
    ) -> Result<InstanceDescription, ProviderError>;

    async fn terminate(&self, instance_id: &ProviderInstanceId) -> Result<(), ProviderError>;

    /// Current hourly spot price for `instance_type` in `pool`, if the
    /// provider publishes one.
    async fn spot_price(&self, pool: &PoolId, instance_type: &str)
        -> Result<Option<f64>, ProviderError>;
}

#[derive(Debug, Clone)]
struct FakeInstance {
    request: LaunchRequest,
    state: ProviderInstanceState,
    pending_polls: u32,
    healthy_at: Option<u64>,
}

#[derive(Debug, Default)]
struct InMemoryInner {
    next_id: u64,
    instances: HashMap<ProviderInstanceId, FakeInstance>,
    tokens: HashMap<String, ProviderInstanceId>,
    launch_failures: VecDeque<ProviderError>,
    terminate_failures: VecDeque<ProviderError>,
    exhausted_pools: Vec<PoolId>,
    pending_polls: u32,
    spot_prices: HashMap<PoolId, f64>,
    launches: Vec<LaunchRequest>,
    terminations: Vec<ProviderInstanceId>,
}

/// Provider used by the `local` environment and by tests. Instances come
/// up after a configurable number of describe polls; failures can be
/// queued up front.
#[derive(Clone)]
pub struct InMemoryCloudProvider {
    inner: Arc<Mutex<InMemoryInner>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryCloudProvider {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(InMemoryInner::default())),
            clock,
        }
    }

    /// Fail the next launches, in order, with the given errors.
    pub async fn fail_next_launches(&self, errors: impl IntoIterator<Item = ProviderError>) {
        self.inner.lock().await.launch_failures.extend(errors);
    }

    pub async fn fail_next_terminations(&self, errors: impl IntoIterator<Item = ProviderError>) {
        self.inner.lock().await.terminate_failures.extend(errors);
    }

    /// Every launch into `pool` fails with insufficient capacity.
    pub async fn exhaust_pool(&self, pool: PoolId) {
        self.inner.lock().await.exhausted_pools.push(pool);
    }

    /// Number of describe calls that report `Pending` before a new
    /// instance turns `Running`.
    pub async fn set_pending_polls(&self, polls: u32) {
        self.inner.lock().await.pending_polls = polls;
    }

    pub async fn set_spot_price(&self, pool: PoolId, price: f64) {
        self.inner.lock().await.spot_prices.insert(pool, price);
    }

    pub async fn launches(&self) -> Vec<LaunchRequest> {
        self.inner.lock().await.launches.clone()
    }

    pub async fn terminations(&self) -> Vec<ProviderInstanceId> {
        self.inner.lock().await.terminations.clone()
    }

    pub async fn running(&self) -> Vec<ProviderInstanceId> {
        let inner = self.inner.lock().await;
        let mut ids = inner
            .instances
            .iter()
            .filter(|(_, i)| {
                matches!(
                    i.state,
                    ProviderInstanceState::Pending | ProviderInstanceState::Running
                )
            })
            .map(|(id, _)| id.clone())
            .collect::<Vec<_>>();
        ids.sort_by(|a, b| a.get().cmp(b.get()));
        ids
    }

    pub async fn launch_request(&self, instance_id: &ProviderInstanceId) -> Option<LaunchRequest> {
        self.inner
            .lock()
            .await
            .instances
            .get(instance_id)
            .map(|i| i.request.clone())
    }
}

#[async_trait]
impl CloudProvider for InMemoryCloudProvider {
    async fn launch(&self, request: &LaunchRequest) -> Result<ProviderInstanceId, ProviderError> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.tokens.get(&request.client_token) {
            return Ok(existing.clone());
        }
        if let Some(err) = inner.launch_failures.pop_front() {
            return Err(err);
        }
        if inner.exhausted_pools.contains(&request.pool) {
            return Err(ProviderError::InsufficientCapacity(request.pool.clone()));
        }
        inner.next_id += 1;
        let id = ProviderInstanceId::new(format!("i-mem-{:06}", inner.next_id));
        let pending_polls = inner.pending_polls;
        inner.instances.insert(
            id.clone(),
            FakeInstance {
                request: request.clone(),
                state: ProviderInstanceState::Pending,
                pending_polls,
                healthy_at: None,
            },
        );
        inner
            .tokens
            .insert(request.client_token.clone(), id.clone());
        inner.launches.push(request.clone());
        debug!(instance_id = id.get(), pool = request.pool.to_string(), "launched instance");
        Ok(id)
    }

    async fn describe(
        &self,
        instance_id: &ProviderInstanceId,
    ) -> Result<InstanceDescription, ProviderError> {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock().await;
        let instance = inner
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| ProviderError::NotFound(instance_id.clone()))?;
        if instance.state == ProviderInstanceState::Pending {
            if instance.pending_polls == 0 {
                instance.state = ProviderInstanceState::Running;
                instance.healthy_at = Some(now);
            } else {
                instance.pending_polls -= 1;
            }
        }
        Ok(InstanceDescription {
            instance_id: instance_id.clone(),
            state: instance.state,
            healthy_at: instance.healthy_at,
        })
    }

    async fn terminate(&self, instance_id: &ProviderInstanceId) -> Result<(), ProviderError> {
        let mut inner = self.inner.lock().await;
        if let Some(err) = inner.terminate_failures.pop_front() {
            return Err(err);
        }
        let instance = inner
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| ProviderError::NotFound(instance_id.clone()))?;
        instance.state = ProviderInstanceState::Terminated;
        inner.terminations.push(instance_id.clone());
        Ok(())
    }

    async fn spot_price(
        &self,
        pool: &PoolId,
        _instance_type: &str,
    ) -> Result<Option<f64>, ProviderError> {
        Ok(self.inner.lock().await.spot_prices.get(pool).copied())
    }
}

#[cfg(test)]
mod tests {
    use safety_net_utils::ManualClock;

    use super::*;

    fn request(token: &str) -> LaunchRequest {
        LaunchRequest {
            account_id: "acct-1".to_string(),
            region: "region-1".to_string(),
            pool: PoolId::new("c5", "az-2"),
            instance_type: "c5.xlarge".to_string(),
            workload_id: "w-1".to_string(),
            client_token: token.to_string(),
        }
    }

    #[tokio::test]
    async fn test_launch_is_idempotent_per_token() {
        let provider = InMemoryCloudProvider::new(Arc::new(ManualClock::new(0)));
        let a = provider.launch(&request("t-1")).await.unwrap();
        let b = provider.launch(&request("t-1")).await.unwrap();
        let c = provider.launch(&request("t-2")).await.unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(provider.launches().await.len(), 2);
    }

    #[tokio::test]
    async fn test_describe_turns_running_after_pending_polls() {
        let clock = ManualClock::new(10);
        let provider = InMemoryCloudProvider::new(Arc::new(clock.clone()));
        provider.set_pending_polls(1).await;
        let id = provider.launch(&request("t-1")).await.unwrap();

        let first = provider.describe(&id).await.unwrap();
        assert_eq!(first.state, ProviderInstanceState::Pending);
        clock.set(20);
        let second = provider.describe(&id).await.unwrap();
        assert_eq!(second.state, ProviderInstanceState::Running);
        assert_eq!(second.healthy_at, Some(20));
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let provider = InMemoryCloudProvider::new(Arc::new(ManualClock::new(0)));
        provider
            .fail_next_launches([ProviderError::RateLimited("slow down".to_string())])
            .await;
        let err = provider.launch(&request("t-1")).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(provider.launch(&request("t-1")).await.is_ok());

        provider.exhaust_pool(PoolId::new("c5", "az-2")).await;
        let err = provider.launch(&request("t-3")).await.unwrap_err();
        assert_eq!(err, ProviderError::InsufficientCapacity(PoolId::new("c5", "az-2")));

        let missing = ProviderInstanceId::from("i-missing");
        assert!(!provider.terminate(&missing).await.unwrap_err().is_retryable());
    }
}
