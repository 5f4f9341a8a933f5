use std::{collections::BTreeMap, sync::Arc};

use anyhow::{anyhow, Result};
use data_model::{InterruptionNotice, NoticeKind, ProtectedInstance, ProviderInstanceId};
use processor::{
    config::{FamilyCatalog, PoolCatalogConfig, RetryPolicy, SafetyNetConfig},
    interruption_handler::NoticeOutcome,
    provider::InMemoryCloudProvider,
};
use reqwest::StatusCode;
use safety_net_utils::{Clock, ManualClock, MS_PER_DAY};
use serde::{de::DeserializeOwned, Serialize};
use tempfile::TempDir;
use tracing::subscriber;
use tracing_subscriber::{layer::SubscriberExt, Layer};

use crate::{config::ServerConfig, http_objects::RegisterInstance, routes::create_routes, service::Service};

pub const TEST_ACCOUNT: &str = "acct-1";

pub fn test_pool_catalog() -> PoolCatalogConfig {
    PoolCatalogConfig {
        regions: BTreeMap::from([(
            "region-1".to_string(),
            vec!["az-1".to_string(), "az-2".to_string(), "az-3".to_string()],
        )]),
        families: BTreeMap::from([
            (
                "c5".to_string(),
                FamilyCatalog {
                    compatible: vec!["m5".to_string()],
                    hourly_rate_usd: Some(0.10),
                },
            ),
            (
                "m5".to_string(),
                FamilyCatalog {
                    compatible: vec!["c5".to_string()],
                    hourly_rate_usd: Some(0.12),
                },
            ),
        ]),
    }
}

pub fn test_safety_net_config() -> SafetyNetConfig {
    SafetyNetConfig {
        describe_poll_interval_ms: 5,
        rebalance_deadline_secs: 2,
        termination_deadline_secs: 1,
        notice_workers: 4,
        notice_queue_length: 64,
        provider_retry: RetryPolicy {
            max_retries: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
        },
        ..Default::default()
    }
}

/// The full service behind a real listener, with a manual clock and the
/// in-memory provider.
pub struct TestService {
    pub service: Service,
    pub clock: ManualClock,
    pub provider: InMemoryCloudProvider,
    pub base_url: String,
    client: reqwest::Client,
    _temp_dir: TempDir,
}

impl TestService {
    pub async fn new() -> Result<Self> {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"));
        let _ = subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer().with_filter(env_filter)),
        );

        let temp_dir = tempfile::tempdir()?;
        let cfg = ServerConfig {
            state_store_path: temp_dir
                .path()
                .join("state_store")
                .to_string_lossy()
                .to_string(),
            listen_addr: "127.0.0.1:0".to_string(),
            safety_net: test_safety_net_config(),
            pool_catalog: test_pool_catalog(),
            ..Default::default()
        };
        cfg.validate()?;

        let clock = ManualClock::new(MS_PER_DAY);
        let provider = InMemoryCloudProvider::new(Arc::new(clock.clone()));
        let service =
            Service::new_with(cfg, Arc::new(clock.clone()), Arc::new(provider.clone())).await?;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let routes = create_routes(service.route_state());
        tokio::spawn(async move { axum::serve(listener, routes).await });

        Ok(Self {
            service,
            clock,
            provider,
            base_url: format!("http://{}", addr),
            client: reqwest::Client::new(),
            _temp_dir: temp_dir,
        })
    }

    pub async fn post<B: Serialize, R: DeserializeOwned>(&self, path: &str, body: &B) -> Result<R> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(anyhow!(
                "POST {} failed: {} {}",
                path,
                response.status(),
                response.text().await?
            ));
        }
        Ok(response.json().await?)
    }

    pub async fn get<R: DeserializeOwned>(&self, path: &str) -> Result<R> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(anyhow!(
                "GET {} failed: {} {}",
                path,
                response.status(),
                response.text().await?
            ));
        }
        Ok(response.json().await?)
    }

    pub async fn get_status(&self, path: &str) -> Result<StatusCode> {
        Ok(self
            .client
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await?
            .status())
    }

    pub async fn post_status<B: Serialize>(&self, path: &str, body: &B) -> Result<StatusCode> {
        Ok(self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(body)
            .send()
            .await?
            .status())
    }

    pub async fn register(&self, provider_id: &str, zone: &str) -> Result<ProtectedInstance> {
        self.post(
            "/v1/instances",
            &RegisterInstance {
                instance_id: ProviderInstanceId::from(provider_id),
                account_id: TEST_ACCOUNT.to_string(),
                instance_type: "c5.xlarge".to_string(),
                availability_zone: zone.to_string(),
                region: None,
                workload_id: None,
                risk_model_version: Some("v3".to_string()),
                labels: Default::default(),
            },
        )
        .await
    }

    pub fn notice_for(&self, provider_id: &str, kind: NoticeKind) -> InterruptionNotice {
        InterruptionNotice {
            instance_id: ProviderInstanceId::from(provider_id),
            kind,
            instance_type: "c5.xlarge".to_string(),
            availability_zone: "az-1".to_string(),
            account_id: TEST_ACCOUNT.to_string(),
            timestamp: self.clock.now_ms(),
        }
    }

    /// Deliver a notice through the synchronous endpoint.
    pub async fn notice(&self, provider_id: &str, kind: NoticeKind) -> Result<NoticeOutcome> {
        self.post("/v1/notices/sync", &self.notice_for(provider_id, kind))
            .await
    }

    pub async fn process_notices(&self) {
        self.service.notice_runner.process().await;
    }
}
