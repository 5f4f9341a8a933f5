use std::{env, fmt::Debug, net::SocketAddr, time::Duration};

use anyhow::{anyhow, Result};
use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use processor::config::{PoolCatalogConfig, SafetyNetConfig};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const LOCAL_ENV: &str = "local";
const ENV_PREFIX: &str = "SAFETY_NET_";

/// Where launch, describe and terminate calls go.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ProviderConfig {
    /// Simulated provider, for the local environment.
    #[default]
    InMemory,
    /// A provider gateway speaking JSON over HTTP.
    Http {
        endpoint: String,
        #[serde(default = "default_request_timeout_secs")]
        request_timeout_secs: u64,
    },
}

fn default_request_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enable_metrics: bool,
    pub enable_tracing: bool,
    // OpenTelemetry collector grpc endpoint for both traces and metrics.
    // Defaults to OTEL_EXPORTER_OTLP_ENDPOINT or localhost:4317 when empty.
    pub endpoint: Option<String>,
    pub metrics_interval_secs: u64,
    // Used as the service.instance.id metric attribute.
    pub instance_id: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enable_metrics: false,
            enable_tracing: false,
            endpoint: None,
            metrics_interval_secs: 10,
            instance_id: None,
        }
    }
}

impl TelemetryConfig {
    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub env: String,
    pub state_store_path: String,
    pub listen_addr: String,
    pub telemetry: TelemetryConfig,
    pub provider: ProviderConfig,
    pub safety_net: SafetyNetConfig,
    pub pool_catalog: PoolCatalogConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            env: LOCAL_ENV.to_string(),
            state_store_path: default_state_store_path(),
            listen_addr: "0.0.0.0:8950".to_string(),
            telemetry: Default::default(),
            provider: Default::default(),
            safety_net: Default::default(),
            pool_catalog: Default::default(),
        }
    }
}

fn default_state_store_path() -> String {
    env::current_dir()
        .map(|dir| dir.join("safety_net_storage/state"))
        .unwrap_or_else(|_| "safety_net_storage/state".into())
        .to_string_lossy()
        .to_string()
}

impl ServerConfig {
    pub fn from_path(path: &str) -> Result<ServerConfig> {
        let config_str = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&config_str)
    }

    /// YAML first, then `SAFETY_NET_` prefixed environment variables, with
    /// `__` separating nested keys (`SAFETY_NET_SAFETY_NET__NOTICE_WORKERS`).
    fn from_yaml_str(config_str: &str) -> Result<ServerConfig> {
        let config: ServerConfig = Figment::new()
            .merge(Yaml::string(config_str))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(anyhow!("invalid listen address: {}", self.listen_addr));
        }
        if self.state_store_path.trim().is_empty() {
            return Err(anyhow!("state_store_path must not be empty"));
        }
        if let ProviderConfig::Http {
            endpoint,
            request_timeout_secs,
        } = &self.provider
        {
            url::Url::parse(endpoint)
                .map_err(|e| anyhow!("invalid provider endpoint {}: {}", endpoint, e))?;
            if *request_timeout_secs == 0 {
                return Err(anyhow!("provider request_timeout_secs must be positive"));
            }
        }
        if self.telemetry.enable_metrics && self.telemetry.metrics_interval_secs == 0 {
            return Err(anyhow!("telemetry metrics_interval_secs must be positive"));
        }
        self.safety_net.validate()?;
        self.pool_catalog.validate()?;
        Ok(())
    }

    pub fn structured_logging(&self) -> bool {
        self.env != LOCAL_ENV
    }

    pub fn instance_id(&self) -> String {
        self.telemetry
            .instance_id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.env, Uuid::new_v4()))
    }
}
