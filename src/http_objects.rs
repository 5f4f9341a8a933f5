use std::collections::HashMap;

use anyhow::{anyhow, Result};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use data_model::{
    InstanceId,
    InstanceMetadata,
    PoolId,
    ProtectedInstance,
    ProtectedInstanceBuilder,
    ProviderInstanceId,
    SafetyNetStats,
};
use processor::{inventory::PoolCatalog, notice_runner::EnqueueError};
use serde::{Deserialize, Serialize};
use tracing::error;

#[derive(Debug, Serialize, Deserialize)]
pub struct SafetyNetAPIError {
    #[serde(skip)]
    status_code: StatusCode,
    message: String,
}

impl SafetyNetAPIError {
    pub fn new(status_code: StatusCode, message: &str) -> Self {
        Self {
            status_code,
            message: message.to_string(),
        }
    }

    pub fn internal_error(e: anyhow::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string().as_str())
    }

    pub fn not_found(message: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn bad_request(message: &str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl IntoResponse for SafetyNetAPIError {
    fn into_response(self) -> Response {
        if self.status_code.is_server_error() {
            error!("API Error: {} - {}", self.status_code, self.message);
        }
        (self.status_code, Json(self)).into_response()
    }
}

impl From<EnqueueError> for SafetyNetAPIError {
    fn from(e: EnqueueError) -> Self {
        match e {
            EnqueueError::QueueFull => Self::new(StatusCode::TOO_MANY_REQUESTS, &e.to_string()),
            EnqueueError::Closed => Self::new(StatusCode::SERVICE_UNAVAILABLE, &e.to_string()),
        }
    }
}

/// A primary reported by inventory discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterInstance {
    pub instance_id: ProviderInstanceId,
    pub account_id: String,
    pub instance_type: String,
    pub availability_zone: String,
    /// Looked up in the pool catalog when absent.
    pub region: Option<String>,
    pub workload_id: Option<String>,
    pub risk_model_version: Option<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl RegisterInstance {
    pub fn into_instance(self, catalog: &PoolCatalog, now: u64) -> Result<ProtectedInstance> {
        let pool = PoolId::from_instance_type(&self.instance_type, &self.availability_zone)?;
        let region = match self.region {
            Some(region) => region,
            None => catalog
                .region_of_zone(&self.availability_zone)
                .map(|r| r.to_string())
                .ok_or(anyhow!(
                    "zone {} is not in the pool catalog and no region was given",
                    self.availability_zone
                ))?,
        };
        let mut builder = ProtectedInstanceBuilder::default();
        builder
            .instance_id(self.instance_id)
            .account_id(self.account_id)
            .instance_type(self.instance_type)
            .region(region)
            .pool(pool)
            .created_at(now)
            .metadata(InstanceMetadata {
                risk_model_version: self.risk_model_version,
                labels: self.labels,
                ..Default::default()
            });
        if let Some(workload_id) = self.workload_id {
            builder.workload_id(workload_id);
        }
        builder.build()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NoticeAccepted {
    pub queued: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DowntimeQuery {
    pub from: Option<u64>,
    pub to: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PoolQuery {
    pub as_of: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AnomalyQuery {
    pub limit: Option<usize>,
}

/// A primary together with its standbys.
#[derive(Debug, Serialize, Deserialize)]
pub struct InstanceView {
    pub instance: ProtectedInstance,
    pub replicas: Vec<ProtectedInstance>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub stats: SafetyNetStats,
    pub observed_false_alarm_ratio: Option<f64>,
    pub configured_false_alarm_ratio: f64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WorkloadView {
    pub workload_id: String,
    pub serving: Option<InstanceId>,
    pub instance: Option<ProtectedInstance>,
}
