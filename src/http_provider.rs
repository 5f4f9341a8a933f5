use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use data_model::{PoolId, ProviderInstanceId};
use processor::provider::{CloudProvider, InstanceDescription, LaunchRequest, ProviderError};
use reqwest::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

#[derive(Debug, Serialize, Deserialize)]
struct LaunchResponse {
    instance_id: ProviderInstanceId,
}

#[derive(Debug, Serialize, Deserialize)]
struct SpotPriceResponse {
    price: Option<f64>,
}

/// [`CloudProvider`] backed by a provider gateway speaking JSON:
///
/// - `POST   /instances`               launch, body is a [`LaunchRequest`]
/// - `GET    /instances/{id}`          describe
/// - `DELETE /instances/{id}`          terminate
/// - `GET    /spot_prices/{pool}?instance_type=`
///
/// 404 maps to `NotFound`, 409 on launch to `InsufficientCapacity`, 429 to
/// `RateLimited`, 504 and client timeouts to `Timeout`.
pub struct HttpCloudProvider {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpCloudProvider {
    pub fn new(endpoint: &str, request_timeout: Duration) -> Result<Self> {
        let mut endpoint = Url::parse(endpoint)?;
        if !endpoint.path().ends_with('/') {
            let path = format!("{}/", endpoint.path());
            endpoint.set_path(&path);
        }
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self { client, endpoint })
    }

    fn url(&self, path: &str) -> Result<Url, ProviderError> {
        self.endpoint
            .join(path)
            .map_err(|e| ProviderError::Rejected(format!("invalid provider path {}: {}", path, e)))
    }
}

fn transport_error(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout(err.to_string())
    } else {
        ProviderError::Unavailable(err.to_string())
    }
}

async fn status_error(
    response: Response,
    instance_id: Option<&ProviderInstanceId>,
    pool: Option<&PoolId>,
) -> ProviderError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    match (status, instance_id, pool) {
        (StatusCode::NOT_FOUND, Some(id), _) => ProviderError::NotFound(id.clone()),
        (StatusCode::CONFLICT, _, Some(pool)) => ProviderError::InsufficientCapacity(pool.clone()),
        (StatusCode::TOO_MANY_REQUESTS, _, _) => ProviderError::RateLimited(body),
        (StatusCode::GATEWAY_TIMEOUT, _, _) => ProviderError::Timeout(body),
        (status, _, _) if status.is_server_error() => {
            ProviderError::Unavailable(format!("{}: {}", status, body))
        }
        (status, _, _) => ProviderError::Rejected(format!("{}: {}", status, body)),
    }
}

async fn decode<T: for<'de> Deserialize<'de>>(response: Response) -> Result<T, ProviderError> {
    response
        .json::<T>()
        .await
        .map_err(|e| ProviderError::Rejected(format!("malformed provider response: {}", e)))
}

#[async_trait]
impl CloudProvider for HttpCloudProvider {
    async fn launch(&self, request: &LaunchRequest) -> Result<ProviderInstanceId, ProviderError> {
        let response = self
            .client
            .post(self.url("instances")?)
            .json(request)
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(status_error(response, None, Some(&request.pool)).await);
        }
        let launched: LaunchResponse = decode(response).await?;
        debug!(
            instance_id = launched.instance_id.get(),
            pool = request.pool.to_string(),
            "provider launched instance"
        );
        Ok(launched.instance_id)
    }

    async fn describe(
        &self,
        instance_id: &ProviderInstanceId,
    ) -> Result<InstanceDescription, ProviderError> {
        let response = self
            .client
            .get(self.url(&format!("instances/{}", instance_id))?)
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(status_error(response, Some(instance_id), None).await);
        }
        decode(response).await
    }

    async fn terminate(&self, instance_id: &ProviderInstanceId) -> Result<(), ProviderError> {
        let response = self
            .client
            .delete(self.url(&format!("instances/{}", instance_id))?)
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(status_error(response, Some(instance_id), None).await);
        }
        Ok(())
    }

    async fn spot_price(
        &self,
        pool: &PoolId,
        instance_type: &str,
    ) -> Result<Option<f64>, ProviderError> {
        let response = self
            .client
            .get(self.url(&format!("spot_prices/{}", pool))?)
            .query(&[("instance_type", instance_type)])
            .send()
            .await
            .map_err(transport_error)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(status_error(response, None, None).await);
        }
        let price: SpotPriceResponse = decode(response).await?;
        Ok(price.price)
    }
}
