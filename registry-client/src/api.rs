//! Thin typed wrapper over the registry's HTTP contract.

use std::collections::BTreeMap;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use url::Url;
use shared::protocol::{HEARTBEAT_PATH, REGISTER_PATH, SERVICES_PATH};
use shared::types::{
    DiscoverResponse, ErrorResponse, HeartbeatRequest, HeartbeatResponse, ListedInstance,
    MessageResponse, RegisterRequest, RegisterResponse, ServiceInstance,
};
use crate::config::ClientConfig;
use crate::error::DiscoveryError;

/// HTTP client for one registry. Cheap to clone.
#[derive(Debug, Clone)]
pub struct RegistryApi {
    http: Client,
    base: Url,
}

impl RegistryApi {
    pub fn new(config: &ClientConfig) -> Result<Self, DiscoveryError> {
        let base = Url::parse(&config.registry_url)?;
        if base.cannot_be_a_base() {
            return Err(url::ParseError::RelativeUrlWithCannotBeABaseBase.into());
        }

        let http = Client::builder()
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self { http, base })
    }

    /// Registry base URL with path segments appended; segments are
    /// percent-encoded, so service names cannot alter the route.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn path(&self, path: &str) -> Url {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        self.endpoint(&segments)
    }

    pub async fn register(&self, request: &RegisterRequest) -> Result<RegisterResponse, DiscoveryError> {
        let response = self
            .http
            .post(self.path(REGISTER_PATH))
            .json(request)
            .send()
            .await?;
        decode(response).await
    }

    pub async fn heartbeat(&self, request: &HeartbeatRequest) -> Result<HeartbeatResponse, DiscoveryError> {
        let response = self
            .http
            .post(self.path(HEARTBEAT_PATH))
            .json(request)
            .send()
            .await?;
        decode(response).await
    }

    /// Alive instances of `name` as the registry currently sees them
    pub async fn discover(&self, name: &str) -> Result<Vec<ServiceInstance>, DiscoveryError> {
        let mut url = self.path(SERVICES_PATH);
        if let Ok(mut path) = url.path_segments_mut() {
            path.push(name);
        }
        let response = self.http.get(url).send().await?;
        let body: DiscoverResponse = decode(response).await?;
        Ok(body.services)
    }

    pub async fn list_all(&self) -> Result<BTreeMap<String, Vec<ListedInstance>>, DiscoveryError> {
        let response = self.http.get(self.path(SERVICES_PATH)).send().await?;
        decode(response).await
    }

    pub async fn remove(&self, name: &str, port: u16) -> Result<MessageResponse, DiscoveryError> {
        let mut url = self.path(SERVICES_PATH);
        if let Ok(mut path) = url.path_segments_mut() {
            path.push(name).push(&port.to_string());
        }
        let response = self.http.delete(url).send().await?;
        decode(response).await
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, DiscoveryError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }

    let message = match response.json::<ErrorResponse>().await {
        Ok(body) => body.error,
        Err(_) => status.canonical_reason().unwrap_or("unknown error").to_string(),
    };
    Err(DiscoveryError::Rejected {
        status: status.as_u16(),
        message,
    })
}
