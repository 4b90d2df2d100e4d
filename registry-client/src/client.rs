use std::sync::Arc;
use std::time::Duration;
use serde::Serialize;
use tokio::sync::Mutex;
use shared::clock::{Clock, SystemClock};
use shared::protocol::MAX_HEARTBEAT_INTERVAL_SECS;
use shared::types::{HeartbeatRequest, HeartbeatResponse, RegisterRequest, RegisterResponse};
use crate::api::RegistryApi;
use crate::cache::{CacheEntry, ResolverCache};
use crate::config::ClientConfig;
use crate::error::DiscoveryError;
use crate::heartbeat::HeartbeatTask;

/// Identity of this process once the registry has accepted it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentService {
    pub id: String,
    pub name: String,
    pub port: u16,
    /// Interval confirmed by the registry
    pub heartbeat_interval: u64,
}

struct Registration {
    service: CurrentService,
    heartbeat: HeartbeatTask,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: HealthState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Registers this process with the registry, keeps it alive, and resolves
/// peer names to base URLs.
pub struct DiscoveryClient {
    config: ClientConfig,
    api: RegistryApi,
    clock: Arc<dyn Clock>,
    cache: ResolverCache,
    registration: Mutex<Option<Registration>>,
}

impl DiscoveryClient {
    pub fn new(config: ClientConfig) -> Result<Self, DiscoveryError> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: ClientConfig, clock: Arc<dyn Clock>) -> Result<Self, DiscoveryError> {
        config.validate()?;
        let api = RegistryApi::new(&config)?;
        Ok(Self {
            config,
            api,
            clock,
            cache: ResolverCache::new(),
            registration: Mutex::new(None),
        })
    }

    /// Register as `name` on `port` and start heartbeating.
    ///
    /// The interval returned by the registry replaces the configured one.
    /// Registering again replaces the previous identity and heartbeat loop.
    pub async fn register(&self, name: &str, port: u16) -> Result<RegisterResponse, DiscoveryError> {
        let request = RegisterRequest {
            name: Some(name.to_string()),
            port: Some(port),
            heartbeat_interval: Some(self.config.heartbeat_interval_secs),
        };

        let response = self.api.register(&request).await?;
        tracing::info!(
            "Registered {} with heartbeat every {}s",
            response.id,
            response.heartbeat_interval
        );

        let heartbeat = HeartbeatTask::spawn(
            self.api.clone(),
            HeartbeatRequest {
                name: Some(name.to_string()),
                port: Some(port),
                heartbeat_interval: Some(response.heartbeat_interval),
            },
            Duration::from_secs(response.heartbeat_interval.clamp(1, MAX_HEARTBEAT_INTERVAL_SECS)),
        );

        let service = CurrentService {
            id: response.id.clone(),
            name: name.to_string(),
            port,
            heartbeat_interval: response.heartbeat_interval,
        };

        // Replacing drops the previous heartbeat task, which cancels it
        *self.registration.lock().await = Some(Registration { service, heartbeat });

        Ok(response)
    }

    /// Deregister and stop heartbeating. Removal failures are logged; local
    /// state is always cleared. No-op when not registered.
    pub async fn unregister(&self) {
        let Some(registration) = self.registration.lock().await.take() else {
            tracing::debug!("Unregister called while not registered");
            return;
        };

        registration.heartbeat.stop().await;

        let service = &registration.service;
        match self.api.remove(&service.name, service.port).await {
            Ok(_) => tracing::info!("Unregistered {}", service.id),
            Err(e) => tracing::warn!("Failed to unregister {}: {}", service.id, e),
        }

        self.cache.clear();
    }

    pub async fn is_registered(&self) -> bool {
        self.registration.lock().await.is_some()
    }

    pub async fn current_service(&self) -> Option<CurrentService> {
        self.registration
            .lock()
            .await
            .as_ref()
            .map(|r| r.service.clone())
    }

    /// Send one heartbeat now, outside the recurring loop.
    pub async fn heartbeat(&self) -> Result<HeartbeatResponse, DiscoveryError> {
        let service = self
            .current_service()
            .await
            .ok_or(DiscoveryError::NotRegistered)?;

        let request = HeartbeatRequest {
            name: Some(service.name),
            port: Some(service.port),
            heartbeat_interval: Some(service.heartbeat_interval),
        };
        self.api.heartbeat(&request).await
    }

    /// Resolve `name` to the base URL of one of its instances.
    ///
    /// Fresh cache entries are served without contacting the registry. When a
    /// refresh fails or comes back empty, an expired entry is served instead.
    pub async fn resolve(&self, name: &str) -> Result<String, DiscoveryError> {
        if let Some(url) = self.cache.fresh_url(name, self.clock.now_millis()) {
            return Ok(url);
        }

        let failure = match self.api.discover(name).await {
            Ok(services) if !services.is_empty() => {
                let entry = CacheEntry::new(services, self.clock.now_millis(), self.config.cache_multiplier);
                let url = entry.pick_url();
                self.cache.insert(name, entry);
                if let Some(url) = url {
                    return Ok(url);
                }
                None
            }
            Ok(_) => None,
            Err(e) => Some(e),
        };

        if let Some(url) = self.cache.stale_url(name) {
            match &failure {
                Some(e) => tracing::warn!("Serving stale instances of {}: {}", name, e),
                None => tracing::warn!("Registry lists no instances of {}, serving stale cache", name),
            }
            return Ok(url);
        }

        if let Some(e) = failure {
            tracing::debug!("Lookup of {} failed: {}", name, e);
        }
        Err(DiscoveryError::NoInstancesAvailable {
            service: name.to_string(),
        })
    }

    /// Probe the registry without touching registration state
    pub async fn health_check(&self) -> HealthStatus {
        match self.api.list_all().await {
            Ok(_) => HealthStatus {
                status: HealthState::Healthy,
                error: None,
            },
            Err(e) => HealthStatus {
                status: HealthState::Unhealthy,
                error: Some(e.to_string()),
            },
        }
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// The cached discovery result for `name`, if any
    pub fn cached(&self, name: &str) -> Option<CacheEntry> {
        self.cache.get(name)
    }
}
