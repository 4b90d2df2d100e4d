use std::net::IpAddr;
use serde::{Serialize, Deserialize};
use crate::protocol::GRACE_FACTOR;

/// A registered service instance.
/// This is the canonical data model used by the registry daemon, API, and client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstance {
    /// Deterministic id, `"{name}-{ip}-{port}"`
    pub id: String,

    /// Logical service name, e.g. "user-service"
    pub name: String,

    /// Address the instance registered from
    pub ip: IpAddr,

    /// Service port
    pub port: u16,

    /// Heartbeat interval in seconds, as confirmed by the registry
    pub heartbeat_interval: u64,

    /// Registration time, epoch milliseconds
    pub registered_at: i64,

    /// Last heartbeat time, epoch milliseconds
    pub last_heartbeat: i64,
}

impl ServiceInstance {
    /// Build the instance id for a `(name, ip, port)` triple.
    pub fn instance_id(name: &str, ip: IpAddr, port: u16) -> String {
        format!("{}-{}-{}", name, ip, port)
    }

    /// An instance is alive while its last heartbeat is within
    /// `heartbeat_interval * 1.5` seconds of `now_millis`.
    pub fn is_alive(&self, now_millis: i64) -> bool {
        let window = (self.heartbeat_interval as f64 * 1000.0 * GRACE_FACTOR) as i64;
        now_millis - self.last_heartbeat <= window
    }

    /// Base URL of the instance.
    pub fn url(&self) -> String {
        format_url(self.ip, self.port)
    }
}

/// Format an http base URL, bracketing IPv6 literals.
pub fn format_url(ip: IpAddr, port: u16) -> String {
    match ip {
        IpAddr::V4(v4) => format!("http://{}:{}", v4, port),
        IpAddr::V6(v6) => format!("http://[{}]:{}", v6, port),
    }
}

/// Body of `POST /register` and `POST /heartbeat`.
///
/// Fields are optional on the wire so the registry can answer a missing
/// field with a validation error instead of a decode failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval: Option<u64>,
}

pub type HeartbeatRequest = RegisterRequest;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub id: String,
    pub heartbeat_interval: u64,
    pub registered_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub ok: bool,
    pub last_heartbeat: i64,
    pub next_heartbeat_in: u64,
}

/// Body of `GET /services/:name`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoverResponse {
    pub services: Vec<ServiceInstance>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Alive,
}

/// One entry of the `GET /services` listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListedInstance {
    #[serde(flatten)]
    pub instance: ServiceInstance,
    pub status: InstanceStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
