use std::net::IpAddr;
use serde::Serialize;
use sha2::{Sha256, Digest};
use shared::types::ServiceInstance;

/// Only membership fields are hashed: heartbeat and registration timestamps
/// change on every heartbeat but don't represent a membership change.
#[derive(Serialize)]
struct HashView<'a> {
    id: &'a str,
    name: &'a str,
    ip: IpAddr,
    port: u16,
    heartbeat_interval: u64,
}

/// Computes a SHA-256 hash of the registry membership.
/// Instances are sorted by id for deterministic output.
pub fn compute_hash(instances: &[ServiceInstance]) -> String {
    let mut indices: Vec<usize> = (0..instances.len()).collect();
    indices.sort_by(|&a, &b| instances[a].id.cmp(&instances[b].id));

    let mut hasher = Sha256::new();
    for &i in &indices {
        let s = &instances[i];
        let view = HashView {
            id: &s.id,
            name: &s.name,
            ip: s.ip,
            port: s.port,
            heartbeat_interval: s.heartbeat_interval,
        };
        // Serializing a struct of strings and integers cannot fail
        if let Ok(json) = serde_json::to_vec(&view) {
            hasher.update(&json);
            hasher.update(b"\n");
        }
    }

    hex::encode(hasher.finalize())
}
