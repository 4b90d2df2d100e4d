use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use shared::types::ServiceInstance;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Service {0} not found")]
    UnknownService(String),
    #[error("Instance {0} not found")]
    UnknownInstance(String),
}

/// A validated register/heartbeat request, with the caller's address already
/// derived from the connection.
#[derive(Debug, Clone)]
pub struct Registration {
    pub name: String,
    pub ip: IpAddr,
    pub port: u16,
    pub heartbeat_interval: Option<u64>,
}

impl Registration {
    pub fn id(&self) -> String {
        ServiceInstance::instance_id(&self.name, self.ip, self.port)
    }
}

/// Result of applying a heartbeat.
#[derive(Debug, Clone)]
pub struct HeartbeatOutcome {
    pub instance: ServiceInstance,
    /// True when the heartbeat implicitly registered an unknown instance
    pub created: bool,
    /// True when membership-relevant fields changed
    pub changed: bool,
}

/// In-memory registry: service name -> instance id -> instance.
///
/// A name is present only while its group is non-empty.
pub struct RegistryStore {
    services: HashMap<String, HashMap<String, ServiceInstance>>,
    default_heartbeat_interval: u64,
}

impl RegistryStore {
    pub fn new(default_heartbeat_interval: u64) -> Self {
        Self {
            services: HashMap::new(),
            default_heartbeat_interval,
        }
    }

    /// Insert or overwrite an instance. Returns the stored instance and
    /// whether membership changed.
    pub fn register(&mut self, reg: &Registration, now: i64) -> (ServiceInstance, bool) {
        let instance = ServiceInstance {
            id: reg.id(),
            name: reg.name.clone(),
            ip: reg.ip,
            port: reg.port,
            heartbeat_interval: reg.heartbeat_interval.unwrap_or(self.default_heartbeat_interval),
            registered_at: now,
            last_heartbeat: now,
        };

        let group = self.services.entry(reg.name.clone()).or_default();
        let changed = match group.get(&instance.id) {
            Some(old) => membership_changed(old, &instance),
            None => true,
        };
        group.insert(instance.id.clone(), instance.clone());

        (instance, changed)
    }

    /// Refresh an instance's heartbeat. Unknown instances are registered
    /// unless `create_missing` is false.
    pub fn heartbeat(
        &mut self,
        reg: &Registration,
        now: i64,
        create_missing: bool,
    ) -> Result<HeartbeatOutcome, StoreError> {
        let id = reg.id();
        let existing = self
            .services
            .get_mut(&reg.name)
            .and_then(|group| group.get_mut(&id));

        if let Some(instance) = existing {
            let mut changed = false;
            if let Some(interval) = reg.heartbeat_interval {
                changed = instance.heartbeat_interval != interval;
                instance.heartbeat_interval = interval;
            }
            instance.last_heartbeat = now;
            return Ok(HeartbeatOutcome {
                instance: instance.clone(),
                created: false,
                changed,
            });
        }

        if !create_missing {
            return Err(StoreError::UnknownInstance(id));
        }

        let (instance, changed) = self.register(reg, now);
        Ok(HeartbeatOutcome { instance, created: true, changed })
    }

    /// Alive instances of one service. Unknown names yield an empty list.
    pub fn discover(&self, name: &str, now: i64) -> Vec<ServiceInstance> {
        self.services
            .get(name)
            .map(|group| {
                group
                    .values()
                    .filter(|instance| instance.is_alive(now))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Alive instances of every service. Names without an alive instance are omitted.
    pub fn list_all(&self, now: i64) -> BTreeMap<String, Vec<ServiceInstance>> {
        self.services
            .keys()
            .filter_map(|name| {
                let alive = self.discover(name, now);
                (!alive.is_empty()).then(|| (name.clone(), alive))
            })
            .collect()
    }

    /// Remove one instance, dropping the group when it becomes empty.
    pub fn remove(&mut self, name: &str, ip: IpAddr, port: u16) -> Result<ServiceInstance, StoreError> {
        let group = self
            .services
            .get_mut(name)
            .ok_or_else(|| StoreError::UnknownService(name.to_string()))?;

        let id = ServiceInstance::instance_id(name, ip, port);
        let removed = group
            .remove(&id)
            .ok_or(StoreError::UnknownInstance(id))?;

        if group.is_empty() {
            self.services.remove(name);
        }

        Ok(removed)
    }

    /// Evict every instance that failed the liveness check. Returns the evicted instances.
    pub fn sweep(&mut self, now: i64) -> Vec<ServiceInstance> {
        let mut evicted = Vec::new();

        for group in self.services.values_mut() {
            group.retain(|_, instance| {
                let alive = instance.is_alive(now);
                if !alive {
                    evicted.push(instance.clone());
                }
                alive
            });
        }
        self.services.retain(|_, group| !group.is_empty());

        evicted
    }

    /// Every stored instance, alive or not.
    pub fn instances(&self) -> Vec<ServiceInstance> {
        self.services
            .values()
            .flat_map(|group| group.values().cloned())
            .collect()
    }

    #[cfg(test)]
    pub fn contains_service(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }
}

/// Timestamps move on every heartbeat and do not count as a membership change.
fn membership_changed(old: &ServiceInstance, new: &ServiceInstance) -> bool {
    old.ip != new.ip
        || old.port != new.port
        || old.heartbeat_interval != new.heartbeat_interval
        || old.name != new.name
}
