use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::thread;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use anyhow::Result;
use shared::clock::Clock;
use shared::types::ServiceInstance;
use crate::config::RegistryConfig;
use crate::registry::hash;
use crate::registry::store::{HeartbeatOutcome, Registration, RegistryStore, StoreError};

/// Commands sent to the registry thread
pub enum RegistryCommand {
    Register(Registration, oneshot::Sender<ServiceInstance>),
    Heartbeat(Registration, oneshot::Sender<Result<HeartbeatOutcome, StoreError>>),
    Discover(String, oneshot::Sender<Vec<ServiceInstance>>),
    ListAll(oneshot::Sender<BTreeMap<String, Vec<ServiceInstance>>>),
    Remove {
        name: String,
        ip: IpAddr,
        port: u16,
        reply: oneshot::Sender<Result<ServiceInstance, StoreError>>,
    },
    Sweep(oneshot::Sender<Vec<ServiceInstance>>),
    Shutdown,
}

/// Handle to the registry store.
///
/// The store is owned by a single thread; every read and mutation, including
/// the periodic sweep, goes through this channel and is applied in order.
#[derive(Clone)]
pub struct RegistryHandle {
    tx: mpsc::Sender<RegistryCommand>,
}

impl RegistryHandle {
    /// Spawn the registry thread with an empty store
    pub fn spawn(
        config: &RegistryConfig,
        clock: Arc<dyn Clock>,
        hash_tx: watch::Sender<String>,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<RegistryCommand>(256);
        let mut store = RegistryStore::new(config.default_heartbeat_interval_secs);
        let create_missing = !config.strict_heartbeat;

        let publish_hash = |store: &RegistryStore, hash_tx: &watch::Sender<String>| {
            let _ = hash_tx.send(hash::compute_hash(&store.instances()));
        };

        thread::spawn(move || {
            while let Some(cmd) = rx.blocking_recv() {
                let now = clock.now_millis();
                match cmd {
                    RegistryCommand::Register(reg, reply) => {
                        let (instance, changed) = store.register(&reg, now);
                        if changed {
                            tracing::info!("Registered {}", instance.id);
                            publish_hash(&store, &hash_tx);
                        }
                        let _ = reply.send(instance);
                    }
                    RegistryCommand::Heartbeat(reg, reply) => {
                        let result = store.heartbeat(&reg, now, create_missing);
                        match &result {
                            Ok(outcome) => {
                                if outcome.created {
                                    tracing::warn!(
                                        "Heartbeat from unregistered instance {}, registering it",
                                        outcome.instance.id
                                    );
                                }
                                if outcome.changed {
                                    publish_hash(&store, &hash_tx);
                                }
                            }
                            Err(e) => tracing::warn!("Rejected heartbeat: {}", e),
                        }
                        let _ = reply.send(result);
                    }
                    RegistryCommand::Discover(name, reply) => {
                        let _ = reply.send(store.discover(&name, now));
                    }
                    RegistryCommand::ListAll(reply) => {
                        let _ = reply.send(store.list_all(now));
                    }
                    RegistryCommand::Remove { name, ip, port, reply } => {
                        let result = store.remove(&name, ip, port);
                        if let Ok(instance) = &result {
                            tracing::info!("Removed {}", instance.id);
                            publish_hash(&store, &hash_tx);
                        }
                        let _ = reply.send(result);
                    }
                    RegistryCommand::Sweep(reply) => {
                        let evicted = store.sweep(now);
                        if !evicted.is_empty() {
                            for instance in &evicted {
                                tracing::info!("Evicted {} (no heartbeat)", instance.id);
                            }
                            publish_hash(&store, &hash_tx);
                        }
                        let _ = reply.send(evicted);
                    }
                    RegistryCommand::Shutdown => {
                        tracing::info!("Registry thread shutting down");
                        break;
                    }
                }
            }
        });

        Self { tx }
    }

    /// Insert or overwrite an instance
    pub async fn register(&self, reg: Registration) -> Result<ServiceInstance> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(RegistryCommand::Register(reg, reply)).await?;
        Ok(rx.await?)
    }

    /// Refresh an instance's heartbeat
    pub async fn heartbeat(&self, reg: Registration) -> Result<Result<HeartbeatOutcome, StoreError>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(RegistryCommand::Heartbeat(reg, reply)).await?;
        Ok(rx.await?)
    }

    /// Alive instances of one service
    pub async fn discover(&self, name: String) -> Result<Vec<ServiceInstance>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(RegistryCommand::Discover(name, reply)).await?;
        Ok(rx.await?)
    }

    /// Alive instances of every service
    pub async fn list_all(&self) -> Result<BTreeMap<String, Vec<ServiceInstance>>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(RegistryCommand::ListAll(reply)).await?;
        Ok(rx.await?)
    }

    /// Remove one instance
    pub async fn remove(
        &self,
        name: String,
        ip: IpAddr,
        port: u16,
    ) -> Result<Result<ServiceInstance, StoreError>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(RegistryCommand::Remove { name, ip, port, reply }).await?;
        Ok(rx.await?)
    }

    /// Evict dead instances
    pub async fn sweep(&self) -> Result<Vec<ServiceInstance>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(RegistryCommand::Sweep(reply)).await?;
        Ok(rx.await?)
    }

    /// Shutdown the registry thread
    pub async fn shutdown(&self) -> Result<()> {
        self.tx.send(RegistryCommand::Shutdown).await?;
        Ok(())
    }
}

/// Sweep loop - evicts instances that stopped heartbeating
pub async fn run(
    registry: RegistryHandle,
    config: RegistryConfig,
    cancel: CancellationToken,
) -> Result<()> {
    let mut sweep_interval = tokio::time::interval(
        std::time::Duration::from_secs(config.sweep_interval_secs)
    );

    loop {
        tokio::select! {
            _ = sweep_interval.tick() => {
                match registry.sweep().await {
                    Ok(evicted) if !evicted.is_empty() => {
                        tracing::info!("Sweep evicted {} instance(s)", evicted.len());
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!("Failed to run sweep: {}", e),
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("Sweep loop shutting down");
                break;
            }
        }
    }

    Ok(())
}
