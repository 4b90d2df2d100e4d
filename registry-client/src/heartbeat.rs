use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use shared::protocol::MAX_HEARTBEAT_INTERVAL_SECS;
use shared::types::HeartbeatRequest;
use crate::api::RegistryApi;

/// A running heartbeat loop. Dropping the handle stops the loop.
#[derive(Debug)]
pub struct HeartbeatTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl HeartbeatTask {
    /// Start sending heartbeats every `every`, the first one immediately.
    ///
    /// Failed heartbeats are logged and retried on the next tick. If the
    /// registry answers with a different interval, the loop switches to it.
    pub fn spawn(api: RegistryApi, request: HeartbeatRequest, every: Duration) -> Self {
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut period = every;
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = task_cancel.cancelled() => {
                        tracing::debug!("Heartbeat loop stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        match api.heartbeat(&request).await {
                            Ok(response) => {
                                tracing::debug!(
                                    "Heartbeat accepted, next in {}s",
                                    response.next_heartbeat_in
                                );
                                let confirmed = Duration::from_secs(
                                    response.next_heartbeat_in.min(MAX_HEARTBEAT_INTERVAL_SECS),
                                );
                                if !confirmed.is_zero() && confirmed != period {
                                    tracing::info!(
                                        "Registry changed heartbeat interval from {}s to {}s",
                                        period.as_secs(),
                                        confirmed.as_secs()
                                    );
                                    period = confirmed;
                                    ticker = interval_at(Instant::now() + period, period);
                                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                                }
                            }
                            Err(e) => {
                                tracing::warn!("Heartbeat failed, retrying next tick: {}", e);
                            }
                        }
                    }
                }
            }
        });

        Self { cancel, handle }
    }

    /// Stop the loop, waiting for a heartbeat already in flight so nothing
    /// reaches the registry after this returns.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Err(e) = (&mut self.handle).await {
            tracing::warn!("Heartbeat task ended abnormally: {}", e);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for HeartbeatTask {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
