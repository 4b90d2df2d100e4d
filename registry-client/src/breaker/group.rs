use std::collections::BTreeMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::RwLock;
use shared::clock::{Clock, SystemClock};
use crate::error::BreakerError;
use super::{BreakerStatus, CircuitBreaker, CircuitBreakerConfig};

type Operation<A, T> = Arc<dyn Fn(A) -> BoxFuture<'static, Result<T, String>> + Send + Sync>;
type Fallback<A, T> = Arc<dyn Fn(A) -> T + Send + Sync>;

/// An operation bound to its own breaker, callable with the operation's
/// original argument and result types.
pub struct Protected<A, T> {
    breaker: Arc<CircuitBreaker>,
    op: Operation<A, T>,
    fallback: Option<Fallback<A, T>>,
}

impl<A, T> Clone for Protected<A, T> {
    fn clone(&self) -> Self {
        Self {
            breaker: self.breaker.clone(),
            op: self.op.clone(),
            fallback: self.fallback.clone(),
        }
    }
}

impl<A, T> Protected<A, T>
where
    A: Clone + Send + 'static,
    T: Send + 'static,
{
    /// Invoke the operation. With a fallback this never fails; without one
    /// an open circuit or failed call yields `ServiceUnavailable`.
    pub async fn call(&self, args: A) -> Result<T, BreakerError> {
        let op = self.op.clone();
        let input = args.clone();

        match &self.fallback {
            Some(fallback) => Ok(self
                .breaker
                .execute(move || op(input), || fallback(args))
                .await),
            None => self.breaker.call(move || op(input)).await,
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn status(&self) -> BreakerStatus {
        self.breaker.status()
    }
}

fn erase<A, T, E, F, Fut>(op: F) -> Operation<A, T>
where
    A: 'static,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    E: Display + 'static,
    T: Send + 'static,
{
    Arc::new(move |args: A| {
        let fut = op(args);
        async move { fut.await.map_err(|e| e.to_string()) }.boxed()
    })
}

/// One independent breaker per named operation of a component.
///
/// Failures recorded against one operation never affect another.
pub struct CircuitBreakerGroup {
    clock: Arc<dyn Clock>,
    breakers: RwLock<BTreeMap<String, Arc<CircuitBreaker>>>,
}

impl Default for CircuitBreakerGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreakerGroup {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            breakers: RwLock::new(BTreeMap::new()),
        }
    }

    /// Breaker for `operation`, created with `config` on first use. An
    /// existing breaker keeps its original config and state.
    pub fn breaker(&self, operation: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.read().get(operation) {
            return existing.clone();
        }

        self.breakers
            .write()
            .entry(operation.to_string())
            .or_insert_with(|| {
                tracing::debug!("Creating breaker for {}", operation);
                Arc::new(CircuitBreaker::with_clock(operation, config, self.clock.clone()))
            })
            .clone()
    }

    pub fn get(&self, operation: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().get(operation).cloned()
    }

    /// Wrap `op` with the breaker for `operation`. The fallback receives the
    /// same arguments as the failed call.
    pub fn wrap<A, T, E, F, Fut, FB>(
        &self,
        operation: &str,
        config: CircuitBreakerConfig,
        op: F,
        fallback: FB,
    ) -> Protected<A, T>
    where
        A: 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Display + 'static,
        T: Send + 'static,
        FB: Fn(A) -> T + Send + Sync + 'static,
    {
        Protected {
            breaker: self.breaker(operation, config),
            op: erase(op),
            fallback: Some(Arc::new(fallback)),
        }
    }

    /// Wrap `op` without a fallback.
    pub fn wrap_without_fallback<A, T, E, F, Fut>(
        &self,
        operation: &str,
        config: CircuitBreakerConfig,
        op: F,
    ) -> Protected<A, T>
    where
        A: 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Display + 'static,
        T: Send + 'static,
    {
        Protected {
            breaker: self.breaker(operation, config),
            op: erase(op),
            fallback: None,
        }
    }

    /// Status of every breaker, ordered by operation name.
    pub fn status(&self) -> Vec<BreakerStatus> {
        self.breakers.read().values().map(|b| b.status()).collect()
    }
}
