//! Client side of the service registry.
//!
//! - [`DiscoveryClient`] registers the current process, keeps it alive with
//!   heartbeats, and resolves peer names to base URLs through a TTL cache
//!   that falls back to stale entries while the registry is unreachable.
//! - [`CircuitBreaker`] and [`CircuitBreakerGroup`] guard calls to those
//!   peers, answering from a fallback while a peer keeps failing.
//!
//! ```rust,ignore
//! use registry_client::*;
//!
//! let discovery = DiscoveryClient::new(ClientConfig::new("http://registry:3000"))?;
//! discovery.register("order-service", 8080).await?;
//!
//! let breakers = CircuitBreakerGroup::new();
//! let get_user = breakers.wrap(
//!     "get_user",
//!     CircuitBreakerConfig::default(),
//!     move |id: u32| fetch_user(id),
//!     |id: u32| User::placeholder(id),
//! );
//! let user = get_user.call(42).await?;
//!
//! discovery.unregister().await;
//! ```

pub mod api;
pub mod breaker;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod heartbeat;

pub use breaker::{
    BreakerStatus, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerGroup, CircuitState,
    Protected,
};
pub use client::{CurrentService, DiscoveryClient, HealthState, HealthStatus};
pub use config::ClientConfig;
pub use error::{BreakerError, DiscoveryError};
pub use shared::clock::{Clock, ManualClock, SystemClock};
