use thiserror::Error;

/// Errors surfaced by the discovery client
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("No instances available for service '{service}'")]
    NoInstancesAvailable { service: String },

    #[error("Registry unreachable: {0}")]
    RegistryUnreachable(#[from] reqwest::Error),

    #[error("Registry rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Invalid registry URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Invalid client config: {0}")]
    InvalidConfig(String),

    #[error("Not registered with the registry")]
    NotRegistered,
}

/// The only error a breaker-wrapped call can return
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BreakerError {
    #[error("Service unavailable: '{operation}' failed and no fallback is configured")]
    ServiceUnavailable { operation: String },
}
