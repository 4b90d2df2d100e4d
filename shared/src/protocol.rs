/// Liveness grace: an instance stays alive for 1.5x its heartbeat interval
pub const GRACE_FACTOR: f64 = 1.5;

/// Heartbeat interval applied when a registration does not carry one
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Longest heartbeat interval the registry accepts (one day)
pub const MAX_HEARTBEAT_INTERVAL_SECS: u64 = 86_400;

/// Period of the registry's dead-instance sweep
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

/// API paths
pub const REGISTER_PATH: &str = "/register";
pub const HEARTBEAT_PATH: &str = "/heartbeat";
pub const SERVICES_PATH: &str = "/services";
pub const HASH_PATH: &str = "/registry/hash";
