use std::{env, time::Duration};

pub const STARTUP_TIMEOUT_SECS: u64 = 30;
pub const STOP_GRACE_SECS: u64 = 10;
pub const RPC_TIMEOUT_SECS: u64 = 10;
pub const READY_DEADLINE_SECS: u64 = 5 * 60;
pub const DEPROVISION_DEADLINE_SECS: u64 = 2 * 60;
pub const PROBE_INTERVAL_SECS: u64 = 2;
pub const ROUTE_REFRESH_SECS: u64 = 1;
pub const BACKOFF_BASE_MS: u64 = 500;
pub const BACKOFF_CAP_SECS: u64 = 10;

/// Consecutive probe failures before a readiness bit flips back to false.
pub const PROBE_FAIL_THRESHOLD: u32 = 3;

fn env_duration(key: &str, default: u64) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or_else(|| Duration::from_secs(default))
}

/// How long a spawned instance may take to answer its health endpoint.
pub fn startup_timeout() -> Duration {
    env_duration("ORAMA_STARTUP_TIMEOUT_SECS", STARTUP_TIMEOUT_SECS)
}

/// Grace window between a shutdown request and forced termination.
pub fn stop_grace() -> Duration {
    env_duration("ORAMA_STOP_GRACE_SECS", STOP_GRACE_SECS)
}

/// Per-call timeout on host-to-host spawn RPCs.
pub fn rpc_timeout() -> Duration {
    env_duration("ORAMA_RPC_TIMEOUT_SECS", RPC_TIMEOUT_SECS)
}

/// Overall deadline for a cluster to reach `ready`.
pub fn ready_deadline() -> Duration {
    env_duration("ORAMA_READY_DEADLINE_SECS", READY_DEADLINE_SECS)
}

/// Overall deadline for a placement to stop during deprovisioning.
pub fn deprovision_deadline() -> Duration {
    env_duration("ORAMA_DEPROVISION_DEADLINE_SECS", DEPROVISION_DEADLINE_SECS)
}

/// Interval between readiness probe rounds.
pub fn probe_interval() -> Duration {
    env_duration("ORAMA_PROBE_INTERVAL_SECS", PROBE_INTERVAL_SECS)
}

/// Interval between router route-table refreshes.
pub fn route_refresh_interval() -> Duration {
    env_duration("ORAMA_ROUTE_REFRESH_SECS", ROUTE_REFRESH_SECS)
}

/// First retry delay for provisioning steps; doubles per attempt.
pub fn backoff_base() -> Duration {
    env::var("ORAMA_BACKOFF_BASE_MS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or_else(|| Duration::from_millis(BACKOFF_BASE_MS))
}

/// Upper bound on the provisioning retry delay.
pub fn backoff_cap() -> Duration {
    env_duration("ORAMA_BACKOFF_CAP_SECS", BACKOFF_CAP_SECS)
}
