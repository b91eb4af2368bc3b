/// Header carrying the pre-shared secret on host-to-host spawn calls.
pub const INTERNAL_AUTH_HEADER: &str = "X-Orama-Internal-Auth";

/// Path of the internal spawn endpoint every host exposes.
pub const INTERNAL_SPAWN_PATH: &str = "/v1/internal/spawn";

/// The permanent namespace that is never managed by the provisioner.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Host-name prefix reserved for namespace gateway records
/// (`ns-{name}.{base_domain}`). Deployment subdomains can never collide
/// with it because deployment names are validated not to start with it.
pub const NAMESPACE_HOST_PREFIX: &str = "ns-";

/// Poll URL template returned by provisioning responses.
pub const STATUS_POLL_PATH: &str = "/v1/namespace/status";

/// Rough provisioning estimate surfaced to polling clients, in seconds.
pub const PROVISION_ESTIMATE_SECS: u64 = 60;
