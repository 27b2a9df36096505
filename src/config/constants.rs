//! Timeouts and fixed limits used across the service.

use std::time::Duration;

/// JSON-RPC request timeout for upstream commands.
pub const RPC_COMMAND_TIMEOUT: Duration = Duration::from_secs(15);

/// WebSocket handshake deadline when dialing the upstream node.
pub const WS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for a supervisor-driven reconnect attempt.
pub const RECONNECT_TIMEOUT: Duration = Duration::from_secs(8);

/// How often the listener supervisor checks the upstream connection.
pub const SUPERVISOR_TICK: Duration = Duration::from_secs(5);

/// Per-candidate deadline for account geolocation during enrichment.
pub const ACCOUNT_RESOLVE_TIMEOUT: Duration = Duration::from_secs(3);

/// Bound on graceful shutdown of any component.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client timeout for validator list and registry fetches.
pub const SOURCE_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Fresh-cache lifetime for a fetched validator list blob.
pub const VALIDATOR_LIST_CACHE_TTL: Duration = Duration::from_secs(10 * 60);

/// Fresh-cache lifetime for the secondary registry payload.
pub const SECONDARY_REGISTRY_CACHE_TTL: Duration = Duration::from_secs(30 * 60);

/// Cooldown applied to a source that failed without a rate-limit signal.
pub const DEFAULT_SOURCE_COOLDOWN: Duration = Duration::from_secs(2 * 60);

/// Cooldown applied on 429/503 when no Retry-After header is usable.
pub const RATE_LIMIT_COOLDOWN: Duration = Duration::from_secs(10 * 60);

/// Retry attempts per validator list URL.
pub const VALIDATOR_LIST_MAX_RETRIES: u32 = 3;

/// Upper bound on tracked validators, guards memory on hostile lists.
pub const MAX_VALIDATORS: usize = 1000;

/// Interval between keepalive pings on a client WebSocket.
pub const WS_PING_INTERVAL: Duration = Duration::from_secs(54);

/// Liveness deadline for inbound frames (pongs included) per client.
pub const WS_READ_DEADLINE: Duration = Duration::from_secs(60);

/// Deadline for a single outbound write to a client WebSocket.
pub const WS_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Seconds between the Ripple epoch (2000-01-01) and the Unix epoch.
pub const RIPPLE_EPOCH_OFFSET: i64 = 946_684_800;

/// DNS query timeout in seconds.
pub const DNS_TIMEOUT_SECS: u64 = 5;

/// GeoLite database download deadline.
pub const GEOLITE_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);
