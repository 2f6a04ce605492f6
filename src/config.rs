//! Tunables named throughout the spec, collected into one struct rather than
//! scattered constants, since this crate is embedded by a host process and
//! has no config file of its own.

use std::time::Duration;

/// Maximum size of a v1 text upcall payload (`mech=... uid=... ...\n`).
pub const V1_PAYLOAD_MAX: usize = 128;

/// Maximum size of an entire downcall message.
pub const DOWNCALL_MAX: usize = 1024;

/// `GSS_CRED_SLACK`-equivalent: extra room reserved in the send buffer for
/// the credential body and verifier.
pub const CRED_SLACK: usize = 2 * MAX_AUTH_SIZE;

/// `RPC_MAX_AUTH_SIZE`-equivalent upper bound on a verifier's opaque body.
pub const MAX_AUTH_SIZE: usize = 400;

/// Extra slack reserved ahead of the arguments when integrity is in use
/// (two 4-byte integers) plus typical krb5 verifier length.
pub const VERF_SLACK: usize = 100;

#[derive(Debug, Clone)]
pub struct GssConfig {
    /// Cooldown before a NEGATIVE credential is retried. Default 5s.
    pub expired_cred_retry_delay: Duration,
    /// How long a synchronous caller waits for a pipe version to appear
    /// when the daemon is believed to be running. Default 15s.
    pub pipe_wait_timeout: Duration,
    /// How long a synchronous caller waits when the daemon is already
    /// known not to be running. Default 0.25s.
    pub pipe_wait_timeout_no_daemon: Duration,
    /// How often a rate-limited warning may repeat. Default 15s.
    pub warn_rate_limit: Duration,
    /// Timeout for delivering an upcall message to userspace before it is
    /// stamped `-ETIMEDOUT`. Default 15s, matching the RPC task timeout.
    pub upcall_task_timeout: Duration,
}

impl Default for GssConfig {
    fn default() -> Self {
        GssConfig {
            expired_cred_retry_delay: Duration::from_secs(5),
            pipe_wait_timeout: Duration::from_secs(15),
            pipe_wait_timeout_no_daemon: Duration::from_millis(250),
            warn_rate_limit: Duration::from_secs(15),
            upcall_task_timeout: Duration::from_secs(15),
        }
    }
}
