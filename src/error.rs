//! Crate-wide error type, covering the error kinds named in the RPCSEC_GSS
//! error handling design: transient (retry-soon), terminal (key-expired,
//! access-denied), and per-call (context-expired, format-error).

use thiserror::Error;

/// Every error this crate can surface to an embedder or to the RPC engine.
#[derive(Debug, Error)]
pub enum GssError {
    /// The daemon has not opened a pipe yet, or a downcall indicated a
    /// transient fault (`-EFAULT`, `-ENOMEM`, `-EINVAL`, `-ENOSYS`). The
    /// refresh path should retry.
    #[error("rpcsec_gss: try again")]
    RetrySoon,

    /// The daemon rejected context establishment with `-EKEYEXPIRED`. The
    /// credential becomes NEGATIVE and enters the retry-cooldown.
    #[error("rpcsec_gss: key expired")]
    KeyExpired,

    /// Any other daemon-signaled failure, or the daemon did not appear
    /// within the wait bound.
    #[error("rpcsec_gss: permission denied")]
    AccessDenied,

    /// A synchronous waiter was woken by a fatal signal (or, in this
    /// library, by an embedder-raised cancellation token) before the
    /// downcall completed.
    #[error("rpcsec_gss: interrupted")]
    Interrupted,

    /// `get_mic`/`verify_mic`/`wrap`/`unwrap` reported that the security
    /// context has expired. The caller must clear UPTODATE on the
    /// credential as a side effect even though this variant still
    /// propagates as an error for MIC paths.
    #[error("rpcsec_gss: context expired")]
    ContextExpired,

    /// A malformed downcall, an oversized verifier, or a sequence-number
    /// mismatch between request and reply. Fatal to the call.
    #[error("rpcsec_gss: format error: {0}")]
    FormatError(String),

    /// An allocation or buffer-sizing failure.
    #[error("rpcsec_gss: resource exhausted")]
    ResourceExhausted,

    /// The pseudoflavor did not resolve to a known `(mechanism, service)`
    /// pair.
    #[error("rpcsec_gss: unknown pseudoflavor {0}")]
    UnknownPseudoflavor(u32),

    /// Lower-layer GSS mechanism failure that does not map to one of the
    /// kinds above (e.g. a hard failure out of `import_sec_context`).
    #[error("rpcsec_gss: mechanism error: {0}")]
    Mechanism(#[from] libgssapi::error::Error),

    /// Transport I/O failure writing to or reading from an upcall pipe.
    #[error("rpcsec_gss: upcall transport error: {0}")]
    Io(#[from] std::io::Error),
}

impl GssError {
    /// True for the errors the refresh loop should retry rather than
    /// surface to the RPC engine.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GssError::RetrySoon)
    }
}

pub type Result<T> = std::result::Result<T, GssError>;
