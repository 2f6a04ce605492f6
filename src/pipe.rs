//! The per-namespace pipe-version singleton and the transport trait that
//! stands in for the pipe filesystem (an explicit external collaborator
//! per §1).
//!
//! spec.md models this as per-network-namespace state; this crate collapses
//! it to one process-global singleton, per the guidance in §9 Design Notes
//! ("implementations without namespaces may collapse to a process-global
//! singleton").

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, OnceLock};
use tracing::warn;

use crate::error::{GssError, Result};
use crate::ratelimit::RateLimiter;

/// Which of the two upcall pipes a message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipeId {
    /// Legacy binary protocol, named after the mechanism (e.g. "krb5").
    V0,
    /// Text protocol, named "gssd".
    V1,
}

/// `pipe_version ∈ {-1, 0, 1}`, `pipe_users`, and the `daemon_running`
/// heuristic (§3). Guarded by its own mutex + condvar, matching the
/// kernel's spinlock + waitqueue pair.
struct Inner {
    version: i32,
    users: u32,
}

pub struct PipeVersionState {
    inner: Mutex<Inner>,
    condvar: Condvar,
    daemon_running: AtomicBool,
    warn_limiter: RateLimiter,
}

impl PipeVersionState {
    fn new() -> Self {
        PipeVersionState {
            inner: Mutex::new(Inner { version: -1, users: 0 }),
            condvar: Condvar::new(),
            daemon_running: AtomicBool::new(true),
            warn_limiter: RateLimiter::new(std::time::Duration::from_secs(15)),
        }
    }

    pub fn global() -> &'static PipeVersionState {
        static STATE: OnceLock<PipeVersionState> = OnceLock::new();
        STATE.get_or_init(PipeVersionState::new)
    }

    /// A userspace daemon has opened a pipe with the given version. Sticky
    /// while any user holds the pipe open (§3).
    pub fn open(&self, version: i32) {
        let mut inner = self.inner.lock().unwrap();
        if inner.users == 0 {
            inner.version = version;
        }
        inner.users += 1;
        self.daemon_running.store(true, Ordering::SeqCst);
        self.condvar.notify_all();
    }

    /// A pipe user has gone away. `pipe_users` dropping to zero resets
    /// `pipe_version` to -1 (§3, §8 boundary behavior).
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.users > 0 {
            inner.users -= 1;
        }
        if inner.users == 0 {
            inner.version = -1;
        }
    }

    pub fn version(&self) -> i32 {
        self.inner.lock().unwrap().version
    }

    fn daemon_running(&self) -> bool {
        self.daemon_running.load(Ordering::SeqCst)
    }

    /// Synchronous wait for a pipe version to appear, bounded by 15s (or
    /// 0.25s when the daemon is already known absent). On timeout, clears
    /// `daemon_running`, warns (rate-limited), and surfaces access-denied
    /// (§4.3 Version acquisition).
    pub fn wait_for_version_blocking(&self, cfg: &crate::config::GssConfig) -> Result<i32> {
        let bound = if self.daemon_running() {
            cfg.pipe_wait_timeout
        } else {
            cfg.pipe_wait_timeout_no_daemon
        };

        let inner = self.inner.lock().unwrap();
        if inner.version >= 0 {
            return Ok(inner.version);
        }
        let (inner, timeout_result) = self
            .condvar
            .wait_timeout_while(inner, bound, |i| i.version < 0)
            .unwrap();

        if inner.version >= 0 {
            return Ok(inner.version);
        }
        drop(inner);

        if timeout_result.timed_out() {
            self.daemon_running.store(false, Ordering::SeqCst);
            if self.warn_limiter.allow() {
                warn!("rpcsec_gss: upcall daemon not running");
            }
        }
        Err(GssError::AccessDenied)
    }

    /// Async equivalent, polled cooperatively rather than parked on a
    /// kernel waitqueue (§9 Design Notes: blocking/callback adapters over
    /// one state machine).
    pub async fn wait_for_version_async(&self, cfg: &crate::config::GssConfig) -> Result<i32> {
        let bound = if self.daemon_running() {
            cfg.pipe_wait_timeout
        } else {
            cfg.pipe_wait_timeout_no_daemon
        };
        let deadline = tokio::time::Instant::now() + bound;
        loop {
            let v = self.version();
            if v >= 0 {
                return Ok(v);
            }
            if tokio::time::Instant::now() >= deadline {
                self.daemon_running.store(false, Ordering::SeqCst);
                if self.warn_limiter.allow() {
                    warn!("rpcsec_gss: upcall daemon not running");
                }
                return Err(GssError::AccessDenied);
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    }
}

/// The pipe filesystem boundary: delivering an encoded upcall request to
/// whatever userspace daemon is listening. The real rpc_pipefs mount, the
/// daemon process, and the kernel VFS glue are all out of scope per §1;
/// this trait is the seam.
pub trait UpcallTransport: Send + Sync {
    fn send(&self, pipe: PipeId, payload: Bytes) -> Result<()>;
}

/// In-process transport backed by a channel, for tests and for embedding
/// without a real gssd. Delivering a payload here simply makes it
/// observable to whatever is draining the corresponding receiver (typically
/// a test daemon double driving [`crate::upcall::UpcallBroker::handle_downcall`]).
pub struct ChannelTransport {
    tx: tokio::sync::mpsc::UnboundedSender<(PipeId, Bytes)>,
}

impl ChannelTransport {
    pub fn new() -> (Self, tokio::sync::mpsc::UnboundedReceiver<(PipeId, Bytes)>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (ChannelTransport { tx }, rx)
    }
}

impl UpcallTransport for ChannelTransport {
    fn send(&self, pipe: PipeId, payload: Bytes) -> Result<()> {
        self.tx
            .send((pipe, payload))
            .map_err(|_| GssError::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "upcall channel closed")))
    }
}

/// Transport backed by a real Unix domain socket, for hosts that bridge the
/// rpc_pipefs-equivalent channel over one rather than mounting a pipe
/// filesystem. Frames as a 1-byte pipe tag (`0` = V0, `1` = V1) followed by
/// a 4-byte big-endian length and the payload; there is no standard wire
/// format for this once it leaves an actual pipe filesystem, so this one is
/// this crate's own.
///
/// `send` is synchronous (the `UpcallTransport` contract), so writes are
/// handed to a background task over an unbounded channel rather than
/// blocking the caller on the socket.
pub struct UnixPipeTransport {
    tx: tokio::sync::mpsc::UnboundedSender<(PipeId, Bytes)>,
}

impl UnixPipeTransport {
    pub async fn connect(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let stream = tokio::net::UnixStream::connect(path).await?;
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(Self::write_loop(stream, rx));
        Ok(UnixPipeTransport { tx })
    }

    async fn write_loop(
        mut stream: tokio::net::UnixStream,
        mut rx: tokio::sync::mpsc::UnboundedReceiver<(PipeId, Bytes)>,
    ) {
        use tokio::io::AsyncWriteExt;
        while let Some((pipe, payload)) = rx.recv().await {
            let tag: u8 = match pipe {
                PipeId::V0 => 0,
                PipeId::V1 => 1,
            };
            let mut frame = Vec::with_capacity(5 + payload.len());
            frame.push(tag);
            frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
            frame.extend_from_slice(&payload);
            if stream.write_all(&frame).await.is_err() {
                warn!("rpcsec_gss: unix pipe transport write failed, closing");
                break;
            }
        }
    }
}

impl UpcallTransport for UnixPipeTransport {
    fn send(&self, pipe: PipeId, payload: Bytes) -> Result<()> {
        self.tx
            .send((pipe, payload))
            .map_err(|_| GssError::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "upcall unix socket closed")))
    }
}

/// Tests elsewhere in the crate that exercise `GssAuth`/`Cred` end to end
/// go through `PipeVersionState::global()`, so they must not run
/// concurrently with each other. Acquire this lock for the duration of any
/// such test.
#[cfg(test)]
pub(crate) fn global_test_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Each test gets its own `PipeVersionState` instance rather than the
    // process-global singleton, since tests run concurrently and would
    // otherwise trample each other's version/users counters.
    fn fresh_state() -> PipeVersionState {
        PipeVersionState::new()
    }

    #[test]
    fn open_sets_version_once_then_counts_users() {
        let state = fresh_state();
        state.open(1);
        assert_eq!(state.version(), 1);
        state.open(0); // a second opener does not change the sticky version
        assert_eq!(state.version(), 1);
    }

    #[test]
    fn users_dropping_to_zero_resets_version() {
        let state = fresh_state();
        state.open(1);
        state.open(1);
        state.close();
        assert_eq!(state.version(), 1);
        state.close();
        assert_eq!(state.version(), -1);
    }

    #[test]
    fn channel_transport_delivers_payload() {
        let (transport, mut rx) = ChannelTransport::new();
        transport.send(PipeId::V1, Bytes::from_static(b"hello")).unwrap();
        let (pipe, payload) = rx.try_recv().unwrap();
        assert_eq!(pipe, PipeId::V1);
        assert_eq!(&payload[..], b"hello");
    }

    #[test]
    fn channel_transport_send_fails_once_receiver_dropped() {
        let (transport, rx) = ChannelTransport::new();
        drop(rx);
        assert!(transport.send(PipeId::V0, Bytes::from_static(b"x")).is_err());
    }
}
