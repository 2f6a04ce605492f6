//! `SecCtx`: the immutable (save for `seq`), reference-counted security
//! context installed on a credential once context establishment succeeds.

use crate::mechanism::MechContext;
use std::sync::Mutex;
use std::time::Instant;

/// Which operation this context is used for. A context is allocated for
/// DATA use; a degenerate DESTROY context is swapped in only for the
/// one-shot teardown call (§4.2 Destruction policy, §9 Design Notes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proc {
    Data,
    Destroy,
}

/// A shared, reference-counted security context.
///
/// Every field other than `seq` is fixed at construction time (the
/// invariant from §4.1). `seq` advances under its own lock so that
/// `marshal` calls racing across threads still produce strictly
/// increasing, unique sequence numbers — the seq-lock is the
/// linearization point called out in §5.
///
/// Deferred reclamation (§4.1, §9): callers never hold a raw pointer to a
/// `SecCtx`. They always hold an `Arc<SecCtx>` obtained by loading the
/// `ArcSwapOption` published on the owning [`crate::cred::Cred`]. Because
/// every reader holds its own strong reference, the context is only
/// actually freed once the last such `Arc` (including the one published on
/// the credential, if it has since been replaced) is dropped — this *is*
/// the grace period; no separate epoch mechanism is needed on top of it.
pub struct SecCtx {
    mech_ctx: Mutex<MechContext>,
    wire_ctx: Vec<u8>,
    seq: Mutex<u32>,
    expiry: Instant,
    window: u32,
    proc: Proc,
}

impl SecCtx {
    /// Construct a freshly established context. `seq` starts at 1 because
    /// some server implementations reject sequence number 0.
    pub fn new(mech_ctx: MechContext, wire_ctx: Vec<u8>, expiry: Instant, window: u32) -> Self {
        SecCtx {
            mech_ctx: Mutex::new(mech_ctx),
            wire_ctx,
            seq: Mutex::new(1),
            expiry,
            window,
            proc: Proc::Data,
        }
    }

    /// Build the degenerate "destroy" context that shares the same mechanism
    /// context and wire handle as `self` but carries `proc = DESTROY`, used
    /// so the teardown RPC can be marshaled with the cred's own operation
    /// table without recursing back into `refresh` (§4.2 Destruction
    /// policy). Since `MechContext` cannot be cloned (it owns a live GSS
    /// handle), the destroy path takes the original context's reference
    /// rather than copying it; callers must not use `self` for further
    /// `DATA` traffic afterwards.
    pub fn proc(&self) -> Proc {
        self.proc
    }

    pub fn with_proc(wire_ctx: Vec<u8>, expiry: Instant, window: u32, mech_ctx: MechContext, proc: Proc) -> Self {
        SecCtx {
            mech_ctx: Mutex::new(mech_ctx),
            wire_ctx,
            seq: Mutex::new(1),
            expiry,
            window,
            proc,
        }
    }

    pub fn wire_ctx(&self) -> &[u8] {
        &self.wire_ctx
    }

    pub fn window(&self) -> u32 {
        self.window
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now > self.expiry
    }

    pub fn expiry(&self) -> Instant {
        self.expiry
    }

    /// Allocate the next sequence number for an outbound call. Advances
    /// under the seq-lock; the returned value is globally unique and
    /// strictly greater than every value returned before it for this
    /// context (§5, §8 invariant).
    pub fn next_seq(&self) -> u32 {
        let mut seq = self.seq.lock().unwrap();
        let this = *seq;
        *seq = seq.wrapping_add(1);
        this
    }

    /// Run a closure against the mechanism context under its lock. All MIC
    /// and wrap/unwrap operations go through here so that a single
    /// `SecCtx` can be shared by concurrent marshal/validate/wrap/unwrap
    /// calls without the mechanism handle itself needing to be `Sync`.
    pub fn with_mech<R>(&self, f: impl FnOnce(&mut MechContext) -> R) -> R {
        let mut guard = self.mech_ctx.lock().unwrap();
        f(&mut guard)
    }
}

impl std::fmt::Debug for SecCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecCtx")
            .field("wire_ctx_len", &self.wire_ctx.len())
            .field("window", &self.window)
            .field("proc", &self.proc)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mechanism::{InMemoryMechanism, Mechanism};
    use std::time::Duration;

    fn ctx() -> SecCtx {
        let mech = InMemoryMechanism::new();
        let mech_ctx = mech.import_sec_context("x", b"\x01tok").unwrap();
        SecCtx::new(mech_ctx, b"wirectx".to_vec(), Instant::now() + Duration::from_secs(60), 128)
    }

    #[test]
    fn next_seq_is_strictly_increasing() {
        let c = ctx();
        let mut prev = c.next_seq();
        for _ in 0..100 {
            let next = c.next_seq();
            assert!(next > prev, "sequence numbers must be strictly increasing");
            prev = next;
        }
    }

    #[test]
    fn seq_starts_at_one() {
        let c = ctx();
        assert_eq!(c.next_seq(), 1);
    }

    #[test]
    fn expiry_is_respected() {
        let mech = InMemoryMechanism::new();
        let mech_ctx = mech.import_sec_context("x", b"\x01tok").unwrap();
        let past = SecCtx::new(mech_ctx, Vec::new(), Instant::now() - Duration::from_secs(1), 1);
        assert!(past.is_expired(Instant::now()));
    }
}
