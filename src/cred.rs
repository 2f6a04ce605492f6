//! `Cred`: a per-user authentication record owning at most one current
//! `SecCtx`, the credential cache that owns them, and the refresh/destroy
//! lifecycle described in spec.md §4.2.

use crate::auth::GssAuth;
use crate::context::{Proc, SecCtx};
use crate::error::{GssError, Result};
use crate::mechanism::Service;
use arc_swap::ArcSwapOption;
use bitflags::bitflags;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use tracing::{debug, warn};

bitflags! {
    /// Lifecycle flags from §3. More than one may be set only in the
    /// instant a transition is in progress; steady states are exactly one
    /// of NEW, UPTODATE or NEGATIVE (NEGATIVE may coexist with neither of
    /// the other two once a refresh has failed).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CredFlags: u8 {
        /// Never successfully refreshed.
        const NEW       = 0b001;
        /// `ctx` is installed and believed valid.
        const UPTODATE  = 0b010;
        /// Last refresh failed with "key expired"; retry-cooldown applies.
        const NEGATIVE  = 0b100;
    }
}

/// Cache key: `(uid, principal)`. A machine credential's principal takes
/// precedence over uid for matching purposes (§4.2).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CredKey {
    pub uid: u32,
    pub principal: Option<String>,
}

/// A per-user (or per-principal) RPCSEC_GSS credential.
pub struct Cred {
    pub key: CredKey,
    pub service: Service,
    ctx: ArcSwapOption<SecCtx>,
    flags: Mutex<CredFlags>,
    auth: Arc<GssAuth>,
    upcall_ts: Mutex<Option<Instant>>,
    verf_len: Mutex<usize>,
}

impl Cred {
    pub(crate) fn new(key: CredKey, service: Service, auth: Arc<GssAuth>) -> Arc<Self> {
        Arc::new(Cred {
            key,
            service,
            ctx: ArcSwapOption::from(None),
            flags: Mutex::new(CredFlags::NEW),
            auth,
            upcall_ts: Mutex::new(None),
            verf_len: Mutex::new(0),
        })
    }

    pub fn uid(&self) -> u32 {
        self.key.uid
    }

    pub fn principal(&self) -> Option<&str> {
        self.key.principal.as_deref()
    }

    pub fn flags(&self) -> CredFlags {
        *self.flags.lock().unwrap()
    }

    /// The shared-read guard of §4.1: an owned `Arc<SecCtx>`, or `None` if
    /// no context has ever been installed.
    pub fn context(&self) -> Option<Arc<SecCtx>> {
        self.ctx.load_full()
    }

    /// Publish a freshly established context and mark the credential
    /// UPTODATE, clearing NEW. The store is the NEW -> UPTODATE publication
    /// point from §5: readers either observe the prior state (NEW, and
    /// retry) or a fully initialized context, never a half-built one,
    /// because `SecCtx` is complete before it is ever stored here.
    fn install_context(&self, ctx: Arc<SecCtx>) {
        self.ctx.store(Some(ctx));
        let mut flags = self.flags.lock().unwrap();
        flags.remove(CredFlags::NEW);
        flags.remove(CredFlags::NEGATIVE);
        flags.insert(CredFlags::UPTODATE);
    }

    /// Record the reply verifier length observed by `validate` (§4.4), so
    /// `unwrap`'s INTEGRITY branch can size auth slack off the verifier this
    /// credential is actually seeing rather than a fixed constant alone.
    pub(crate) fn record_verf_len(&self, len: usize) {
        *self.verf_len.lock().unwrap() = len;
    }

    pub(crate) fn verf_len(&self) -> usize {
        *self.verf_len.lock().unwrap()
    }

    /// Clear UPTODATE as an optimistic hint (§5): a subsequent marshal may
    /// still race against an expired context; the server will reject it
    /// and the next `refresh` call will pick up the work.
    pub fn clear_uptodate(&self) {
        self.flags.lock().unwrap().remove(CredFlags::UPTODATE);
    }

    fn mark_negative(&self, now: Instant) {
        let mut flags = self.flags.lock().unwrap();
        flags.remove(CredFlags::NEW);
        flags.remove(CredFlags::UPTODATE);
        flags.insert(CredFlags::NEGATIVE);
        *self.upcall_ts.lock().unwrap() = Some(now);
    }

    fn is_new(&self) -> bool {
        self.flags().contains(CredFlags::NEW)
    }

    fn is_uptodate(&self) -> bool {
        self.flags().contains(CredFlags::UPTODATE)
    }

    fn is_negative(&self) -> bool {
        self.flags().contains(CredFlags::NEGATIVE)
    }

    /// Match rules from §4.2, evaluated against a lookup request.
    fn matches(&self, key: &CredKey, now: Instant) -> bool {
        if self.is_new() {
            // will refresh; matches unconditionally
        } else if let Some(ctx) = self.context() {
            if ctx.is_expired(now) {
                return false;
            }
            if !self.is_uptodate() {
                return false;
            }
        } else if !self.is_uptodate() {
            return false;
        }

        match (&self.key.principal, &key.principal) {
            (Some(a), Some(b)) => a == b,
            (None, None) => self.key.uid == key.uid,
            _ => false,
        }
    }

    /// Test-only shortcut around [`Cred::install_context`] so other
    /// modules' tests can set up an UPTODATE credential without driving a
    /// full upcall round trip.
    #[cfg(test)]
    pub(crate) fn test_install_context(&self, ctx: Arc<SecCtx>) {
        self.install_context(ctx);
    }

    /// Public entry point used by the RPC engine before each call (§4.2).
    pub async fn refresh(self: &Arc<Self>, now: Instant) -> Result<()> {
        if self.is_negative() {
            let ts = *self.upcall_ts.lock().unwrap();
            if let Some(ts) = ts {
                let cooldown = self.auth.config().expired_cred_retry_delay;
                if now < ts + cooldown {
                    return Err(GssError::KeyExpired);
                }
            }
        }

        if !self.is_new() && !self.is_uptodate() {
            // Previously used, now stale: a real RPC engine would swap the
            // task's cred pointer for a fresh lookup here. Since this
            // crate does not own the task's cred pointer, we fall through
            // and drive a fresh upcall directly on this entry, which is
            // semantically equivalent for a reference implementation that
            // does not juggle per-task cred pointers.
            debug!(uid = self.key.uid, "cred stale, renewing in place");
        }

        match self.auth.upcall_broker().obtain_context(&self.auth, self).await {
            Ok(ctx) => {
                self.install_context(ctx);
                Ok(())
            }
            Err(GssError::KeyExpired) => {
                self.mark_negative(now);
                Err(GssError::KeyExpired)
            }
            Err(e) => Err(e),
        }
    }
}

/// Cache of live credentials, matched by `(uid, principal)` per §4.2.
/// Represents the "external cache subsystem with its own lock" spec.md
/// treats as a collaborator (§5); this is the concrete default.
pub struct CredCache {
    entries: RwLock<HashMap<CredKey, Arc<Cred>>>,
}

impl CredCache {
    pub fn new() -> Self {
        CredCache {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Look up or create a credential for `key`, applying the match rules
    /// of §4.2. Matching falls through to creation on a miss.
    pub fn lookup_or_create(&self, key: CredKey, service: Service, auth: &Arc<GssAuth>, now: Instant) -> Arc<Cred> {
        {
            let entries = self.entries.read().unwrap();
            if let Some(cred) = entries.get(&key) {
                if cred.matches(&key, now) {
                    return Arc::clone(cred);
                }
            }
        }

        let mut entries = self.entries.write().unwrap();
        if let Some(cred) = entries.get(&key) {
            if cred.matches(&key, now) {
                return Arc::clone(cred);
            }
        }
        let cred = Cred::new(key.clone(), service, Arc::clone(auth));
        entries.insert(key, Arc::clone(&cred));
        cred
    }

    /// Evict a credential, driving the destroy-context policy of §4.2: a
    /// one-shot `DESTROY` RPC is issued best-effort when the evicted
    /// credential still holds an UPTODATE `DATA` context.
    pub fn evict(&self, key: &CredKey) -> Option<Arc<Cred>> {
        let mut entries = self.entries.write().unwrap();
        entries.remove(key)
    }

    /// Drain every entry, used by `GssAuth::destroy` (§4.4).
    pub fn drain(&self) -> Vec<Arc<Cred>> {
        let mut entries = self.entries.write().unwrap();
        entries.drain().map(|(_, v)| v).collect()
    }
}

impl Default for CredCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn the best-effort DESTROY teardown RPC for `cred`, if it holds an
/// UPTODATE DATA context. Asynchronous and best-effort per §4.2: failures
/// are logged, not propagated, and the cred is freed through the normal
/// `Arc` drop path regardless of outcome.
pub fn spawn_teardown(auth: Arc<GssAuth>, cred: Arc<Cred>) {
    if !cred.is_uptodate() {
        return;
    }
    let Some(ctx) = cred.context() else { return };
    if ctx.proc() != Proc::Data {
        return;
    }

    tokio::spawn(async move {
        match auth.send_destroy_rpc(&cred).await {
            Ok(()) => debug!(uid = cred.key.uid, "destroy-context rpc completed"),
            Err(e) => warn!(uid = cred.key.uid, error = %e, "destroy-context rpc failed"),
        }
    });
}
