//! `GssAuth`: the top-level handle bound to an RPC client and GSS
//! mechanism. Owns the credential cache and dispatches the per-request
//! hooks described in §4.4.

use crate::config::{GssConfig, CRED_SLACK, MAX_AUTH_SIZE, VERF_SLACK};
use crate::context::{Proc, SecCtx};
use crate::cred::{spawn_teardown, Cred, CredCache, CredKey};
use crate::error::{GssError, Result};
use crate::mechanism::{pseudoflavor_to_service, Mechanism, Service};
use crate::pipe::UpcallTransport;
use crate::upcall::UpcallBroker;
use crate::wire;
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::debug;

/// Minimal stand-in for the embedding RPC client. The real task scheduler,
/// wait queues and transport are out of scope (§1); this only exists so
/// `GssAuth` can hold the non-owning back-reference spec.md's cyclic
/// ownership note (§9) calls for.
pub trait RpcClientHandle: Send + Sync {
    /// The target service principal name calls through this client
    /// authenticate to (e.g. `"nfs@fileserver.example.com"`).
    fn target_principal(&self) -> String;
}

/// Output of [`GssAuth::marshal`]: the encoded credential + verifier
/// section, ready to be appended after the embedder's own RPC header, and
/// the sequence number assigned to this call (needed again by `wrap`).
pub struct MarshalOutput {
    pub header: Bytes,
    pub seq: u32,
}

/// Output of [`GssAuth::validate`]: whether the reply verifier checked out,
/// plus the verifier length `unwrap` needs to size its own auth slack.
pub struct ValidateOutput {
    pub verf_len: usize,
}

/// Output of [`GssAuth::unwrap`]: the decoded body plus the auth slack the
/// upper layer should reserve when sizing its receive buffers for the next
/// call on this credential (§4.4).
pub struct UnwrapOutput {
    pub body: Bytes,
    pub slack: usize,
}

pub struct GssAuth {
    mechanism: Arc<dyn Mechanism>,
    service: Service,
    client: Weak<dyn RpcClientHandle>,
    broker: UpcallBroker,
    cache: CredCache,
    config: GssConfig,
}

impl GssAuth {
    /// `create(client, pseudoflavor)` from §4.4: resolve the pseudoflavor,
    /// initialize the credential cache, and wire up the upcall broker.
    /// The real kernel allocates the v1-then-v0 pipes in that order so a
    /// racing reader never observes a directory advertising only v0
    /// support; our pipes are encoded purely in the upcall payload rather
    /// than as directory entries, so no such race exists here, but the
    /// broker still keeps the two tables distinct to mirror the source's
    /// structure.
    pub fn create(
        client: Weak<dyn RpcClientHandle>,
        pseudoflavor: u32,
        mechanism: Arc<dyn Mechanism>,
        transport: Arc<dyn UpcallTransport>,
        config: GssConfig,
    ) -> Result<Arc<Self>> {
        let (_mech_name, service) =
            pseudoflavor_to_service(pseudoflavor).ok_or(GssError::UnknownPseudoflavor(pseudoflavor))?;

        Ok(Arc::new(GssAuth {
            mechanism,
            service,
            client,
            broker: UpcallBroker::new(transport, config.clone()),
            cache: CredCache::new(),
            config,
        }))
    }

    pub fn mechanism(&self) -> &Arc<dyn Mechanism> {
        &self.mechanism
    }

    pub fn upcall_broker(&self) -> &UpcallBroker {
        &self.broker
    }

    pub fn config(&self) -> &GssConfig {
        &self.config
    }

    pub fn target_name(&self) -> String {
        self.client
            .upgrade()
            .map(|c| c.target_principal())
            .unwrap_or_else(|| "unknown@unknown".to_string())
    }

    /// Look up or create the credential for `uid`/`principal`, as the RPC
    /// engine would before issuing a call (§4.2).
    pub fn lookup_cred(self: &Arc<Self>, uid: u32, principal: Option<String>) -> Arc<Cred> {
        let key = CredKey { uid, principal };
        self.cache.lookup_or_create(key, self.service, self, Instant::now())
    }

    /// `destroy`: empty the cache, driving per-cred destruction (possibly
    /// including destroy-context RPCs), then unlink pipes (handled by the
    /// transport's own lifecycle) and drop the mechanism reference. Must be
    /// called explicitly — it is what breaks the `Cred -> Arc<GssAuth>`
    /// back-reference that would otherwise keep this value alive forever,
    /// mirroring the kernel's explicit cache-purge-then-kref-put sequence
    /// (§9 Design Notes).
    pub fn destroy(self: &Arc<Self>) {
        for cred in self.cache.drain() {
            spawn_teardown(Arc::clone(self), cred);
        }
    }

    /// Best-effort, asynchronous NULL `DESTROY` RPC (§4.2 Destruction
    /// policy). The real RPC transport is out of scope (§1); this builds
    /// and logs the degenerate destroy credential body that such a call
    /// would carry.
    pub async fn send_destroy_rpc(&self, cred: &Arc<Cred>) -> Result<()> {
        let Some(ctx) = cred.context() else {
            return Ok(());
        };
        let seq = ctx.next_seq();
        let body = wire::encode_credential_body(Proc::Destroy, seq, cred.service, ctx.wire_ctx());
        debug!(uid = cred.uid(), bytes = body.len(), "rpcsec_gss: sending destroy-context null rpc");
        Ok(())
    }

    // -------------------------------------------------------------
    // Per-request hooks (§4.4)
    // -------------------------------------------------------------

    /// Write the RPCSEC_GSS credential and verifier. `prefix` is
    /// everything the embedder has already written for this call, from the
    /// RPC xid through the end of the procedure header, excluding the
    /// transport framing — the MIC covers `prefix` plus the credential
    /// section (§4.4, §6).
    pub fn marshal(&self, cred: &Arc<Cred>, prefix: &[u8]) -> Result<MarshalOutput> {
        let ctx = cred.context().ok_or(GssError::AccessDenied)?;

        let seq = ctx.next_seq();
        let body = wire::encode_credential_body(ctx.proc(), seq, cred.service, ctx.wire_ctx());

        let mut header = BytesMut::with_capacity(8 + body.len());
        header.put_u32(wire::RPCSEC_GSS);
        header.put_u32(body.len() as u32);
        header.put_slice(&body);

        let mut mic_input = BytesMut::with_capacity(prefix.len() + header.len());
        mic_input.put_slice(prefix);
        mic_input.put_slice(&header);

        let mic = match ctx.with_mech(|m| m.get_mic(&mic_input)) {
            crate::mechanism::MicOutcome::Ok(mic) => mic,
            crate::mechanism::MicOutcome::ContextExpired => {
                // §4.4, §8 scenario 4: context-expired does not abort the
                // call — clear UPTODATE and send with whatever MIC is
                // available so the server can reject it; only other MIC
                // errors abort marshalling.
                cred.clear_uptodate();
                Vec::new()
            }
            crate::mechanism::MicOutcome::Err(e) => return Err(e),
        };

        header.put_u32(wire::RPCSEC_GSS);
        header.put_slice(&wire::encode_opaque(&mic));

        Ok(MarshalOutput {
            header: header.freeze(),
            seq,
        })
    }

    /// Validate the reply verifier against the request's seqno (§4.4).
    /// Records the verifier length on `cred` so `unwrap` can size slack.
    pub fn validate(
        &self,
        cred: &Arc<Cred>,
        request_seq: u32,
        reply_flavor: u32,
        reply_mic: &[u8],
    ) -> Result<ValidateOutput> {
        if reply_flavor != wire::RPCSEC_GSS {
            return Err(GssError::FormatError("reply verifier flavor is not RPCSEC_GSS".into()));
        }
        if reply_mic.len() > MAX_AUTH_SIZE {
            return Err(GssError::FormatError("reply verifier exceeds maximum auth size".into()));
        }
        let ctx = cred.context().ok_or(GssError::AccessDenied)?;
        let covered = wire::seqno_buf(request_seq);

        match ctx.with_mech(|m| m.verify_mic(&covered, reply_mic)) {
            crate::mechanism::MicOutcome::Ok(()) => {
                cred.record_verf_len(reply_mic.len());
                Ok(ValidateOutput {
                    verf_len: reply_mic.len(),
                })
            }
            crate::mechanism::MicOutcome::ContextExpired => {
                cred.clear_uptodate();
                Err(GssError::ContextExpired)
            }
            crate::mechanism::MicOutcome::Err(e) => Err(e),
        }
    }

    /// Apply integrity or privacy protection to an outbound call body
    /// (§4.4). `seq` is the sequence number `marshal` assigned to this
    /// call.
    pub fn wrap(&self, cred: &Arc<Cred>, seq: u32, body: &[u8]) -> Result<Bytes> {
        let ctx = cred.context().ok_or(GssError::AccessDenied)?;
        if cred.service == Service::None || ctx.proc() == Proc::Destroy {
            return Ok(Bytes::copy_from_slice(body));
        }

        let mut covered = BytesMut::with_capacity(4 + body.len());
        covered.put_slice(&wire::seqno_buf(seq));
        covered.put_slice(body);

        match cred.service {
            Service::None => unreachable!(),
            Service::Integrity => {
                let mic = match ctx.with_mech(|m| m.get_mic(&covered)) {
                    crate::mechanism::MicOutcome::Ok(mic) => mic,
                    crate::mechanism::MicOutcome::ContextExpired => {
                        // §4.4, §7, §9 Open Question: clears UPTODATE but
                        // does not fail the send — the payload already
                        // written is treated as committed.
                        cred.clear_uptodate();
                        Vec::new()
                    }
                    crate::mechanism::MicOutcome::Err(e) => return Err(e),
                };
                Ok(frame_integrity(&covered, &mic))
            }
            Service::Privacy => {
                let ciphertext = match ctx.with_mech(|m| m.wrap(true, &covered)) {
                    crate::mechanism::MicOutcome::Ok(ct) => ct,
                    crate::mechanism::MicOutcome::ContextExpired => {
                        cred.clear_uptodate();
                        Vec::new()
                    }
                    crate::mechanism::MicOutcome::Err(e) => return Err(e),
                };
                Ok(frame_privacy(&ciphertext))
            }
        }
    }

    /// Inverse of [`GssAuth::wrap`] for an inbound reply (§4.4).
    pub fn unwrap(&self, cred: &Arc<Cred>, seq: u32, buf: &[u8]) -> Result<UnwrapOutput> {
        let ctx = cred.context().ok_or(GssError::AccessDenied)?;
        if cred.service == Service::None || ctx.proc() == Proc::Destroy {
            return Ok(UnwrapOutput {
                body: Bytes::copy_from_slice(buf),
                slack: CRED_SLACK,
            });
        }

        match cred.service {
            Service::None => unreachable!(),
            Service::Integrity => {
                let (length, rest) = read_len(buf)?;
                if length % 4 != 0 {
                    return Err(GssError::FormatError("integrity length not 4-byte aligned".into()));
                }
                if length as usize > rest.len() {
                    return Err(GssError::FormatError("integrity length overruns receive buffer".into()));
                }
                let covered = &rest[..length as usize];
                if covered.len() < 4 {
                    return Err(GssError::FormatError("integrity frame missing seqno".into()));
                }
                let embedded_seq = u32::from_be_bytes(covered[0..4].try_into().unwrap());
                if embedded_seq != seq {
                    return Err(GssError::FormatError("seqno mismatch in integrity reply".into()));
                }
                let mic_field = &rest[length as usize..];
                let (mic_len, mic_rest) = read_len(mic_field)?;
                if mic_len as usize > mic_rest.len() {
                    return Err(GssError::FormatError("mic field overruns receive buffer".into()));
                }
                let mic = &mic_rest[..mic_len as usize];
                match ctx.with_mech(|m| m.verify_mic(covered, mic)) {
                    crate::mechanism::MicOutcome::Ok(()) => {}
                    crate::mechanism::MicOutcome::ContextExpired => {
                        cred.clear_uptodate();
                        return Err(GssError::ContextExpired);
                    }
                    crate::mechanism::MicOutcome::Err(e) => return Err(e),
                }
                // §4.4: recompute auth slack off the verifier length
                // `validate` last recorded for this credential, floored at
                // the default VERF_SLACK so a credential that hasn't seen a
                // reply yet still gets a sane buffer hint.
                let slack = CRED_SLACK + cred.verf_len().max(VERF_SLACK);
                Ok(UnwrapOutput {
                    body: Bytes::copy_from_slice(&covered[4..]),
                    slack,
                })
            }
            Service::Privacy => {
                let (length, rest) = read_len(buf)?;
                if length as usize > rest.len() {
                    return Err(GssError::FormatError("privacy length overruns receive buffer".into()));
                }
                let ciphertext = &rest[..length as usize];
                let plaintext = match ctx.with_mech(|m| m.unwrap(ciphertext)) {
                    crate::mechanism::MicOutcome::Ok(pt) => pt,
                    crate::mechanism::MicOutcome::ContextExpired => {
                        cred.clear_uptodate();
                        return Err(GssError::ContextExpired);
                    }
                    crate::mechanism::MicOutcome::Err(e) => return Err(e),
                };
                if plaintext.len() < 4 {
                    return Err(GssError::FormatError("privacy frame missing seqno".into()));
                }
                let embedded_seq = u32::from_be_bytes(plaintext[0..4].try_into().unwrap());
                if embedded_seq != seq {
                    return Err(GssError::FormatError("seqno mismatch in privacy reply".into()));
                }
                Ok(UnwrapOutput {
                    body: Bytes::copy_from_slice(&plaintext[4..]),
                    slack: CRED_SLACK,
                })
            }
        }
    }
}

fn read_len(buf: &[u8]) -> Result<(u32, &[u8])> {
    if buf.len() < 4 {
        return Err(GssError::FormatError("truncated length field".into()));
    }
    let len = u32::from_be_bytes(buf[0..4].try_into().unwrap());
    Ok((len, &buf[4..]))
}

fn frame_integrity(covered: &[u8], mic: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(4 + covered.len() + 4 + mic.len());
    out.put_u32(covered.len() as u32);
    out.put_slice(covered);
    out.put_slice(&wire::encode_opaque(mic));
    out.freeze()
}

fn frame_privacy(ciphertext: &[u8]) -> Bytes {
    let pad = (4 - (ciphertext.len() % 4)) % 4;
    let mut out = BytesMut::with_capacity(4 + ciphertext.len() + pad);
    out.put_u32(ciphertext.len() as u32);
    out.put_slice(ciphertext);
    out.put_bytes(0, pad);
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cred::tests_support::NullClient;
    use crate::mechanism::{InMemoryMechanism, KrbMechanism, Mechanism};
    use crate::pipe::ChannelTransport;

    fn auth_with(service_pseudoflavor: u32) -> Arc<GssAuth> {
        let (transport, _rx) = ChannelTransport::new();
        let client: Weak<dyn RpcClientHandle> = Weak::<NullClient>::new();
        GssAuth::create(
            client,
            service_pseudoflavor,
            Arc::new(InMemoryMechanism::new()),
            Arc::new(transport),
            GssConfig::default(),
        )
        .unwrap()
    }

    fn cred_with_context(auth: &Arc<GssAuth>) -> Arc<Cred> {
        let mech = InMemoryMechanism::new();
        let mech_ctx = mech.import_sec_context("x", b"\x0ckey").unwrap();
        let ctx = Arc::new(SecCtx::new(
            mech_ctx,
            b"wirectx".to_vec(),
            Instant::now() + std::time::Duration::from_secs(60),
            128,
        ));
        let cred = auth.lookup_cred(1000, None);
        cred.test_install_context(ctx);
        cred
    }

    #[test]
    fn create_rejects_unknown_pseudoflavor() {
        let (transport, _rx) = ChannelTransport::new();
        let client: Weak<dyn RpcClientHandle> = Weak::<NullClient>::new();
        let err = GssAuth::create(
            client,
            1,
            Arc::new(KrbMechanism::new()),
            Arc::new(transport),
            GssConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, GssError::UnknownPseudoflavor(1)));
    }

    #[test]
    fn marshal_produces_increasing_seq_and_rpcsec_gss_flavor() {
        let auth = auth_with(390_004);
        let cred = cred_with_context(&auth);
        let first = auth.marshal(&cred, b"prefix").unwrap();
        let second = auth.marshal(&cred, b"prefix").unwrap();
        assert!(second.seq > first.seq);
        assert_eq!(&first.header[0..4], &wire::RPCSEC_GSS.to_be_bytes());
    }

    #[test]
    fn marshal_without_context_is_access_denied() {
        let auth = auth_with(390_004);
        let cred = auth.lookup_cred(1000, None);
        assert!(matches!(auth.marshal(&cred, b"prefix"), Err(GssError::AccessDenied)));
    }

    #[test]
    fn wrap_unwrap_round_trip_integrity() {
        let auth = auth_with(390_004); // krb5i
        let cred = cred_with_context(&auth);
        let seq = 7;
        let body = b"procedure arguments go here";
        let framed = auth.wrap(&cred, seq, body).unwrap();
        let unwrapped = auth.unwrap(&cred, seq, &framed).unwrap();
        assert_eq!(&unwrapped.body[..], body);
    }

    #[test]
    fn wrap_unwrap_round_trip_privacy() {
        let auth = auth_with(390_005); // krb5p
        let cred = cred_with_context(&auth);
        let seq = 11;
        let body = b"sensitive procedure arguments";
        let framed = auth.wrap(&cred, seq, body).unwrap();
        let ciphertext_len = u32::from_be_bytes(framed[0..4].try_into().unwrap()) as usize;
        let ciphertext = &framed[4..4 + ciphertext_len];
        assert_ne!(ciphertext, body, "privacy framing must not leak plaintext verbatim");
        let unwrapped = auth.unwrap(&cred, seq, &framed).unwrap();
        assert_eq!(&unwrapped.body[..], body);
    }

    #[test]
    fn unwrap_rejects_seqno_mismatch() {
        let auth = auth_with(390_004);
        let cred = cred_with_context(&auth);
        let framed = auth.wrap(&cred, 1, b"body").unwrap();
        let err = auth.unwrap(&cred, 2, &framed).unwrap_err();
        assert!(matches!(err, GssError::FormatError(_)));
    }

    #[test]
    fn service_none_passes_body_through_unchanged() {
        let auth = auth_with(390_003); // krb5, no protection
        let cred = cred_with_context(&auth);
        let body = b"plain body";
        let framed = auth.wrap(&cred, 1, body).unwrap();
        assert_eq!(&framed[..], &body[..]);
        let unwrapped = auth.unwrap(&cred, 1, &framed).unwrap();
        assert_eq!(&unwrapped.body[..], &body[..]);
    }

    #[test]
    fn validate_records_verf_len_for_unwrap_slack() {
        let auth = auth_with(390_004);
        let cred = cred_with_context(&auth);
        let ctx = cred.context().unwrap();
        let mic = match ctx.with_mech(|m| m.get_mic(&wire::seqno_buf(5))) {
            crate::mechanism::MicOutcome::Ok(mic) => mic,
            _ => panic!("expected a mic"),
        };
        let out = auth.validate(&cred, 5, wire::RPCSEC_GSS, &mic).unwrap();
        assert_eq!(out.verf_len, mic.len());

        let framed = auth.wrap(&cred, 1, b"body").unwrap();
        let unwrapped = auth.unwrap(&cred, 1, &framed).unwrap();
        assert!(unwrapped.slack >= crate::config::VERF_SLACK);
    }

    /// §8: any in-transit single-bit corruption of ciphertext, MIC, or
    /// sequence field is detected. Flip every bit within `[0, meaningful_len)`
    /// of `wrap`'s output in turn and assert `unwrap` rejects it.
    /// `meaningful_len` excludes the privacy frame's trailing 4-byte-align
    /// padding, which carries no covered data and so is exempt from the law.
    fn assert_every_bit_flip_detected(auth: &Arc<GssAuth>, cred: &Arc<Cred>, seq: u32, framed: &[u8], meaningful_len: usize) {
        for byte_idx in 0..meaningful_len {
            for bit in 0..8u8 {
                let mut corrupted = framed.to_vec();
                corrupted[byte_idx] ^= 1 << bit;
                if corrupted == framed {
                    continue;
                }
                let result = auth.unwrap(cred, seq, &corrupted);
                assert!(
                    result.is_err(),
                    "corrupting byte {byte_idx} bit {bit} went undetected"
                );
            }
        }
    }

    #[test]
    fn integrity_detects_any_single_bit_wire_corruption() {
        let auth = auth_with(390_004); // krb5i
        let cred = cred_with_context(&auth);
        let seq = 9;
        let framed = auth.wrap(&cred, seq, b"corruption probe payload").unwrap();
        let meaningful_len = framed.len();
        assert_every_bit_flip_detected(&auth, &cred, seq, &framed, meaningful_len);
    }

    #[test]
    fn privacy_detects_any_single_bit_wire_corruption() {
        let auth = auth_with(390_005); // krb5p
        let cred = cred_with_context(&auth);
        let seq = 13;
        let framed = auth.wrap(&cred, seq, b"corruption probe payload").unwrap();
        let ciphertext_len = u32::from_be_bytes(framed[0..4].try_into().unwrap()) as usize;
        let meaningful_len = 4 + ciphertext_len;
        assert_every_bit_flip_detected(&auth, &cred, seq, &framed, meaningful_len);
    }
}
