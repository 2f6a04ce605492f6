//! On-the-wire layouts from §6: the RPCSEC_GSS credential/verifier header
//! carried on every outbound call, the reply verifier, and the upcall
//! pipe's request/downcall formats.

use crate::context::Proc;
use crate::error::{GssError, Result};
use crate::mechanism::Service;
use byteorder::{NativeEndian, ReadBytesExt};
use bytes::{BufMut, Bytes, BytesMut};
use std::io::Cursor;

/// RPCSEC_GSS flavor number (RFC 2203).
pub const RPCSEC_GSS: u32 = 6;

const CRED_VERSION: u32 = 1;

fn proc_code(p: Proc) -> u32 {
    match p {
        Proc::Data => 0,
        Proc::Destroy => 3,
    }
}

fn service_code(s: Service) -> u32 {
    match s {
        Service::None => 1,
        Service::Integrity => 2,
        Service::Privacy => 3,
    }
}

fn write_opaque(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

/// Native-endian counterpart of [`write_opaque`], used only for the upcall
/// pipe wire (§6, native order throughout — see [`parse_downcall`]).
fn write_opaque_ne(buf: &mut BytesMut, data: &[u8]) {
    buf.put_slice(&(data.len() as u32).to_ne_bytes());
    buf.put_slice(data);
}

/// Write the credential body: version, proc, seq, service, opaque
/// wire_ctx. Returns the encoded bytes; the caller is responsible for the
/// flavor tag and length prefix that wrap it on the wire (§6).
pub fn encode_credential_body(proc: Proc, seq: u32, service: Service, wire_ctx: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(16 + wire_ctx.len());
    buf.put_u32(CRED_VERSION);
    buf.put_u32(proc_code(proc));
    buf.put_u32(seq);
    buf.put_u32(service_code(service));
    write_opaque(&mut buf, wire_ctx);
    buf.freeze()
}

/// Wrap an opaque field (the verifier, a MIC, or a wire_ctx) with its
/// 4-byte big-endian length prefix.
pub fn encode_opaque(data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + data.len());
    write_opaque(&mut buf, data);
    buf.freeze()
}

/// Big-endian encoding of a request's seqno, the buffer the reply
/// verifier's MIC must cover (§4.4 validate).
pub fn seqno_buf(seq: u32) -> [u8; 4] {
    seq.to_be_bytes()
}

// ---------------------------------------------------------------------
// Upcall pipe requests (§6)
// ---------------------------------------------------------------------

/// v0 (legacy) request: raw 32-bit uid, native byte order. The kernel
/// source uses native order because both ends are always the same host;
/// this crate, also always running on one host, follows suit.
pub fn encode_v0_request(uid: u32) -> [u8; 4] {
    uid.to_ne_bytes()
}

/// v1 text upcall request, capped at 128 bytes total (§6, §8 boundary
/// behavior). Returns `FormatError` if the fully-rendered line would
/// exceed the cap.
pub fn encode_v1_request(
    mech: &str,
    uid: u32,
    target: Option<&str>,
    service: Option<&str>,
    enctypes: Option<&str>,
) -> Result<Vec<u8>> {
    let mut line = format!("mech={mech} uid={uid} ");
    if let Some(t) = target {
        line.push_str(&format!("target={t} "));
    }
    if let Some(s) = service {
        line.push_str(&format!("service={s} "));
    }
    if let Some(e) = enctypes {
        line.push_str(&format!("enctypes={e} "));
    }
    line.push('\n');

    if line.len() > crate::config::V1_PAYLOAD_MAX {
        return Err(GssError::FormatError(format!(
            "v1 upcall payload of {} bytes exceeds {} byte cap",
            line.len(),
            crate::config::V1_PAYLOAD_MAX
        )));
    }
    Ok(line.into_bytes())
}

// ---------------------------------------------------------------------
// Downcall parsing (§6)
// ---------------------------------------------------------------------

/// A downcall that completed with a fresh security context.
pub struct DowncallOk {
    pub uid: u32,
    pub timeout_secs: u32,
    pub window: u32,
    pub wire_ctx: Vec<u8>,
    pub token: Vec<u8>,
}

/// A downcall that completed with an error: `window == 0` followed by a
/// signed errno (§4.3 step 3, §6).
pub struct DowncallErr {
    pub uid: u32,
    pub errno: i32,
}

pub enum Downcall {
    Ok(DowncallOk),
    Err(DowncallErr),
}

fn read_opaque(r: &mut Cursor<&[u8]>, remaining_cap: usize) -> Result<Vec<u8>> {
    let len = r
        .read_u32::<NativeEndian>()
        .map_err(|_| GssError::FormatError("truncated opaque length".into()))? as usize;
    if len > remaining_cap || (r.position() as usize) + len > r.get_ref().len() {
        return Err(GssError::FormatError("opaque field overruns message".into()));
    }
    let start = r.position() as usize;
    let data = r.get_ref()[start..start + len].to_vec();
    r.set_position((start + len) as u64);
    Ok(data)
}

/// Parse a downcall message per §6. The entire message is native byte
/// order, matching the kernel source (`gss_fill_context`/
/// `simple_get_bytes`), which reads the whole buffer via `memcpy` rather
/// than converting individual fields — not just the `uid`, as the matching
/// request-side `encode_v0_request` already assumes. `buf` must be at most
/// [`crate::config::DOWNCALL_MAX`] bytes; trailing bytes beyond the parsed
/// fields are ignored, truncation is a `FormatError`.
pub fn parse_downcall(buf: &[u8]) -> Result<Downcall> {
    if buf.len() > crate::config::DOWNCALL_MAX {
        return Err(GssError::FormatError("downcall exceeds maximum message size".into()));
    }
    let mut r = Cursor::new(buf);

    let uid = r
        .read_u32::<NativeEndian>()
        .map_err(|_| GssError::FormatError("truncated uid".into()))?;
    let timeout = r
        .read_u32::<NativeEndian>()
        .map_err(|_| GssError::FormatError("truncated timeout".into()))?;
    let window = r
        .read_u32::<NativeEndian>()
        .map_err(|_| GssError::FormatError("truncated window".into()))?;

    if window == 0 {
        let errno = r
            .read_i32::<NativeEndian>()
            .map_err(|_| GssError::FormatError("truncated errno".into()))?;
        return Ok(Downcall::Err(DowncallErr { uid, errno }));
    }

    let wire_ctx = read_opaque(&mut r, buf.len())?;
    let token = read_opaque(&mut r, buf.len())?;

    let timeout_secs = if timeout == 0 { 3600 } else { timeout };

    Ok(Downcall::Ok(DowncallOk {
        uid,
        timeout_secs,
        window,
        wire_ctx,
        token,
    }))
}

/// Re-encode a parsed, successful downcall back to its wire form. Used by
/// tests asserting the round-trip law in §8 ("downcall parsing followed by
/// re-encoding of the same logical fields yields the same byte sequence
/// modulo ignored trailing bytes").
pub fn encode_downcall_ok(d: &DowncallOk) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_slice(&d.uid.to_ne_bytes());
    buf.put_slice(&d.timeout_secs.to_ne_bytes());
    buf.put_slice(&d.window.to_ne_bytes());
    write_opaque_ne(&mut buf, &d.wire_ctx);
    write_opaque_ne(&mut buf, &d.token);
    buf.freeze()
}

pub fn encode_downcall_err(d: &DowncallErr) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_slice(&d.uid.to_ne_bytes());
    buf.put_slice(&0u32.to_ne_bytes()); // timeout, unused on the error path
    buf.put_slice(&0u32.to_ne_bytes()); // window == 0 sentinel
    buf.put_slice(&d.errno.to_ne_bytes());
    buf.freeze()
}

/// The distinguished errno the daemon uses to signal key-expired (§4.3).
pub const EKEYEXPIRED: i32 = -127;
