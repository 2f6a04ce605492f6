//! End-to-end scenarios wiring `GssAuth` over the in-process channel
//! transport with a small task standing in for the upcall daemon, matching
//! the scenarios named in spec.md's testable properties section.
//!
//! Each `#[tokio::test]` here runs in its own process-level test binary
//! separate from the crate's own unit tests, so touching
//! `PipeVersionState::global()` is safe without cross-crate coordination;
//! within this file, only one test does so.

use bytes::{BufMut, Bytes, BytesMut};
use rpcsec_gss::pipe::{ChannelTransport, PipeId, PipeVersionState};
use rpcsec_gss::{GssAuth, GssConfig, GssError, InMemoryMechanism, RpcClientHandle};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Instant;

/// `PipeVersionState::global()` is one process-wide singleton; the test
/// harness runs the functions in this file concurrently on separate
/// threads, so anything touching it must be serialized.
fn pipe_state_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

struct NullClient;
impl RpcClientHandle for NullClient {
    fn target_principal(&self) -> String {
        "nfs@fileserver.example.com".to_string()
    }
}

fn fake_downcall_ok(uid: u32) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_slice(&uid.to_ne_bytes());
    buf.put_slice(&3600u32.to_ne_bytes());
    buf.put_slice(&128u32.to_ne_bytes());
    let wire_ctx = b"12345678"; // 8 opaque bytes, per scenario 1
    buf.put_slice(&(wire_ctx.len() as u32).to_ne_bytes());
    buf.put_slice(wire_ctx);
    let token = b"\x2avalid-token";
    buf.put_slice(&(token.len() as u32).to_ne_bytes());
    buf.put_slice(token);
    buf.freeze()
}

fn new_auth(pseudoflavor: u32) -> (
    Arc<GssAuth>,
    tokio::sync::mpsc::UnboundedReceiver<(PipeId, Bytes)>,
) {
    let (transport, rx) = ChannelTransport::new();
    let client: Weak<dyn RpcClientHandle> = Weak::<NullClient>::new();
    let auth = GssAuth::create(
        client,
        pseudoflavor,
        Arc::new(InMemoryMechanism::new()),
        Arc::new(transport),
        GssConfig::default(),
    )
    .unwrap();
    (auth, rx)
}

#[tokio::test]
async fn cold_start_then_first_call_marshals_with_seq_one() {
    let _guard = pipe_state_lock().lock().unwrap();
    while PipeVersionState::global().version() >= 0 {
        PipeVersionState::global().close();
    }

    let (auth, mut inbound) = new_auth(390_004); // krb5i
    let cred = auth.lookup_cred(1000, None);

    // Before the daemon has opened a pipe, refresh fails fast.
    let early = cred.refresh(Instant::now()).await;
    assert!(matches!(early, Err(GssError::RetrySoon)));

    // Daemon "starts": opens the v1 pipe and answers the next request.
    PipeVersionState::global().open(1);
    let auth_for_daemon = Arc::clone(&auth);
    let daemon = tokio::spawn(async move {
        let (pipe, _payload) = inbound.recv().await.unwrap();
        assert_eq!(pipe, PipeId::V1);
        auth_for_daemon
            .upcall_broker()
            .handle_downcall(&auth_for_daemon, pipe, &fake_downcall_ok(1000));
    });

    cred.refresh(Instant::now()).await.unwrap();
    daemon.await.unwrap();

    let marshaled = auth.marshal(&cred, b"call-prefix").unwrap();
    assert_eq!(marshaled.seq, 1);

    PipeVersionState::global().close();
}

async fn established_cred(auth: &Arc<GssAuth>, mut inbound: tokio::sync::mpsc::UnboundedReceiver<(PipeId, Bytes)>, uid: u32) -> Arc<rpcsec_gss::Cred> {
    let cred = auth.lookup_cred(uid, None);
    let auth_for_daemon = Arc::clone(auth);
    let daemon = tokio::spawn(async move {
        let (pipe, _payload) = inbound.recv().await.unwrap();
        auth_for_daemon
            .upcall_broker()
            .handle_downcall(&auth_for_daemon, pipe, &fake_downcall_ok(uid));
    });
    cred.refresh(Instant::now()).await.unwrap();
    daemon.await.unwrap();
    cred
}

#[tokio::test]
async fn privacy_frame_is_four_byte_aligned_with_correct_padding() {
    let _guard = pipe_state_lock().lock().unwrap();
    PipeVersionState::global().open(1);
    let (auth, inbound) = new_auth(390_005); // krb5p
    let cred = established_cred(&auth, inbound, 2000).await;

    // A body spanning more than one page, per scenario 6.
    let body = vec![0x42u8; 9000];
    let framed = auth.wrap(&cred, 1, &body).unwrap();
    assert_eq!(framed.len() % 4, 0, "final payload must be 4-byte aligned");

    let unwrapped = auth.unwrap(&cred, 1, &framed).unwrap();
    assert_eq!(&unwrapped.body[..], &body[..]);
    PipeVersionState::global().close();
}

#[tokio::test]
async fn integrity_round_trip_matches_scenario_five() {
    let _guard = pipe_state_lock().lock().unwrap();
    PipeVersionState::global().open(1);
    let (auth, inbound) = new_auth(390_004); // krb5i
    let cred = established_cred(&auth, inbound, 3000).await;

    let body = vec![0x7au8; 17];
    let framed = auth.wrap(&cred, 1, &body).unwrap();
    let covered_len = u32::from_be_bytes(framed[0..4].try_into().unwrap());
    assert_eq!(covered_len, 4 + 17);

    let unwrapped = auth.unwrap(&cred, 1, &framed).unwrap();
    assert_eq!(unwrapped.body.len(), 17);
    assert_eq!(&unwrapped.body[..], &body[..]);
    PipeVersionState::global().close();
}
