//! Demonstrates wiring a `GssAuth` over the in-process channel transport,
//! with a small loop standing in for the real `rpc.gssd` daemon.

use bytes::Bytes;
use rpcsec_gss::pipe::{ChannelTransport, PipeId, PipeVersionState};
use rpcsec_gss::{GssAuth, GssConfig, KrbMechanism, RpcClientHandle};
use std::sync::{Arc, Weak};

struct StaticClient;

impl RpcClientHandle for StaticClient {
    fn target_principal(&self) -> String {
        "nfs@fileserver.example.com".to_string()
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::try_init().ok();

    let (transport, mut inbound) = ChannelTransport::new();
    let transport = Arc::new(transport);

    let client: Weak<dyn RpcClientHandle> = Weak::<StaticClient>::new();
    let auth = GssAuth::create(
        client,
        390_004, // krb5i
        Arc::new(KrbMechanism::new()),
        transport,
        GssConfig::default(),
    )
    .expect("known pseudoflavor");

    // Stand in for rpc.gssd: once it "starts", it opens the v1 pipe and
    // answers every request with a fixed (fake) downcall.
    let auth_for_daemon = Arc::clone(&auth);
    tokio::spawn(async move {
        PipeVersionState::global().open(1);
        while let Some((pipe, _payload)) = inbound.recv().await {
            let downcall = fake_downcall(1000);
            auth_for_daemon.upcall_broker().handle_downcall(&auth_for_daemon, pipe, &downcall);
        }
    });

    let cred = auth.lookup_cred(1000, None);
    // First attempt races the daemon startup above; a real RPC engine
    // would retry on `RetrySoon` until the daemon opens its pipe.
    loop {
        match cred.refresh(std::time::Instant::now()).await {
            Ok(()) => break,
            Err(rpcsec_gss::GssError::RetrySoon) => {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
            Err(e) => panic!("refresh failed: {e}"),
        }
    }

    let marshaled = auth.marshal(&cred, b"fake-rpc-prefix").expect("marshal");
    println!("marshaled {} bytes, seq={}", marshaled.header.len(), marshaled.seq);
}

fn fake_downcall(uid: u32) -> Bytes {
    use bytes::BufMut;
    let mut buf = bytes::BytesMut::new();
    buf.put_slice(&uid.to_ne_bytes());
    buf.put_slice(&3600u32.to_ne_bytes()); // timeout
    buf.put_slice(&128u32.to_ne_bytes()); // window
    let wire_ctx = b"wirectx1";
    buf.put_slice(&(wire_ctx.len() as u32).to_ne_bytes());
    buf.put_slice(wire_ctx);
    let token = b"fake-accept-token";
    buf.put_slice(&(token.len() as u32).to_ne_bytes());
    buf.put_slice(token);
    buf.freeze()
}
