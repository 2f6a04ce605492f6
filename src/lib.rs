//! Client-side RPCSEC_GSS.
//!
//! This crate attaches per-request GSS-API authentication headers,
//! verifiers, and optional integrity or privacy protection to outgoing ONC
//! RPC messages, and validates and unwraps the corresponding fields on
//! inbound replies. Context establishment is brokered through an
//! [`UpcallTransport`](pipe::UpcallTransport) standing in for the
//! kernel-to-userspace pipe a real `rpc.gssd` listens on.
//!
//! The four cooperating components (see `SPEC_FULL.md` for the full
//! design):
//!
//! - [`context::SecCtx`] — the shared, reference-counted security context.
//! - [`cred::Cred`] / [`cred::CredCache`] — per-user credential lifecycle.
//! - [`upcall::UpcallBroker`] — upcall deduplication and downcall parsing.
//! - [`auth::GssAuth`] — the per-request marshal/validate/wrap/unwrap hooks.

pub mod auth;
pub mod config;
pub mod context;
pub mod cred;
pub mod error;
pub mod mechanism;
pub mod pipe;
mod ratelimit;
pub mod upcall;
pub mod wire;

pub use auth::{GssAuth, MarshalOutput, RpcClientHandle, UnwrapOutput, ValidateOutput};
pub use config::GssConfig;
pub use context::{Proc, SecCtx};
pub use cred::{Cred, CredCache, CredFlags, CredKey};
pub use error::{GssError, Result};
pub use mechanism::{InMemoryMechanism, KrbMechanism, Mechanism, Service};
pub use pipe::{ChannelTransport, PipeId, PipeVersionState, UnixPipeTransport, UpcallTransport};
