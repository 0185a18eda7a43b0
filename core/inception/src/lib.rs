//! Inception relay core
//!
//! This crate provides the pieces shared by every tier of the relay
//! (admin panel → VM host → KVM):
//! - Exponential backoff for reconnect loops
//! - Cooperative shutdown tokens wired to SIGINT/SIGTERM
//! - Opaque-payload forwarding (`Forwarder`, `ForwardingImpl`, stub generator)
//! - A connection manager that keeps one authenticated connection alive
//! - QUIC client/server transport via quiche, with mTLS peer identity
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  Envelope{Kvm(name)}  ┌──────────────┐  payload  ┌──────────────┐
//! │    Admin     │ ────────────────────► │   VM host    │ ────────► │     KVM      │
//! │ kclient(name)│ ◄──────────────────── │    Router    │ ◄──────── │   handler    │
//! └──────────────┘         Reply         └──────────────┘   Reply   └──────────────┘
//! ```
//!
//! Every hop is a byte pipe: payloads are never interpreted in transit.

// ============================================================================
// Modules
// ============================================================================

pub mod auth;
pub mod client;
pub mod forward;
pub mod generator;
pub mod manager;
pub mod metrics;
pub mod retry;
pub mod server;
pub mod shutdown;
pub mod transport;
pub mod wire;

// Re-export commonly used types
pub use forward::{
    ForwardError,
    Forwarder,
    ForwardingImpl,
    KvmForwarder,
    RelayClient,
    RpcChannel,
    VmHostClient,
    VmHostForwarder,
};
pub use generator::{ProtoClientGenerator, RawStub, RpcStub};
pub use manager::{ConnectionManager, ConnectionState, ManagerOptions};
pub use metrics::Metrics;
pub use retry::ExponentialRetryTimer;
pub use server::{QuicServer, RequestHandler, ServerOptions};
pub use shutdown::Shutdown;
pub use transport::{ConnectError, Connector, Session, TlsFiles, TransportError};

// ============================================================================
// Constants (shared by every tier)
// ============================================================================

/// Maximum UDP payload size for QUIC packets
pub const MAX_DATAGRAM_SIZE: usize = 1350;

/// QUIC idle timeout in milliseconds
pub const IDLE_TIMEOUT_MS: u64 = 30_000;

/// ALPN protocol identifier (CRITICAL: must match on every tier)
pub const ALPN_PROTOCOL: &[u8] = b"inception-v1";
