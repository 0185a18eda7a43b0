//! Opaque-payload forwarding
//!
//! A [`Forwarder`] relays `(identifier, bytes)` through a connected peer.
//! [`ForwardingImpl`] binds one identifier to a forwarder and exposes the
//! plain [`RpcChannel`] contract that RPC stubs are built on, so a stub never
//! knows how many hops its traffic crosses:
//!
//! ```text
//! stub.do_rpc(b)
//!   └─ ForwardingImpl("svcA", KvmForwarder)
//!        └─ VmHostClient::send_message_to_kvm("svcA", b)
//!             └─ RelayClient: Envelope{Kvm("svcA"), b} over the direct channel
//! ```

use std::fmt;
use std::sync::Arc;

use crate::wire::{self, Envelope, Route};

// ============================================================================
// Errors
// ============================================================================

/// Failure to deliver a request to (or get a reply from) a hop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardError {
    /// No connection to the named peer is currently established
    NotConnected(String),
    /// The identifier does not name a destination known to this hop
    UnknownDestination(String),
    /// The transport failed while the request was in flight
    Transport(String),
    /// No reply arrived before the per-hop timeout
    Timeout,
    /// A downstream hop reported a failure
    Remote(String),
    /// The forwarding side is shutting down
    ShuttingDown,
}

impl fmt::Display for ForwardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForwardError::NotConnected(peer) => write!(f, "not connected to {}", peer),
            ForwardError::UnknownDestination(id) => write!(f, "unknown destination '{}'", id),
            ForwardError::Transport(msg) => write!(f, "transport error: {}", msg),
            ForwardError::Timeout => write!(f, "request timed out"),
            ForwardError::Remote(msg) => write!(f, "remote error: {}", msg),
            ForwardError::ShuttingDown => write!(f, "shutting down"),
        }
    }
}

impl std::error::Error for ForwardError {}

impl From<wire::WireError> for ForwardError {
    fn from(e: wire::WireError) -> Self {
        ForwardError::Transport(e.to_string())
    }
}

// ============================================================================
// Capabilities
// ============================================================================

/// Transport contract expected by RPC stubs: one request in, one reply out
pub trait RpcChannel: Send + Sync {
    fn do_rpc(&self, request: &[u8]) -> Result<Vec<u8>, ForwardError>;
}

/// Relays an opaque payload to the destination named by `identifier`
pub trait Forwarder: Send + Sync {
    fn forward(&self, identifier: &str, payload: &[u8]) -> Result<Vec<u8>, ForwardError>;
}

/// Primitives offered by a client connected to a VM host
pub trait VmHostClient: Send + Sync {
    fn send_message_to_vmhost(&self, vmhost_id: &str, payload: &[u8])
        -> Result<Vec<u8>, ForwardError>;

    fn send_message_to_kvm(&self, service_name: &str, payload: &[u8])
        -> Result<Vec<u8>, ForwardError>;
}

// ============================================================================
// Forwarders
// ============================================================================

/// Forwards to a VM host, addressed by VM-host ID
pub struct VmHostForwarder {
    client: Arc<dyn VmHostClient>,
}

impl VmHostForwarder {
    pub fn new(client: Arc<dyn VmHostClient>) -> Self {
        Self { client }
    }
}

impl Forwarder for VmHostForwarder {
    fn forward(&self, identifier: &str, payload: &[u8]) -> Result<Vec<u8>, ForwardError> {
        self.client.send_message_to_vmhost(identifier, payload)
    }
}

/// Forwards to a KVM, addressed by service name
pub struct KvmForwarder {
    client: Arc<dyn VmHostClient>,
}

impl KvmForwarder {
    pub fn new(client: Arc<dyn VmHostClient>) -> Self {
        Self { client }
    }
}

impl Forwarder for KvmForwarder {
    fn forward(&self, identifier: &str, payload: &[u8]) -> Result<Vec<u8>, ForwardError> {
        self.client.send_message_to_kvm(identifier, payload)
    }
}

// ============================================================================
// ForwardingImpl
// ============================================================================

/// Adapts an `(identifier, forwarder)` pair into an [`RpcChannel`]
pub struct ForwardingImpl {
    identifier: String,
    forwarder: Arc<dyn Forwarder>,
}

impl ForwardingImpl {
    pub fn new(identifier: impl Into<String>, forwarder: Arc<dyn Forwarder>) -> Self {
        Self {
            identifier: identifier.into(),
            forwarder,
        }
    }
}

impl RpcChannel for ForwardingImpl {
    fn do_rpc(&self, request: &[u8]) -> Result<Vec<u8>, ForwardError> {
        self.forwarder.forward(&self.identifier, request)
    }
}

// ============================================================================
// RelayClient
// ============================================================================

/// [`VmHostClient`] that tags each payload with its route and sends it over
/// the direct channel to the next hop
pub struct RelayClient {
    channel: Arc<dyn RpcChannel>,
}

impl RelayClient {
    pub fn new(channel: Arc<dyn RpcChannel>) -> Self {
        Self { channel }
    }

    fn send(&self, route: Route, payload: &[u8]) -> Result<Vec<u8>, ForwardError> {
        let envelope = Envelope {
            route,
            payload: payload.to_vec(),
        };
        let request = wire::encode_envelope(&envelope)?;
        self.channel.do_rpc(&request)
    }
}

impl VmHostClient for RelayClient {
    fn send_message_to_vmhost(
        &self,
        vmhost_id: &str,
        payload: &[u8],
    ) -> Result<Vec<u8>, ForwardError> {
        self.send(Route::VmHost(vmhost_id.to_string()), payload)
    }

    fn send_message_to_kvm(
        &self,
        service_name: &str,
        payload: &[u8],
    ) -> Result<Vec<u8>, ForwardError> {
        self.send(Route::Kvm(service_name.to_string()), payload)
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records every forward call and answers with a fixed prefix + payload
    #[derive(Default)]
    struct RecordingForwarder {
        calls: Mutex<Vec<(String, Vec<u8>)>>,
    }

    impl Forwarder for RecordingForwarder {
        fn forward(&self, identifier: &str, payload: &[u8]) -> Result<Vec<u8>, ForwardError> {
            self.calls
                .lock()
                .unwrap()
                .push((identifier.to_string(), payload.to_vec()));
            let mut reply = b"re:".to_vec();
            reply.extend_from_slice(payload);
            Ok(reply)
        }
    }

    /// Records the primitive used for each message
    #[derive(Default)]
    struct RecordingClient {
        calls: Mutex<Vec<String>>,
    }

    impl VmHostClient for RecordingClient {
        fn send_message_to_vmhost(&self, id: &str, _: &[u8]) -> Result<Vec<u8>, ForwardError> {
            self.calls.lock().unwrap().push(format!("vmhost:{}", id));
            Ok(Vec::new())
        }

        fn send_message_to_kvm(&self, name: &str, _: &[u8]) -> Result<Vec<u8>, ForwardError> {
            self.calls.lock().unwrap().push(format!("kvm:{}", name));
            Err(ForwardError::UnknownDestination(name.to_string()))
        }
    }

    /// Captures the raw request bytes sent on a channel
    #[derive(Default)]
    struct CapturingChannel {
        last: Mutex<Option<Vec<u8>>>,
    }

    impl RpcChannel for CapturingChannel {
        fn do_rpc(&self, request: &[u8]) -> Result<Vec<u8>, ForwardError> {
            *self.last.lock().unwrap() = Some(request.to_vec());
            Ok(b"ack".to_vec())
        }
    }

    #[test]
    fn test_forwarding_impl_passes_identifier_and_bytes() {
        let forwarder = Arc::new(RecordingForwarder::default());
        let channel = ForwardingImpl::new("svcA", forwarder.clone());

        let reply = channel.do_rpc(b"ping").unwrap();

        assert_eq!(reply, b"re:ping");
        let calls = forwarder.calls.lock().unwrap();
        assert_eq!(calls.as_slice(), &[("svcA".to_string(), b"ping".to_vec())]);
    }

    #[test]
    fn test_variants_pick_their_primitive() {
        let client = Arc::new(RecordingClient::default());

        VmHostForwarder::new(client.clone())
            .forward("host-1", b"x")
            .unwrap();
        let err = KvmForwarder::new(client.clone())
            .forward("svcB", b"y")
            .unwrap_err();

        assert_eq!(err, ForwardError::UnknownDestination("svcB".to_string()));
        assert_eq!(
            client.calls.lock().unwrap().as_slice(),
            &["vmhost:host-1".to_string(), "kvm:svcB".to_string()]
        );
    }

    #[test]
    fn test_relay_client_wraps_payload_in_envelope() {
        let channel = Arc::new(CapturingChannel::default());
        let relay = RelayClient::new(channel.clone());

        let reply = relay.send_message_to_kvm("svcA", b"opaque").unwrap();
        assert_eq!(reply, b"ack");

        let sent = channel.last.lock().unwrap().clone().unwrap();
        let envelope = wire::decode_envelope(&sent).unwrap();
        assert_eq!(envelope.route, Route::Kvm("svcA".to_string()));
        assert_eq!(envelope.payload, b"opaque");

        relay.send_message_to_vmhost("host-7", b"").unwrap();
        let sent = channel.last.lock().unwrap().clone().unwrap();
        let envelope = wire::decode_envelope(&sent).unwrap();
        assert_eq!(envelope.route, Route::VmHost("host-7".to_string()));
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            ForwardError::NotConnected("kvm-a".to_string()).to_string(),
            "not connected to kvm-a"
        );
        assert_eq!(ForwardError::Timeout.to_string(), "request timed out");
    }
}
