//! Per-node RPC client generator
//!
//! A [`ProtoClientGenerator`] owns the direct stub to its immediate peer
//! (`vclient`) and lazily creates one forwarded stub per downstream
//! identifier. Stubs are cached for the generator's lifetime; lookups are
//! get-or-create under a single lock so concurrent callers never build two
//! stubs for the same destination.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::forward::{
    ForwardError, Forwarder, ForwardingImpl, KvmForwarder, RelayClient, RpcChannel,
    VmHostClient, VmHostForwarder,
};

// ============================================================================
// Stubs
// ============================================================================

/// An RPC client stub that can be built on top of any [`RpcChannel`]
pub trait RpcStub: Send + Sync + 'static {
    fn from_channel(channel: Arc<dyn RpcChannel>) -> Self;
}

/// Stub exposing the channel's opaque request/reply primitive
pub struct RawStub {
    channel: Arc<dyn RpcChannel>,
}

impl RawStub {
    pub fn call(&self, request: &[u8]) -> Result<Vec<u8>, ForwardError> {
        self.channel.do_rpc(request)
    }

    /// The channel this stub sends through (for stacking further hops)
    pub fn channel(&self) -> Arc<dyn RpcChannel> {
        Arc::clone(&self.channel)
    }
}

impl RpcStub for RawStub {
    fn from_channel(channel: Arc<dyn RpcChannel>) -> Self {
        Self { channel }
    }
}

// ============================================================================
// Generator
// ============================================================================

/// Cache key: the kind of destination plus its identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Destination {
    VmHost(String),
    Kvm(String),
}

pub struct ProtoClientGenerator<S: RpcStub> {
    /// Direct stub to the immediate peer
    vclient: Arc<S>,
    /// Route-tagging client over the same direct channel
    relay: Arc<dyn VmHostClient>,
    /// Forwarded stubs, one per downstream destination
    stubs: Mutex<HashMap<Destination, Arc<S>>>,
}

impl<S: RpcStub> ProtoClientGenerator<S> {
    /// Build a generator over the direct channel to the immediate peer
    pub fn new(channel: Arc<dyn RpcChannel>) -> Self {
        let relay: Arc<dyn VmHostClient> = Arc::new(RelayClient::new(Arc::clone(&channel)));
        Self {
            vclient: Arc::new(S::from_channel(channel)),
            relay,
            stubs: Mutex::new(HashMap::new()),
        }
    }

    /// Stub for the immediate peer
    pub fn vclient(&self) -> Arc<S> {
        Arc::clone(&self.vclient)
    }

    /// Stub whose traffic is relayed to the KVM named `service_name`
    pub fn kclient(&self, service_name: &str) -> Arc<S> {
        self.get_or_create(Destination::Kvm(service_name.to_string()))
    }

    /// Stub whose traffic is relayed to the VM host with `vmhost_id`
    pub fn vmhost_client(&self, vmhost_id: &str) -> Arc<S> {
        self.get_or_create(Destination::VmHost(vmhost_id.to_string()))
    }

    /// Number of forwarded stubs created so far
    pub fn cached_count(&self) -> usize {
        self.stubs.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn get_or_create(&self, destination: Destination) -> Arc<S> {
        let mut stubs = self.stubs.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(stub) = stubs.get(&destination) {
            return Arc::clone(stub);
        }

        let relay = Arc::clone(&self.relay);
        let (identifier, forwarder): (&str, Arc<dyn Forwarder>) = match &destination {
            Destination::VmHost(id) => (id.as_str(), Arc::new(VmHostForwarder::new(relay))),
            Destination::Kvm(name) => (name.as_str(), Arc::new(KvmForwarder::new(relay))),
        };
        log::debug!("Creating forwarded stub for {:?}", destination);

        let channel: Arc<dyn RpcChannel> = Arc::new(ForwardingImpl::new(identifier, forwarder));
        let stub = Arc::new(S::from_channel(channel));
        stubs.insert(destination, Arc::clone(&stub));
        stub
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
