//! Envelope routing for the VM host
//!
//! Every admin request arrives as an [`Envelope`]. The router answers
//! `Local` and `VmHost(<own id>)` itself and relays `Kvm(<name>)` payloads,
//! untouched, over that KVM's connection.

use std::collections::HashMap;
use std::sync::Arc;

use inception::wire::{self, Route};
use inception::{ForwardError, Forwarder, Metrics, RequestHandler, RpcChannel};

// ============================================================================
// KVM table
// ============================================================================

/// Connections to the managed KVMs, by service name
#[derive(Default)]
pub struct KvmTable {
    channels: HashMap<String, Arc<dyn RpcChannel>>,
}

impl KvmTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, service_name: impl Into<String>, channel: Arc<dyn RpcChannel>) {
        let service_name = service_name.into();
        log::info!("Registering KVM '{}'", service_name);
        self.channels.insert(service_name, channel);
    }
}

impl Forwarder for KvmTable {
    fn forward(&self, identifier: &str, payload: &[u8]) -> Result<Vec<u8>, ForwardError> {
        let channel = self
            .channels
            .get(identifier)
            .ok_or_else(|| ForwardError::UnknownDestination(identifier.to_string()))?;
        channel.do_rpc(payload)
    }
}

// ============================================================================
// Router
// ============================================================================

pub struct Router {
    vmhost_id: String,
    kvms: Arc<dyn Forwarder>,
    metrics: Arc<Metrics>,
}

impl Router {
    pub fn new(vmhost_id: impl Into<String>, kvms: Arc<dyn Forwarder>, metrics: Arc<Metrics>) -> Self {
        Self {
            vmhost_id: vmhost_id.into(),
            kvms,
            metrics,
        }
    }

    /// Requests addressed to this VM host: report its status
    fn handle_local(&self) -> Vec<u8> {
        self.metrics.render().into_bytes()
    }
}

impl RequestHandler for Router {
    fn handle(&self, request: &[u8]) -> Result<Vec<u8>, ForwardError> {
        let envelope = wire::decode_envelope(request)?;

        match envelope.route {
            Route::Local => Ok(self.handle_local()),
            Route::VmHost(id) if id == self.vmhost_id => Ok(self.handle_local()),
            Route::VmHost(id) => {
                log::warn!("Request for VM host '{}' reached '{}'", id, self.vmhost_id);
                Err(ForwardError::UnknownDestination(id))
            }
            Route::Kvm(name) => {
                log::debug!("Forwarding {} bytes to KVM '{}'", envelope.payload.len(), name);
                let result = self.kvms.forward(&name, &envelope.payload);
                if let Err(e) = &result {
                    log::warn!("Forward to KVM '{}' failed: {}", name, e);
                }
                result
            }
        }
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
