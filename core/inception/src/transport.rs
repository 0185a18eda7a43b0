//! Transport seam between the connection manager and the wire
//!
//! The [`crate::manager::ConnectionManager`] only knows how to ask a
//! [`Connector`] for a fresh [`Session`] and how to push requests through
//! it. The production implementation is QUIC ([`crate::client`]); tests
//! plug in-memory sessions in here.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::forward::ForwardError;
use crate::wire::WireError;
use crate::{ALPN_PROTOCOL, IDLE_TIMEOUT_MS, MAX_DATAGRAM_SIZE};

// ============================================================================
// Traits
// ============================================================================

/// One established, authenticated connection to a peer
pub trait Session: Send {
    /// Send one request and block until its reply or `timeout`
    fn call(&mut self, request: &[u8], timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Housekeeping between calls (timers, keepalive). Fails once the
    /// connection is gone.
    fn service(&mut self) -> Result<(), TransportError>;

    /// Close the connection; further calls fail
    fn close(&mut self);
}

/// Factory for sessions to one fixed peer
pub trait Connector: Send + Sync {
    /// Perform a full handshake
    fn connect(&self) -> Result<Box<dyn Session>, ConnectError>;

    /// Human-readable peer description for logs
    fn peer(&self) -> String;
}

// ============================================================================
// Errors
// ============================================================================

/// Failure to establish a session. Always transient from the manager's
/// point of view.
#[derive(Debug)]
pub enum ConnectError {
    Io(io::Error),
    /// TLS / QUIC configuration could not be built
    Config(String),
    /// Handshake failed or the peer closed during it
    Handshake(String),
    /// Handshake did not finish in time
    Timeout,
    /// Peer certificate does not carry the expected role
    Rejected(String),
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectError::Io(e) => write!(f, "I/O error: {}", e),
            ConnectError::Config(msg) => write!(f, "configuration error: {}", msg),
            ConnectError::Handshake(msg) => write!(f, "handshake failed: {}", msg),
            ConnectError::Timeout => write!(f, "handshake timed out"),
            ConnectError::Rejected(msg) => write!(f, "peer rejected: {}", msg),
        }
    }
}

impl std::error::Error for ConnectError {}

impl From<io::Error> for ConnectError {
    fn from(e: io::Error) -> Self {
        ConnectError::Io(e)
    }
}

/// Failure on an established session
#[derive(Debug)]
pub enum TransportError {
    Io(io::Error),
    Quic(String),
    Wire(WireError),
    /// Connection closed (by the peer, idle timeout or locally)
    Closed,
    /// No reply before the call deadline
    Timeout,
    /// The peer processed the request and reported an error. The session
    /// itself is still healthy.
    Remote(String),
}

impl TransportError {
    /// Whether the session must be discarded after this error
    pub fn is_fatal(&self) -> bool {
        !matches!(self, TransportError::Remote(_))
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Io(e) => write!(f, "I/O error: {}", e),
            TransportError::Quic(msg) => write!(f, "QUIC error: {}", msg),
            TransportError::Wire(e) => write!(f, "wire error: {}", e),
            TransportError::Closed => write!(f, "connection closed"),
            TransportError::Timeout => write!(f, "timed out waiting for reply"),
            TransportError::Remote(msg) => write!(f, "remote error: {}", msg),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        TransportError::Io(e)
    }
}

impl From<WireError> for TransportError {
    fn from(e: WireError) -> Self {
        TransportError::Wire(e)
    }
}

impl From<quiche::Error> for TransportError {
    fn from(e: quiche::Error) -> Self {
        TransportError::Quic(format!("{:?}", e))
    }
}

impl From<TransportError> for ForwardError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Timeout => ForwardError::Timeout,
            TransportError::Remote(msg) => ForwardError::Remote(msg),
            other => ForwardError::Transport(other.to_string()),
        }
    }
}

// ============================================================================
// TLS / QUIC Configuration
// ============================================================================

/// Certificate material for one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsFiles {
    /// PEM certificate chain presented to peers
    pub cert: PathBuf,
    /// PEM private key for `cert`
    pub key: PathBuf,
    /// CA bundle used to verify peers. None disables peer verification.
    #[serde(default)]
    pub ca: Option<PathBuf>,
}

fn path_str(path: &Path) -> Result<&str, quiche::Error> {
    path.to_str().ok_or(quiche::Error::TlsFail)
}

/// Settings shared by client and server (must match on every tier)
fn base_config(tls: &TlsFiles) -> Result<quiche::Config, quiche::Error> {
    let mut config = quiche::Config::new(quiche::PROTOCOL_VERSION)?;

    // Both sides present a certificate (mTLS)
    config.load_cert_chain_from_pem_file(path_str(&tls.cert)?)?;
    config.load_priv_key_from_pem_file(path_str(&tls.key)?)?;

    match &tls.ca {
        Some(ca) => {
            config.load_verify_locations_from_file(path_str(ca)?)?;
            config.verify_peer(true);
        }
        None => {
            log::warn!("No CA bundle configured, peer certificates are NOT verified");
            config.verify_peer(false);
        }
    }

    // CRITICAL: ALPN must match on every tier
    config.set_application_protos(&[ALPN_PROTOCOL])?;

    config.set_max_idle_timeout(IDLE_TIMEOUT_MS);
    config.set_max_recv_udp_payload_size(MAX_DATAGRAM_SIZE);
    config.set_max_send_udp_payload_size(MAX_DATAGRAM_SIZE);
    config.set_initial_max_data(10_000_000);
    config.set_initial_max_stream_data_bidi_local(1_000_000);
    config.set_initial_max_stream_data_bidi_remote(1_000_000);
    config.set_initial_max_streams_bidi(100);
    config.set_initial_max_streams_uni(100);

    Ok(config)
}

/// quiche configuration for the dialing side
pub fn client_config(tls: &TlsFiles) -> Result<quiche::Config, quiche::Error> {
    base_config(tls)
}

/// quiche configuration for the accepting side
pub fn server_config(tls: &TlsFiles) -> Result<quiche::Config, quiche::Error> {
    let mut config = base_config(tls)?;
    // Requests are one bidi stream each; allow a generous number over the
    // lifetime of one connection
    config.set_initial_max_streams_bidi(1000);
    Ok(config)
}
