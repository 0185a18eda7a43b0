//! QUIC request server
//!
//! Accepts mutually authenticated connections from the tier above and
//! answers every request stream through a [`RequestHandler`]. The handler
//! runs on the event-loop thread; a request that is relayed further down
//! blocks the loop until the downstream hop answers or times out, which
//! keeps at most one request in flight per hop.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};
use ring::hmac;
use ring::rand::SystemRandom;

use crate::auth::{self, Role};
use crate::forward::ForwardError;
use crate::metrics::Metrics;
use crate::shutdown::Shutdown;
use crate::transport::{self, TlsFiles};
use crate::wire::{self, Reply, WireError};
use crate::MAX_DATAGRAM_SIZE;

/// mio token for the UDP socket
const SOCKET_TOKEN: Token = Token(0);

/// Upper bound on one poll so shutdown is noticed promptly
const MAX_POLL_WAIT: Duration = Duration::from_millis(100);

// ============================================================================
// Handler
// ============================================================================

/// Answers one opaque request
pub trait RequestHandler: Send + Sync {
    fn handle(&self, request: &[u8]) -> Result<Vec<u8>, ForwardError>;
}

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub listen: SocketAddr,
    pub tls: TlsFiles,
    /// Role the connecting peer must carry. None accepts any verified peer.
    pub allowed_role: Option<Role>,
}

// ============================================================================
// Per-connection state
// ============================================================================

struct Client {
    conn: quiche::Connection,
    addr: SocketAddr,
    /// Peer identity checked after the handshake
    authorized: bool,
    /// Request bytes received so far, by stream
    requests: HashMap<u64, Vec<u8>>,
    /// Reply frames not yet fully accepted by quiche: (frame, bytes written)
    replies: HashMap<u64, (Vec<u8>, usize)>,
}

impl Client {
    fn new(conn: quiche::Connection, addr: SocketAddr) -> Self {
        Self {
            conn,
            addr,
            authorized: false,
            requests: HashMap::new(),
            replies: HashMap::new(),
        }
    }
}

// ============================================================================
// Server
// ============================================================================

pub struct QuicServer {
    /// mio poll instance
    poll: Poll,
    /// UDP socket
    socket: UdpSocket,
    /// quiche configuration
    config: quiche::Config,
    /// Connected clients (by our connection ID)
    clients: HashMap<quiche::ConnectionId<'static>, Client>,
    /// Key for deriving our connection IDs from the client's initial DCID
    conn_id_seed: hmac::Key,
    handler: Arc<dyn RequestHandler>,
    metrics: Arc<Metrics>,
    allowed_role: Option<Role>,
    /// Receive buffer
    recv_buf: Vec<u8>,
    /// Send buffer
    send_buf: Vec<u8>,
    /// Stream read buffer
    stream_buf: Vec<u8>,
}

impl QuicServer {
    pub fn bind(
        options: &ServerOptions,
        handler: Arc<dyn RequestHandler>,
        metrics: Arc<Metrics>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let config = transport::server_config(&options.tls)?;

        let poll = Poll::new()?;
        let mut socket = UdpSocket::bind(options.listen)?;
        poll.registry()
            .register(&mut socket, SOCKET_TOKEN, Interest::READABLE)?;

        let rng = SystemRandom::new();
        let conn_id_seed =
            hmac::Key::generate(hmac::HMAC_SHA256, &rng).map_err(|_| "failed to generate key")?;

        log::info!("Server listening on {}", socket.local_addr()?);

        Ok(QuicServer {
            poll,
            socket,
            config,
            clients: HashMap::new(),
            conn_id_seed,
            handler,
            metrics,
            allowed_role: options.allowed_role,
            recv_buf: vec![0u8; 65535],
            send_buf: vec![0u8; MAX_DATAGRAM_SIZE],
            stream_buf: vec![0u8; 65535],
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Serve until `shutdown` fires, then close every connection
    pub fn run(&mut self, shutdown: &Shutdown) -> Result<(), Box<dyn std::error::Error>> {
        let mut events = Events::with_capacity(1024);

        while !shutdown.is_triggered() {
            // Calculate timeout based on earliest connection timeout
            let timeout = self
                .clients
                .values()
                .filter_map(|c| c.conn.timeout())
                .min()
                .map_or(MAX_POLL_WAIT, |t| t.min(MAX_POLL_WAIT));

            match self.poll.poll(&mut events, Some(timeout)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }

            if events.iter().any(|e| e.token() == SOCKET_TOKEN) {
                self.process_socket()?;
            }

            self.process_timeouts();
            self.process_streams();
            self.send_pending()?;
            self.cleanup_closed();
        }

        log::info!("Closing {} connection(s)", self.clients.len());
        for client in self.clients.values_mut() {
            if let Err(e) = client.conn.close(true, 0x00, b"shutdown") {
                log::debug!("close error: {:?}", e);
            }
        }
        self.send_pending()?;
        Ok(())
    }

    /// Connection ID we hand out for a client's initial DCID
    fn derive_conn_id(&self, dcid: &[u8]) -> quiche::ConnectionId<'static> {
        let tag = hmac::sign(&self.conn_id_seed, dcid);
        quiche::ConnectionId::from_vec(tag.as_ref()[..quiche::MAX_CONN_ID_LEN].to_vec())
    }

    fn process_socket(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        // Use a separate buffer to avoid borrow conflicts with self.recv_buf
        let mut pkt_buf = vec![0u8; 65535];
        let local_addr = self.socket.local_addr()?;

        loop {
            let (len, from) = match self.socket.recv_from(&mut self.recv_buf) {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            };

            pkt_buf[..len].copy_from_slice(&self.recv_buf[..len]);
            let pkt_slice = &mut pkt_buf[..len];

            let hdr = match quiche::Header::from_slice(pkt_slice, quiche::MAX_CONN_ID_LEN) {
                Ok(v) => v,
                Err(e) => {
                    log::debug!("Failed to parse QUIC header: {:?}", e);
                    continue;
                }
            };

            // Known connection, or a retransmitted Initial still using the
            // client's original DCID
            let dcid = hdr.dcid.clone().into_owned();
            let conn_id = if self.clients.contains_key(&dcid) {
                dcid
            } else {
                let derived = self.derive_conn_id(&hdr.dcid);
                if !self.clients.contains_key(&derived) {
                    if hdr.ty != quiche::Type::Initial {
                        log::debug!("Non-Initial packet for unknown connection");
                        continue;
                    }
                    if !quiche::version_is_supported(hdr.version) {
                        let len = quiche::negotiate_version(&hdr.scid, &hdr.dcid, &mut self.send_buf)?;
                        self.socket.send_to(&self.send_buf[..len], from)?;
                        continue;
                    }

                    let conn = match quiche::accept(&derived, None, local_addr, from, &mut self.config) {
                        Ok(conn) => conn,
                        Err(e) => {
                            log::debug!("Failed to accept connection: {:?}", e);
                            continue;
                        }
                    };
                    log::info!("New connection from {} (scid={:?})", from, derived);
                    self.clients.insert(derived.clone(), Client::new(conn, from));
                }
                derived
            };

            if let Some(client) = self.clients.get_mut(&conn_id) {
                let recv_info = quiche::RecvInfo {
                    from,
                    to: local_addr,
                };
                if let Err(e) = client.conn.recv(pkt_slice, recv_info) {
                    log::debug!("Connection recv error: {:?}", e);
                }
            }
        }

        Ok(())
    }

    fn process_timeouts(&mut self) {
        for client in self.clients.values_mut() {
            client.conn.on_timeout();
        }
    }

    fn process_streams(&mut self) {
        for client in self.clients.values_mut() {
            // Skip connections still handshaking or already closed by us
            if !client.conn.is_established()
                || client.conn.is_closed()
                || client.conn.local_error().is_some()
            {
                continue;
            }

            if !client.authorized {
                if !authorize(client, self.allowed_role) {
                    self.metrics
                        .requests_rejected_total
                        .fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                client.authorized = true;
            }

            flush_replies(client);

            let readable: Vec<u64> = client.conn.readable().collect();
            for stream_id in readable {
                let request = match read_request(client, stream_id, &mut self.stream_buf) {
                    Some(request) => request,
                    None => continue,
                };

                let reply = match request {
                    Ok(body) => match self.handler.handle(&body) {
                        Ok(bytes) => {
                            self.metrics
                                .requests_handled_total
                                .fetch_add(1, Ordering::Relaxed);
                            Reply::Ok(bytes)
                        }
                        Err(e) => {
                            log::debug!("Request on stream {} failed: {}", stream_id, e);
                            Reply::Err(error_message(e))
                        }
                    },
                    Err(e) => {
                        log::warn!("Malformed request from {}: {}", client.addr, e);
                        self.metrics
                            .requests_rejected_total
                            .fetch_add(1, Ordering::Relaxed);
                        Reply::Err(e.to_string())
                    }
                };

                client.replies.insert(stream_id, (reply_frame(&reply), 0));
            }

            flush_replies(client);
        }
    }

    fn send_pending(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        for client in self.clients.values_mut() {
            loop {
                match client.conn.send(&mut self.send_buf) {
                    Ok((len, send_info)) => {
                        log::trace!("Sending {} bytes to {:?}", len, send_info.to);
                        match self.socket.send_to(&self.send_buf[..len], send_info.to) {
                            Ok(_) => {}
                            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                            Err(e) => return Err(e.into()),
                        }
                    }
                    Err(quiche::Error::Done) => break,
                    Err(e) => {
                        log::debug!("Send error: {:?}", e);
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn cleanup_closed(&mut self) {
        let closed: Vec<_> = self
            .clients
            .iter()
            .filter(|(_, c)| c.conn.is_closed())
            .map(|(id, _)| id.clone())
            .collect();

        for conn_id in closed {
            if let Some(client) = self.clients.remove(&conn_id) {
                log::info!("Connection closed: {} ({:?})", client.addr, conn_id);
            }
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Check the peer certificate once the handshake completes. Closes the
/// connection and returns false when the peer lacks the required role.
fn authorize(client: &mut Client, allowed_role: Option<Role>) -> bool {
    let role = match allowed_role {
        Some(role) => role,
        None => return true,
    };

    match auth::authorize_peer(client.conn.peer_cert(), role) {
        Ok(identity) => {
            log::info!(
                "Peer {} authenticated as '{}' ({})",
                client.addr,
                identity.common_name,
                role
            );
            true
        }
        Err(e) => {
            log::warn!("Rejecting peer {}: {}", client.addr, e);
            if let Err(e) = client.conn.close(false, 0x01, b"unauthorized") {
                log::debug!("close error: {:?}", e);
            }
            false
        }
    }
}

/// Accumulate stream data. Returns the request body once a full frame has
/// arrived, an error for a malformed or truncated one, None while waiting.
fn read_request(
    client: &mut Client,
    stream_id: u64,
    buf: &mut [u8],
) -> Option<Result<Vec<u8>, WireError>> {
    let pending = client.requests.entry(stream_id).or_default();
    let mut finished = false;
    loop {
        match client.conn.stream_recv(stream_id, buf) {
            Ok((len, fin)) => {
                pending.extend_from_slice(&buf[..len]);
                if fin {
                    finished = true;
                    break;
                }
            }
            Err(quiche::Error::Done) => break,
            Err(e) => {
                log::debug!("stream_recv error on stream {}: {:?}", stream_id, e);
                client.requests.remove(&stream_id);
                return None;
            }
        }
    }

    let result = match wire::decode_frame(&pending[..]) {
        Ok((body, _)) => Ok(body.to_vec()),
        Err(WireError::Incomplete(_)) if !finished => return None,
        Err(e) => Err(e),
    };
    client.requests.remove(&stream_id);
    Some(result)
}

fn flush_replies(client: &mut Client) {
    let conn = &mut client.conn;
    client.replies.retain(|stream_id, (frame, written)| {
        match conn.stream_send(*stream_id, &frame[*written..], true) {
            Ok(n) => *written += n,
            Err(quiche::Error::Done) => {}
            Err(e) => {
                log::debug!("stream_send error on stream {}: {:?}", stream_id, e);
                return false;
            }
        }
        *written < frame.len()
    });
}

/// Remote errors pass through unchanged so a multi-hop failure reads the
/// same at the origin as where it happened
fn error_message(e: ForwardError) -> String {
    match e {
        ForwardError::Remote(msg) => msg,
        other => other.to_string(),
    }
}

fn reply_frame(reply: &Reply) -> Vec<u8> {
    match wire::encode_reply(reply).and_then(|body| wire::encode_frame(&body)) {
        Ok(frame) => frame,
        Err(e) => {
            log::warn!("Failed to encode reply: {}", e);
            let fallback = Reply::Err(format!("failed to encode reply: {}", e));
            wire::encode_reply(&fallback)
                .and_then(|body| wire::encode_frame(&body))
                .unwrap_or_default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_message_passes_remote_through() {
        assert_eq!(
            error_message(ForwardError::Remote("daemon down".to_string())),
            "daemon down"
        );
        assert_eq!(
            error_message(ForwardError::UnknownDestination("svcZ".to_string())),
            "unknown destination 'svcZ'"
        );
    }

    #[test]
    fn test_reply_frame_decodes() {
        let frame = reply_frame(&Reply::Ok(b"pong".to_vec()));
        let (body, consumed) = wire::decode_frame(&frame).unwrap();
        assert_eq!(consumed, frame.len());
        assert_eq!(wire::decode_reply(body).unwrap(), Reply::Ok(b"pong".to_vec()));
    }

    #[test]
    fn test_oversized_reply_becomes_error() {
        let huge = vec![0u8; wire::MAX_FRAME_SIZE as usize + 1];
        let frame = reply_frame(&Reply::Ok(huge));
        let (body, _) = wire::decode_frame(&frame).unwrap();
        assert!(matches!(wire::decode_reply(body).unwrap(), Reply::Err(_)));
    }
}
