//! QUIC client transport
//!
//! [`QuicConnector`] dials one fixed peer with mutual TLS and hands the
//! connection manager a [`QuicSession`]. A session owns its own mio poll
//! and UDP socket, so it is driven only from the thread holding it: the
//! manager's loop between requests, the caller's thread during a request.
//!
//! Each request uses a fresh client-initiated bidirectional stream carrying
//! one length-prefixed frame; the peer answers on the same stream with a
//! framed [`Reply`].

use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};
use ring::rand::{SecureRandom, SystemRandom};

use crate::auth::{self, Role};
use crate::transport::{self, ConnectError, Connector, Session, TlsFiles, TransportError};
use crate::wire::{self, Reply, WireError};
use crate::MAX_DATAGRAM_SIZE;

/// mio token for the UDP socket
const SOCKET_TOKEN: Token = Token(0);

/// Default time allowed for the QUIC/TLS handshake
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Keepalive period, well below the 30s idle timeout
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Upper bound on one poll while waiting for a reply or the handshake
const DRIVE_STEP: Duration = Duration::from_millis(50);

// ============================================================================
// Connector
// ============================================================================

#[derive(Debug, Clone)]
pub struct QuicConnector {
    peer_addr: SocketAddr,
    server_name: Option<String>,
    tls: TlsFiles,
    expected_role: Option<Role>,
    /// Node/service ID the expected role must be granted for
    expected_id: Option<String>,
    handshake_timeout: Duration,
}

impl QuicConnector {
    pub fn new(peer_addr: SocketAddr, tls: TlsFiles) -> Self {
        Self {
            peer_addr,
            server_name: None,
            tls,
            expected_role: None,
            expected_id: None,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    /// SNI / hostname to verify the peer certificate against
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    /// Require the peer certificate to carry `role`
    pub fn expect_role(mut self, role: Role) -> Self {
        self.expected_role = Some(role);
        self
    }

    /// Require the peer certificate to carry `role` for node/service `id`
    pub fn expect_grant(mut self, role: Role, id: impl Into<String>) -> Self {
        self.expected_role = Some(role);
        self.expected_id = Some(id.into());
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

impl Connector for QuicConnector {
    fn connect(&self) -> Result<Box<dyn Session>, ConnectError> {
        let mut config = transport::client_config(&self.tls)
            .map_err(|e| ConnectError::Config(format!("{:?}", e)))?;

        let poll = Poll::new()?;
        let bind_addr: SocketAddr = if self.peer_addr.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let mut socket = UdpSocket::bind(bind_addr)?;
        poll.registry()
            .register(&mut socket, SOCKET_TOKEN, Interest::READABLE)?;

        // Generate connection ID
        let mut scid = [0u8; quiche::MAX_CONN_ID_LEN];
        SystemRandom::new()
            .fill(&mut scid)
            .map_err(|_| ConnectError::Config("failed to generate connection ID".to_string()))?;
        let scid = quiche::ConnectionId::from_ref(&scid);

        let local_addr = socket.local_addr()?;
        let conn = quiche::connect(
            self.server_name.as_deref(),
            &scid,
            local_addr,
            self.peer_addr,
            &mut config,
        )
        .map_err(|e| ConnectError::Handshake(format!("{:?}", e)))?;

        log::debug!("Connecting to {} (scid={:?})", self.peer_addr, scid);

        let mut session = QuicSession {
            poll,
            socket,
            local_addr,
            conn,
            events: Events::with_capacity(64),
            recv_buf: vec![0u8; 65535],
            send_buf: vec![0u8; MAX_DATAGRAM_SIZE],
            stream_buf: vec![0u8; 65535],
            next_stream_id: 0,
            last_keepalive: Instant::now(),
        };

        session.wait_established(self.handshake_timeout)?;

        if let Some(role) = self.expected_role {
            let peer_cert = session.conn.peer_cert();
            let authorized = match &self.expected_id {
                Some(id) => auth::authorize_peer_for(peer_cert, role, id),
                None => auth::authorize_peer(peer_cert, role),
            };
            if let Err(e) = authorized {
                session.close();
                return Err(ConnectError::Rejected(e.to_string()));
            }
        }

        Ok(Box::new(session))
    }

    fn peer(&self) -> String {
        match &self.server_name {
            Some(name) => format!("{} ({})", self.peer_addr, name),
            None => self.peer_addr.to_string(),
        }
    }
}

// ============================================================================
// Session
// ============================================================================

pub struct QuicSession {
    poll: Poll,
    socket: UdpSocket,
    local_addr: SocketAddr,
    conn: quiche::Connection,
    events: Events,
    recv_buf: Vec<u8>,
    send_buf: Vec<u8>,
    stream_buf: Vec<u8>,
    /// Next client-initiated bidirectional stream (0, 4, 8, ...)
    next_stream_id: u64,
    last_keepalive: Instant,
}

impl QuicSession {
    fn wait_established(&mut self, timeout: Duration) -> Result<(), ConnectError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.conn.is_established() {
                return Ok(());
            }
            if self.conn.is_closed() {
                let reason = self
                    .conn
                    .peer_error()
                    .or(self.conn.local_error())
                    .map(|e| String::from_utf8_lossy(&e.reason).into_owned())
                    .unwrap_or_else(|| "connection closed".to_string());
                return Err(ConnectError::Handshake(reason));
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ConnectError::Timeout);
            }
            match self.drive((deadline - now).min(DRIVE_STEP)) {
                Ok(()) | Err(TransportError::Closed) => {}
                Err(TransportError::Io(e)) => return Err(ConnectError::Io(e)),
                Err(e) => return Err(ConnectError::Handshake(e.to_string())),
            }
        }
    }

    /// One round of the event loop: send, wait up to `max_wait` for packets,
    /// process timers, send again.
    fn drive(&mut self, max_wait: Duration) -> Result<(), TransportError> {
        self.flush()?;

        let timeout = match self.conn.timeout() {
            Some(t) => t.min(max_wait),
            None => max_wait,
        };
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }

        self.read_socket()?;
        self.conn.on_timeout();
        self.flush()?;

        if self.conn.is_closed() {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    fn read_socket(&mut self) -> Result<(), TransportError> {
        loop {
            let (len, from) = match self.socket.recv_from(&mut self.recv_buf) {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            };

            let recv_info = quiche::RecvInfo {
                from,
                to: self.local_addr,
            };
            if let Err(e) = self.conn.recv(&mut self.recv_buf[..len], recv_info) {
                log::debug!("recv error from {}: {:?}", from, e);
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        loop {
            match self.conn.send(&mut self.send_buf) {
                Ok((len, send_info)) => {
                    match self.socket.send_to(&self.send_buf[..len], send_info.to) {
                        Ok(_) => {}
                        // Dropped packet, QUIC loss recovery retransmits
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(quiche::Error::Done) => break,
                Err(e) => {
                    log::debug!("send error: {:?}", e);
                    break;
                }
            }
        }
        Ok(())
    }

    /// Drain whatever has arrived on `stream_id` into `response`.
    /// Returns true once the peer finished the stream.
    fn read_stream(&mut self, stream_id: u64, response: &mut Vec<u8>) -> Result<bool, TransportError> {
        loop {
            match self.conn.stream_recv(stream_id, &mut self.stream_buf) {
                Ok((len, fin)) => {
                    response.extend_from_slice(&self.stream_buf[..len]);
                    if fin {
                        return Ok(true);
                    }
                }
                Err(quiche::Error::Done) => return Ok(false),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Session for QuicSession {
    fn call(&mut self, request: &[u8], timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let frame = wire::encode_frame(request)?;
        let stream_id = self.next_stream_id;
        self.next_stream_id += 4;

        let deadline = Instant::now() + timeout;
        let mut written = 0;
        let mut response = Vec::new();

        loop {
            if self.conn.is_closed() {
                return Err(TransportError::Closed);
            }

            if written < frame.len() {
                match self.conn.stream_send(stream_id, &frame[written..], true) {
                    Ok(n) => written += n,
                    Err(quiche::Error::Done) => {}
                    Err(e) => return Err(e.into()),
                }
            }

            let finished = self.read_stream(stream_id, &mut response)?;
            match wire::decode_frame(&response) {
                Ok((body, _)) => {
                    return match wire::decode_reply(body)? {
                        Reply::Ok(bytes) => Ok(bytes),
                        Reply::Err(msg) => Err(TransportError::Remote(msg)),
                    };
                }
                Err(WireError::Incomplete(_)) if !finished => {}
                Err(e) => return Err(e.into()),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(TransportError::Timeout);
            }
            self.drive((deadline - now).min(DRIVE_STEP))?;
        }
    }

    fn service(&mut self) -> Result<(), TransportError> {
        if self.last_keepalive.elapsed() >= KEEPALIVE_INTERVAL {
            self.conn.send_ack_eliciting()?;
            self.last_keepalive = Instant::now();
        }
        self.drive(Duration::ZERO)
    }

    fn close(&mut self) {
        if self.conn.is_closed() {
            return;
        }
        if let Err(e) = self.conn.close(true, 0x00, b"shutdown") {
            log::debug!("close error: {:?}", e);
        }
        if let Err(e) = self.flush() {
            log::debug!("flush on close failed: {}", e);
        }
    }
}
