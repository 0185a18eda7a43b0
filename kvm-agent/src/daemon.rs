//! Link to the local daemon
//!
//! Each relayed request opens a TCP connection to the daemon, writes one
//! length-prefixed frame and reads one back. The whole exchange, connect
//! included, shares one deadline.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use inception::manager::DAEMON_CALL_TIMEOUT;
use inception::wire;
use inception::{ForwardError, RequestHandler};

/// Default bound on one daemon exchange
pub const DEFAULT_DAEMON_TIMEOUT: Duration = DAEMON_CALL_TIMEOUT;

// ============================================================================
// Deadline-bounded stream
// ============================================================================

/// TCP stream whose every read and write waits at most until `deadline`
struct DeadlineStream {
    stream: TcpStream,
    deadline: Instant,
}

impl DeadlineStream {
    fn remaining(&self) -> io::Result<Duration> {
        let now = Instant::now();
        if now >= self.deadline {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "daemon exchange deadline exceeded",
            ));
        }
        Ok(self.deadline - now)
    }
}

impl Read for DeadlineStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.remaining()?;
        self.stream.set_read_timeout(Some(remaining))?;
        self.stream.read(buf)
    }
}

impl Write for DeadlineStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let remaining = self.remaining()?;
        self.stream.set_write_timeout(Some(remaining))?;
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

// ============================================================================
// Handler
// ============================================================================

pub struct DaemonHandler {
    addr: SocketAddr,
    timeout: Duration,
}

impl DaemonHandler {
    pub fn new(addr: SocketAddr, timeout: Duration) -> Self {
        Self { addr, timeout }
    }

    fn exchange(&self, request: &[u8]) -> io::Result<Vec<u8>> {
        let deadline = Instant::now() + self.timeout;
        let stream = TcpStream::connect_timeout(&self.addr, self.timeout)?;
        stream.set_nodelay(true)?;

        let mut stream = DeadlineStream { stream, deadline };
        wire::write_frame(&mut stream, request)?;
        wire::read_frame(&mut stream)
    }
}

impl RequestHandler for DaemonHandler {
    fn handle(&self, request: &[u8]) -> Result<Vec<u8>, ForwardError> {
        self.exchange(request).map_err(|e| {
            log::warn!("Daemon at {} failed: {}", self.addr, e);
            match e.kind() {
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ForwardError::Timeout,
                _ => ForwardError::Remote(format!("daemon unavailable: {}", e)),
            }
        })
    }
}
