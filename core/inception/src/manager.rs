//! Connection manager
//!
//! Keeps one authenticated connection to a fixed upstream peer alive on a
//! dedicated thread and exposes it as an [`RpcChannel`].
//!
//! ```text
//!   start()                        handshake ok
//! Disconnected ──► Connecting ─────────────────► Connected
//!      ▲              │  ▲ failure: sleep             │
//!      │              └──┘ RetryTimer.next()          │ transport error
//!      └──────────────────────────────────────────────┘
//!
//! any ──stop()/shutdown──► ShuttingDown ──► Stopped
//! ```
//!
//! Forwards on one connection are serialized by the session lock. A caller
//! never sees a [`ConnectError`](crate::ConnectError): while the peer is
//! unreachable requests fail fast with [`ForwardError::NotConnected`].

use std::fmt;
use std::io;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::forward::{ForwardError, RpcChannel};
use crate::metrics::Metrics;
use crate::retry::ExponentialRetryTimer;
use crate::shutdown::Shutdown;
use crate::transport::{Connector, Session};

/// Default per-request timeout for one hop (admin → VM host)
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// VM host → KVM timeout. Must expire before the caller's.
pub const KVM_CALL_TIMEOUT: Duration = Duration::from_secs(8);

/// KVM → local daemon timeout. Must expire before the VM host's.
pub const DAEMON_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Default pause between session housekeeping passes
pub const DEFAULT_SERVICE_INTERVAL: Duration = Duration::from_millis(500);

// ============================================================================
// State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::ShuttingDown => "shutting down",
            ConnectionState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// How long one request may wait for its reply
    pub call_timeout: Duration,
    /// Pause between housekeeping passes while connected
    pub service_interval: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            call_timeout: DEFAULT_CALL_TIMEOUT,
            service_interval: DEFAULT_SERVICE_INTERVAL,
        }
    }
}

// ============================================================================
// ConnectionManager
// ============================================================================

struct Inner {
    name: String,
    connector: Box<dyn Connector>,
    options: ManagerOptions,
    shutdown: Shutdown,
    metrics: Arc<Metrics>,
    state: Mutex<ConnectionState>,
    state_changed: Condvar,
    session: Mutex<Option<Box<dyn Session>>>,
}

pub struct ConnectionManager {
    inner: Arc<Inner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Inner {
    fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    /// Move to `next` unless shutdown already began
    fn transition(&self, next: ConnectionState) {
        let mut state = lock(&self.state);
        if matches!(
            *state,
            ConnectionState::ShuttingDown | ConnectionState::Stopped
        ) && next != ConnectionState::Stopped
        {
            return;
        }
        if *state != next {
            log::debug!("[{}] {} -> {}", self.name, *state, next);
            *state = next;
            self.state_changed.notify_all();
        }
    }

    fn drop_session(&self) {
        if let Some(mut session) = lock(&self.session).take() {
            session.close();
        }
    }
}

impl ConnectionManager {
    /// Create a manager for the peer behind `connector`.
    ///
    /// The manager gets a child of `shutdown`: a process-wide shutdown
    /// stops it, [`stop`](Self::stop) stops only this manager.
    pub fn new(
        name: impl Into<String>,
        connector: Box<dyn Connector>,
        options: ManagerOptions,
        shutdown: &Shutdown,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                connector,
                options,
                shutdown: shutdown.child(),
                metrics,
                state: Mutex::new(ConnectionState::Disconnected),
                state_changed: Condvar::new(),
                session: Mutex::new(None),
            }),
            handle: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Spawn the connection loop. Calling it again while running is a no-op.
    pub fn start(&self) -> io::Result<()> {
        let mut handle = lock(&self.handle);
        if handle.is_some() || self.inner.shutdown.is_triggered() {
            return Ok(());
        }

        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name(format!("conn-{}", self.inner.name))
            .spawn(move || run(inner))?;
        *handle = Some(spawned);
        Ok(())
    }

    /// Stop the loop, close the connection and wait for the thread.
    /// Safe to call from any state, any number of times.
    pub fn stop(&self) {
        if self.state() == ConnectionState::Stopped {
            return;
        }
        self.inner.transition(ConnectionState::ShuttingDown);
        self.inner.shutdown.trigger();

        if let Some(handle) = lock(&self.handle).take() {
            if handle.join().is_err() {
                log::error!("[{}] connection thread panicked", self.inner.name);
            }
        }

        self.inner.drop_session();
        self.inner.transition(ConnectionState::Stopped);
        log::info!("[{}] Stopped", self.inner.name);
    }

    /// Block until connected, stopped, or `timeout` elapses.
    /// Returns whether the manager is connected.
    pub fn wait_connected(&self, timeout: Duration) -> bool {
        let state = lock(&self.inner.state);
        let (state, _) = self
            .inner
            .state_changed
            .wait_timeout_while(state, timeout, |s| {
                !matches!(
                    *s,
                    ConnectionState::Connected | ConnectionState::Stopped
                )
            })
            .unwrap_or_else(|e| e.into_inner());
        *state == ConnectionState::Connected
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.stop();
    }
}

impl RpcChannel for ConnectionManager {
    fn do_rpc(&self, request: &[u8]) -> Result<Vec<u8>, ForwardError> {
        let inner = &self.inner;
        if inner.shutdown.is_triggered() {
            return Err(ForwardError::ShuttingDown);
        }

        let mut guard = lock(&inner.session);
        let session = guard
            .as_mut()
            .ok_or_else(|| ForwardError::NotConnected(inner.name.clone()))?;

        inner.metrics.forwards_total.fetch_add(1, Ordering::Relaxed);
        match session.call(request, inner.options.call_timeout) {
            Ok(reply) => Ok(reply),
            Err(e) => {
                inner
                    .metrics
                    .forward_errors_total
                    .fetch_add(1, Ordering::Relaxed);
                if e.is_fatal() {
                    log::warn!("[{}] Connection lost during request: {}", inner.name, e);
                    if let Some(mut session) = guard.take() {
                        session.close();
                    }
                    // Still holding the session lock so the loop cannot
                    // reconnect in between
                    inner.transition(ConnectionState::Disconnected);
                }
                Err(e.into())
            }
        }
    }
}

// ============================================================================
// Connection Loop
// ============================================================================

fn run(inner: Arc<Inner>) {
    let mut retry = ExponentialRetryTimer::new();
    log::info!("[{}] Connection loop started ({})", inner.name, inner.connector.peer());

    while !inner.shutdown.is_triggered() {
        match inner.state() {
            ConnectionState::Disconnected => inner.transition(ConnectionState::Connecting),

            ConnectionState::Connecting => match inner.connector.connect() {
                Ok(session) => {
                    *lock(&inner.session) = Some(session);
                    retry.reset();
                    inner
                        .metrics
                        .reconnections_total
                        .fetch_add(1, Ordering::Relaxed);
                    log::info!("[{}] Connected to {}", inner.name, inner.connector.peer());
                    inner.transition(ConnectionState::Connected);
                }
                Err(e) => {
                    inner
                        .metrics
                        .connect_failures_total
                        .fetch_add(1, Ordering::Relaxed);
                    let delay = retry.next_delay();
                    log::warn!(
                        "[{}] Connection to {} failed: {} (retrying in {:.1}s)",
                        inner.name,
                        inner.connector.peer(),
                        e,
                        delay.as_secs_f64()
                    );
                    if inner.shutdown.sleep(delay) {
                        break;
                    }
                }
            },

            ConnectionState::Connected => {
                let result = match lock(&inner.session).as_mut() {
                    Some(session) => session.service(),
                    // Dropped by a failed request
                    None => Err(crate::transport::TransportError::Closed),
                };
                if let Err(e) = result {
                    log::warn!("[{}] Connection lost: {}", inner.name, e);
                    inner.drop_session();
                    inner.transition(ConnectionState::Disconnected);
                    continue;
                }
                if inner.shutdown.sleep(inner.options.service_interval) {
                    break;
                }
            }

            ConnectionState::ShuttingDown | ConnectionState::Stopped => break,
        }
    }

    inner.transition(ConnectionState::ShuttingDown);
    log::debug!("[{}] Connection loop exiting", inner.name);
}

// ============================================================================
// Unit Tests
// ============================================================================
