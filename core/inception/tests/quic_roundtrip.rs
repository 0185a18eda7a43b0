//! Integration tests for the QUIC transport
//!
//! These tests run a real server and connection manager in-process over
//! loopback UDP with mutual TLS, using throwaway certificates from a test CA.

use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use inception::auth::Role;
use inception::client::QuicConnector;
use inception::{
    ConnectError, Connector, ConnectionManager, ForwardError, ManagerOptions, Metrics,
    ProtoClientGenerator, QuicServer, RawStub, RequestHandler, RpcChannel, ServerOptions,
    Shutdown, TlsFiles,
};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, IsCa, KeyPair, KeyUsagePurpose,
};

// ============================================================================
// Helpers
// ============================================================================

struct TestCa {
    cert: Certificate,
    key: KeyPair,
}

impl TestCa {
    fn new() -> Self {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name.push(DnType::CommonName, "Inception Test CA");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let cert = params.self_signed(&key).unwrap();
        Self { cert, key }
    }

    /// Issue a leaf certificate and write cert/key/CA PEMs into `dir`
    fn issue(&self, dir: &Path, name: &str, sans: &[&str]) -> TlsFiles {
        let key = KeyPair::generate().unwrap();
        let sans: Vec<String> = sans.iter().map(|s| s.to_string()).collect();
        let mut params = CertificateParams::new(sans).unwrap();
        params.distinguished_name.push(DnType::CommonName, name);
        let cert = params.signed_by(&key, &self.cert, &self.key).unwrap();

        let tls = TlsFiles {
            cert: dir.join(format!("{}.crt", name)),
            key: dir.join(format!("{}.key", name)),
            ca: Some(dir.join("ca.crt")),
        };
        std::fs::write(&tls.cert, cert.pem()).unwrap();
        std::fs::write(&tls.key, key.serialize_pem()).unwrap();
        std::fs::write(dir.join("ca.crt"), self.cert.pem()).unwrap();
        tls
    }
}

/// Echoes the request; "fail" produces a handler error
struct EchoHandler;

impl RequestHandler for EchoHandler {
    fn handle(&self, request: &[u8]) -> Result<Vec<u8>, ForwardError> {
        if request == b"fail" {
            return Err(ForwardError::Remote("daemon unavailable".to_string()));
        }
        let mut reply = b"kvm:".to_vec();
        reply.extend_from_slice(request);
        Ok(reply)
    }
}

struct RunningServer {
    addr: std::net::SocketAddr,
    shutdown: Shutdown,
    metrics: Arc<Metrics>,
    handle: Option<JoinHandle<()>>,
}

impl RunningServer {
    fn start(tls: TlsFiles, allowed_role: Option<Role>) -> Self {
        let options = ServerOptions {
            listen: "127.0.0.1:0".parse().unwrap(),
            tls,
            allowed_role,
        };
        let metrics = Arc::new(Metrics::new());
        let mut server = QuicServer::bind(&options, Arc::new(EchoHandler), metrics.clone()).unwrap();
        let addr = server.local_addr().unwrap();

        let shutdown = Shutdown::new();
        let token = shutdown.clone();
        let handle = thread::spawn(move || {
            server.run(&token).unwrap();
        });

        Self {
            addr,
            shutdown,
            metrics,
            handle: Some(handle),
        }
    }
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        self.shutdown.trigger();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn test_request_reply_over_mtls() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let ca = TestCa::new();
    let server_tls = ca.issue(dir.path(), "kvm-svca", &["kvm.svca.inception"]);
    let client_tls = ca.issue(dir.path(), "vmhost-1", &["vmhost.host-1.inception"]);

    let server = RunningServer::start(server_tls, Some(Role::VmHost));

    let connector = QuicConnector::new(server.addr, client_tls).expect_role(Role::Kvm);
    let manager = ConnectionManager::new(
        "svcA",
        Box::new(connector),
        ManagerOptions::default(),
        &Shutdown::new(),
        Arc::new(Metrics::new()),
    );
    manager.start().unwrap();
    assert!(manager.wait_connected(Duration::from_secs(10)));

    assert_eq!(manager.do_rpc(b"ping").unwrap(), b"kvm:ping");

    // Binary payloads pass through untouched
    let blob: Vec<u8> = (0..=255u8).cycle().take(100_000).collect();
    let reply = manager.do_rpc(&blob).unwrap();
    assert_eq!(&reply[..4], b"kvm:");
    assert_eq!(&reply[4..], &blob[..]);

    manager.stop();
    assert!(server.metrics.requests_handled_total.load(Ordering::Relaxed) >= 2);
}

#[test]
fn test_remote_error_keeps_connection() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let ca = TestCa::new();
    let server_tls = ca.issue(dir.path(), "kvm-svca", &["kvm.svca.inception"]);
    let client_tls = ca.issue(dir.path(), "vmhost-1", &["vmhost.host-1.inception"]);
    let server = RunningServer::start(server_tls, Some(Role::VmHost));

    let connector = QuicConnector::new(server.addr, client_tls);
    let manager = Arc::new(ConnectionManager::new(
        "svcA",
        Box::new(connector),
        ManagerOptions::default(),
        &Shutdown::new(),
        Arc::new(Metrics::new()),
    ));
    manager.start().unwrap();
    assert!(manager.wait_connected(Duration::from_secs(10)));

    assert_eq!(
        manager.do_rpc(b"fail"),
        Err(ForwardError::Remote("daemon unavailable".to_string()))
    );
    assert!(manager.is_connected());

    // The same connection keeps serving, also through a stub
    let generator = ProtoClientGenerator::<RawStub>::new(manager.clone());
    assert_eq!(generator.vclient().call(b"after").unwrap(), b"kvm:after");
    manager.stop();
}

#[test]
fn test_client_rejects_peer_with_wrong_role() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let ca = TestCa::new();
    let server_tls = ca.issue(dir.path(), "vmhost-2", &["vmhost.host-2.inception"]);
    let client_tls = ca.issue(dir.path(), "admin", &["admin.panel.inception"]);
    let server = RunningServer::start(server_tls, None);

    let connector = QuicConnector::new(server.addr, client_tls).expect_role(Role::Kvm);
    match connector.connect() {
        Err(ConnectError::Rejected(_)) => {}
        Err(other) => panic!("Expected Rejected, got {}", other),
        Ok(_) => panic!("Expected Rejected, got a session"),
    }
}

#[test]
fn test_client_rejects_kvm_granted_for_another_service() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let ca = TestCa::new();
    let server_tls = ca.issue(dir.path(), "kvm-svcb", &["kvm.svcb.inception"]);
    let client_tls = ca.issue(dir.path(), "vmhost-1", &["vmhost.host-1.inception"]);
    let server = RunningServer::start(server_tls, Some(Role::VmHost));

    let connector = QuicConnector::new(server.addr, client_tls.clone()).expect_grant(Role::Kvm, "svcA");
    match connector.connect() {
        Err(ConnectError::Rejected(msg)) => assert!(msg.contains("svcA"), "{}", msg),
        Err(other) => panic!("Expected Rejected, got {}", other),
        Ok(_) => panic!("Expected Rejected, got a session"),
    }

    // The same certificate is accepted for the service it was issued for
    let connector = QuicConnector::new(server.addr, client_tls).expect_grant(Role::Kvm, "svcB");
    let mut session = connector.connect().unwrap();
    assert_eq!(session.call(b"ping", Duration::from_secs(5)).unwrap(), b"kvm:ping");
    session.close();
}

#[test]
fn test_server_rejects_peer_with_wrong_role() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let ca = TestCa::new();
    let server_tls = ca.issue(dir.path(), "kvm-svca", &["kvm.svca.inception"]);
    let client_tls = ca.issue(dir.path(), "admin", &["admin.panel.inception"]);
    let server = RunningServer::start(server_tls, Some(Role::VmHost));

    let connector = QuicConnector::new(server.addr, client_tls);
    // The handshake itself succeeds; the server closes right after
    if let Ok(mut session) = connector.connect() {
        assert!(session.call(b"ping", Duration::from_secs(2)).is_err());
    }

    assert!(server.metrics.requests_rejected_total.load(Ordering::Relaxed) >= 1);
    assert_eq!(server.metrics.requests_handled_total.load(Ordering::Relaxed), 0);
}

#[test]
fn test_untrusted_client_certificate_fails_handshake() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let other_dir = tempfile::tempdir().unwrap();
    let ca = TestCa::new();
    let rogue_ca = TestCa::new();
    let server_tls = ca.issue(dir.path(), "kvm-svca", &["kvm.svca.inception"]);
    let mut client_tls = rogue_ca.issue(other_dir.path(), "vmhost-x", &["vmhost.x.inception"]);
    // Client trusts the real CA but presents a certificate from another one
    client_tls.ca = server_tls.ca.clone();
    let server = RunningServer::start(server_tls, Some(Role::VmHost));

    let connector = QuicConnector::new(server.addr, client_tls)
        .with_handshake_timeout(Duration::from_secs(3));
    if let Ok(mut session) = connector.connect() {
        assert!(session.call(b"ping", Duration::from_secs(2)).is_err());
    }
    assert_eq!(server.metrics.requests_handled_total.load(Ordering::Relaxed), 0);
}
