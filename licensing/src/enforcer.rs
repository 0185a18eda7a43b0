//! Periodic license enforcement
//!
//! On every pass the enforcer verifies the installed license and checks its
//! validity window. Any failure (file missing, bad signature, expired) stops
//! the dependent services. A valid license leaves them alone.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use inception::Shutdown;

use crate::crypto::LicenseVerifier;
use crate::error::LicenseError;
use crate::license::License;

/// Default period between enforcement passes
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(3600);

// ============================================================================
// Status
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LicenseStatus {
    Valid(License),
    /// No license file installed
    Missing,
    /// Present but not authentic or not decodable
    Invalid(String),
    /// Authentic but past its expiry date
    Expired(License),
}

impl LicenseStatus {
    pub fn is_valid(&self) -> bool {
        matches!(self, LicenseStatus::Valid(_))
    }
}

impl fmt::Display for LicenseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LicenseStatus::Valid(license) => write!(
                f,
                "license valid (customer {}, {} seats, expires at {})",
                license.customer_id, license.seats, license.expiry_date
            ),
            LicenseStatus::Missing => write!(f, "no license file"),
            LicenseStatus::Invalid(reason) => write!(f, "invalid license: {}", reason),
            LicenseStatus::Expired(license) => {
                write!(f, "license expired at {}", license.expiry_date)
            }
        }
    }
}

// ============================================================================
// Service control
// ============================================================================

/// Stops a named service that depends on a valid license
pub trait ServiceController: Send + Sync {
    fn stop(&self, service: &str) -> io::Result<()>;
}

/// Stops system services with `systemctl stop`
pub struct SystemctlController;

impl ServiceController for SystemctlController {
    fn stop(&self, service: &str) -> io::Result<()> {
        let status = Command::new("systemctl").arg("stop").arg(service).status()?;
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::Other,
                format!("systemctl stop {} exited with {}", service, status),
            ))
        }
    }
}

/// Stops in-process services by triggering their shutdown token
pub struct ShutdownController {
    shutdown: Shutdown,
}

impl ShutdownController {
    pub fn new(shutdown: Shutdown) -> Self {
        Self { shutdown }
    }
}

impl ServiceController for ShutdownController {
    fn stop(&self, service: &str) -> io::Result<()> {
        log::warn!("Shutting down {}", service);
        self.shutdown.trigger();
        Ok(())
    }
}

// ============================================================================
// Enforcer
// ============================================================================

pub struct LicenseEnforcer {
    license_path: PathBuf,
    verifier: LicenseVerifier,
    services: Vec<String>,
    controller: Arc<dyn ServiceController>,
}

impl LicenseEnforcer {
    pub fn new(
        license_path: impl Into<PathBuf>,
        verifier: LicenseVerifier,
        services: Vec<String>,
        controller: Arc<dyn ServiceController>,
    ) -> Self {
        Self {
            license_path: license_path.into(),
            verifier,
            services,
            controller,
        }
    }

    /// Verify the installed license without acting on the result
    pub fn check(&self) -> LicenseStatus {
        match self.verifier.verify_file(&self.license_path) {
            Ok(verified) if verified.license.is_currently_valid() => {
                LicenseStatus::Valid(verified.license)
            }
            Ok(verified) => LicenseStatus::Expired(verified.license),
            Err(LicenseError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                LicenseStatus::Missing
            }
            Err(e) => LicenseStatus::Invalid(e.to_string()),
        }
    }

    /// One enforcement pass
    pub fn enforce_once(&self) -> LicenseStatus {
        let status = self.check();
        if status.is_valid() {
            log::debug!("{}", status);
            return status;
        }

        log::error!(
            "{} ({}), stopping {} service(s)",
            status,
            self.license_path.display(),
            self.services.len()
        );
        for service in &self.services {
            match self.controller.stop(service) {
                Ok(()) => log::info!("Stopped {}", service),
                Err(e) => log::error!("Failed to stop {}: {}", service, e),
            }
        }
        status
    }

    /// Enforce now and then every `interval` until `shutdown` fires
    pub fn run(&self, interval: Duration, shutdown: &Shutdown) {
        log::info!(
            "License enforcement every {}s for {}",
            interval.as_secs(),
            self.license_path.display()
        );
        loop {
            if shutdown.is_triggered() {
                break;
            }
            self.enforce_once();
            if shutdown.sleep(interval) {
                break;
            }
        }
        log::debug!("License enforcement stopped");
    }

    /// Run [`run`](Self::run) on a background thread
    pub fn spawn(self, interval: Duration, shutdown: Shutdown) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("license-enforcer".to_string())
            .spawn(move || self.run(interval, &shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::LicenseSigner;
    use crate::keyring::{Keyring, TRUSTED_SIGNER};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingController {
        stopped: Mutex<Vec<String>>,
    }

    impl ServiceController for RecordingController {
        fn stop(&self, service: &str) -> io::Result<()> {
            self.stopped.lock().unwrap().push(service.to_string());
            Ok(())
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        signer: LicenseSigner,
        controller: Arc<RecordingController>,
    }

    impl Fixture {
        fn new() -> Self {
            let pkcs8 = LicenseSigner::generate_pkcs8().unwrap();
            Self {
                dir: tempfile::tempdir().unwrap(),
                signer: LicenseSigner::from_pkcs8(TRUSTED_SIGNER, &pkcs8).unwrap(),
                controller: Arc::new(RecordingController::default()),
            }
        }

        fn license_path(&self) -> PathBuf {
            self.dir.path().join("license.gpg")
        }

        fn install(&self, valid_for: Duration) {
            let license = License::new("cust-1", 5, valid_for);
            std::fs::write(self.license_path(), self.signer.sign(&license).unwrap()).unwrap();
        }

        fn enforcer(&self) -> LicenseEnforcer {
            let mut keyring = Keyring::new();
            keyring.add(TRUSTED_SIGNER, self.signer.public_key());
            LicenseEnforcer::new(
                self.license_path(),
                LicenseVerifier::new(keyring),
                vec!["vmhost-agent".to_string(), "kvm-agent".to_string()],
                self.controller.clone(),
            )
        }

        fn stopped(&self) -> Vec<String> {
            self.controller.stopped.lock().unwrap().clone()
        }
    }

    #[test]
    fn test_valid_license_leaves_services_running() {
        let f = Fixture::new();
        f.install(Duration::from_secs(3600));

        assert!(f.enforcer().enforce_once().is_valid());
        assert!(f.stopped().is_empty());
    }

    #[test]
    fn test_missing_license_stops_services() {
        let f = Fixture::new();

        assert_eq!(f.enforcer().enforce_once(), LicenseStatus::Missing);
        assert_eq!(f.stopped(), vec!["vmhost-agent", "kvm-agent"]);
    }

    #[test]
    fn test_expired_license_stops_services() {
        let f = Fixture::new();
        f.install(Duration::ZERO);

        let status = f.enforcer().enforce_once();
        assert!(matches!(status, LicenseStatus::Expired(_)));
        assert!(status.to_string().starts_with("license expired"));
        assert_eq!(f.stopped().len(), 2);
    }

    #[test]
    fn test_invalid_license_stops_services() {
        let f = Fixture::new();
        std::fs::write(f.license_path(), b"garbage").unwrap();

        let status = f.enforcer().enforce_once();
        assert!(matches!(status, LicenseStatus::Invalid(_)));
        assert_eq!(f.stopped().len(), 2);
    }

    #[test]
    fn test_run_stops_on_shutdown() {
        let f = Fixture::new();
        let shutdown = Shutdown::new();
        let handle = f
            .enforcer()
            .spawn(Duration::from_secs(3600), shutdown.clone())
            .unwrap();

        // First pass happens immediately
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while f.stopped().is_empty() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(f.stopped().len(), 2);

        shutdown.trigger();
        handle.join().unwrap();
    }

    #[test]
    fn test_shutdown_controller_triggers_token() {
        let shutdown = Shutdown::new();
        let controller = ShutdownController::new(shutdown.clone());
        controller.stop("relay").unwrap();
        assert!(shutdown.is_triggered());
    }
}
