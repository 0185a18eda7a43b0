//! Node configuration
//!
//! ```json
//! {
//!   "vmhost_id": "host-1",
//!   "listen": "0.0.0.0:4433",
//!   "tls": { "cert": "/etc/inception/vmhost.crt", "key": "/etc/inception/vmhost.key",
//!            "ca": "/etc/inception/cacert.pem" },
//!   "kvms": [ { "service_name": "kvm-a", "addr": "10.0.0.5:4434" } ],
//!   "license": { "keyring": "/etc/inception/keyring.json" }
//! }
//! ```

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use inception::TlsFiles;
use licensing::{DEFAULT_CHECK_INTERVAL, DEFAULT_LICENSE_PATH};

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Identifier this VM host answers to in `VmHost(..)` routes
    pub vmhost_id: String,
    /// Address admin connections are accepted on
    pub listen: SocketAddr,
    /// Certificate material, used both as server and as client of the KVMs
    pub tls: TlsFiles,
    #[serde(default)]
    pub kvms: Vec<KvmPeer>,
    pub license: LicenseConfig,
}

/// One managed KVM
#[derive(Debug, Clone, Deserialize)]
pub struct KvmPeer {
    pub service_name: String,
    pub addr: SocketAddr,
    /// TLS server name, when it differs from the address
    #[serde(default)]
    pub server_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LicenseConfig {
    #[serde(default = "default_license_file")]
    pub file: PathBuf,
    pub keyring: PathBuf,
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
}

fn default_license_file() -> PathBuf {
    PathBuf::from(DEFAULT_LICENSE_PATH)
}

fn default_check_interval_secs() -> u64 {
    DEFAULT_CHECK_INTERVAL.as_secs()
}

impl LicenseConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(io::Error),
    Parse(serde_json::Error),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "cannot read config: {}", e),
            ConfigError::Parse(e) => write!(f, "cannot parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: NodeConfig = serde_json::from_str(text).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.vmhost_id.is_empty() {
            return Err(ConfigError::Invalid("vmhost_id is empty".to_string()));
        }
        let mut seen = HashSet::new();
        for kvm in &self.kvms {
            if kvm.service_name.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "KVM at {} has an empty service_name",
                    kvm.addr
                )));
            }
            if !seen.insert(kvm.service_name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate KVM service_name '{}'",
                    kvm.service_name
                )));
            }
        }
        if self.license.check_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "license.check_interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
