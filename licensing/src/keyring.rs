//! Trusted keyring
//!
//! JSON document listing signer identities and their Ed25519 public keys
//! (base64). Verification only ever looks up [`TRUSTED_SIGNER`].

use std::fs;
use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::LicenseError;

/// Identity whose signature makes a license authentic
pub const TRUSTED_SIGNER: &str = "licensing@aerofs.com";

/// Default location of the installed license file
pub const DEFAULT_LICENSE_PATH: &str = "/etc/aerofs/license.gpg";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustedKey {
    pub identity: String,
    /// Base64 Ed25519 public key
    pub public_key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keyring {
    signers: Vec<TrustedKey>,
}

impl Keyring {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> Result<Self, LicenseError> {
        let json = fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn from_json(json: &str) -> Result<Self, LicenseError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String, LicenseError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), LicenseError> {
        fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Add or replace the key for `identity`
    pub fn add(&mut self, identity: impl Into<String>, public_key: &[u8]) {
        let identity = identity.into();
        self.signers.retain(|k| k.identity != identity);
        self.signers.push(TrustedKey {
            identity,
            public_key: STANDARD.encode(public_key),
        });
    }

    /// Raw public key bytes for `identity`
    pub fn find(&self, identity: &str) -> Result<Vec<u8>, LicenseError> {
        let entry = self
            .signers
            .iter()
            .find(|k| k.identity == identity)
            .ok_or_else(|| LicenseError::KeyNotFound(identity.to_string()))?;

        STANDARD
            .decode(&entry.public_key)
            .map_err(|e| LicenseError::Malformed(format!("keyring entry '{}': {}", identity, e)))
    }

    pub fn identities(&self) -> impl Iterator<Item = &str> {
        self.signers.iter().map(|k| k.identity.as_str())
    }
}
