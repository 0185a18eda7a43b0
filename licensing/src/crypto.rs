//! License signing and verification
//!
//! A license file is a signed blob:
//!
//! ```text
//! "INCLIC01" | bincode(SignedBlob { payload: JSON(License), signatures: [..] })
//! ```
//!
//! Each detached signature is an Ed25519 signature over the raw payload
//! bytes, tagged with the signer identity. Verification accepts the blob
//! only if one of those signatures is by [`TRUSTED_SIGNER`] and verifies
//! under the trusted key from the keyring. Other signers are ignored.

use std::fs;
use std::path::Path;

use ring::rand::SystemRandom;
use ring::signature::{self, Ed25519KeyPair, KeyPair as _, UnparsedPublicKey};
use serde::{Deserialize, Serialize};

use crate::error::LicenseError;
use crate::keyring::{Keyring, TRUSTED_SIGNER};
use crate::license::License;

/// Prefix identifying a signed license blob
pub const BLOB_MAGIC: &[u8; 8] = b"INCLIC01";

// ============================================================================
// Blob format
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetachedSignature {
    pub signer: String,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedBlob {
    pub payload: Vec<u8>,
    pub signatures: Vec<DetachedSignature>,
}

impl SignedBlob {
    pub fn encode(&self) -> Result<Vec<u8>, LicenseError> {
        let mut out = BLOB_MAGIC.to_vec();
        out.extend_from_slice(&bincode::serialize(self)?);
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, LicenseError> {
        let body = bytes
            .strip_prefix(BLOB_MAGIC.as_slice())
            .ok_or_else(|| LicenseError::Malformed("not a signed license".to_string()))?;
        Ok(bincode::deserialize(body)?)
    }

    /// Signers named on the blob (authenticity not checked)
    pub fn signers(&self) -> impl Iterator<Item = &str> {
        self.signatures.iter().map(|s| s.signer.as_str())
    }
}

// ============================================================================
// Signing
// ============================================================================

pub struct LicenseSigner {
    identity: String,
    key_pair: Ed25519KeyPair,
}

impl LicenseSigner {
    /// Fresh Ed25519 private key in PKCS#8 form
    pub fn generate_pkcs8() -> Result<Vec<u8>, LicenseError> {
        let rng = SystemRandom::new();
        let document = Ed25519KeyPair::generate_pkcs8(&rng)
            .map_err(|_| LicenseError::Malformed("failed to generate key pair".to_string()))?;
        Ok(document.as_ref().to_vec())
    }

    pub fn from_pkcs8(identity: impl Into<String>, pkcs8: &[u8]) -> Result<Self, LicenseError> {
        let key_pair = Ed25519KeyPair::from_pkcs8(pkcs8)
            .map_err(|e| LicenseError::Malformed(format!("signing key rejected: {}", e)))?;
        Ok(Self {
            identity: identity.into(),
            key_pair,
        })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn public_key(&self) -> &[u8] {
        self.key_pair.public_key().as_ref()
    }

    fn detached(&self, payload: &[u8]) -> DetachedSignature {
        DetachedSignature {
            signer: self.identity.clone(),
            signature: self.key_pair.sign(payload).as_ref().to_vec(),
        }
    }

    /// Produce a new signed license blob
    pub fn sign(&self, license: &License) -> Result<Vec<u8>, LicenseError> {
        let payload = serde_json::to_vec(license)?;
        let signatures = vec![self.detached(&payload)];
        SignedBlob {
            payload,
            signatures,
        }
        .encode()
    }

    /// Add this signer's signature to an existing blob, replacing any
    /// earlier signature by the same identity
    pub fn countersign(&self, blob: &[u8]) -> Result<Vec<u8>, LicenseError> {
        let mut signed = SignedBlob::decode(blob)?;
        signed.signatures.retain(|s| s.signer != self.identity);
        let signature = self.detached(&signed.payload);
        signed.signatures.push(signature);
        signed.encode()
    }
}

// ============================================================================
// Verification
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedLicense {
    pub license: License,
    pub signer: String,
}

pub struct LicenseVerifier {
    keyring: Keyring,
    trusted_signer: String,
}

impl LicenseVerifier {
    /// Verifier trusting only [`TRUSTED_SIGNER`]
    pub fn new(keyring: Keyring) -> Self {
        Self::with_trusted_signer(keyring, TRUSTED_SIGNER)
    }

    pub fn with_trusted_signer(keyring: Keyring, identity: impl Into<String>) -> Self {
        Self {
            keyring,
            trusted_signer: identity.into(),
        }
    }

    pub fn verify(&self, blob: &[u8]) -> Result<VerifiedLicense, LicenseError> {
        let key = self.keyring.find(&self.trusted_signer)?;
        let signed = SignedBlob::decode(blob)?;

        let public_key = UnparsedPublicKey::new(&signature::ED25519, key);
        let trusted = signed.signatures.iter().any(|s| {
            s.signer == self.trusted_signer && public_key.verify(&signed.payload, &s.signature).is_ok()
        });
        if !trusted {
            return Err(LicenseError::SignatureInvalid);
        }

        let license: License = serde_json::from_slice(&signed.payload)?;
        Ok(VerifiedLicense {
            license,
            signer: self.trusted_signer.clone(),
        })
    }

    pub fn verify_file(&self, path: &Path) -> Result<VerifiedLicense, LicenseError> {
        let blob = fs::read(path)?;
        self.verify(&blob)
    }
}
