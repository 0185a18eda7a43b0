//! License verification errors

use std::fmt;
use std::io;

#[derive(Debug)]
pub enum LicenseError {
    /// The trusted signer's public key is not in the keyring
    KeyNotFound(String),
    /// No valid signature by the trusted signer over the payload
    SignatureInvalid,
    /// The blob or its payload could not be decoded
    Malformed(String),
    Io(io::Error),
}

impl fmt::Display for LicenseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LicenseError::KeyNotFound(identity) => {
                write!(f, "public key for '{}' not found in keyring", identity)
            }
            LicenseError::SignatureInvalid => write!(f, "license signature is invalid"),
            LicenseError::Malformed(msg) => write!(f, "malformed license: {}", msg),
            LicenseError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for LicenseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LicenseError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for LicenseError {
    fn from(e: io::Error) -> Self {
        LicenseError::Io(e)
    }
}

impl From<serde_json::Error> for LicenseError {
    fn from(e: serde_json::Error) -> Self {
        LicenseError::Malformed(e.to_string())
    }
}

impl From<bincode::Error> for LicenseError {
    fn from(e: bincode::Error) -> Self {
        LicenseError::Malformed(e.to_string())
    }
}
