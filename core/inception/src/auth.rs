//! mTLS peer identity and role authorization
//!
//! Extracts the peer identity from the DER-encoded X.509 certificate
//! presented during the QUIC/TLS handshake. SAN DNS entries carry the tier
//! role the certificate was issued for.
//!
//! SAN convention:
//!   DNS:admin.<id>.inception   → Admin tier, node <id>
//!   DNS:vmhost.<id>.inception  → VM host tier, node <id>
//!   DNS:kvm.<name>.inception   → KVM tier, service <name>
//!   DNS:<role>.*.inception     → wildcard for that role
//!   (no inception SAN entries) → no role restriction (legacy certificates)

use std::collections::HashSet;
use std::fmt;

use x509_parser::prelude::*;

// ============================================================================
// Types
// ============================================================================

/// Tier a node plays in the relay topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Admin,
    VmHost,
    Kvm,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::VmHost => "vmhost",
            Role::Kvm => "kvm",
        }
    }

    fn parse(s: &str) -> Option<Role> {
        match s {
            "admin" => Some(Role::Admin),
            "vmhost" => Some(Role::VmHost),
            "kvm" => Some(Role::Kvm),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity extracted from a peer's X.509 certificate
#[derive(Debug, Clone)]
pub struct PeerIdentity {
    /// Common Name from the certificate subject
    pub common_name: String,
    /// `<role>:<id>` grants from SAN DNS entries.
    /// None means no inception SAN entries were found.
    pub grants: Option<HashSet<String>>,
}

impl PeerIdentity {
    /// Whether this peer may act as `role`
    pub fn has_role(&self, role: Role) -> bool {
        match &self.grants {
            None => true,
            Some(grants) => {
                let prefix = format!("{}:", role.as_str());
                grants.iter().any(|g| g.starts_with(&prefix))
            }
        }
    }

    /// Whether this peer may act as `role` for node/service `id`
    pub fn is_authorized_for(&self, role: Role, id: &str) -> bool {
        let grants = match &self.grants {
            None => return true,
            Some(g) => g,
        };

        // Grants are stored lowercased. Exact match, then wildcard.
        grants.contains(&format!("{}:{}", role.as_str(), id.to_lowercase()))
            || grants.contains(&format!("{}:*", role.as_str()))
    }
}

/// Errors during certificate parsing and identity extraction
#[derive(Debug)]
pub enum AuthError {
    /// Failed to parse X.509 DER certificate
    ParseError(String),
    /// Certificate has no Common Name in subject
    MissingCommonName,
    /// Peer did not present a certificate
    NoCertificate,
    /// Peer certificate lacks the required role
    Unauthorized { common_name: String, required: Role },
    /// Peer carries the role, but not for this node/service
    NotGranted {
        common_name: String,
        role: Role,
        id: String,
    },
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::ParseError(msg) => write!(f, "certificate parse error: {}", msg),
            AuthError::MissingCommonName => write!(f, "certificate has no Common Name"),
            AuthError::NoCertificate => write!(f, "peer presented no certificate"),
            AuthError::Unauthorized {
                common_name,
                required,
            } => write!(f, "'{}' is not authorized as {}", common_name, required),
            AuthError::NotGranted {
                common_name,
                role,
                id,
            } => write!(f, "'{}' is not authorized as {} '{}'", common_name, role, id),
        }
    }
}

impl std::error::Error for AuthError {}

/// Inception SAN domain suffix
const INCEPTION_SAN_SUFFIX: &str = ".inception";

// ============================================================================
// Identity Extraction
// ============================================================================

/// Extract the peer identity from a DER-encoded X.509 certificate.
pub fn extract_identity(der_cert: &[u8]) -> Result<PeerIdentity, AuthError> {
    let (_, cert) =
        X509Certificate::from_der(der_cert).map_err(|e| AuthError::ParseError(format!("{}", e)))?;

    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(|s| s.to_string())
        .ok_or(AuthError::MissingCommonName)?;

    let grants = extract_grants(&cert);

    Ok(PeerIdentity {
        common_name,
        grants,
    })
}

/// Check that an optional peer certificate carries `required`.
pub fn authorize_peer(der_cert: Option<&[u8]>, required: Role) -> Result<PeerIdentity, AuthError> {
    let der = der_cert.ok_or(AuthError::NoCertificate)?;
    let identity = extract_identity(der)?;
    if identity.has_role(required) {
        Ok(identity)
    } else {
        Err(AuthError::Unauthorized {
            common_name: identity.common_name,
            required,
        })
    }
}

/// Check that an optional peer certificate carries `role` for `id`.
pub fn authorize_peer_for(
    der_cert: Option<&[u8]>,
    role: Role,
    id: &str,
) -> Result<PeerIdentity, AuthError> {
    let identity = authorize_peer(der_cert, role)?;
    if identity.is_authorized_for(role, id) {
        Ok(identity)
    } else {
        Err(AuthError::NotGranted {
            common_name: identity.common_name,
            role,
            id: id.to_string(),
        })
    }
}

/// Collect `<role>:<id>` grants from SAN DNS entries.
///
/// Returns None if no inception SAN entries are present.
fn extract_grants(cert: &X509Certificate<'_>) -> Option<HashSet<String>> {
    let san = match cert.subject_alternative_name() {
        Ok(Some(ext)) => ext.value,
        _ => return None,
    };

    let grants: HashSet<String> = san
        .general_names
        .iter()
        .filter_map(|name| match name {
            GeneralName::DNSName(dns) => parse_inception_san(dns),
            _ => None,
        })
        .collect();

    if grants.is_empty() {
        None
    } else {
        Some(grants)
    }
}

/// Parse a single SAN DNS entry of the form `<role>.<id>.inception`.
fn parse_inception_san(dns: &str) -> Option<String> {
    let dns = dns.to_lowercase();
    let prefix = dns.strip_suffix(INCEPTION_SAN_SUFFIX)?;

    let (role, id) = prefix.split_once('.')?;
    if id.is_empty() {
        return None;
    }

    Role::parse(role).map(|role| format!("{}:{}", role.as_str(), id))
}

// ============================================================================
// Unit Tests
// ============================================================================
