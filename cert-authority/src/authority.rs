//! Certificate authority
//!
//! Key pairs, CSRs and certificates for internal service identity. The CA
//! state lives in one directory:
//!
//! ```text
//! <cadir>/ca.key            CA private key (PEM, 0600)
//! <cadir>/ca.crt            CA certificate (PEM)
//! <cadir>/serial            next serial number (decimal)
//! <cadir>/issued/<n>.crt    every certificate issued, by serial
//! ```

use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, CertificateSigningRequest,
    CertificateSigningRequestParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, SerialNumber,
};
use ::time::{Duration, OffsetDateTime};
use x509_parser::prelude::*;

// ============================================================================
// Constants
// ============================================================================

/// Fixed subject fields of every CSR
pub const SUBJECT_ORGANIZATION: &str = "AeroFS";
pub const SUBJECT_COUNTRY: &str = "US";
pub const SUBJECT_STATE: &str = "California";
pub const SUBJECT_LOCALITY: &str = "Palo Alto";

/// Common name of the CA certificate created by [`CertificateAuthority::init`]
pub const CA_COMMON_NAME: &str = "Inception CA";

/// Default validity of a self-signed or issued certificate
pub const DEFAULT_VALIDITY_DAYS: u32 = 365;

/// Validity of a newly created CA certificate
pub const CA_VALIDITY_DAYS: u32 = 3650;

const CA_KEY_FILE: &str = "ca.key";
const CA_CERT_FILE: &str = "ca.crt";
const SERIAL_FILE: &str = "serial";
const ISSUED_DIR: &str = "issued";

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub enum CaError {
    Io(io::Error),
    /// Key or certificate generation failed
    Certificate(rcgen::Error),
    /// The submitted CSR could not be parsed or its signature is invalid
    BadRequest(String),
    /// The signing key does not belong to the CSR
    KeyMismatch,
    /// CA directory content could not be read back
    Corrupt(String),
}

impl fmt::Display for CaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaError::Io(e) => write!(f, "I/O error: {}", e),
            CaError::Certificate(e) => write!(f, "certificate error: {}", e),
            CaError::BadRequest(msg) => write!(f, "bad certificate request: {}", msg),
            CaError::KeyMismatch => write!(f, "key pair does not match the CSR"),
            CaError::Corrupt(msg) => write!(f, "corrupt CA directory: {}", msg),
        }
    }
}

impl std::error::Error for CaError {}

impl From<io::Error> for CaError {
    fn from(e: io::Error) -> Self {
        CaError::Io(e)
    }
}

impl From<rcgen::Error> for CaError {
    fn from(e: rcgen::Error) -> Self {
        CaError::Certificate(e)
    }
}

// ============================================================================
// Keys, CSRs and self-signing
// ============================================================================

pub fn generate_key_pair() -> Result<KeyPair, CaError> {
    Ok(KeyPair::generate()?)
}

fn subject(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, SUBJECT_ORGANIZATION);
    dn.push(DnType::CountryName, SUBJECT_COUNTRY);
    dn.push(DnType::StateOrProvinceName, SUBJECT_STATE);
    dn.push(DnType::LocalityName, SUBJECT_LOCALITY);
    dn.push(DnType::CommonName, common_name);
    dn
}

/// CSR with the fixed subject template, signed by `key_pair`
pub fn create_csr(
    common_name: &str,
    key_pair: &KeyPair,
) -> Result<CertificateSigningRequest, CaError> {
    create_csr_with_names(common_name, &[], key_pair)
}

/// Like [`create_csr`], also requesting DNS subject alternative names
pub fn create_csr_with_names(
    common_name: &str,
    dns_names: &[String],
    key_pair: &KeyPair,
) -> Result<CertificateSigningRequest, CaError> {
    let mut params = CertificateParams::new(dns_names.to_vec())?;
    params.distinguished_name = subject(common_name);
    Ok(params.serialize_request(key_pair)?)
}

/// Shortest big-endian encoding of `serial` (at least one byte)
fn serial_number(serial: u64) -> SerialNumber {
    let bytes = serial.to_be_bytes();
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len() - 1);
    SerialNumber::from_slice(&bytes[first..])
}

fn validity(params: &mut CertificateParams, days: u32) {
    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(i64::from(days));
}

/// Parse a PEM CSR and check its self-signature. Returns the DER bytes.
fn parse_csr_pem(pem: &str) -> Result<Vec<u8>, CaError> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(pem.as_bytes())
        .map_err(|e| CaError::BadRequest(format!("invalid PEM: {}", e)))?;
    if pem.label != "CERTIFICATE REQUEST" {
        return Err(CaError::BadRequest(format!("unexpected PEM block '{}'", pem.label)));
    }

    let (_, csr) = X509CertificationRequest::from_der(&pem.contents)
        .map_err(|e| CaError::BadRequest(format!("invalid CSR: {}", e)))?;
    csr.verify_signature()
        .map_err(|e| CaError::BadRequest(format!("CSR signature: {}", e)))?;

    Ok(pem.contents)
}

/// Whether the CSR's public key is `key_pair`'s
fn csr_matches_key(csr_der: &[u8], key_pair: &KeyPair) -> Result<bool, CaError> {
    let (_, csr) = X509CertificationRequest::from_der(csr_der)
        .map_err(|e| CaError::BadRequest(format!("invalid CSR: {}", e)))?;
    let spki = &csr.certification_request_info.subject_pki;
    Ok(spki.subject_public_key.data.as_ref() == key_pair.public_key_raw())
}

/// Certificate for the CSR's subject and key, signed by that same key:
/// issuer == subject, `not_before = now`, `not_after = now + validity_days`.
pub fn self_sign(
    key_pair: &KeyPair,
    csr: &CertificateSigningRequest,
    serial: u64,
    validity_days: u32,
) -> Result<Certificate, CaError> {
    let pem = csr.pem()?;
    let der = parse_csr_pem(&pem)?;
    if !csr_matches_key(&der, key_pair)? {
        return Err(CaError::KeyMismatch);
    }

    let mut params = CertificateSigningRequestParams::from_pem(&pem)?.params;
    params.serial_number = Some(serial_number(serial));
    validity(&mut params, validity_days);
    Ok(params.self_signed(key_pair)?)
}

// ============================================================================
// PEM output
// ============================================================================

/// Write the private key as PEM, readable only by its owner
pub fn write_key(key_pair: &KeyPair, path: &Path) -> io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(key_pair.serialize_pem().as_bytes())
}

pub fn write_cert(cert: &Certificate, path: &Path) -> io::Result<()> {
    fs::write(path, cert.pem())
}

// ============================================================================
// Certificate authority
// ============================================================================

pub struct CertificateAuthority {
    dir: PathBuf,
    key: KeyPair,
    /// Issuer rebuilt from the on-disk CA certificate
    cert: Certificate,
    /// PEM served to clients, byte-identical to ca.crt
    cert_pem: String,
    validity_days: u32,
    /// Serializes serial allocation and archive writes
    serial_lock: Mutex<()>,
}

impl CertificateAuthority {
    /// Create a new CA key and certificate in `dir`
    pub fn init(dir: &Path) -> Result<Self, CaError> {
        fs::create_dir_all(dir.join(ISSUED_DIR))?;

        let key = generate_key_pair()?;
        let mut params = CertificateParams::new(Vec::<String>::new())?;
        params.distinguished_name = subject(CA_COMMON_NAME);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.serial_number = Some(serial_number(0));
        validity(&mut params, CA_VALIDITY_DAYS);
        let cert = params.self_signed(&key)?;

        write_key(&key, &dir.join(CA_KEY_FILE))?;
        write_cert(&cert, &dir.join(CA_CERT_FILE))?;
        fs::write(dir.join(SERIAL_FILE), "1\n")?;

        log::info!("Initialized new CA in {}", dir.display());
        Self::open(dir)
    }

    /// Load an existing CA directory
    pub fn open(dir: &Path) -> Result<Self, CaError> {
        let key_pem = fs::read_to_string(dir.join(CA_KEY_FILE))?;
        let cert_pem = fs::read_to_string(dir.join(CA_CERT_FILE))?;

        let key = KeyPair::from_pem(&key_pem)
            .map_err(|e| CaError::Corrupt(format!("{}: {}", CA_KEY_FILE, e)))?;
        let params = CertificateParams::from_ca_cert_pem(&cert_pem)
            .map_err(|e| CaError::Corrupt(format!("{}: {}", CA_CERT_FILE, e)))?;
        let cert = params.self_signed(&key)?;
        fs::create_dir_all(dir.join(ISSUED_DIR))?;

        Ok(Self {
            dir: dir.to_path_buf(),
            key,
            cert,
            cert_pem,
            validity_days: DEFAULT_VALIDITY_DAYS,
            serial_lock: Mutex::new(()),
        })
    }

    /// Open `dir`, initializing it first when it holds no CA
    pub fn open_or_init(dir: &Path) -> Result<Self, CaError> {
        if dir.join(CA_KEY_FILE).exists() {
            Self::open(dir)
        } else {
            Self::init(dir)
        }
    }

    pub fn with_validity_days(mut self, days: u32) -> Self {
        self.validity_days = days;
        self
    }

    pub fn ca_cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Next serial number, persisted before it is used
    fn next_serial(&self) -> Result<u64, CaError> {
        let path = self.dir.join(SERIAL_FILE);
        let serial = match fs::read_to_string(&path) {
            Ok(text) => text
                .trim()
                .parse::<u64>()
                .map_err(|e| CaError::Corrupt(format!("{}: {}", SERIAL_FILE, e)))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => 1,
            Err(e) => return Err(e.into()),
        };
        fs::write(&path, format!("{}\n", serial + 1))?;
        Ok(serial)
    }

    /// Sign a PEM CSR, returning the issued certificate as PEM
    pub fn sign_request_pem(&self, csr_pem: &str) -> Result<String, CaError> {
        parse_csr_pem(csr_pem)?;
        let mut csr = CertificateSigningRequestParams::from_pem(csr_pem)
            .map_err(|e| CaError::BadRequest(e.to_string()))?;

        let _guard = self.serial_lock.lock().unwrap_or_else(|e| e.into_inner());
        let serial = self.next_serial()?;

        let params = &mut csr.params;
        params.serial_number = Some(serial_number(serial));
        validity(params, self.validity_days);
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        params.use_authority_key_identifier_extension = true;

        let cert = csr.signed_by(&self.cert, &self.key)?;
        let pem = cert.pem();
        fs::write(
            self.dir.join(ISSUED_DIR).join(format!("{}.crt", serial)),
            &pem,
        )?;

        log::info!("Issued certificate serial {}", serial);
        Ok(pem)
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_pem(pem: &str) -> Vec<u8> {
        let (_, pem) = x509_parser::pem::parse_x509_pem(pem.as_bytes()).unwrap();
        pem.contents
    }

    #[test]
    fn test_csr_subject_template() {
        let key = generate_key_pair().unwrap();
        let csr = create_csr("vmhost-1", &key).unwrap();

        let der = parse_csr_pem(&csr.pem().unwrap()).unwrap();
        let (_, parsed) = X509CertificationRequest::from_der(&der).unwrap();
        let subject = parsed.certification_request_info.subject.to_string();
        assert!(subject.contains("CN=vmhost-1"));
        assert!(subject.contains("O=AeroFS"));
        assert!(subject.contains("C=US"));
        assert!(subject.contains("ST=California"));
        assert!(subject.contains("L=Palo Alto"));
    }

    #[test]
    fn test_self_sign_issuer_is_subject() {
        let key = generate_key_pair().unwrap();
        let csr = create_csr("kvm-a", &key).unwrap();
        let cert = self_sign(&key, &csr, 0, DEFAULT_VALIDITY_DAYS).unwrap();

        let der = cert.der().to_vec();
        let (_, parsed) = X509Certificate::from_der(&der).unwrap();
        assert_eq!(parsed.issuer().to_string(), parsed.subject().to_string());
        assert!(parsed.subject().to_string().contains("CN=kvm-a"));
        parsed.verify_signature(None).unwrap();

        let validity = parsed.validity();
        let days = (validity.not_after.timestamp() - validity.not_before.timestamp()) / 86_400;
        assert_eq!(days, 365);
        assert_eq!(parsed.raw_serial(), &[0]);
    }

    #[test]
    fn test_self_sign_rejects_foreign_key() {
        let key = generate_key_pair().unwrap();
        let other = generate_key_pair().unwrap();
        let csr = create_csr("kvm-a", &key).unwrap();

        assert!(matches!(
            self_sign(&other, &csr, 0, 30),
            Err(CaError::KeyMismatch)
        ));
    }

    #[test]
    fn test_serial_number_minimal() {
        let der = {
            let key = generate_key_pair().unwrap();
            let csr = create_csr("s", &key).unwrap();
            self_sign(&key, &csr, 0x0102, 1).unwrap().der().to_vec()
        };
        let (_, parsed) = X509Certificate::from_der(&der).unwrap();
        assert_eq!(parsed.raw_serial(), &[0x01, 0x02]);
    }

    #[test]
    fn test_write_key_and_cert() {
        let dir = tempfile::tempdir().unwrap();
        let key = generate_key_pair().unwrap();
        let csr = create_csr("writer", &key).unwrap();
        let cert = self_sign(&key, &csr, 7, 30).unwrap();

        write_key(&key, &dir.path().join("node.key")).unwrap();
        write_cert(&cert, &dir.path().join("node.crt")).unwrap();

        let key_pem = fs::read_to_string(dir.path().join("node.key")).unwrap();
        assert!(KeyPair::from_pem(&key_pem).is_ok());
        let cert_der = parse_pem(&fs::read_to_string(dir.path().join("node.crt")).unwrap());
        assert_eq!(cert_der, cert.der().to_vec());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(dir.path().join("node.key")).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_write_errors_propagate() {
        let key = generate_key_pair().unwrap();
        let err = write_key(&key, Path::new("/nonexistent/dir/node.key")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_ca_issues_verifiable_certificates() {
        let dir = tempfile::tempdir().unwrap();
        let ca = CertificateAuthority::init(dir.path()).unwrap();

        let key = generate_key_pair().unwrap();
        let names = vec!["vmhost.host-1.inception".to_string()];
        let csr = create_csr_with_names("vmhost-1", &names, &key).unwrap();
        let pem = ca.sign_request_pem(&csr.pem().unwrap()).unwrap();

        let ca_der = parse_pem(ca.ca_cert_pem());
        let (_, ca_cert) = X509Certificate::from_der(&ca_der).unwrap();
        let leaf_der = parse_pem(&pem);
        let (_, leaf) = X509Certificate::from_der(&leaf_der).unwrap();

        assert_eq!(leaf.issuer().to_string(), ca_cert.subject().to_string());
        assert!(leaf.subject().to_string().contains("CN=vmhost-1"));
        leaf.verify_signature(Some(ca_cert.public_key())).unwrap();
        assert!(!leaf.is_ca());

        let san = leaf.subject_alternative_name().unwrap().unwrap();
        assert!(san
            .value
            .general_names
            .iter()
            .any(|n| matches!(n, GeneralName::DNSName("vmhost.host-1.inception"))));
        assert!(dir.path().join("issued/1.crt").exists());
    }

    #[test]
    fn test_serials_increase_and_persist() {
        let dir = tempfile::tempdir().unwrap();
        let key = generate_key_pair().unwrap();
        let csr_pem = create_csr("node", &key).unwrap().pem().unwrap();

        let serial_of = |pem: &str| {
            let der = parse_pem(pem);
            let (_, cert) = X509Certificate::from_der(&der).unwrap();
            cert.raw_serial().to_vec()
        };

        let first = {
            let ca = CertificateAuthority::init(dir.path()).unwrap();
            let a = ca.sign_request_pem(&csr_pem).unwrap();
            let b = ca.sign_request_pem(&csr_pem).unwrap();
            assert_eq!(serial_of(&a), vec![1]);
            assert_eq!(serial_of(&b), vec![2]);
            ca.ca_cert_pem().to_string()
        };

        // Reopened CA continues the sequence and serves the same certificate
        let ca = CertificateAuthority::open_or_init(dir.path()).unwrap();
        assert_eq!(ca.ca_cert_pem(), first);
        let c = ca.sign_request_pem(&csr_pem).unwrap();
        assert_eq!(serial_of(&c), vec![3]);

        let ca_der = parse_pem(&first);
        let (_, ca_cert) = X509Certificate::from_der(&ca_der).unwrap();
        let leaf_der = parse_pem(&c);
        let (_, leaf) = X509Certificate::from_der(&leaf_der).unwrap();
        leaf.verify_signature(Some(ca_cert.public_key())).unwrap();
    }

    #[test]
    fn test_bad_requests() {
        let dir = tempfile::tempdir().unwrap();
        let ca = CertificateAuthority::init(dir.path()).unwrap();

        assert!(matches!(
            ca.sign_request_pem("not a csr"),
            Err(CaError::BadRequest(_))
        ));
        // A certificate is not a request
        assert!(matches!(
            ca.sign_request_pem(ca.ca_cert_pem()),
            Err(CaError::BadRequest(_))
        ));
    }
}
