//! Inception certificate authority
//!
//! Issues the X.509 certificates that identify admin, VM host and KVM
//! processes to each other. A small loopback HTTP server signs CSRs:
//!
//! ```text
//! POST /prod            body: PEM CSR   ->  200 PEM certificate
//! GET  /prod/cacert.pem                 ->  200 PEM CA certificate
//! ```

pub mod authority;
pub mod server;

pub use authority::{
    create_csr, create_csr_with_names, generate_key_pair, self_sign, write_cert, write_key,
    CaError, CertificateAuthority, DEFAULT_VALIDITY_DAYS,
};
pub use server::{build_router, serve};
