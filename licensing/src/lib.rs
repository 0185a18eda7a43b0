//! Inception licensing
//!
//! Issue, sign, verify and enforce license files:
//! - [`License`]: the immutable license record
//! - [`Keyring`]: trusted signer identities and public keys
//! - [`LicenseSigner`] / [`LicenseVerifier`]: detached Ed25519 signatures
//! - [`LicenseEnforcer`]: periodic fail-closed enforcement
//!
//! ```text
//! license-tool issue ──► license.gpg ──► LicenseVerifier::verify ──► is_currently_valid
//!                                                   │ failure
//!                                                   ▼
//!                                       ServiceController::stop(..)
//! ```

pub mod crypto;
pub mod enforcer;
pub mod error;
pub mod keyring;
pub mod license;

pub use crypto::{LicenseSigner, LicenseVerifier, SignedBlob, VerifiedLicense};
pub use enforcer::{
    LicenseEnforcer, LicenseStatus, ServiceController, ShutdownController, SystemctlController,
    DEFAULT_CHECK_INTERVAL,
};
pub use error::LicenseError;
pub use keyring::{Keyring, DEFAULT_LICENSE_PATH, TRUSTED_SIGNER};
pub use license::License;
