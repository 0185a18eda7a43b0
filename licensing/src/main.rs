//! license-tool
//!
//! Key generation, license issuance, verification and enforcement.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use clap::{Parser, Subcommand};

use inception::Shutdown;
use licensing::{
    Keyring, License, LicenseEnforcer, LicenseSigner, LicenseVerifier, SystemctlController,
    DEFAULT_CHECK_INTERVAL, DEFAULT_LICENSE_PATH, TRUSTED_SIGNER,
};

#[derive(Parser)]
#[command(name = "license-tool", version, about = "Issue, verify and enforce license files")]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Generate a signing key and add its public half to a keyring
    Keygen {
        #[arg(long, default_value = TRUSTED_SIGNER)]
        identity: String,
        /// Where to write the PKCS#8 private key
        #[arg(long)]
        out: PathBuf,
        /// Keyring to add the public key to (created if missing)
        #[arg(long)]
        keyring: PathBuf,
    },
    /// Issue and sign a new license
    Issue {
        /// PKCS#8 signing key
        #[arg(long)]
        key: PathBuf,
        #[arg(long, default_value = TRUSTED_SIGNER)]
        identity: String,
        #[arg(long)]
        customer_id: String,
        #[arg(long, default_value = "")]
        customer_name: String,
        #[arg(long)]
        seats: u32,
        /// Validity in days from now
        #[arg(long, default_value_t = 365)]
        days: u64,
        #[arg(long)]
        trial: bool,
        #[arg(long)]
        allow_audit: bool,
        #[arg(long)]
        allow_identity: bool,
        #[arg(long)]
        allow_mdm: bool,
        #[arg(long)]
        out: PathBuf,
    },
    /// Add a signature to an existing license
    Countersign {
        #[arg(long)]
        key: PathBuf,
        #[arg(long)]
        identity: String,
        #[arg(long)]
        license: PathBuf,
    },
    /// Verify a license and print its contents
    Verify {
        #[arg(long, default_value = DEFAULT_LICENSE_PATH)]
        license: PathBuf,
        #[arg(long)]
        keyring: PathBuf,
    },
    /// Stop dependent services whenever the license is not valid
    Enforce {
        #[arg(long, default_value = DEFAULT_LICENSE_PATH)]
        license: PathBuf,
        #[arg(long)]
        keyring: PathBuf,
        /// Service to stop on failure (repeatable)
        #[arg(long = "service", required = true)]
        services: Vec<String>,
        #[arg(long, default_value_t = DEFAULT_CHECK_INTERVAL.as_secs())]
        interval_secs: u64,
        /// Run a single pass and exit non-zero if the license is not valid
        #[arg(long)]
        once: bool,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run(Cli::parse()) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Cmd::Keygen {
            identity,
            out,
            keyring,
        } => {
            let pkcs8 = LicenseSigner::generate_pkcs8()?;
            let signer = LicenseSigner::from_pkcs8(&identity, &pkcs8)?;
            write_private(&out, &pkcs8)?;

            let mut trusted = if keyring.exists() {
                Keyring::load(&keyring)?
            } else {
                Keyring::new()
            };
            trusted.add(identity.as_str(), signer.public_key());
            trusted.save(&keyring)?;

            log::info!("Wrote signing key for '{}' to {}", identity, out.display());
            log::info!("Added public key to {}", keyring.display());
            log::info!(
                "Keyring now trusts: {}",
                trusted.identities().collect::<Vec<_>>().join(", ")
            );
        }

        Cmd::Issue {
            key,
            identity,
            customer_id,
            customer_name,
            seats,
            days,
            trial,
            allow_audit,
            allow_identity,
            allow_mdm,
            out,
        } => {
            let signer = LicenseSigner::from_pkcs8(identity, &fs::read(&key)?)?;
            let mut license = License::new(customer_id, seats, Duration::from_secs(days * 86_400));
            license.customer_name = customer_name;
            license.is_trial = trial;
            license.allow_audit = allow_audit;
            license.allow_identity = allow_identity;
            license.allow_mdm = allow_mdm;

            fs::write(&out, signer.sign(&license)?)?;
            log::info!(
                "Issued license for {} ({} seats, expires at {}) to {}",
                license.customer_id,
                license.seats,
                license.expiry_date,
                out.display()
            );
        }

        Cmd::Countersign {
            key,
            identity,
            license,
        } => {
            let signer = LicenseSigner::from_pkcs8(identity, &fs::read(&key)?)?;
            let blob = signer.countersign(&fs::read(&license)?)?;
            fs::write(&license, blob)?;
            log::info!("Countersigned {} as '{}'", license.display(), signer.identity());
        }

        Cmd::Verify { license, keyring } => {
            let verifier = LicenseVerifier::new(Keyring::load(&keyring)?);
            let verified = verifier.verify_file(&license)?;
            println!("{}", serde_json::to_string_pretty(&verified.license)?);
            let Some(remaining) = verified.license.remaining_at(SystemTime::now()) else {
                return Err(format!("license expired at {}", verified.license.expiry_date).into());
            };
            println!(
                "OK: signed by {}, {} day(s) remaining",
                verified.signer,
                remaining.as_secs() / 86_400
            );
        }

        Cmd::Enforce {
            license,
            keyring,
            services,
            interval_secs,
            once,
        } => {
            let enforcer = LicenseEnforcer::new(
                license,
                LicenseVerifier::new(Keyring::load(&keyring)?),
                services,
                Arc::new(SystemctlController),
            );

            if once {
                let status = enforcer.enforce_once();
                if !status.is_valid() {
                    return Err(status.to_string().into());
                }
                println!("{}", status);
            } else {
                let shutdown = Shutdown::new();
                shutdown.register_signals()?;
                enforcer.run(Duration::from_secs(interval_secs), &shutdown);
            }
        }
    }

    Ok(())
}

/// Write a private key readable only by its owner
fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(bytes)
}
