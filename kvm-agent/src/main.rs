//! Inception KVM agent
//!
//! Terminal tier of the relay. Accepts connections from VM hosts and hands
//! every request payload, unchanged, to the local daemon.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use inception::auth::Role;
use inception::{Metrics, QuicServer, ServerOptions, Shutdown, TlsFiles};
use licensing::{
    Keyring, LicenseEnforcer, LicenseVerifier, ShutdownController, DEFAULT_CHECK_INTERVAL,
    DEFAULT_LICENSE_PATH,
};

use kvm_agent::daemon::{DaemonHandler, DEFAULT_DAEMON_TIMEOUT};

#[derive(Parser)]
#[command(name = "kvm-agent", version, about = "Inception KVM agent")]
struct Cli {
    /// Address VM host connections are accepted on
    #[arg(long, default_value = "0.0.0.0:4434")]
    listen: SocketAddr,
    /// PEM certificate presented to VM hosts
    #[arg(long)]
    cert: PathBuf,
    /// PEM private key for --cert
    #[arg(long)]
    key: PathBuf,
    /// CA bundle used to verify VM host certificates
    #[arg(long)]
    ca: Option<PathBuf>,
    /// Local daemon address
    #[arg(long, default_value = "127.0.0.1:50123")]
    daemon: SocketAddr,
    #[arg(long, default_value_t = DEFAULT_DAEMON_TIMEOUT.as_secs())]
    daemon_timeout_secs: u64,
    #[arg(long, default_value = DEFAULT_LICENSE_PATH)]
    license: PathBuf,
    #[arg(long)]
    keyring: PathBuf,
    #[arg(long, default_value_t = DEFAULT_CHECK_INTERVAL.as_secs())]
    check_interval_secs: u64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    log::info!("Inception KVM agent starting...");
    log::info!("  Listen: {}", cli.listen);
    log::info!("  Daemon: {}", cli.daemon);

    let shutdown = Shutdown::new();
    shutdown.register_signals()?;

    let enforcer = LicenseEnforcer::new(
        cli.license,
        LicenseVerifier::new(Keyring::load(&cli.keyring)?),
        vec!["kvm-agent".to_string()],
        Arc::new(ShutdownController::new(shutdown.clone())),
    );
    let status = enforcer.check();
    if !status.is_valid() {
        return Err(format!("refusing to start: {}", status).into());
    }
    log::info!("{}", status);

    let handler = Arc::new(DaemonHandler::new(
        cli.daemon,
        Duration::from_secs(cli.daemon_timeout_secs),
    ));
    let options = ServerOptions {
        listen: cli.listen,
        tls: TlsFiles {
            cert: cli.cert,
            key: cli.key,
            ca: cli.ca,
        },
        allowed_role: Some(Role::VmHost),
    };
    let mut server = QuicServer::bind(&options, handler, Arc::new(Metrics::new()))?;
    log::info!("Accepting VM host connections on {}", server.local_addr()?);

    let enforcer_thread =
        enforcer.spawn(Duration::from_secs(cli.check_interval_secs), shutdown.child())?;

    let result = server.run(&shutdown);

    shutdown.trigger();
    if enforcer_thread.join().is_err() {
        log::error!("License enforcer thread panicked");
    }
    log::info!("Stopped");

    result
}
