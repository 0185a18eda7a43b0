//! cert-authority-server
//!
//! Signs certificate requests for internal services over loopback HTTP.
//!
//! Usage: cert-authority-server <cadir> <port>

use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};

use cert_authority::{serve, CertificateAuthority};

#[derive(Parser)]
#[command(name = "cert-authority-server", version, about = "Inception certificate authority")]
struct Cli {
    /// CA state directory (created and initialized when empty)
    cadir: PathBuf,
    /// Loopback port to listen on
    port: u16,
    /// Validity of issued certificates in days
    #[arg(long, default_value_t = cert_authority::DEFAULT_VALIDITY_DAYS)]
    validity_days: u32,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let ca = CertificateAuthority::open_or_init(&cli.cadir)?.with_validity_days(cli.validity_days);

    serve(Arc::new(ca), cli.port, shutdown_signal()?).await?;

    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM. The SIGTERM handler is installed before
/// this returns, so a signal that arrives while serving is never lost.
fn shutdown_signal() -> io::Result<impl Future<Output = ()>> {
    let mut terminate = signal(SignalKind::terminate())?;

    Ok(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        };

        tokio::select! {
            _ = ctrl_c => log::info!("Received Ctrl+C"),
            _ = terminate.recv() => log::info!("Received SIGTERM"),
        }
        log::info!("Shutting down");
    })
}
