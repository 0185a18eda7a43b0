//! Inception VM host agent
//!
//! Middle tier of the relay:
//! 1. Refuses to start without a valid license
//! 2. Keeps one managed connection to every configured KVM
//! 3. Accepts admin connections and routes their envelopes
//! 4. Re-checks the license periodically and shuts down when it fails

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;

use inception::auth::Role;
use inception::client::QuicConnector;
use inception::manager::KVM_CALL_TIMEOUT;
use inception::{ConnectionManager, ManagerOptions, Metrics, QuicServer, ServerOptions, Shutdown};
use licensing::{Keyring, LicenseEnforcer, LicenseVerifier, ShutdownController};

use vmhost_agent::config::NodeConfig;
use vmhost_agent::router::{KvmTable, Router};

/// How often the main loop re-evaluates KVM health and checks for shutdown
const HEALTH_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "vmhost-agent", version, about = "Inception VM host agent")]
struct Cli {
    /// Node configuration file (JSON)
    #[arg(long)]
    config: PathBuf,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = NodeConfig::load(&cli.config)?;

    log::info!("Inception VM host agent starting...");
    log::info!("  VM host: {}", config.vmhost_id);
    log::info!("  Listen:  {}", config.listen);
    log::info!("  KVMs:    {}", config.kvms.len());

    let shutdown = Shutdown::new();
    shutdown.register_signals()?;
    let metrics = Arc::new(Metrics::new());

    // ------------------------------------------------------------------
    // License gate
    // ------------------------------------------------------------------
    let enforcer = LicenseEnforcer::new(
        config.license.file.clone(),
        LicenseVerifier::new(Keyring::load(&config.license.keyring)?),
        vec!["vmhost-agent".to_string()],
        Arc::new(ShutdownController::new(shutdown.clone())),
    );
    let status = enforcer.check();
    if !status.is_valid() {
        return Err(format!("refusing to start: {}", status).into());
    }
    log::info!("{}", status);

    // ------------------------------------------------------------------
    // KVM connections
    // ------------------------------------------------------------------
    let mut table = KvmTable::new();
    let mut managers = Vec::with_capacity(config.kvms.len());
    for peer in &config.kvms {
        let mut connector = QuicConnector::new(peer.addr, config.tls.clone())
            .expect_grant(Role::Kvm, peer.service_name.clone());
        if let Some(name) = &peer.server_name {
            connector = connector.with_server_name(name.clone());
        }

        let manager = Arc::new(ConnectionManager::new(
            peer.service_name.clone(),
            Box::new(connector),
            ManagerOptions {
                call_timeout: KVM_CALL_TIMEOUT,
                ..ManagerOptions::default()
            },
            &shutdown,
            Arc::clone(&metrics),
        ));
        manager.start()?;
        table.insert(peer.service_name.clone(), manager.clone());
        managers.push(manager);
    }

    // ------------------------------------------------------------------
    // Admin-facing server
    // ------------------------------------------------------------------
    let router = Arc::new(Router::new(
        config.vmhost_id.clone(),
        Arc::new(table),
        Arc::clone(&metrics),
    ));
    let options = ServerOptions {
        listen: config.listen,
        tls: config.tls.clone(),
        allowed_role: Some(Role::Admin),
    };
    let mut server = QuicServer::bind(&options, router, Arc::clone(&metrics))?;
    log::info!("Accepting admin connections on {}", server.local_addr()?);

    let server_shutdown = shutdown.child();
    let server_thread = thread::Builder::new()
        .name("quic-server".to_string())
        .spawn(move || {
            if let Err(e) = server.run(&server_shutdown) {
                log::error!("Server stopped with error: {}", e);
            }
        })?;

    let enforcer_thread = enforcer.spawn(config.license.check_interval(), shutdown.child())?;

    // ------------------------------------------------------------------
    // Main loop
    // ------------------------------------------------------------------
    loop {
        let healthy = managers.iter().filter(|m| m.is_connected()).count();
        metrics.record_health(healthy, managers.len());
        log::debug!("{}/{} KVMs connected", healthy, managers.len());

        if shutdown.sleep(HEALTH_INTERVAL) {
            break;
        }
    }

    log::info!("Shutting down...");
    for manager in &managers {
        manager.stop();
    }
    if server_thread.join().is_err() {
        log::error!("Server thread panicked");
    }
    if enforcer_thread.join().is_err() {
        log::error!("License enforcer thread panicked");
    }
    log::info!("Stopped");

    Ok(())
}
