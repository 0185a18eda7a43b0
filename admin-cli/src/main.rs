//! Inception admin client
//!
//! Connects to one VM host and issues a single RPC:
//!
//! ```text
//! admin-cli --vmhost 10.0.0.2:4433 --cert admin.crt --key admin.key --ca ca.pem status
//! admin-cli ... call --kvm kvm-a < request.bin > reply.bin
//! admin-cli ... call --vmhost-id host-1 < request.bin
//! ```
//!
//! Request bytes are read from stdin and the reply is written to stdout
//! unmodified.

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use inception::auth::Role;
use inception::client::QuicConnector;
use inception::manager::DEFAULT_CALL_TIMEOUT;
use inception::wire::{self, Envelope, Route};
use inception::{
    ConnectionManager, ManagerOptions, Metrics, ProtoClientGenerator, RawStub, Shutdown, TlsFiles,
};

#[derive(Parser)]
#[command(name = "admin-cli", version, about = "Issue RPCs through an Inception VM host")]
struct Cli {
    /// VM host address
    #[arg(long)]
    vmhost: SocketAddr,
    /// TLS server name of the VM host
    #[arg(long)]
    server_name: Option<String>,
    /// VM host ID the peer certificate must be granted for
    #[arg(long)]
    peer_id: Option<String>,
    #[arg(long)]
    cert: PathBuf,
    #[arg(long)]
    key: PathBuf,
    /// CA bundle used to verify the VM host certificate
    #[arg(long)]
    ca: Option<PathBuf>,
    /// How long to wait for the connection to come up
    #[arg(long, default_value_t = 10)]
    connect_timeout_secs: u64,
    /// Per-call reply timeout
    #[arg(long, default_value_t = DEFAULT_CALL_TIMEOUT.as_secs())]
    call_timeout_secs: u64,
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Print the VM host's status report
    Status,
    /// Send stdin to a destination and write the reply to stdout
    Call(CallArgs),
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct CallArgs {
    /// KVM service name, forwarded through the VM host
    #[arg(long)]
    kvm: Option<String>,
    /// VM host ID
    #[arg(long)]
    vmhost_id: Option<String>,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    if let Err(e) = run(Cli::parse()) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let tls = TlsFiles {
        cert: cli.cert,
        key: cli.key,
        ca: cli.ca,
    };
    let mut connector = QuicConnector::new(cli.vmhost, tls);
    connector = match cli.peer_id {
        Some(id) => connector.expect_grant(Role::VmHost, id),
        None => connector.expect_role(Role::VmHost),
    };
    if let Some(name) = cli.server_name {
        connector = connector.with_server_name(name);
    }

    let shutdown = Shutdown::new();
    shutdown.register_signals()?;

    let options = ManagerOptions {
        call_timeout: Duration::from_secs(cli.call_timeout_secs),
        ..ManagerOptions::default()
    };
    let manager = Arc::new(ConnectionManager::new(
        "vmhost",
        Box::new(connector),
        options,
        &shutdown,
        Arc::new(Metrics::new()),
    ));
    manager.start()?;

    if !manager.wait_connected(Duration::from_secs(cli.connect_timeout_secs)) {
        manager.stop();
        return Err(format!("could not connect to VM host at {}", cli.vmhost).into());
    }

    let generator: ProtoClientGenerator<RawStub> = ProtoClientGenerator::new(manager.clone());
    let result = execute(&generator, cli.command);
    manager.stop();

    io::stdout().write_all(&result?)?;
    Ok(())
}

fn execute(
    generator: &ProtoClientGenerator<RawStub>,
    command: Cmd,
) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    match command {
        Cmd::Status => {
            let request = wire::encode_envelope(&Envelope {
                route: Route::Local,
                payload: Vec::new(),
            })?;
            Ok(generator.vclient().call(&request)?)
        }
        Cmd::Call(args) => {
            let mut request = Vec::new();
            io::stdin().read_to_end(&mut request)?;

            let stub = match (args.kvm, args.vmhost_id) {
                (Some(kvm), _) => generator.kclient(&kvm),
                (None, Some(id)) => generator.vmhost_client(&id),
                (None, None) => return Err("call needs --kvm or --vmhost-id".into()),
            };
            log::debug!("Sending {} bytes", request.len());
            Ok(stub.call(&request)?)
        }
    }
}
