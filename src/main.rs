//! tunnelthing - Authenticated TLS tunnels between devices behind NAT.

use clap::Parser;
use std::future::Future;
use tracing_subscriber::EnvFilter;
use tunnelthing::{
    load_cert_id, run_connect, run_listen, run_ping, write_new_cert, BuildInfo, Cli, Command,
    GencertArgs, IdArgs, Result, TlsError,
};

fn main() {
    let cli = Cli::parse();

    // Initialize logging; stdout is left to command output
    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    // Initialize the crypto provider
    if let Err(e) = rustls::crypto::ring::default_provider().install_default() {
        tracing::warn!("failed to install default crypto provider (may already be installed): {:?}", e);
    }

    let result = match cli.command {
        Command::Listen(args) => {
            tracing::debug!(?args, "Listen arguments");
            block_on(run_listen(&args))
        }
        Command::Ping(args) => {
            tracing::debug!(?args, "Ping arguments");
            block_on(run_ping(&args))
        }
        Command::Connect(args) => {
            tracing::debug!(?args, "Connect arguments");
            block_on(run_connect(&args))
        }
        Command::Gencert(args) => run_gencert(&args),
        Command::Id(args) => run_id(&args),
        Command::Version => {
            let info = BuildInfo::get();
            println!("{}", info.format());
            Ok(())
        }
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "command failed");
        std::process::exit(e.exit_code().into());
    }
}

fn block_on<F: Future<Output = Result<()>>>(future: F) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(future)
}

fn run_gencert(args: &GencertArgs) -> Result<()> {
    match write_new_cert(&args.cert, &args.key, &args.name) {
        Ok(id) => {
            println!("{}", id);
            Ok(())
        }
        Err(TlsError::AlreadyExists(path)) => {
            println!("{} already exists, leaving certificate unchanged", path);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn run_id(args: &IdArgs) -> Result<()> {
    let id = load_cert_id(&args.cert)?;
    println!("{}", id);
    Ok(())
}
