//! Vultr provider plugin binary
//!
//! Reads one JSON-RPC request per line from stdin and answers on stdout.
//! Logs go to stderr.

use clap::Parser;
use std::io;
use terraform_provider_vultr::provider::VultrProvider;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Vultr provider plugin
#[derive(Parser, Debug)]
#[command(name = "terraform-provider-vultr")]
#[command(about = "Provider plugin for Vultr Kubernetes Engine clusters")]
struct Args {
    /// Enable debug logging
    #[arg(long, env = "TF_LOG")]
    debug: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let default_level = if args.debug { "debug" } else { "info" };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    tracing::info!("Starting Vultr provider");

    let provider = VultrProvider::new()?;
    provider.listen_for_signals();

    provider.serve(io::stdin().lock(), io::stdout())?;

    tracing::info!("Vultr provider shutting down");
    Ok(())
}
