mod cli;
mod error;

use std::process;
use std::time::Duration;

use clap::Parser;
use mimalloc::MiMalloc;
use mirror_engine::{CancellationToken, MirrorConfig, ReqwestTransport, SyncEngine};
use tracing::{Level, error, info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use crate::cli::Args;
use crate::error::{AppError, Result};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    if let Err(e) = run(args).await {
        error!("Application error: {}", e);
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let config = build_config(&args)?;
    let transport = ReqwestTransport::from_config(&config)?;

    let token = CancellationToken::new();
    let engine = SyncEngine::with_transport(config, transport, token.clone())?;

    tokio::spawn({
        let token = token.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Cancellation requested. Shutting down gracefully...");
                    token.cancel();
                }
                Err(e) => warn!(error = %e, "Cannot listen for Ctrl-C"),
            }
        }
    });

    engine.run().await;
    Ok(())
}

fn build_config(args: &Args) -> Result<MirrorConfig> {
    if args.retry_interval == 0 {
        return Err(AppError::InvalidInput(
            "--retry-interval must be at least 1 second".to_owned(),
        ));
    }

    let mut builder = MirrorConfig::builder(args.playlist_url.as_str())
        .with_output_dir(&args.output_dir)
        .with_playlist_filename(args.playlist_name.as_str())
        .with_user_agent(args.user_agent.as_str())
        .with_retry_interval(Duration::from_secs(args.retry_interval))
        .with_timeout(Duration::from_secs(args.timeout))
        .with_connect_timeout(Duration::from_secs(args.connect_timeout))
        .with_proxy(args.proxy.clone());
    for (name, value) in &args.headers {
        builder = builder.with_header(name, value)?;
    }

    let config = builder.build();
    config.validate()?;
    Ok(config)
}

fn init_logging(verbose: bool, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_level(verbose))
        .init();
}
