//! Daemon entry point.

use std::sync::Arc;

use clap::Parser;
use log::info;

use tuhi::logging;
use tuhi::rpc::emitter::LogEmitter;

/// Daemon to extract the pen stroke data from Wacom SmartPad devices.
#[derive(Parser)]
#[command(name = "tuhi", version, about)]
struct Args {
    /// Show some debugging information
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init(args.verbose);

    let (_manager, _registry) = tuhi::start(Arc::new(LogEmitter)).await?;
    info!("tuhi is running, press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}
