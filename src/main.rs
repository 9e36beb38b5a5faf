use anyhow::Result;
use clap::Parser;
use tracing::{debug, info};
use v6proxy::{Args, Orchestrator, ShutdownCoordinator, config, shutdown};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse args
    let args = Args::parse();

    // Initialize tracing subscriber
    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt().with_max_level(level).init();

    // Nothing enabled: show usage and leave without binding
    let Some(config) = args.resolve()? else {
        config::print_usage()?;
        return Ok(());
    };

    debug!("resolved configuration: {:?}", config);

    // A bind failure aborts here; anything already bound is released on drop
    let mut orchestrator = Orchestrator::start(&config).await?;
    info!(
        "{} proxy service(s) starting, press Ctrl-C to stop",
        orchestrator.active()
    );

    let coordinator = ShutdownCoordinator::new(config.shutdown_timeout);
    orchestrator.run(shutdown::interrupt(), &coordinator).await?;

    Ok(())
}
