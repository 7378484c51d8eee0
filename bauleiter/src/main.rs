//! Bauleiter - plan and run dependency-aware builds

use bauleiter::commands::{build, plan};
use bauleiter::{Cli, Commands, Session};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bauleiter=info,convenient_coordinator=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let session = Session::open(cli.config.as_deref(), &cli.catalog)?;

    let succeeded = match &cli.command {
        Commands::Plan {
            id,
            set,
            revision,
            format,
            build: args,
        } => {
            let _ = plan::execute(&session, *id, *set, *revision, args, *format).await?;
            true
        }
        Commands::Build {
            id,
            revision,
            build: args,
            run,
        } => build::execute(&session, *id, *revision, args, run)
            .await?
            .succeeded(),
        Commands::BuildSet {
            id,
            pins,
            build: args,
            run,
        } => build::execute_set(&session, *id, pins, args, run)
            .await?
            .succeeded(),
    };

    if !succeeded {
        std::process::exit(1);
    }
    Ok(())
}
