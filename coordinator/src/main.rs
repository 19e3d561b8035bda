use anyhow::Context;
use clap::{Parser, Subcommand};
use market_core::Store;
use market_coordinator::{config::CoordinatorConfig, server};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "market-coordinator")]
#[command(about = "Coordinator for the replicated-worker labeling market", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run DB migrations and exit.
    Migrate,

    /// Run migrations, then serve the coordinator HTTP API until ctrl-c.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = CoordinatorConfig::from_env().context("load coordinator config")?;

    match cli.command {
        Command::Migrate => {
            let store = Store::connect(&cfg.database_url)
                .await
                .context("connect coordinator db")?;
            store.migrate().await.context("migrate coordinator db")?;
            tracing::info!("migrations complete");
            Ok(())
        }
        Command::Serve => server::run(&cfg).await,
    }
}
