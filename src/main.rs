use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod daemon;
mod db;
mod events;
mod intent;
mod ip;
mod labels;
mod model;
mod provider;
mod reconcile;
mod secrets;
mod source;
mod tunnel;

#[derive(Parser)]
#[command(name = "trafegodns")]
#[command(about = "Keeps authoritative DNS zones in sync with containerized services")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the reconciliation engine
    Run,
    /// Check configuration, store, and provider connectivity, then exit
    ValidateConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = config::AppConfig::from_env()?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "trafegodns=info".into());

    if config.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let cli = Cli::parse();

    match cli.command {
        Command::Run => daemon::run(config).await?,
        Command::ValidateConfig => daemon::validate(config).await?,
    }

    Ok(())
}
