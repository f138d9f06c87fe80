use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use lettingwatch_monitor::{load_registry, run_all, MonitorSettings};
use lettingwatch_notify::TelegramNotifier;
use lettingwatch_source::PortalClient;

#[derive(Debug, Parser)]
#[command(name = "lettingwatch")]
#[command(about = "Rental-listing monitor: alerts on new portal listings per saved search")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every configured search once and alert on new listings.
    Run,
    /// List the searches configured in the registry.
    Searches,
    /// Fetch every result page for one search and print the candidates as JSON.
    Dump {
        #[arg(long)]
        search: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let settings = MonitorSettings::from_env();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let registry = load_registry(&settings.registry_path).await?;
            let client = PortalClient::new(settings.portal()).context("building portal client")?;
            let notifier =
                TelegramNotifier::new(settings.telegram()?).context("building Telegram notifier")?;

            let outcomes = run_all(&settings, &registry, &client, &notifier).await;
            let mut failed = 0usize;
            for (name, result) in &outcomes {
                match result {
                    Ok(outcome) => println!(
                        "{name}: fetched={} new={} sent={}",
                        outcome.fetched, outcome.new_found, outcome.sent
                    ),
                    Err(err) => {
                        failed += 1;
                        println!("{name}: failed during {}: {err}", err.phase().as_str());
                    }
                }
            }
            if failed > 0 {
                bail!("{failed} of {} monitor runs failed", outcomes.len());
            }
        }
        Commands::Searches => {
            let registry = load_registry(&settings.registry_path).await?;
            for search in &registry.searches {
                println!(
                    "{} ({}, {})",
                    search.name,
                    search.transaction.channel(),
                    search.location_identifier
                );
            }
        }
        Commands::Dump { search } => {
            let registry = load_registry(&settings.registry_path).await?;
            let config = registry
                .find(&search)
                .with_context(|| format!("no search named {search:?} in the registry"))?;
            let client = PortalClient::new(settings.portal()).context("building portal client")?;
            let listings = client.fetch_all(config).await?;
            println!("{}", serde_json::to_string_pretty(&listings)?);
        }
    }

    Ok(())
}
