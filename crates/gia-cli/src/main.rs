use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gia_core::{JobKind, SourceStatus};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "gia-cli")]
#[command(about = "Generated image aggregator command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one aggregation job in the foreground and wait for it to finish.
    Run {
        /// Sources to collect; every registered source when omitted.
        #[arg(long = "source", value_name = "NAME")]
        sources: Vec<String>,
    },
    /// Apply database migrations.
    Migrate,
    /// Serve the HTTP API (and the cron trigger when enabled).
    Serve,
    /// List registered sources.
    Sources,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run { sources: Vec::new() }) {
        Commands::Run { sources } => {
            let (_config, _store, service) = gia_sync::build_service_from_env().await?;
            let launched = service.launch(JobKind::Manual, &sources).await?;
            info!(job_id = %launched.job.id, "waiting for aggregation to finish");
            let job = launched.completion.await.context("aggregation task panicked")?;
            println!("job {} finished", job.id);
            for source in &job.sources {
                println!(
                    "  {:<12} {:<8} fetched={} inserted={}",
                    source.source_name,
                    match source.status {
                        SourceStatus::Success => "success",
                        SourceStatus::Failed => "failed",
                        SourceStatus::Running => "running",
                    },
                    source.fetched_count,
                    source.inserted_count
                );
            }
        }
        Commands::Migrate => {
            let config = gia_sync::SyncConfig::from_env();
            let store = gia_sync::connect_store(&config).await?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Serve => gia_web::serve_from_env().await?,
        Commands::Sources => {
            for name in gia_core::SourceName::all_names() {
                println!("{name}");
            }
        }
    }

    Ok(())
}
