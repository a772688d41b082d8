use anyhow::Result;
use clap::{Parser, Subcommand};
use clientele_engine::{
    render_diagnostics_markdown, run_consolidation_from_env, run_diagnostics_from_env,
    ConsolidateConfig,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "clientele")]
#[command(about = "Customer record consolidation CLI")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a full consolidation pass over all enabled sources.
    Consolidate,
    /// Report match-rate diagnostics without writing masters.
    Diagnostics,
    /// Apply pending database migrations.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Consolidate) {
        Commands::Consolidate => {
            let summary = run_consolidation_from_env().await?;
            println!(
                "consolidation complete: run_id={} loaded={} groups={} created={} updated={} unchanged={} superseded={} failed_groups={}",
                summary.run_id,
                summary.records_loaded,
                summary.groups_formed,
                summary.masters_created,
                summary.masters_updated,
                summary.masters_unchanged,
                summary.masters_superseded,
                summary.failed_groups
            );
            for (source, outcome) in &summary.sources {
                if outcome.failed {
                    eprintln!(
                        "warning: source {source} failed: {}",
                        outcome.error.as_deref().unwrap_or("unknown")
                    );
                }
            }
        }
        Commands::Diagnostics => {
            let diagnostics = run_diagnostics_from_env().await?;
            println!("{}", render_diagnostics_markdown(&diagnostics));
        }
        Commands::Migrate => {
            let config = ConsolidateConfig::from_env();
            let pool = clientele_storage::connect(&config.database_url).await?;
            clientele_storage::run_migrations(&pool).await?;
            println!("migrations applied");
        }
    }

    Ok(())
}
