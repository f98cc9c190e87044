use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kef_storage::{resolve_export_endpoint, HttpRowSource, PgStore, RowSource};
use kef_sync::{ImportService, PollerSettings};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "kef-cli")]
#[command(about = "KEF assessment sheet importer")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Poll the configured source until Ctrl-C
    Poll,
    /// Run a single import cycle and exit
    Once,
    /// Apply database migrations
    Migrate,
    /// Serve the control API (and the poller, unless KEF_AUTOSTART=false)
    Serve,
    /// Resolve and fetch a source without saving anything
    CheckSource { source_url: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let settings = PollerSettings::from_env();

    match cli.command.unwrap_or(Commands::Poll) {
        Commands::Poll => {
            let service = ImportService::connect(&settings).await?;
            service.start().await;
            tokio::signal::ctrl_c()
                .await
                .context("waiting for ctrl-c")?;
            info!("shutdown requested");
            service.stop().await;
        }
        Commands::Once => {
            let service = ImportService::connect(&settings).await?;
            let report = service.run_once().await?;
            println!(
                "import complete: cycle_id={} rows={} attempted={} imported={} failed={} blank={} cursor={}",
                report.cycle_id,
                report.rows_in_source,
                report.attempted,
                report.imported,
                report.failed,
                report.blank,
                report.cursor_after
            );
        }
        Commands::Migrate => {
            let store = PgStore::connect(&settings.database_url, settings.max_connections).await?;
            store.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::Serve => {
            let service = Arc::new(ImportService::connect(&settings).await?);
            kef_web::serve(service, &settings.web_addr, settings.autostart).await?;
        }
        Commands::CheckSource { source_url } => {
            let endpoint = resolve_export_endpoint(&source_url)?;
            let source = HttpRowSource::new(settings.http_client_config())?;
            let rows = source.probe_rows(&endpoint).await?;
            println!("endpoint: {endpoint}");
            println!("rows: {} (header included)", rows.len());
            for row in rows.iter().take(3) {
                println!("  {}", row.join(" | "));
            }
        }
    }

    Ok(())
}
