use std::path::PathBuf;

use anyhow::{Context, Result};
use campwatch_enrich::{EnrichmentUpdater, LookupClient, LookupConfig};
use campwatch_extract::SnapshotDriver;
use campwatch_pipeline::{resolve_table, PipelineConfig, RunConfig, ScrapePipeline};
use campwatch_store::{export_csv, EnrichmentScope, PgRecordStore, RecordStore};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use tracing::error;

#[derive(Debug, Parser)]
#[command(name = "campwatch")]
#[command(about = "Campaign listing scraper, reconciler, and enricher")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a full scrape: extract, normalize, dedup, reconcile.
    Scrape {
        /// Run definition file (keywords, table, export path).
        #[arg(long, default_value = "campwatch.yaml")]
        config: PathBuf,
    },
    /// Enrich stored records with address, coordinates, and image link.
    Enrich {
        /// Run definition file; its `table` wins over CAMPWATCH_TABLE.
        #[arg(long, default_value = "campwatch.yaml")]
        config: PathBuf,
        /// Visit every record instead of only those missing enrichment.
        #[arg(long)]
        all: bool,
    },
    /// Export the campaign table to CSV.
    Export {
        /// Run definition file; its `table` wins over CAMPWATCH_TABLE.
        #[arg(long, default_value = "campwatch.yaml")]
        config: PathBuf,
        #[arg(long, default_value = "campaign_export.csv")]
        path: PathBuf,
    },
    /// Apply pending database migrations.
    Migrate {
        /// Run definition file; its `table` wins over CAMPWATCH_TABLE.
        #[arg(long, default_value = "campwatch.yaml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env();

    match cli.command {
        Commands::Scrape { config: run_path } => {
            let run = RunConfig::load(&run_path)?;
            let store = PgRecordStore::connect(&config.database_url, &run.table)
                .await
                .context("connecting to the campaign store")?;
            let driver = SnapshotDriver::with_config(&config.snapshot_dir, config.driver.clone());

            let pipeline = ScrapePipeline::new(
                driver,
                &store,
                config.year_context,
                config.driver.settle_delay,
            )?;
            let summary = match pipeline.run(&run.keywords).await {
                Ok(summary) => summary,
                Err(err) => {
                    error!(error = %err, "scrape run aborted, store left unchanged for this batch");
                    return Err(err);
                }
            };
            println!(
                "scrape complete: run_id={} keywords={} extracted={} skipped_short={} \
                 dropped={} collapsed={} written={}",
                summary.run_id,
                summary.keywords_processed,
                summary.rows_extracted,
                summary.rows_skipped_short,
                summary.records_dropped_invalid,
                summary.duplicates_collapsed,
                summary.records_written
            );

            if let Some(path) = &run.export_path {
                let records = store.all_records().await?;
                let written = export_csv(&records, path)?;
                println!("exported {written} records to {}", path.display());
            }
        }
        Commands::Enrich { config: run_path, all } => {
            let lookup_config = LookupConfig::from_env()?;
            let table = resolve_table(&run_path, &config.table)?;
            let store = PgRecordStore::connect(&config.database_url, &table)
                .await
                .context("connecting to the campaign store")?;
            let lookup = LookupClient::new(&lookup_config)?;
            let updater = EnrichmentUpdater::new(lookup, lookup_config.pace_delay);

            let scope = if all {
                EnrichmentScope::All
            } else {
                EnrichmentScope::MissingOnly
            };
            let summary = updater.run(&store, scope).await?;
            println!(
                "enrich complete: scanned={} matched={} geocoded={} updated={} \
                 skipped_empty={} failed={}",
                summary.scanned,
                summary.place_matched,
                summary.geocoded,
                summary.updated,
                summary.skipped_empty,
                summary.failed
            );
        }
        Commands::Export { config: run_path, path } => {
            let table = resolve_table(&run_path, &config.table)?;
            let store = PgRecordStore::connect(&config.database_url, &table)
                .await
                .context("connecting to the campaign store")?;
            let records = store.all_records().await?;
            let written = export_csv(&records, &path)?;
            println!("exported {written} records to {}", path.display());
        }
        Commands::Migrate { config: run_path } => {
            let table = resolve_table(&run_path, &config.table)?;
            let store = PgRecordStore::connect(&config.database_url, &table)
                .await
                .context("connecting to the campaign store")?;
            store.migrate().await?;
            println!("migrations applied");
        }
    }

    Ok(())
}
