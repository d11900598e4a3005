use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use daa_analysis::insight::suggest_visualizations;
use daa_analysis::{DataAnalyzer, InsightClient, ReportGenerator};
use daa_core::{BrandRegistry, Table};
use daa_storage::LocalStore;
use daa_sync::{render_validation, FirstPayRunSummary, LocalPaths, SyncRunSummary};
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "daa")]
#[command(about = "Order data sync and analysis for the Data Analysis Agent")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Rebuild the local store from every brand's windowed order data.
    SyncOrders,
    /// Recompute each subscription's first payment over the full history.
    SyncFirstPay,
    /// Describe one local table, or a .csv/.json export, and write a report.
    Analyze {
        #[arg(long, required_unless_present = "file", conflicts_with = "file")]
        table: Option<String>,
        /// Analyze a .csv or .json file instead of a local table.
        #[arg(long)]
        file: Option<PathBuf>,
        /// Restrict to one brand (tag or key, case-insensitive).
        #[arg(long, conflicts_with = "file")]
        brand: Option<String>,
        #[arg(long, value_enum, default_value_t = ReportFormat::Markdown)]
        format: ReportFormat,
        /// Skip the LLM commentary.
        #[arg(long)]
        no_ai: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ReportFormat {
    Markdown,
    Json,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().compact().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine; exported variables still apply.
    let env_file = dotenvy::dotenv().ok();
    init_tracing();
    if let Some(path) = &env_file {
        debug!(path = %path.display(), "loaded .env");
    }
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::SyncOrders) {
        Commands::SyncOrders => {
            let summary = daa_sync::run_windowed_sync_from_env().await?;
            print_sync_summary(&summary);
        }
        Commands::SyncFirstPay => {
            let summary = daa_sync::run_first_pay_from_env().await?;
            print_first_pay_summary(&summary);
        }
        Commands::Analyze {
            table,
            file,
            brand,
            format,
            no_ai,
        } => {
            let input = match (table, file) {
                (_, Some(path)) => Input::File(path),
                (Some(table), None) => Input::Table(table),
                (None, None) => bail!("analyze needs --table or --file"),
            };
            analyze(input, brand.as_deref(), format, no_ai).await?
        }
    }

    Ok(())
}

fn print_sync_summary(summary: &SyncRunSummary) {
    println!(
        "sync complete: run_id={} cutoff={} brands={}",
        summary.run_id,
        summary.cutoff.to_rfc3339(),
        summary.brands.len()
    );
    for brand in &summary.brands {
        println!(
            "  {} ({}): orders={} subscriptions={} set_meal={} amount_details={} cloud={} devices={}/{} covered={}",
            brand.brand,
            brand.schema,
            brand.orders,
            brand.subscriptions,
            brand.catalog_entries,
            brand.amount_details,
            brand.cloud_records,
            brand.devices.active_devices_30d,
            brand.devices.total_devices,
            brand.devices.devices_with_subscription,
        );
    }
    println!("{}", render_validation(&summary.validation));
    println!(
        "store: {} ({:.2} MB, {} indexes)",
        summary.store_path,
        summary.store_bytes as f64 / 1024.0 / 1024.0,
        summary.indexes.len()
    );
}

fn print_first_pay_summary(summary: &FirstPayRunSummary) {
    println!("first-pay reconciliation complete: run_id={}", summary.run_id);
    for brand in &summary.brands {
        println!(
            "  {}: subscriptions={} first paid before cutoff={}",
            brand.brand, brand.subscriptions, brand.first_paid_before_cutoff
        );
    }
    println!("{}", render_validation(std::slice::from_ref(&summary.validation)));
}

enum Input {
    Table(String),
    File(PathBuf),
}

async fn analyze(
    input: Input,
    brand: Option<&str>,
    format: ReportFormat,
    no_ai: bool,
) -> Result<()> {
    let paths = LocalPaths::from_env();
    let (analyzer, subject, brand) = match &input {
        Input::Table(table) => {
            let brand = match brand {
                Some(id) => {
                    let registry = BrandRegistry::load_or_builtin(&paths.brands_file)?;
                    Some(registry.resolve(id)?.brand.clone())
                }
                None => None,
            };
            let rows = read_store_table(&paths.sqlite_path, table, brand.as_deref()).await?;
            (DataAnalyzer::from_table(rows), table.clone(), brand)
        }
        Input::File(path) => {
            let analyzer = DataAnalyzer::from_file(path)
                .await
                .with_context(|| format!("loading {}", path.display()))?;
            (analyzer, file_subject(path), None)
        }
    };

    let results = analyzer.analyze();
    let insights = if no_ai {
        None
    } else {
        Some(InsightClient::from_env().analyze(&results).await)
    };

    let reports = ReportGenerator::new(&paths.reports_dir).await?;
    let path = match format {
        ReportFormat::Markdown => {
            let title = match &brand {
                Some(brand) => format!("{subject} analysis report ({brand})"),
                None => format!("{subject} analysis report"),
            };
            reports
                .write_markdown(&results, insights.as_deref(), &title)
                .await?
        }
        ReportFormat::Json => reports.write_json(&results).await?,
    };
    info!(%subject, rows = results.metadata.shape.0, "analysis finished");

    println!("report written: {}", path.display());
    for suggestion in suggest_visualizations(&results.metadata.dtypes) {
        println!("  suggested chart: {} ({})", suggestion.kind, suggestion.description);
    }
    Ok(())
}

async fn read_store_table(store_path: &Path, table: &str, brand: Option<&str>) -> Result<Table> {
    if !store_path.exists() {
        bail!(
            "local store {} not found; run `daa sync-orders` first",
            store_path.display()
        );
    }
    let store = LocalStore::open(store_path)
        .await
        .with_context(|| format!("opening {}", store_path.display()))?;
    if !store.table_exists(table).await? {
        bail!("table `{table}` does not exist in {}", store_path.display());
    }
    let rows = store
        .read_table(table, brand)
        .await
        .with_context(|| format!("reading {table}"))?;
    store.close().await;
    Ok(rows)
}

fn file_subject(path: &Path) -> String {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .map(String::from)
        .unwrap_or_else(|| path.display().to_string())
}
