use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgGroup, Args, Parser, Subcommand};
use distribution_api::{
    DistributeRequest, DistributionApi, DistributionReport, ProductionPlan, SnapshotFileSource,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing_subscriber::filter::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const DEFAULT_LOG_LEVEL: &str = "warn";

#[derive(Debug, Parser)]
#[command(name = "dist")]
#[command(about = "Store distribution planner CLI")]
struct Cli {
    /// Log filter in `EnvFilter` syntax, e.g. "info" or "warn,distribution_api=debug".
    /// Falls back to `RUST_LOG`, then to "warn". Logs go to stderr.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Distribute one product's production run across its stores.
    Distribute(DistributeArgs),
    /// Show how raw store statistics normalize, without allocating.
    Normalize(NormalizeArgs),
    /// Distribute every product of a production plan.
    Plan(PlanArgs),
}

#[derive(Debug, Args)]
#[command(group(ArgGroup::new("input").required(true).args(["stats", "stores"])))]
struct DistributeArgs {
    #[arg(long)]
    product_id: String,
    /// Produced quantity as a JSON number.
    #[arg(long, allow_hyphen_values = true)]
    quantity: String,
    /// Snapshot file with store statistics keyed by product.
    #[arg(long)]
    stats: Option<PathBuf>,
    /// File holding a list of store statistics for this product only.
    #[arg(long)]
    stores: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct NormalizeArgs {
    #[arg(long)]
    stores: PathBuf,
}

#[derive(Debug, Args)]
struct PlanArgs {
    #[arg(long)]
    plan: PathBuf,
    #[arg(long)]
    stats: PathBuf,
}

fn init_log(log_level: Option<&str>) {
    let env_filter = match log_level {
        Some(level) => EnvFilter::try_new(level).unwrap_or_else(|err| {
            eprintln!("invalid --log-level {level}: {err}; using {DEFAULT_LOG_LEVEL}");
            EnvFilter::new(DEFAULT_LOG_LEVEL)
        }),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_LEVEL)),
    };

    if let Err(err) = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(true)
        .try_init()
    {
        eprintln!("failed to init logger: {err}");
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn is_yaml(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"))
}

/// Read a JSON or YAML document, chosen by file extension.
fn read_document<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned,
{
    let body =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    if is_yaml(path) {
        serde_yaml::from_str(&body)
            .with_context(|| format!("failed to parse YAML {}", path.display()))
    } else {
        serde_json::from_str(&body)
            .with_context(|| format!("failed to parse JSON {}", path.display()))
    }
}

/// Command-line quantities are parsed as JSON so that "12", "12.0" and "-3"
/// reach the same validation as request bodies do. Anything else is passed on
/// as a string and rejected there.
fn quantity_value(raw: &str) -> Value {
    serde_json::from_str(raw.trim()).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn report_value(report: &DistributionReport) -> Result<Value> {
    serde_json::to_value(report).context("failed to serialize distribution report")
}

fn run_distribute(args: DistributeArgs) -> Result<()> {
    let quantity = quantity_value(&args.quantity);
    let report = match (args.stats, args.stores) {
        (Some(stats), _) => DistributionApi::with_source(Arc::new(SnapshotFileSource::new(stats)))
            .distribute_product(&args.product_id, &quantity)?,
        (None, Some(stores)) => {
            let stores = read_document::<Vec<Value>>(&stores)?;
            DistributionApi::new().distribute(&DistributeRequest {
                product_id: args.product_id,
                quantity,
                stores,
            })?
        }
        (None, None) => anyhow::bail!("either --stats or --stores is required"),
    };
    emit_json(report_value(&report)?)
}

fn run_normalize(args: &NormalizeArgs) -> Result<()> {
    let records = read_document::<Vec<Value>>(&args.stores)?;
    let normalized = DistributionApi::new().normalize_preview(&records);
    emit_json(serde_json::json!({
        "stores": normalized.stores,
        "issues": normalized.issues,
        "dropped_count": normalized.dropped_count(),
    }))
}

fn run_plan(args: PlanArgs) -> Result<()> {
    let plan = read_document::<ProductionPlan>(&args.plan)?;
    let api = DistributionApi::with_source(Arc::new(SnapshotFileSource::new(args.stats)));
    let report = api.distribute_plan(&plan)?;
    emit_json(serde_json::to_value(&report).context("failed to serialize plan report")?)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_log(cli.log_level.as_deref());
    match cli.command {
        Command::Distribute(args) => run_distribute(args),
        Command::Normalize(args) => run_normalize(&args),
        Command::Plan(args) => run_plan(args),
    }
}
