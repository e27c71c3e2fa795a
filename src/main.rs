use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use scholargate::alert::{Notifier, ThrottledAlerts};
use scholargate::config::{resolve_config, AppConfig, ConfigError};
use scholargate::gate::run_quality_gate;
use scholargate::progress::ConsoleProgress;
use scholargate::stage::{backfill, DocumentLedger, ScanError};
use scholargate::status::{InventorySnapshot, INVENTORY_KEY};
use scholargate::store::{get_json, LocalDirStore, ObjectStore};
use scholargate::TranslationCandidate;

#[derive(Parser, Debug)]
#[command(name = "scholargate")]
#[command(about = "Quality gate and pipeline state for translated papers", long_about = None)]
struct Args {
    /// Config file path (default: search for scholargate.toml upwards)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Suppress progress lines on stderr
    #[arg(long)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the quality gate over a JSON array of translation candidates
    Gate {
        /// Input JSON: array of {id, title, abstract, body}
        #[arg(value_name = "JSON")]
        input: PathBuf,

        /// Write the flagged total into status/inventory.json
        #[arg(long)]
        update_inventory: bool,
    },

    /// Reconcile per-document stage status against the object store
    Backfill {
        /// Exported status rows JSON (default: [pipeline].ledger_path)
        #[arg(long, value_name = "JSON")]
        ledger: Option<PathBuf>,
    },

    /// Print the current inventory snapshot
    Inventory,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let progress = ConsoleProgress::new(!args.quiet);
    let code = match run(&args, &progress) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("error: {e:#}");
            // Per-document failures never land here; they are summarized in
            // the batch output. Non-zero is config (1) or fatal ops (2).
            if e.is::<ConfigError>() {
                1
            } else {
                2
            }
        }
    };
    std::process::exit(code);
}

fn run(args: &Args, progress: &ConsoleProgress) -> anyhow::Result<()> {
    let cfg = resolve_config(args.config.as_deref())?;
    match &args.command {
        Command::Gate {
            input,
            update_inventory,
        } => run_gate(&cfg, input, *update_inventory, progress),
        Command::Backfill { ledger } => run_backfill(&cfg, ledger.as_deref(), progress),
        Command::Inventory => run_inventory(&cfg),
    }
}

fn open_store(cfg: &AppConfig) -> anyhow::Result<Arc<dyn ObjectStore>> {
    let root = cfg.store_root()?;
    Ok(Arc::new(LocalDirStore::open(root)?))
}

fn run_gate(
    cfg: &AppConfig,
    input: &Path,
    update_inventory: bool,
    progress: &ConsoleProgress,
) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(input)
        .with_context(|| format!("read candidates: {}", input.display()))?;
    let candidates: Vec<TranslationCandidate> =
        serde_json::from_str(&text).context("parse candidates json")?;

    let total = candidates.len();
    let mut passed = 0usize;
    let mut flagged = 0usize;
    for (i, candidate) in candidates.iter().enumerate() {
        let result = run_quality_gate(candidate);
        if result.passed() {
            passed += 1;
        } else {
            flagged += 1;
            progress.info(format!("{}\n{}", candidate.id, result.render_block()));
        }
        println!(
            "{}",
            serde_json::to_string(&serde_json::json!({
                "id": candidate.id,
                "qa": result,
            }))?
        );
        if (i + 1) % 50 == 0 {
            progress.progress("gate", i + 1, total, 0);
        }
    }
    progress.summary("gate", passed, flagged);

    // Flagged candidates are a normal terminal classification, not an error.
    if update_inventory {
        let store = open_store(cfg)?;
        let writer = scholargate::PipelineStatusWriter::new(store);
        writer.update_inventory(|inv| inv.set_flagged_total(flagged as u64))?;
    }
    Ok(())
}

struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, message: &str) -> anyhow::Result<()> {
        tracing::error!("{message}");
        Ok(())
    }
}

fn run_backfill(
    cfg: &AppConfig,
    ledger_arg: Option<&Path>,
    progress: &ConsoleProgress,
) -> anyhow::Result<()> {
    let store = open_store(cfg)?;
    let ledger_path = ledger_arg
        .map(Path::to_path_buf)
        .or_else(|| cfg.pipeline.ledger_path.clone())
        .ok_or_else(|| {
            anyhow::Error::new(ConfigError(
                "ledger path not set (--ledger or [pipeline].ledger_path)".to_string(),
            ))
        })?;

    let mut ledger: DocumentLedger = match std::fs::read_to_string(&ledger_path) {
        Ok(text) => serde_json::from_str(&text)
            .with_context(|| format!("parse ledger: {}", ledger_path.display()))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(path = %ledger_path.display(), "ledger missing, starting empty");
            DocumentLedger::new()
        }
        Err(e) => {
            return Err(e).with_context(|| format!("read ledger: {}", ledger_path.display()))
        }
    };

    progress.info(format!(
        "reconciling {} documents against the store",
        ledger.len()
    ));
    let report = match backfill(store.as_ref(), &mut ledger, &cfg.layout(), chrono::Utc::now()) {
        Ok(report) => report,
        Err(e) if e.is::<ScanError>() => {
            // Fail closed: no row was touched. Raise an alert and escalate.
            let mut alerts = ThrottledAlerts::new(Box::new(TracingNotifier));
            alerts.send(format!("backfill aborted: {e:#}"));
            alerts.flush();
            return Err(e);
        }
        Err(e) => return Err(e),
    };

    let serialized = serde_json::to_string_pretty(&ledger).context("serialize ledger")?;
    std::fs::write(&ledger_path, serialized)
        .with_context(|| format!("write ledger: {}", ledger_path.display()))?;

    progress.info(format!(
        "backfill: documents={} promoted={} demoted={} orphans={}",
        report.documents, report.promoted, report.demoted, report.orphans
    ));
    progress.summary("backfill", report.promoted, 0);
    Ok(())
}

fn run_inventory(cfg: &AppConfig) -> anyhow::Result<()> {
    let store = open_store(cfg)?;
    let inventory: Option<InventorySnapshot> = get_json(store.as_ref(), INVENTORY_KEY)?;
    match inventory {
        Some(inventory) => {
            println!("{}", serde_json::to_string_pretty(&inventory)?);
        }
        None => println!("no inventory published yet"),
    }
    Ok(())
}
