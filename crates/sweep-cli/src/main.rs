//! `alpha-sweep`: run a resumable settings search for one alpha.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use sweep_client::{
    extract_fields, BrainEvaluator, BrainSessionProvider, Credentials, SessionProvider,
    DEFAULT_API_URL,
};
use sweep_ledger::Ledger;
use sweep_optimizer::{
    Orchestrator, RegionMetadata, ShutdownHandle, Strategy, StudyConfig, MAX_CONCURRENCY,
};
use sweep_types::{AlphaDocument, Availability};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const API_URL_VAR: &str = "ALPHA_SWEEP_API_URL";

/// Exit status when a second interrupt cuts the drain short.
const ABORT_EXIT_CODE: i32 = 130;

/// A session must outlive a typical study by this much before it is reused.
const MIN_SESSION_VALIDITY: Duration = Duration::from_secs(7200);

#[derive(Parser)]
#[command(name = "alpha-sweep")]
#[command(about = "Concurrent, resumable settings search for simulated alphas")]
struct Cli {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Search the settings space of an alpha, resuming the study if its
    /// journal already exists
    Run(RunArgs),

    /// Print the data fields referenced by an alpha expression
    Fields {
        /// Expression text; read from --alpha when omitted
        expression: Option<String>,

        #[arg(long)]
        alpha: Option<PathBuf>,
    },
}

#[derive(clap::Args)]
struct RunArgs {
    /// Simulations in flight at once
    #[arg(short = 's', long, default_value_t = 5,
          value_parser = clap::value_parser!(u64).range(1..=MAX_CONCURRENCY as u64))]
    simulations: u64,

    /// Study name, selects the journal file (defaults to the current time)
    #[arg(short = 'n', long)]
    name: Option<String>,

    /// Alpha document to patch with each configuration
    #[arg(long, default_value = "alpha.json")]
    alpha: PathBuf,

    /// Region metadata (Universe, Neutralization, Delay per region)
    #[arg(long, default_value = "regions.json")]
    regions: PathBuf,

    /// Candidate strategy (grid, random, tpe)
    #[arg(long, default_value_t = Strategy::Grid)]
    strategy: Strategy,

    /// Stop after starting this many trials
    #[arg(long)]
    max_trials: Option<usize>,

    /// Seed for the random and tpe strategies
    #[arg(long)]
    seed: Option<u64>,

    /// Leave configurations whose last trial failed alone on resume
    #[arg(long)]
    no_retry_failed: bool,

    /// Directory holding study journals
    #[arg(long, default_value = "studies")]
    studies_dir: PathBuf,

    /// Cached backend session
    #[arg(long, default_value = "session.json")]
    session_cache: PathBuf,

    /// Search every region delay and universe, even where the alpha's data
    /// fields are unavailable
    #[arg(long)]
    skip_field_check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match cli.command {
        Command::Run(args) => run(args).await,
        Command::Fields { expression, alpha } => fields(expression, alpha.as_deref()),
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn load_alpha(path: &Path) -> Result<AlphaDocument> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading alpha document {}", path.display()))?;
    AlphaDocument::from_json_str(&text)
        .with_context(|| format!("parsing alpha document {}", path.display()))
}

fn fields(expression: Option<String>, alpha: Option<&Path>) -> Result<()> {
    let expression = match (expression, alpha) {
        (Some(expression), _) => expression,
        (None, Some(path)) => match load_alpha(path)?.expression() {
            Some(expression) => expression.to_string(),
            None => bail!("{} has no regular expression", path.display()),
        },
        (None, None) => bail!("pass an expression or --alpha"),
    };
    for field in extract_fields(&expression) {
        println!("{field}");
    }
    Ok(())
}

async fn run(args: RunArgs) -> Result<()> {
    let name = args
        .name
        .unwrap_or_else(|| chrono::Local::now().format("%Y-%m-%d_%H-%M-%S").to_string());
    let mut config = StudyConfig::new(name)
        .with_concurrency(args.simulations as usize)
        .with_strategy(args.strategy)
        .with_retry_failed(!args.no_retry_failed);
    if let Some(n) = args.max_trials {
        config = config.with_max_trials(n);
    }
    if let Some(seed) = args.seed {
        config = config.with_seed(seed);
    }
    config.validate()?;

    let alpha = load_alpha(&args.alpha)?;
    let regions = RegionMetadata::load(&args.regions)?;

    let base_url = std::env::var(API_URL_VAR).unwrap_or_else(|_| DEFAULT_API_URL.to_string());
    let provider = BrainSessionProvider::new(base_url, &args.session_cache, Credentials::from_env_or_file()?);
    let session = provider.get_session(MIN_SESSION_VALIDITY).await?;
    info!(expires_at = %session.expires_at(), "session ready");

    let fields = alpha.expression().map(extract_fields).unwrap_or_default();
    let availability = if args.skip_field_check {
        None
    } else {
        Availability::common(&session.data_fields(&fields).await?)
    };
    let space = match availability {
        Some(availability) => {
            info!(fields = ?fields, "restricting settings to field coverage");
            regions.search_space_with(&alpha, &availability)?
        }
        None => regions.search_space_for(&alpha)?,
    };
    info!(
        study = %config.name,
        region = alpha.region().unwrap_or("?"),
        cardinality = space.cardinality(),
        "search space ready"
    );

    std::fs::create_dir_all(&args.studies_dir)
        .with_context(|| format!("creating {}", args.studies_dir.display()))?;
    let journal = config.journal_path(&args.studies_dir);
    let ledger = Ledger::load_or_create(&journal)
        .with_context(|| format!("opening study journal {}", journal.display()))?;

    let evaluator = BrainEvaluator::new(session, alpha);
    let mut orchestrator = Orchestrator::new(config, space, ledger, evaluator)?;

    let handle = orchestrator.shutdown_handle();
    tokio::spawn(async move {
        loop {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "cannot listen for interrupts");
                return;
            }
            match on_interrupt(&handle) {
                Interrupt::Drain => warn!(
                    "interrupt received, waiting for running simulations (interrupt again to quit now)"
                ),
                Interrupt::Abort => {
                    error!("second interrupt, exiting without waiting for running simulations");
                    std::process::exit(ABORT_EXIT_CODE);
                }
            }
        }
    });

    let summary = orchestrator.run().await?;
    println!("{summary}");
    println!("Journal: {}", journal.display());
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum Interrupt {
    /// Stop dispatching and let in-flight trials finish.
    Drain,
    /// Already draining; leave now.
    Abort,
}

fn on_interrupt(handle: &ShutdownHandle) -> Interrupt {
    if handle.is_cancelled() {
        Interrupt::Abort
    } else {
        handle.cancel();
        Interrupt::Drain
    }
}
