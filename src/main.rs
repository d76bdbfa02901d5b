use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use patchwarden::acceptance::{preflight, Controller, LadderVerifier, RunOptions};
use patchwarden::config::Config;
use patchwarden::error::{ExitStatus, InfraError};
use patchwarden::generator::{CommandGenerator, PatchGenerator};
use patchwarden::git_ops;
use patchwarden::guard::{GuardDecision, GuardLimits, LedgerRules, PatchGuard, Scope};
use patchwarden::ladder::Mode;
use patchwarden::lock::{ensure_state_dir, RunLock};
use patchwarden::snapshot;
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "patchwarden",
    about = "Admit generated patches only when they clear the guard and the verification ladder",
    version
)]
struct Cli {
    /// Path inside the repository (defaults to current directory)
    #[arg(long, global = true, default_value = ".")]
    repo: PathBuf,

    /// Log filter, e.g. `info` or `patchwarden=debug` (overrides RUST_LOG)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Verify, fix, and patch until green or out of passes
    Run(RunArgs),
    /// Run the verification ladder once
    Verify(ScopeArgs),
    /// Evaluate a diff file against the patch guard
    Guard(GuardArgs),
    /// Print content hashes of the protected paths as JSON
    Snapshot,
}

#[derive(Args, Debug)]
struct ScopeArgs {
    /// Feature spec name; omit for a global run
    #[arg(long)]
    scope: Option<String>,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    scope: ScopeArgs,
    #[arg(long)]
    max_passes: Option<u32>,
    /// Never ask the generator for a patch
    #[arg(long)]
    no_llm: bool,
    /// Stage accepted patches without committing
    #[arg(long)]
    no_commit: bool,
}

#[derive(Args, Debug)]
struct GuardArgs {
    /// File holding the unified diff
    diff: PathBuf,
    /// Allowed path prefix (repeatable)
    #[arg(long = "prefix", required = true)]
    prefixes: Vec<String>,
    /// Tracked document the patch may append to
    #[arg(long)]
    ledger: Option<String>,
}

impl ScopeArgs {
    fn mode(&self) -> Result<Mode, InfraError> {
        match &self.scope {
            Some(spec) => Mode::scoped(spec),
            None => Ok(Mode::Global),
        }
    }
}

fn main() {
    let cli = Cli::parse();
    let filter = match cli.log_level.as_deref() {
        Some(level) => EnvFilter::try_new(level).map_err(|_| ()),
        None => EnvFilter::try_from_default_env().map_err(|_| ()),
    }
    .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let result = dispatch(&cli);
    if let Err(err) = &result {
        match err.downcast_ref::<InfraError>() {
            Some(infra) => error!(error = %infra, "infrastructure unavailable"),
            None => error!(error = %format!("{err:#}"), "patchwarden failed"),
        }
    }
    let status = ExitStatus::of(&result);
    std::process::exit(status.code());
}

fn dispatch(cli: &Cli) -> Result<ExitStatus> {
    let repo_root = git_ops::repo_root(&cli.repo)?;
    let config = Config::load(&repo_root);
    config.validate()?;

    match &cli.command {
        Commands::Run(args) => run(&repo_root, config, args),
        Commands::Verify(args) => verify(&repo_root, config, args),
        Commands::Guard(args) => guard(&repo_root, &config, args),
        Commands::Snapshot => print_snapshot(&repo_root, &config),
    }
}

fn controller(repo_root: &Path, config: Config) -> Result<Controller> {
    let verifier = Box::new(LadderVerifier::new(repo_root, &config));
    let generator = CommandGenerator::from_config(&config)
        .map(|g| Box::new(g) as Box<dyn PatchGenerator>);
    Controller::new(repo_root, config, verifier, generator)
}

fn run(repo_root: &Path, config: Config, args: &RunArgs) -> Result<ExitStatus> {
    let mode = args.scope.mode()?;
    preflight(&config)?;
    let state_dir = config.state_dir(repo_root);
    ensure_state_dir(repo_root, &state_dir)?;
    let _lock = RunLock::acquire(&state_dir)?;

    let mut options = RunOptions::from_config(mode, &config);
    if let Some(max_passes) = args.max_passes {
        options.max_passes = max_passes;
    }
    options.llm_enabled &= !args.no_llm;
    options.commit = !args.no_commit;

    let mut controller = controller(repo_root, config)?;
    let outcome = controller.run(&options)?;
    println!("{}", serde_json::to_string_pretty(&outcome_json(&outcome))?);
    Ok(outcome.exit_status())
}

fn outcome_json(outcome: &patchwarden::acceptance::RunOutcome) -> serde_json::Value {
    use patchwarden::acceptance::RunOutcome;
    match outcome {
        RunOutcome::Green { passes } => json!({ "outcome": "green", "passes": passes }),
        RunOutcome::MaxPassesExhausted { passes } => {
            json!({ "outcome": "max_passes_exhausted", "passes": passes })
        }
        RunOutcome::Rejected(rejection) => json!({
            "outcome": "rejected",
            "rejection": rejection,
            "message": rejection.to_string(),
        }),
    }
}

fn verify(repo_root: &Path, config: Config, args: &ScopeArgs) -> Result<ExitStatus> {
    let mode = args.mode()?;
    preflight(&config)?;
    let state_dir = config.state_dir(repo_root);
    ensure_state_dir(repo_root, &state_dir)?;
    let _lock = RunLock::acquire(&state_dir)?;

    let mut controller = controller(repo_root, config)?;
    let verdict = controller.verify(&mode)?;
    match &verdict.first_failure {
        None => println!("green: {} stages passed", verdict.results.len()),
        Some(failure) => println!(
            "red: stage {} ({}) failed: {}",
            failure.id, failure.description, failure.reason
        ),
    }
    Ok(if verdict.success {
        ExitStatus::Green
    } else {
        ExitStatus::PassBudgetExhausted
    })
}

fn guard(repo_root: &Path, config: &Config, args: &GuardArgs) -> Result<ExitStatus> {
    let diff = fs::read_to_string(&args.diff)
        .with_context(|| format!("Failed to read {}", args.diff.display()))?;
    let ledger = LedgerRules::new(&config.ledger.status_pattern, &config.ledger.allowed_sections)
        .map_err(|e| InfraError::Config(e.to_string()))?;
    let guard = PatchGuard::new(
        GuardLimits {
            max_files: config.max_patch_files,
            max_lines: config.max_patch_lines,
        },
        ledger,
    );

    let mut scope = Scope::with_prefixes(&args.prefixes);
    if let Some(path) = &args.ledger {
        let baseline = git_ops::read_file_from_head(repo_root, Path::new(path))?;
        scope = scope.with_tracked_document(path.as_str(), baseline);
    }

    let decision = guard.evaluate(&diff, &scope);
    let report = match &decision {
        GuardDecision::Accept => json!({ "decision": "accept" }),
        GuardDecision::Reject(rejection) => json!({
            "decision": "reject",
            "rejection": rejection,
            "message": rejection.to_string(),
        }),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(if decision.is_accept() {
        ExitStatus::Green
    } else {
        ExitStatus::PatchRejected
    })
}

fn print_snapshot(repo_root: &Path, config: &Config) -> Result<ExitStatus> {
    let excluded = vec![config.state_dir.clone()];
    let snap = snapshot::snapshot(repo_root, &config.protected_paths, &excluded)?;
    println!("{}", serde_json::to_string_pretty(&snap)?);
    Ok(ExitStatus::Green)
}
