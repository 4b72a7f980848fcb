//! Converge CLI entrypoint.
//!
//! This is the main entrypoint for the converge command-line tool.

use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use cluster_converge::cli::{Cli, Commands, LogFormat, OutputFormatter, StateCommands};
use cluster_converge::config::{
    ApprovalMode, ConfigParser, ConfigValidator, EnvironmentConfig, PlatformConfig, StateBackend,
    find_config_file,
};
use cluster_converge::error::{ConfigError, ConvergeError, PipelineError, Result, exit_codes};
use cluster_converge::pipeline::{
    ApprovalDecision, ApprovalGate, AutoApprovalGate, AutoApprovalPolicy, CancellationFlag,
    LoggingDeliveryAgent, ManualApprovalGate, PromotionController,
};
use cluster_converge::planner::{ConvergenceExecutor, DiffEngine, Plan};
use cluster_converge::provider::{HttpProvisioner, ProvisioningApi};
use cluster_converge::reconciler::{AddonReconciler, ClusterTarget};
use cluster_converge::registry::EnvironmentRegistry;
use cluster_converge::state::{
    HistoryEntry, HistoryKind, LocalStateStore, PlatformState, S3StateStore, STATE_DIR, StateStore,
};

use clap::Parser;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.log_format);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::from(exit_codes::INTERNAL);
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}

/// Initializes the logging system.
///
/// `RUST_LOG` takes precedence over `--verbose`.
fn init_logging(verbose: bool, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));

    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init(),
    }
}

/// Main async entry point; resolves to the process exit code.
async fn run(cli: Cli) -> Result<u8> {
    let formatter = OutputFormatter::new(cli.output);
    let config_path = cli.config.as_ref();

    match cli.command {
        Commands::Init { path, force } => cmd_init(&path, force),
        Commands::Validate { warnings } => cmd_validate(config_path, warnings, &formatter),
        Commands::Plan {
            environment,
            detailed,
        } => {
            let ws = Workspace::load(config_path).await?;
            cmd_plan(&ws, &environment, detailed, &formatter).await
        }
        Commands::Apply { environment, yes } => {
            let ws = Workspace::load(config_path).await?;
            ws.locked("apply", cmd_apply(&ws, &environment, yes, &formatter))
                .await
        }
        Commands::Promote => {
            let ws = Workspace::load(config_path).await?;
            ws.locked("promote", cmd_promote(&ws, &formatter)).await
        }
        Commands::Approve { run, environment } => {
            let ws = Workspace::load(config_path).await?;
            let decision = ApprovalDecision::Approve;
            ws.locked(
                "approve",
                cmd_decide(&ws, &run, environment, decision, &formatter),
            )
            .await
        }
        Commands::Reject {
            run,
            environment,
            reason,
        } => {
            let ws = Workspace::load(config_path).await?;
            let decision = ApprovalDecision::Reject { reason };
            ws.locked(
                "reject",
                cmd_decide(&ws, &run, environment, decision, &formatter),
            )
            .await
        }
        Commands::Cancel { run, reason } => {
            let ws = Workspace::load(config_path).await?;
            ws.locked("cancel", cmd_cancel(&ws, &run, &reason, &formatter))
                .await
        }
        Commands::Status { run } => {
            let ws = Workspace::load(config_path).await?;
            cmd_status(&ws, run.as_deref(), &formatter).await
        }
        Commands::ReconcileAddons {
            environment,
            once,
            interval,
        } => {
            let ws = Workspace::load(config_path).await?;
            let targets = cluster_targets(&ws.config, environment.as_deref())?;
            if once {
                ws.locked(
                    "reconcile-addons",
                    cmd_reconcile_once(&ws, &targets, &formatter),
                )
                .await
            } else {
                let interval = interval.map_or_else(|| ws.config.reconciler.interval(), Duration::from_secs);
                cmd_reconcile_periodic(&ws, targets, interval, &formatter).await
            }
        }
        Commands::Drift { environment } => {
            let ws = Workspace::load(config_path).await?;
            cmd_drift(&ws, &environment, &formatter).await
        }
        Commands::State { command } => {
            let ws = Workspace::load(config_path).await?;
            cmd_state(&ws, command, &formatter).await
        }
    }
}

/// Initialize a new project.
fn cmd_init(path: &Path, force: bool) -> Result<u8> {
    info!("Initializing new platform project in: {}", path.display());

    let config_path = path.join("converge.platform.yaml");
    let env_path = path.join(".env.example");
    let gitignore_path = path.join(".gitignore");

    if !force && config_path.exists() {
        eprintln!("Configuration file already exists: {}", config_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(0);
    }

    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    std::fs::write(&config_path, include_str!("../templates/platform.yaml"))?;
    eprintln!("Created: {}", config_path.display());

    std::fs::write(&env_path, include_str!("../templates/.env.example"))?;
    eprintln!("Created: {}", env_path.display());

    let state_entry = format!("{STATE_DIR}/");
    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        let has_env = existing.lines().any(|l| l.trim() == ".env");
        let has_state = existing.lines().any(|l| l.trim() == state_entry);
        if !has_env || !has_state {
            let mut file = std::fs::OpenOptions::new().append(true).open(&gitignore_path)?;
            writeln!(file, "\n# converge")?;
            if !has_env {
                writeln!(file, ".env")?;
            }
            if !has_state {
                writeln!(file, "{state_entry}")?;
            }
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, format!(".env\n{state_entry}\n"))?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("\nProject initialized successfully!");
    eprintln!("Next steps:");
    eprintln!("  1. Copy .env.example to .env and set the provisioning API token");
    eprintln!("  2. Edit converge.platform.yaml with your environments and resources");
    eprintln!("  3. Run 'converge validate' to check your configuration");
    eprintln!("  4. Run 'converge plan dev' to see what would change");
    eprintln!("  5. Run 'converge promote' to roll the platform out");

    Ok(0)
}

/// Validate configuration, reporting every problem.
fn cmd_validate(config_path: Option<&PathBuf>, show_warnings: bool, formatter: &OutputFormatter) -> Result<u8> {
    let config_file = resolve_config_path(config_path)?;
    info!("Validating configuration: {}", config_file.display());

    let parser = ConfigParser::new().with_base_path(config_dir(&config_file));
    parser.load_dotenv()?;
    let config = parser.load_with_env(&config_file)?;

    let result = ConfigValidator::new().check(&config);
    println!("{}", formatter.format_validation(&config, &result, show_warnings));

    Ok(if result.is_valid() { 0 } else { exit_codes::CONFIG })
}

/// Show the plan for one environment.
async fn cmd_plan(ws: &Workspace, environment: &str, detailed: bool, formatter: &OutputFormatter) -> Result<u8> {
    let env_config = environment_config(&ws.config, environment)?;
    let state = ws.load_state().await?;
    let engine = Engine::build(&ws.config, &state)?;

    let desired = ws.config.desired_nodes(env_config);
    let observed = engine.registry.get_observed_state(environment).await?;
    let diff = DiffEngine::new().compute_diff(&desired, &observed)?;
    let plan = Plan::from_diff(environment, &ws.config.desired_state().version, &diff);

    println!("{}", formatter.format_plan(&plan, detailed.then_some(&diff)));
    Ok(0)
}

/// Converge one environment directly.
async fn cmd_apply(ws: &Workspace, environment: &str, auto_approve: bool, formatter: &OutputFormatter) -> Result<u8> {
    let env_config = environment_config(&ws.config, environment)?;
    let mut state = ws.load_state().await?;
    let engine = Engine::build(&ws.config, &state)?;

    let version = ws.config.desired_state().version;
    let desired = ws.config.desired_nodes(env_config);
    let observed = engine.registry.get_observed_state(environment).await?;
    let diff = DiffEngine::new().compute_diff(&desired, &observed)?;
    let mut plan = Plan::from_diff(environment, &version, &diff);

    println!("{}", formatter.format_plan(&plan, None));

    if plan.is_empty() {
        engine.registry.record_applied_version(environment, &version).await?;
        engine.persist(&mut state).await;
        ws.store.save(&state).await?;
        return Ok(0);
    }

    if env_config.requires_approval {
        warn!("{environment} normally requires approval; applying it directly bypasses the promotion gate");
    }
    if !auto_approve && !confirm("Do you want to apply this plan? [y/N]: ")? {
        eprintln!("Apply cancelled.");
        return Ok(exit_codes::CANCELLED);
    }

    let flag = Arc::new(CancellationFlag::new());
    let watcher = watch_interrupt(Arc::clone(&flag));
    let report = {
        let mut record = engine.registry.lock(environment).await?;
        let forgotten = record
            .ledger
            .forget_drifted(&observed, ws.config.reconciler.visibility_grace());
        if !forgotten.is_empty() {
            debug!("Forgot drifted ledger entries: {}", forgotten.join(", "));
        }
        engine
            .executor
            .apply_with_cancellation(&mut plan, &mut record.ledger, &flag)
            .await
    };
    watcher.abort();

    if report.success() {
        engine.registry.record_applied_version(environment, &version).await?;
    } else {
        engine.registry.mark_failed(environment).await?;
    }

    state.add_history(
        HistoryEntry::new(
            HistoryKind::Apply,
            report.success(),
            format!("{} applied, {} failed", report.applied, report.failed),
        )
        .with_environment(environment)
        .with_version(&version),
    );
    engine.persist(&mut state).await;
    ws.store.save(&state).await?;

    println!("{}", formatter.format_report(&report));
    Ok(report
        .to_error()
        .map_or(0, |e| ConvergeError::from(e).exit_code()))
}

/// Start a promotion run and drive it as far as it goes.
async fn cmd_promote(ws: &Workspace, formatter: &OutputFormatter) -> Result<u8> {
    let mut state = ws.load_state().await?;
    let engine = Engine::build(&ws.config, &state)?;

    let active: Vec<String> = state
        .runs
        .iter()
        .filter(|r| !r.state.is_terminal())
        .map(|r| r.id.to_string())
        .collect();
    if !active.is_empty() {
        warn!("Runs still in progress: {}", active.join(", "));
    }

    let desired = ws.config.desired_state();
    let id = engine.controller.start(desired);
    let watcher = watch_interrupt(engine.controller.cancellation_flag(id)?);
    let outcome = engine.controller.advance(id).await;
    watcher.abort();

    let run = engine.controller.run(id).await?;
    state.add_history(
        HistoryEntry::new(
            HistoryKind::Promote,
            outcome.is_ok() && run.exit_code() == 0,
            format!("run {} is {}", run.id, run.state),
        )
        .with_run(&run),
    );
    engine.persist(&mut state).await;
    ws.store.save(&state).await?;
    outcome?;

    println!("{}", formatter.format_run(&run));
    Ok(run.exit_code())
}

/// Deliver an approval decision and continue the run.
async fn cmd_decide(
    ws: &Workspace,
    run_prefix: &str,
    environment: Option<String>,
    decision: ApprovalDecision,
    formatter: &OutputFormatter,
) -> Result<u8> {
    let mut state = ws.load_state().await?;
    let engine = Engine::build(&ws.config, &state)?;

    let run = state.resolve_run(run_prefix)?;
    let id = run.id;
    let environment = match environment.or_else(|| run.current_environment().map(str::to_string)) {
        Some(env) => env,
        None => {
            return Err(PipelineError::InvalidTransition {
                state: run.state.to_string(),
                event: String::from("decision"),
            }
            .into());
        }
    };

    let (kind, approved) = match &decision {
        ApprovalDecision::Approve => (HistoryKind::Approve, true),
        ApprovalDecision::Reject { .. } => (HistoryKind::Reject, false),
    };
    let watcher = watch_interrupt(engine.controller.cancellation_flag(id)?);
    let outcome = engine.controller.decide(id, &environment, decision).await;
    watcher.abort();

    let run = engine.controller.run(id).await?;
    state.add_history(
        HistoryEntry::new(
            kind,
            outcome.is_ok(),
            format!(
                "{} {environment}; run is {}",
                if approved { "approved" } else { "rejected" },
                run.state
            ),
        )
        .with_environment(&environment)
        .with_run(&run),
    );
    engine.persist(&mut state).await;
    ws.store.save(&state).await?;
    outcome?;

    println!("{}", formatter.format_run(&run));
    Ok(run.exit_code())
}

/// Cancel a run.
async fn cmd_cancel(ws: &Workspace, run_prefix: &str, reason: &str, formatter: &OutputFormatter) -> Result<u8> {
    let mut state = ws.load_state().await?;
    let engine = Engine::build(&ws.config, &state)?;

    let id = state.resolve_run(run_prefix)?.id;
    let run_state = engine.controller.cancel(id, reason).await?;

    let run = engine.controller.run(id).await?;
    state.add_history(
        HistoryEntry::new(HistoryKind::Cancel, true, format!("run is {run_state}: {reason}")).with_run(&run),
    );
    engine.persist(&mut state).await;
    ws.store.save(&state).await?;

    println!("{}", formatter.format_run(&run));
    Ok(0)
}

/// Show environments and runs.
async fn cmd_status(ws: &Workspace, run_prefix: Option<&str>, formatter: &OutputFormatter) -> Result<u8> {
    let state = ws.load_state().await?;

    if let Some(prefix) = run_prefix {
        let run = state.resolve_run(prefix)?;
        println!("{}", formatter.format_run(run));
        return Ok(0);
    }

    let mut environments: Vec<_> = state
        .records_for(ws.config.registry_environments())
        .into_iter()
        .map(|r| r.environment)
        .collect();
    environments.sort_by_key(|e| e.position);

    println!("{}", formatter.format_status(&environments, &state.runs));
    Ok(0)
}

/// Run one add-on reconciliation cycle per cluster.
async fn cmd_reconcile_once(ws: &Workspace, targets: &[ClusterTarget], formatter: &OutputFormatter) -> Result<u8> {
    let mut state = ws.load_state().await?;
    let engine = Engine::build(&ws.config, &state)?;
    let reconciler = engine.reconciler(&ws.config);

    let mut reports = Vec::with_capacity(targets.len());
    for target in targets {
        reports.push(reconciler.reconcile_cycle(target).await);
    }

    let changed: usize = reports.iter().map(|r| r.changed()).sum();
    let failed: usize = reports.iter().map(|r| r.failed()).sum();
    state.add_history(HistoryEntry::new(
        HistoryKind::Reconcile,
        failed == 0,
        format!("{} clusters, {changed} add-ons changed, {failed} failed", reports.len()),
    ));
    engine.persist(&mut state).await;
    ws.store.save(&state).await?;

    println!("{}", formatter.format_cycles(&reports));
    Ok(if failed == 0 {
        0
    } else {
        exit_codes::UNRECOVERABLE_PROVISIONING
    })
}

/// Reconcile add-ons until interrupted.
///
/// Ledger entries recorded while running are not persisted; only a history
/// entry is written on shutdown.
async fn cmd_reconcile_periodic(
    ws: &Workspace,
    targets: Vec<ClusterTarget>,
    interval: Duration,
    formatter: &OutputFormatter,
) -> Result<u8> {
    let state = ws.load_state().await?;
    let engine = Engine::build(&ws.config, &state)?;
    let reconciler = Arc::new(engine.reconciler(&ws.config));
    let clusters = targets.len();

    info!(
        "Reconciling add-ons of {clusters} clusters every {}s; press Ctrl-C to stop",
        interval.as_secs()
    );
    let flag = Arc::new(CancellationFlag::new());
    let handles = reconciler.run_periodic(targets, interval, Arc::clone(&flag));

    tokio::signal::ctrl_c().await?;
    flag.cancel("interrupted");

    let mut cycles = 0;
    for handle in handles {
        match handle.await {
            Ok(n) => cycles += n,
            Err(e) => warn!("Reconciliation task ended abnormally: {e}"),
        }
    }

    ws.locked("reconcile-addons", async {
        let mut latest = ws.load_state().await?;
        latest.add_history(HistoryEntry::new(
            HistoryKind::Reconcile,
            true,
            format!("{cycles} cycles over {clusters} clusters"),
        ));
        ws.store.save(&latest).await
    })
    .await?;

    println!(
        "{}",
        formatter.success(&format!("Stopped after {cycles} cycles over {clusters} clusters"))
    );
    Ok(0)
}

/// Check for drift.
async fn cmd_drift(ws: &Workspace, environment: &str, formatter: &OutputFormatter) -> Result<u8> {
    let env_config = environment_config(&ws.config, environment)?;
    let state = ws.load_state().await?;
    let engine = Engine::build(&ws.config, &state)?;

    let desired = ws.config.desired_nodes(env_config);
    let report = engine
        .reconciler(&ws.config)
        .check_drift(environment, &desired)
        .await?;

    println!("{}", formatter.format_drift(&report));
    Ok(0)
}

/// State management commands.
async fn cmd_state(ws: &Workspace, command: StateCommands, formatter: &OutputFormatter) -> Result<u8> {
    match command {
        StateCommands::Show => {
            if let Some(state) = ws.store.load().await? {
                println!("{}", formatter.format_state(&state));
            } else {
                println!("{}", formatter.warning("No state found."));
            }
        }
        StateCommands::Lock { holder, purpose } => {
            let lock = ws
                .store
                .acquire_lock(holder.as_deref().unwrap_or(""), &purpose)
                .await?;
            println!("{}", formatter.format_lock(&lock));
        }
        StateCommands::Unlock { lock_id, force } => {
            if force {
                match ws.store.force_unlock().await? {
                    Some(lock) => println!(
                        "{}",
                        formatter.success(&format!("Removed lock held by {}", lock.holder))
                    ),
                    None => println!("{}", formatter.warning("State is not locked.")),
                }
            } else if let Some(id) = lock_id {
                ws.store.release_lock(&id).await?;
                println!("{}", formatter.success("State unlocked."));
            } else {
                println!("{}", formatter.error("Please provide --lock-id or use --force"));
                return Ok(exit_codes::STATE);
            }
        }
    }

    Ok(0)
}

// ============================================================================
// Helper Types
// ============================================================================

/// Loaded configuration and its state backend.
struct Workspace {
    config: PlatformConfig,
    store: Box<dyn StateStore>,
}

impl Workspace {
    /// Loads and validates configuration and opens the state backend.
    async fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        let config_file = resolve_config_path(config_path)?;
        debug!("Loading configuration from: {}", config_file.display());
        let base = config_dir(&config_file);

        let parser = ConfigParser::new().with_base_path(&base);
        parser.load_dotenv()?;
        let config = parser.load_with_env(&config_file)?;

        let result = ConfigValidator::new().validate(&config)?;
        for warning in &result.warnings {
            warn!("{warning}");
        }

        let store: Box<dyn StateStore> = match config.state.backend {
            StateBackend::Local => match config.state.path.as_deref() {
                Some(path) => Box::new(LocalStateStore::with_state_path(base.join(path))),
                None => Box::new(LocalStateStore::with_base_dir(base.join(STATE_DIR))),
            },
            StateBackend::S3 => {
                let bucket = config.state.bucket.as_deref().ok_or_else(|| {
                    ConfigError::validation("S3 bucket name is required when using S3 backend", "state.bucket")
                })?;
                Box::new(
                    S3StateStore::new(bucket, config.state.prefix.as_deref(), config.state.region.as_deref())
                        .await,
                )
            }
        };
        debug!("Using {} state backend", store.backend_type());

        Ok(Self { config, store })
    }

    /// Loads persisted state, or starts an empty one.
    async fn load_state(&self) -> Result<PlatformState> {
        Ok(self
            .store
            .load()
            .await?
            .unwrap_or_else(|| PlatformState::new(&self.config.project.name)))
    }

    /// Runs `work` while holding the state lock.
    async fn locked<T, F>(&self, purpose: &str, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let lock = self.store.acquire_lock("", purpose).await?;
        let result = work.await;
        if let Err(e) = self.store.release_lock(&lock.lock_id).await {
            warn!("Failed to release state lock {}: {e}", lock.lock_id);
        }
        result
    }
}

/// Registry, executor and controller rebuilt from persisted state.
struct Engine {
    registry: Arc<EnvironmentRegistry>,
    executor: Arc<ConvergenceExecutor>,
    controller: PromotionController,
}

impl Engine {
    fn build(config: &PlatformConfig, state: &PlatformState) -> Result<Self> {
        let provider = create_provider(config)?;
        let executor_config = config.executor.to_executor_config();
        let registry = Arc::new(
            EnvironmentRegistry::new(Arc::clone(&provider)).with_observe_retry(executor_config.retry.clone()),
        );
        registry.restore(state.records_for(config.registry_environments()))?;

        let executor = ConvergenceExecutor::new(provider).with_config(executor_config);
        let controller = PromotionController::new(Arc::clone(&registry), executor.clone(), create_gate(config))
            .with_delivery_agent(Arc::new(LoggingDeliveryAgent))
            .with_visibility_grace(config.reconciler.visibility_grace());
        for run in &state.runs {
            controller.restore(run.clone());
        }

        Ok(Self {
            registry,
            executor: Arc::new(executor),
            controller,
        })
    }

    fn reconciler(&self, config: &PlatformConfig) -> AddonReconciler {
        AddonReconciler::new(Arc::clone(&self.registry), Arc::clone(&self.executor))
            .with_visibility_grace(config.reconciler.visibility_grace())
    }

    /// Copies environment records and runs back into `state`.
    async fn persist(&self, state: &mut PlatformState) {
        state.set_environments(self.registry.snapshot().await);
        state.upsert_runs(self.controller.runs().await);
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Resolves the configuration file path.
fn resolve_config_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))
}

/// Directory holding the configuration file.
fn config_dir(config_file: &Path) -> PathBuf {
    config_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
}

fn environment_config<'a>(config: &'a PlatformConfig, id: &str) -> Result<&'a EnvironmentConfig> {
    config.environment(id).ok_or_else(|| {
        ConfigError::UnknownEnvironment {
            name: id.to_string(),
        }
        .into()
    })
}

/// Groups the add-ons of the selected environments by cluster.
fn cluster_targets(config: &PlatformConfig, only: Option<&str>) -> Result<Vec<ClusterTarget>> {
    if let Some(id) = only {
        environment_config(config, id)?;
    }

    let mut targets = Vec::new();
    for (_, env) in config.ordered_environments() {
        if only.is_some_and(|id| id != env.id) {
            continue;
        }
        targets.extend(ClusterTarget::discover(&env.id, &config.desired_nodes(env))?);
    }
    Ok(targets)
}

/// Creates the provisioning API client.
fn create_provider(config: &PlatformConfig) -> Result<Arc<dyn ProvisioningApi>> {
    let endpoint = config.provider.endpoint.as_deref().ok_or_else(|| {
        ConfigError::validation(
            "provider.endpoint must be set to reach the provisioning API",
            "provider.endpoint",
        )
    })?;

    let token = match ConfigParser::provider_token(config) {
        Ok(token) => Some(token),
        Err(e) => {
            warn!("{e}; calling the provisioning API without credentials");
            None
        }
    };

    let provider = HttpProvisioner::with_timeout(endpoint, token, config.provider.timeout_secs)?;
    Ok(Arc::new(provider))
}

/// Creates the approval gate for the configured mode.
fn create_gate(config: &PlatformConfig) -> Arc<dyn ApprovalGate> {
    match config.approval.mode {
        ApprovalMode::Manual => Arc::new(ManualApprovalGate::new()),
        ApprovalMode::Auto => Arc::new(AutoApprovalGate::new(
            config
                .approval
                .max_operations
                .map_or(AutoApprovalPolicy::ApproveAll, AutoApprovalPolicy::MaxOperations),
        )),
    }
}

/// Cancels `flag` on Ctrl-C.
///
/// Operations in flight finish; the interrupted run or plan is then
/// persisted as cancelled by the caller.
fn watch_interrupt(flag: Arc<CancellationFlag>) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; waiting for operations in flight");
            flag.cancel("interrupted");
        }
    })
}

/// Asks a yes/no question on the terminal.
fn confirm(prompt: &str) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case("y"))
}
