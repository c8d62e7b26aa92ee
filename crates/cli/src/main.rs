mod cli;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use autoflow_engine::{
    CredentialStore, CredentialVault, EngineSettings, ExecutionEngine, ExecutionRecorder, FileCredentialRepository, JsonlRecorder,
    MemoryPlanRepository, ProviderRegistry, load_plan_directory, load_plan_file, register_builtin_providers,
};
use autoflow_scheduler::{
    CronSchedule, EngineDispatcher, FileJobStore, JobStore, Scheduler, WebhookRouter, WebhookServer, sync_plan_trigger,
};
use autoflow_types::{ExecutionStatus, RunSource};
use autoflow_util::{EngineConfig, SecretCipher, keystore, load_master_key};
use chrono::Utc;
use clap::Parser;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::cli::{Cli, Commands, CredentialAction, KeyAction};

const CREDENTIALS_FILE: &str = "credentials.json";
const JOBS_FILE: &str = "jobs.json";
const RUNS_DIR: &str = "runs";

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => EngineConfig::load_from(path),
        None => EngineConfig::load(),
    }
    .context("failed to load configuration")?;

    match cli.command {
        Commands::Run {
            plan,
            plan_id,
            input,
            user,
        } => run_plan(&config, &plan, plan_id.as_deref(), &input, user).await,
        Commands::Credentials { action } => manage_credentials(&config, action),
        Commands::Serve { plans, bind } => serve(&config, &plans, bind).await,
        Commands::Jobs => list_jobs(&config).await,
        Commands::Runs { user, failed } => list_runs(&config, &user, failed).await,
        Commands::NextRun {
            cron,
            timezone,
            from,
            count,
        } => next_runs(&cron, &timezone, from.unwrap_or_else(Utc::now), count),
        Commands::Key { action } => manage_key(action),
    }
}

fn init_tracing() {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn credential_vault(config: &EngineConfig) -> Result<Arc<CredentialVault<FileCredentialRepository>>> {
    let cipher = load_master_key().context("credential master key unavailable; run `autoflow key generate --store`")?;
    let path = config.resolved_data_dir().join(CREDENTIALS_FILE);
    let repository = FileCredentialRepository::open(&path).with_context(|| format!("failed to open {}", path.display()))?;
    Ok(Arc::new(CredentialVault::new(repository, cipher)))
}

fn recorder(config: &EngineConfig) -> Result<Arc<JsonlRecorder>> {
    let root = config.resolved_data_dir().join(RUNS_DIR);
    let recorder = JsonlRecorder::open(&root).with_context(|| format!("failed to open run log at {}", root.display()))?;
    Ok(Arc::new(recorder))
}

fn job_store(config: &EngineConfig) -> Result<Arc<FileJobStore>> {
    let path = config.resolved_data_dir().join(JOBS_FILE);
    let store = FileJobStore::open(&path).with_context(|| format!("failed to open {}", path.display()))?;
    Ok(Arc::new(store))
}

fn build_engine(config: &EngineConfig) -> Result<ExecutionEngine> {
    let registry = Arc::new(ProviderRegistry::new());
    register_builtin_providers(&registry).context("failed to build HTTP client")?;
    Ok(ExecutionEngine::new(
        registry,
        credential_vault(config)?,
        recorder(config)?,
        EngineSettings::from_config(config),
    ))
}

async fn run_plan(config: &EngineConfig, path: &Path, plan_id: Option<&str>, input: &str, user: Option<String>) -> Result<()> {
    let plans = load_plan_file(path)?;
    let mut plan = match plan_id {
        Some(id) => plans
            .into_iter()
            .find(|plan| plan.id == id)
            .with_context(|| format!("plan '{id}' not found in {}", path.display()))?,
        None => {
            let mut plans = plans.into_iter();
            let first = plans.next().with_context(|| format!("{} contains no plans", path.display()))?;
            if plans.next().is_some() {
                bail!("{} contains several plans; choose one with --plan-id", path.display());
            }
            first
        }
    };
    if let Some(user) = user {
        plan.user_id = user;
    }
    let trigger: Value = serde_json::from_str(input).context("--input must be a JSON document")?;

    let engine = build_engine(config)?;
    let execution = engine.run(&plan, trigger, RunSource::Manual).await?;
    let logs = engine.recorder().logs(execution.id).await?;
    println!("{}", serde_json::to_string_pretty(&json!({ "execution": execution, "logs": logs }))?);

    if execution.status != ExecutionStatus::Success {
        bail!(
            "run {} failed: {}",
            execution.id,
            execution.error_message.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

fn manage_credentials(config: &EngineConfig, action: CredentialAction) -> Result<()> {
    let vault = credential_vault(config)?;
    match action {
        CredentialAction::Set {
            user,
            provider,
            kind,
            value,
            expires_at,
        } => {
            vault.store(&user, &provider, &kind, &value, expires_at)?;
            println!("stored {kind} credential for {provider}");
        }
        CredentialAction::Revoke { user, provider, kind } => {
            vault.invalidate(&user, &provider, &kind)?;
            println!("revoked {kind} credential for {provider}");
        }
        CredentialAction::Check { user, provider } => {
            let credentials = vault.usable(&user, &provider)?;
            let kinds: Vec<&str> = credentials.kinds().collect();
            println!("{}", serde_json::to_string_pretty(&json!({ "provider": provider, "usable": kinds }))?);
        }
    }
    Ok(())
}

async fn serve(config: &EngineConfig, plans_dir: &Path, bind: Option<std::net::SocketAddr>) -> Result<()> {
    let plans = load_plan_directory(plans_dir)?;
    let store = job_store(config)?;
    let now = Utc::now();
    for plan in &plans {
        if let Err(sync_error) = sync_plan_trigger(store.as_ref(), plan, now).await {
            warn!(plan_id = %plan.id, error = %sync_error, "skipping plan trigger");
        }
    }
    info!(plans = plans.len(), directory = %plans_dir.display(), "plans loaded");

    let repository = Arc::new(MemoryPlanRepository::with_plans(plans));
    let dispatcher = Arc::new(EngineDispatcher::new(build_engine(config)?, repository));
    let scheduler = Scheduler::new(store.clone(), dispatcher.clone(), config.scheduler.clone())
        .start()
        .await?;

    let bind_address = match bind {
        Some(address) => address,
        None => config
            .webhook
            .bind_address
            .parse()
            .with_context(|| format!("invalid webhook bind address '{}'", config.webhook.bind_address))?,
    };
    let server = WebhookServer::new(bind_address, WebhookRouter::new(store, dispatcher))
        .start()
        .await?;
    info!(address = %server.bound_address(), "autoflow serving; press Ctrl-C to stop");

    tokio::signal::ctrl_c().await.context("failed to listen for Ctrl-C")?;
    info!("shutting down");
    server.stop().await?;
    scheduler.stop().await?;
    Ok(())
}

async fn list_jobs(config: &EngineConfig) -> Result<()> {
    let jobs = job_store(config)?.jobs().await?;
    println!("{}", serde_json::to_string_pretty(&jobs)?);
    Ok(())
}

async fn list_runs(config: &EngineConfig, user: &str, failed: bool) -> Result<()> {
    let recorder = recorder(config)?;
    let executions = if failed {
        recorder.failed_executions(user).await?
    } else {
        recorder.executions_for_user(user).await?
    };
    let stats = recorder.stats(user).await?;
    println!("{}", serde_json::to_string_pretty(&json!({ "executions": executions, "stats": stats }))?);
    Ok(())
}

fn next_runs(cron: &str, timezone: &str, from: chrono::DateTime<Utc>, count: usize) -> Result<()> {
    let schedule = CronSchedule::parse(cron, timezone)?;
    let mut cursor = from;
    for _ in 0..count.max(1) {
        cursor = schedule.next_after(cursor)?;
        println!("{}", cursor.to_rfc3339());
    }
    Ok(())
}

fn manage_key(action: KeyAction) -> Result<()> {
    match action {
        KeyAction::Generate { store } => {
            let key = SecretCipher::generate_key();
            if store {
                keystore::store_master_key(&key)?;
                println!("master key stored in the OS keychain");
            } else {
                println!("{key}");
            }
        }
        KeyAction::Remove => {
            keystore::remove_master_key()?;
            println!("master key removed from the OS keychain");
        }
    }
    Ok(())
}
