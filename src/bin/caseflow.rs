//! caseflow CLI: operator interface to the allocation engine.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use caseflow::admin::Admin;
use caseflow::config::{Config, Settings};
use caseflow::db::Db;
use caseflow::model::{
    AgencyId, AgencyStatus, AgencyUpdate, CaseId, CaseStatus, ImportedAgency, JobId, JobKind,
    JobState, Month, NewAgency, NewInvoice, NewJob, Priority,
};
use caseflow::queue::{Dispatcher, JobQueue};
use caseflow::store::Repository;
use caseflow::telemetry::{TelemetryConfig, init_telemetry};
use caseflow::worker::{AllocationHandler, HandlerRegistry, IngestionHandler, WorkerRuntime};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "caseflow", about = "Route overdue invoice cases to collection agencies")]
struct Cli {
    /// Recorded as the actor on audit entries
    #[arg(long, global = true, default_value = "operator")]
    actor: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a worker until interrupted
    Serve {
        /// Identifier recorded on claimed jobs
        #[arg(long)]
        worker_id: Option<String>,
    },
    /// Job queue operations
    Job {
        #[command(subcommand)]
        action: JobAction,
    },
    /// Enqueue an allocation run
    Allocate {
        /// Wait for the run to finish and print its report
        #[arg(long)]
        wait: bool,
        #[arg(long, default_value_t = 60)]
        timeout_secs: u64,
    },
    /// Agency administration
    Agency {
        #[command(subcommand)]
        action: AgencyAction,
    },
    /// Case operations
    Case {
        #[command(subcommand)]
        action: CaseAction,
    },
    /// Show the audit trail, newest first
    Audit {
        /// Only entries for this case
        #[arg(long)]
        case: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum JobAction {
    /// Enqueue a job; trailing arguments become its payload
    Enqueue {
        /// ALLOCATION or INGESTION
        kind: String,
        #[arg(long)]
        max_attempts: Option<u32>,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// List jobs, newest first
    List {
        #[arg(long)]
        state: Option<String>,
        #[arg(long)]
        kind: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show a job
    Show {
        /// Job ID (full UUID or prefix)
        id: String,
    },
    /// Block until a job is COMPLETED or terminally FAILED
    Wait {
        id: String,
        #[arg(long, default_value_t = 60)]
        timeout_secs: u64,
    },
}

#[derive(Subcommand)]
enum AgencyAction {
    /// Onboard an agency
    Add {
        name: String,
        #[arg(long, default_value = "NA")]
        region: String,
        /// Defaults to the tier of the probationary score
        #[arg(long)]
        capacity: Option<i32>,
        #[arg(long)]
        id: Option<String>,
    },
    /// Change name, region, capacity or status
    Update {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        region: Option<String>,
        #[arg(long)]
        capacity: Option<i32>,
        /// ACTIVE, INACTIVE or SUSPENDED
        #[arg(long)]
        status: Option<String>,
    },
    /// Soft delete an agency
    Remove { id: String },
    /// Record one month's metrics
    Perf {
        id: String,
        /// YYYY-MM
        month: String,
        #[arg(long)]
        recovery: f64,
        #[arg(long)]
        sla: f64,
    },
    /// Bulk import agencies with history from a JSON file
    Import { file: PathBuf },
    /// Reset capacity to the tier of the current score
    Recompute { id: String },
    /// Delete all performance history of an agency
    ResetHistory { id: String },
    /// List agencies with their current score and load
    List {
        /// Include soft-deleted agencies
        #[arg(long)]
        all: bool,
    },
    /// Show an agency with its last 12 months
    Show { id: String },
}

#[derive(Subcommand)]
enum CaseAction {
    /// Ingest an invoice as a new case
    Add {
        invoice_number: String,
        #[arg(long)]
        amount: f64,
        #[arg(long)]
        customer: String,
        /// HIGH, MEDIUM or LOW
        #[arg(long, default_value = "MEDIUM")]
        priority: String,
        #[arg(long, default_value_t = 50.0)]
        urgency: f64,
    },
    /// List cases in insertion order
    List {
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Release an assigned case back to the pool
    Reassign { id: String },
    /// Close a case
    Close { id: String },
}

/// Process-wide handles, constructed once.
struct App {
    db: Arc<Db>,
    settings: Settings,
    dispatcher: Dispatcher,
}

impl App {
    async fn connect(config: &Config) -> anyhow::Result<Self> {
        let settings = config.settings()?;
        let db = Db::connect(&config.database_url)
            .await?
            .with_max_attempts(settings.jobs.max_attempts);
        db.migrate().await?;
        let db = Arc::new(db);
        let dispatcher = Dispatcher::new(db.clone());
        Ok(Self {
            db,
            settings,
            dispatcher,
        })
    }

    fn repo(&self) -> Arc<dyn Repository> {
        self.db.clone()
    }

    fn admin(&self) -> Admin {
        let admin = Admin::new(self.repo(), self.settings.allocation.lookback_months);
        if self.settings.allocation.auto_recompute {
            admin.with_recompute(self.dispatcher.clone())
        } else {
            admin
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let actor = cli.actor;
    match cli.command {
        Command::Serve { worker_id } => cmd_serve(&config, worker_id).await,
        command => {
            let app = App::connect(&config).await?;
            dispatch(&app, command, &actor).await
        }
    }
}

async fn dispatch(app: &App, command: Command, actor: &str) -> anyhow::Result<()> {
    match command {
        Command::Serve { .. } => anyhow::bail!("serve runs its own connection"),
        Command::Job { action } => cmd_job(app, action).await,
        Command::Allocate { wait, timeout_secs } => cmd_allocate(app, wait, timeout_secs).await,
        Command::Agency { action } => cmd_agency(app, action, actor).await,
        Command::Case { action } => cmd_case(app, action, actor).await,
        Command::Audit { case, limit } => {
            let case = case.as_deref().map(parse_case_id).transpose()?;
            for entry in app.db.audit_trail(case, limit).await? {
                let scope = entry
                    .scope
                    .case_id()
                    .map_or("system".to_string(), |c| c.to_string());
                println!(
                    "{}  {:<20}  {:<36}  {:<16}  {}",
                    entry.recorded_at.format("%Y-%m-%d %H:%M:%S"),
                    entry.action,
                    scope,
                    entry.actor,
                    entry.details
                );
            }
            Ok(())
        }
    }
}

async fn cmd_serve(config: &Config, worker_id: Option<String>) -> anyhow::Result<()> {
    let _guard = init_telemetry(TelemetryConfig::from_config(config))?;
    let app = App::connect(config).await?;
    let _bridge = app.db.spawn_event_bridge().await?;

    let follow_up = app
        .settings
        .allocation
        .auto_recompute
        .then(|| app.dispatcher.clone());
    let registry = HandlerRegistry::new()
        .register(Arc::new(AllocationHandler::new(
            app.repo(),
            app.settings.allocation_settings(),
        )))
        .register(Arc::new(IngestionHandler::new(
            app.repo(),
            Arc::new(app.settings.oracle()),
            follow_up,
        )));

    let worker_id = worker_id.unwrap_or_else(|| format!("worker-{}", std::process::id()));
    let worker = WorkerRuntime::new(
        app.db.clone(),
        Arc::new(registry),
        app.settings.worker_config(worker_id),
    );

    let handle = worker.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        handle.shutdown();
    });

    worker.run().await?;
    Ok(())
}

async fn cmd_job(app: &App, action: JobAction) -> anyhow::Result<()> {
    match action {
        JobAction::Enqueue {
            kind,
            max_attempts,
            args,
        } => {
            let kind: JobKind = kind.parse()?;
            let mut new = NewJob::new(kind).payload(args);
            if let Some(n) = max_attempts {
                new = new.max_attempts(n);
            }
            let id = app.dispatcher.submit(new).await?;
            println!("Enqueued: {id}");
        }
        JobAction::List { state, kind, limit } => {
            let state: Option<JobState> = state.map(|s| s.parse()).transpose()?;
            let kind: Option<JobKind> = kind.map(|k| k.parse()).transpose()?;
            let jobs = app.db.list(state, kind, limit).await?;
            if jobs.is_empty() {
                println!("No jobs found.");
                return Ok(());
            }
            println!(
                "{:<8}  {:<10}  {:<9}  {:<8}  CREATED",
                "ID", "KIND", "STATE", "ATTEMPTS"
            );
            println!("{}", "-".repeat(60));
            for job in &jobs {
                println!(
                    "{:<8}  {:<10}  {:<9}  {:<8}  {}",
                    &job.id.to_string()[..8],
                    job.kind,
                    job.state,
                    format!("{}/{}", job.attempts, job.max_attempts),
                    job.created_at.format("%Y-%m-%d %H:%M")
                );
            }
            println!("\n{} job(s)", jobs.len());
        }
        JobAction::Show { id } => {
            let id = resolve_job_id(app, &id).await?;
            print_job(&app.db.get(id).await?)?;
        }
        JobAction::Wait { id, timeout_secs } => {
            let id = resolve_job_id(app, &id).await?;
            let job = app
                .dispatcher
                .wait_for_terminal(id, Duration::from_secs(timeout_secs))
                .await?;
            print_job(&job)?;
        }
    }
    Ok(())
}

async fn cmd_allocate(app: &App, wait: bool, timeout_secs: u64) -> anyhow::Result<()> {
    let id = app.dispatcher.request_allocation("manual").await?;
    println!("Enqueued allocation run: {id}");
    if wait {
        let job = app
            .dispatcher
            .wait_for_terminal(id, Duration::from_secs(timeout_secs))
            .await?;
        print_job(&job)?;
    }
    Ok(())
}

async fn cmd_agency(app: &App, action: AgencyAction, actor: &str) -> anyhow::Result<()> {
    let admin = app.admin();
    match action {
        AgencyAction::Add {
            name,
            region,
            capacity,
            id,
        } => {
            let mut new = NewAgency::new(name, region);
            if let Some(id) = id {
                new = new.id(id);
            }
            if let Some(capacity) = capacity {
                new = new.capacity(capacity);
            }
            let agency = admin.onboard_agency(new, actor).await?;
            println!("Created: {} (capacity {})", agency.id, agency.capacity);
        }
        AgencyAction::Update {
            id,
            name,
            region,
            capacity,
            status,
        } => {
            let update = AgencyUpdate {
                name,
                region,
                capacity,
                status: status.map(|s| s.parse::<AgencyStatus>()).transpose()?,
            };
            let agency = admin.update_agency(&AgencyId::from(id), update, actor).await?;
            println!(
                "Updated: {} ({}, capacity {}, {})",
                agency.id, agency.name, agency.capacity, agency.status
            );
        }
        AgencyAction::Remove { id } => {
            let agency = admin.remove_agency(&AgencyId::from(id), actor).await?;
            println!("Removed: {}", agency.id);
        }
        AgencyAction::Perf {
            id,
            month,
            recovery,
            sla,
        } => {
            let month: Month = month.parse()?;
            let record = admin
                .record_performance(&AgencyId::from(id), month, recovery, sla, actor)
                .await?;
            println!(
                "Recorded {} {}: recovery {}, SLA {}, DSO {:.1}",
                record.agency_id, record.month, record.recovery_rate, record.sla_adherence,
                record.avg_dso
            );
        }
        AgencyAction::Import { file } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let entries: Vec<ImportedAgency> = serde_json::from_str(&text)
                .with_context(|| format!("parsing {}", file.display()))?;
            let agencies = admin.import_agencies(entries, Month::current(), actor).await?;
            for agency in &agencies {
                println!("Imported: {} ({}, capacity {})", agency.id, agency.name, agency.capacity);
            }
        }
        AgencyAction::Recompute { id } => {
            let agency = admin.recompute_capacity(&AgencyId::from(id), actor).await?;
            println!("Capacity of {} is now {}", agency.id, agency.capacity);
        }
        AgencyAction::ResetHistory { id } => {
            let removed = admin.reset_history(&AgencyId::from(id), actor).await?;
            println!("Deleted {removed} performance record(s)");
        }
        AgencyAction::List { all } => {
            let overview = admin.agency_overview(all).await?;
            if overview.is_empty() {
                println!("No agencies found.");
                return Ok(());
            }
            println!(
                "{:<24}  {:<24}  {:<6}  {:<9}  {:<6}  {:<9}  STATUS",
                "ID", "NAME", "REGION", "LOAD/CAP", "SCORE", "RECOVERY"
            );
            println!("{}", "-".repeat(100));
            for row in &overview {
                println!(
                    "{:<24}  {:<24}  {:<6}  {:<9}  {:<6.1}  {:<9}  {}{}",
                    row.agency.id,
                    row.agency.name,
                    row.agency.region,
                    format!("{}/{}", row.committed_load, row.agency.capacity),
                    row.summary.current_score,
                    row.summary
                        .trailing_recovery_rate
                        .map_or("-".to_string(), |r| format!("{r:.1}")),
                    row.agency.status,
                    if row.agency.deleted_at.is_some() { " (deleted)" } else { "" }
                );
            }
        }
        AgencyAction::Show { id } => {
            let detail = admin.agency_detail(&AgencyId::from(id)).await?;
            println!("{}", serde_json::to_string_pretty(&detail)?);
        }
    }
    Ok(())
}

async fn cmd_case(app: &App, action: CaseAction, actor: &str) -> anyhow::Result<()> {
    let admin = app.admin();
    match action {
        CaseAction::Add {
            invoice_number,
            amount,
            customer,
            priority,
            urgency,
        } => {
            let case = admin
                .add_case(NewInvoice {
                    invoice_number,
                    amount,
                    customer_name: customer,
                    priority: Priority::parse_lenient(&priority),
                    urgency_score: urgency,
                })
                .await?;
            println!("Created case {} ({})", case.id, case.status);
        }
        CaseAction::List { status, limit } => {
            let status: Option<CaseStatus> = status.map(|s| s.parse()).transpose()?;
            for case in app.db.list_cases(status, limit).await? {
                println!(
                    "{}  {:<14}  {:<7}  {:>5.1}  {:<8}  {}",
                    case.id,
                    case.invoice.as_ref().map_or("-", |i| i.invoice_number.as_str()),
                    case.priority,
                    case.urgency_score,
                    case.status,
                    case.assigned_agency.as_ref().map_or("-", AgencyId::as_str)
                );
            }
        }
        CaseAction::Reassign { id } => {
            let case = admin.reassign_case(parse_case_id(&id)?, actor).await?;
            println!("Case {} is {}", case.id, case.status);
        }
        CaseAction::Close { id } => {
            let case = admin.close_case(parse_case_id(&id)?, actor).await?;
            println!("Case {} is {}", case.id, case.status);
        }
    }
    Ok(())
}

fn parse_case_id(raw: &str) -> anyhow::Result<CaseId> {
    Ok(CaseId(uuid::Uuid::parse_str(raw).with_context(|| format!("invalid case id: {raw}"))?))
}

/// Full UUID, or a unique prefix among recent jobs.
async fn resolve_job_id(app: &App, raw: &str) -> anyhow::Result<JobId> {
    if raw.len() >= 36 {
        return Ok(JobId(uuid::Uuid::parse_str(raw)?));
    }
    let jobs = app.db.list(None, None, 200).await?;
    let matches: Vec<_> = jobs
        .iter()
        .filter(|job| job.id.to_string().starts_with(raw))
        .collect();
    match matches.len() {
        0 => anyhow::bail!("no job matching prefix '{raw}'"),
        1 => Ok(matches[0].id),
        n => anyhow::bail!("{n} jobs match prefix '{raw}', be more specific"),
    }
}

fn print_job(job: &caseflow::model::Job) -> anyhow::Result<()> {
    println!("ID:         {}", job.id);
    println!("Kind:       {}", job.kind);
    println!("State:      {}", job.state);
    println!("Payload:    {}", job.payload.join(" "));
    println!("Attempts:   {}/{}", job.attempts, job.max_attempts);
    println!("Worker:     {}", job.worker_id.as_deref().unwrap_or("-"));
    println!("Created:    {}", job.created_at);
    println!("Updated:    {}", job.updated_at);
    if let Some(finished) = job.finished_at {
        println!("Finished:   {finished}");
    }
    if let Some(ref error) = job.error {
        println!("Error:      {error}");
    }
    if let Some(ref result) = job.result {
        println!("Result:     {}", serde_json::to_string_pretty(result)?);
    }
    Ok(())
}
