use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use orgcron::config::{LogFormat, LoggingConfig, OrgcronConfig};
use orgcron::scheduler::{JobFilter, JobSpec, Params};

#[derive(Parser)]
#[command(
    name = "orgcron",
    about = "Multi-tenant cron scheduler for registered target functions",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (overrides ORGCRON_CONFIG and /etc/orgcron/orgcron.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database path
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + scheduler)
    Serve {
        /// Bind address
        #[arg(long)]
        bind: Option<String>,
    },

    /// Manage scheduled jobs
    Job {
        /// Tenant that owns the jobs
        #[arg(long)]
        tenant: String,

        /// Acting user recorded in audit fields
        #[arg(long, default_value = "cli")]
        user: String,

        #[command(subcommand)]
        action: JobAction,
    },
}

#[derive(Subcommand)]
enum JobAction {
    /// List jobs
    List {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Create or update a job keyed on (tenant, key)
    Upsert {
        #[arg(long)]
        key: String,

        #[arg(long)]
        name: String,

        #[arg(long)]
        description: Option<String>,

        /// Cron expression (5-field, or 6-field with seconds)
        #[arg(long)]
        cron: String,

        /// IANA timezone
        #[arg(long, default_value = "UTC")]
        timezone: String,

        /// Target function name
        #[arg(long)]
        target: String,

        /// Parameter bag as a JSON object
        #[arg(long, default_value = "{}")]
        params: String,

        /// Execution timeout in seconds
        #[arg(long, default_value = "60")]
        timeout: i64,

        /// Consecutive failures before auto-disable
        #[arg(long, default_value = "3")]
        max_failures: i64,

        /// Create the job disabled
        #[arg(long)]
        disabled: bool,
    },

    /// Enable a job (clears an auto-disable)
    Enable {
        #[arg(long)]
        id: Uuid,
    },

    /// Disable a job
    Disable {
        #[arg(long)]
        id: Uuid,
    },

    /// Delete a job
    Remove {
        #[arg(long)]
        id: Uuid,
    },

    /// Run a job now
    Run {
        #[arg(long)]
        id: Uuid,
    },

    /// Show recent executions, newest first
    History {
        #[arg(long)]
        id: Uuid,

        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Preview fire times for the next N hours
    DryRun {
        #[arg(long)]
        id: Uuid,

        /// Hours to preview
        #[arg(long, default_value = "24")]
        hours: u64,
    },
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    match logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = OrgcronConfig::resolve(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.storage.database_path = db;
    }
    init_tracing(&config.logging);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.api.bind = bind;
            }
            tracing::info!(bind = %config.api.bind, "Starting orgcron daemon");
            orgcron::serve(config).await?;
        }
        Commands::Job { tenant, user, action } => {
            let targets = orgcron::scheduler::builtin::registry()?;
            let service = orgcron::open_service(&config, targets)?;
            run_job_action(&service, &tenant, &user, action).await?;
        }
    }

    Ok(())
}

async fn run_job_action(
    service: &orgcron::scheduler::JobService,
    tenant: &str,
    user: &str,
    action: JobAction,
) -> Result<()> {
    match action {
        JobAction::List { json } => {
            let jobs = service.list_jobs(tenant, user, &JobFilter::default()).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&jobs)?);
            } else if jobs.is_empty() {
                println!("No jobs found.");
            } else {
                println!(
                    "{:<36} | {:<20} | {:<15} | {:<8} | {:<7} | Next run",
                    "ID", "Key", "Cron", "Status", "Enabled"
                );
                println!("{:-<36}-|-{:-<20}-|-{:-<15}-|-{:-<8}-|-{:-<7}-|-{:-<20}", "", "", "", "", "", "");
                for j in jobs {
                    let next = j
                        .next_run_at
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "{:<36} | {:<20} | {:<15} | {:<8} | {:<7} | {}",
                        j.id.to_string(), j.job_key, j.cron_expr, j.status, j.enabled, next
                    );
                }
            }
        }
        JobAction::Upsert {
            key,
            name,
            description,
            cron,
            timezone,
            target,
            params,
            timeout,
            max_failures,
            disabled,
        } => {
            let params: Params =
                serde_json::from_str(&params).context("--params must be a JSON object")?;
            let spec = JobSpec {
                name,
                description,
                cron_expr: cron,
                timezone,
                enabled: !disabled,
                target,
                params,
                timeout_seconds: timeout,
                max_consecutive_failures: max_failures,
            };
            let job = service.create_or_update(tenant, &key, user, spec).await?;
            println!("Job '{}' saved ({}).", job.job_key, job.id);
        }
        JobAction::Enable { id } => {
            let job = service.set_enabled(tenant, user, id, true).await?;
            println!("Job '{}' enabled.", job.job_key);
        }
        JobAction::Disable { id } => {
            let job = service.set_enabled(tenant, user, id, false).await?;
            println!("Job '{}' disabled.", job.job_key);
        }
        JobAction::Remove { id } => {
            service.delete_job(tenant, user, id).await?;
            println!("Job {} removed.", id);
        }
        JobAction::Run { id } => {
            let record = service.run_now(tenant, user, id, CancellationToken::new()).await?;
            println!("Outcome:  {}", record.outcome.as_str());
            println!("Duration: {} ms", record.duration_ms);
            if let Some(output) = &record.output {
                println!("Output:   {}", output);
            }
            if let Some(err) = &record.error_message {
                println!("Error:    {}", err);
            }
        }
        JobAction::History { id, limit } => {
            let records = service.history(tenant, user, id, limit).await?;
            if records.is_empty() {
                println!("No executions recorded.");
            } else {
                println!("{:<32} | {:<9} | {:<8} | {:>9} | Error", "Started", "Trigger", "Outcome", "Duration");
                println!("{:-<32}-|-{:-<9}-|-{:-<8}-|-{:-<9}-|-{:-<20}", "", "", "", "", "");
                for r in records {
                    println!(
                        "{:<32} | {:<9} | {:<8} | {:>7}ms | {}",
                        r.started_at.to_rfc3339(),
                        r.trigger_type,
                        r.outcome.as_str(),
                        r.duration_ms,
                        r.error_message.unwrap_or_default()
                    );
                }
            }
        }
        JobAction::DryRun { id, hours } => {
            let times = service.preview(tenant, user, id, hours).await?;
            if times.is_empty() {
                println!("No runs scheduled in next {} hours.", hours);
            } else {
                println!("Upcoming runs (next {} hours):", hours);
                for t in times {
                    println!("{}", t.to_rfc3339());
                }
            }
        }
    }
    Ok(())
}
