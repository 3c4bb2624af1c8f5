use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use uuid::Uuid;

use apipulse::config::Config;
use apipulse::engine;
use apipulse::model::{Environment, Interface, Task, Trigger};
use apipulse::scheduler::Scheduler;
use apipulse::storage;

#[derive(Parser)]
#[command(
    name = "apipulse",
    about = "Self-hosted API test automation engine",
    version,
    long_about = None
)]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "apipulse.toml", global = true)]
    config: String,

    /// Database path override
    #[arg(long, global = true)]
    db: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + scheduler)
    Serve {
        /// Bind address override
        #[arg(long)]
        bind: Option<String>,
    },

    /// Execute one task immediately and wait for the verdict
    Run {
        /// Task id
        #[arg(long)]
        task: Uuid,

        /// Recorded as the triggering user on the result
        #[arg(long)]
        user: Option<String>,
    },

    /// Seed environments, interfaces, and tasks from a JSON bundle
    Import {
        /// Bundle file path
        file: String,
    },

    /// List stored results for a task
    Results {
        /// Task id
        #[arg(long)]
        task: Uuid,

        #[arg(long, default_value = "1")]
        page: u32,

        #[arg(long, default_value = "20")]
        per_page: u32,
    },

    /// Inspect the cron schedule registry
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },
}

#[derive(Subcommand)]
enum ScheduleAction {
    /// List registered schedules
    List,

    /// Preview what will run in the next N hours
    DryRun {
        /// Hours to preview
        #[arg(long, default_value = "24")]
        hours: u64,
    },
}

/// Seed bundle consumed by `apipulse import`.
#[derive(Debug, Default, Deserialize)]
struct ImportBundle {
    #[serde(default)]
    environments: Vec<Environment>,
    #[serde(default)]
    interfaces: Vec<Interface>,
    #[serde(default)]
    tasks: Vec<Task>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(&cli.config)?;
    if let Some(db) = &cli.db {
        config.db_path = db.clone();
    }

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.bind = bind;
            }
            tracing::info!(bind=%config.bind, "Starting apipulse daemon");
            apipulse::serve(config).await?;
        }
        Commands::Run { task, user } => {
            let pool = storage::open_pool(&config.db_path)?;
            let ctx = engine::EngineContext::new(pool, &config)?;
            let (task, environment) = engine::load_run_inputs(&ctx, task)?;

            let result_id = Uuid::new_v4();
            engine::orchestrator::run(
                ctx.clone(),
                task,
                environment,
                result_id,
                Trigger::Manual,
                user,
            )
            .await;

            let result = storage::get_result(&ctx.pool, result_id)?
                .context("run finished but result was not persisted")?;

            println!("\nResult {} -- {}", result.id, result.status);
            println!(
                "{:<4} | {:<30} | {:<8} | Detail",
                "#", "Interface", "Status"
            );
            println!("{:-<4}-|-{:-<30}-|-{:-<8}-|-{:-<40}", "", "", "", "");
            for case in &result.cases {
                let detail = case
                    .error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .or_else(|| case.assertion.as_ref().map(|a| a.message.clone()))
                    .unwrap_or_default();
                println!(
                    "{:<4} | {:<30} | {:<8} | {}",
                    case.order,
                    case.interface_name,
                    format!("{:?}", case.status).to_lowercase(),
                    detail
                );
            }
            println!(
                "\n{} total, {} passed, {} failed, {} errors\n",
                result.summary.total,
                result.summary.passed,
                result.summary.failed,
                result.summary.error
            );

            if result.summary.failed + result.summary.error > 0 {
                std::process::exit(1);
            }
        }
        Commands::Import { file } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("cannot read bundle {}", file))?;
            let bundle: ImportBundle =
                serde_json::from_str(&raw).with_context(|| format!("invalid bundle {}", file))?;

            let pool = storage::open_pool(&config.db_path)?;
            for env in &bundle.environments {
                storage::upsert_environment(&pool, env)?;
            }
            for interface in &bundle.interfaces {
                storage::upsert_interface(&pool, interface)?;
            }
            for task in &bundle.tasks {
                storage::upsert_task(&pool, task)?;
            }
            println!(
                "Imported {} environments, {} interfaces, {} tasks.",
                bundle.environments.len(),
                bundle.interfaces.len(),
                bundle.tasks.len()
            );
        }
        Commands::Results {
            task,
            page,
            per_page,
        } => {
            let pool = storage::open_pool(&config.db_path)?;
            let (results, total) = storage::list_results(&pool, task, page, per_page)?;
            if results.is_empty() {
                println!("No results found.");
            } else {
                println!(
                    "{:<36} | {:<8} | {:<6} | {:<6} | Started",
                    "Result", "Status", "Passed", "Failed"
                );
                println!("{:-<36}-|-{:-<8}-|-{:-<6}-|-{:-<6}-|-{:-<25}", "", "", "", "", "");
                for result in &results {
                    println!(
                        "{:<36} | {:<8} | {:<6} | {:<6} | {}",
                        result.id,
                        result.status.to_string(),
                        result.summary.passed,
                        result.summary.failed + result.summary.error,
                        result.started_at.to_rfc3339()
                    );
                }
                println!("({} of {} total)", results.len(), total);
            }
        }
        Commands::Schedule { action } => {
            let pool = storage::open_pool(&config.db_path)?;
            let ctx = engine::EngineContext::new(pool, &config)?;
            let scheduler = Scheduler::new(ctx, config.overlap_policy);
            scheduler.load_jobs().await?;

            match action {
                ScheduleAction::List => {
                    let entries = scheduler.snapshot().await;
                    if entries.is_empty() {
                        println!("No schedules registered.");
                    } else {
                        println!("{:<36} | {:<20} | {:<15} | Next run", "Task", "Name", "Cron");
                        println!("{:-<36}-|-{:-<20}-|-{:-<15}-|-{:-<25}", "", "", "", "");
                        for entry in entries {
                            println!(
                                "{:<36} | {:<20} | {:<15} | {}",
                                entry.task_id,
                                entry.name,
                                entry.cron,
                                entry.next_at.to_rfc3339()
                            );
                        }
                    }
                }
                ScheduleAction::DryRun { hours } => {
                    let preview = scheduler.preview_next_runs(hours).await;
                    if preview.is_empty() {
                        println!("No runs scheduled in next {} hours.", hours);
                    } else {
                        println!("Upcoming runs (next {} hours):", hours);
                        for (time, name) in preview {
                            println!("{} : {}", time.to_rfc3339(), name);
                        }
                    }
                }
            }
        }
    }

    Ok(())
}
