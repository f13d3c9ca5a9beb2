// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tasklane command line.
//!
//! Launches remote job template runs and inspects run history, counters and
//! equivalent requests.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Datelike;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{error, info, warn};

use tasklane_core::config::{Config, OrchestratorConfig};
use tasklane_core::persistence::{
    ListRunsFilter, Persistence, PostgresPersistence, SqlitePersistence,
};
use tasklane_core::remote::{AwxClient, AwxConfig};
use tasklane_core::run::RunStatus;
use tasklane_core::{Actor, BodySource, RunOrchestrator, RunRequest, SequenceAllocator};

/// tasklane - run remote automation job templates with tracked run ids
#[derive(Parser)]
#[command(name = "tasklane")]
#[command(version)]
#[command(about = "Launch remote job template runs and track them to completion")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Launch a job template and wait for the run to finish
    Run(RunArgs),

    /// Print the launch request a run would send, without sending it
    Preview(RunArgs),

    /// Show the id the next run for a caller would receive
    NextId(CallerArgs),

    /// Show per-pool counter statistics
    Stats {
        /// Calendar year (defaults to the current UTC year)
        #[arg(long)]
        year: Option<i32>,
    },

    /// Cancel a run
    Cancel {
        /// Internal run id
        run_id: String,
    },

    /// Show a run and its audit trail
    Show {
        /// Internal run id
        run_id: String,
    },

    /// List recent runs
    List {
        /// Only runs with this status
        #[arg(long)]
        status: Option<RunStatus>,

        /// Maximum rows
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

#[derive(Args, Clone, Default)]
struct CallerArgs {
    /// Caller group; the first one picks the id pool
    #[arg(long = "group")]
    groups: Vec<String>,

    /// Caller user id
    #[arg(long)]
    user: Option<String>,

    /// Caller email
    #[arg(long)]
    email: Option<String>,
}

impl CallerArgs {
    fn actor(&self) -> Actor {
        Actor {
            user_id: self.user.clone(),
            email: self.email.clone(),
            groups: self.groups.clone(),
        }
    }
}

#[derive(Args)]
struct RunArgs {
    /// Remote job template id
    template_id: String,

    /// Form parameter as key=value; JSON values are parsed, anything else is a string
    #[arg(long = "param", value_parser = parse_param)]
    params: Vec<(String, Value)>,

    /// JSON body sent verbatim
    #[arg(long, conflicts_with_all = ["template", "extra_vars"])]
    body: Option<PathBuf>,

    /// JSON body template with {{form.<field>}} placeholders
    #[arg(long, conflicts_with = "extra_vars")]
    template: Option<PathBuf>,

    /// YAML variable map sent as extra_vars
    #[arg(long)]
    extra_vars: Option<PathBuf>,

    /// Inventory id for extra_vars and minimal bodies
    #[arg(long)]
    inventory: Option<u64>,

    /// Use this unique id instead of allocating one
    #[arg(long)]
    reserved_id: Option<String>,

    /// Label recorded as the run's initiator
    #[arg(long)]
    executed_by: Option<String>,

    #[command(flatten)]
    caller: CallerArgs,
}

impl RunArgs {
    fn into_request(self) -> Result<RunRequest> {
        let body = if let Some(path) = &self.body {
            BodySource::Override(read(path)?)
        } else if let Some(path) = &self.template {
            BodySource::Template(read(path)?)
        } else if let Some(path) = &self.extra_vars {
            BodySource::LegacyVars {
                yaml: read(path)?,
                inventory: self.inventory,
            }
        } else {
            BodySource::Minimal {
                inventory: self.inventory,
            }
        };

        let mut request = RunRequest::new(self.template_id)
            .with_parameters(self.params.into_iter().collect::<Map<String, Value>>())
            .with_actor(self.caller.actor())
            .with_body(body);
        if let Some(id) = self.reserved_id {
            request = request.with_reserved_unique_id(id);
        }
        if let Some(label) = self.executed_by {
            request = request.with_executed_by(label);
        }
        Ok(request)
    }
}

fn parse_param(s: &str) -> Result<(String, Value), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", s))?;
    if key.is_empty() {
        return Err("parameter name must not be empty".to_string());
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn read(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn connect(config: &Config) -> Result<Arc<dyn Persistence>> {
    let url = config.database_url.as_str();
    let persistence: Arc<dyn Persistence> = if url.starts_with("sqlite:") {
        Arc::new(SqlitePersistence::connect(url).await?)
    } else if url.starts_with("postgres:") || url.starts_with("postgresql:") {
        Arc::new(PostgresPersistence::connect(url, 10).await?)
    } else {
        anyhow::bail!("unsupported database URL scheme, expected sqlite: or postgres:");
    };

    persistence.health_check_db().await?;
    info!("Database connection established");
    Ok(persistence)
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Warning: failed to load .env file: {}", e);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tasklane=info,tasklane_core=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;
    info!(
        remote_base_url = %config.remote_base_url,
        poll_interval = ?config.poll_interval,
        poll_timeout = ?config.poll_timeout,
        "Configuration loaded"
    );

    let persistence = connect(&config).await?;
    let allocator = Arc::new(SequenceAllocator::new(persistence.clone()));
    let client = Arc::new(AwxClient::new(AwxConfig {
        base_url: config.remote_base_url.clone(),
        token: config.remote_token.clone(),
        request_timeout: config.request_timeout,
    })?);
    let orchestrator = RunOrchestrator::new(
        persistence,
        allocator,
        client,
        OrchestratorConfig::from(&config),
    );

    match cli.command {
        Command::Run(args) => {
            let ticket = orchestrator.submit(args.into_request()?).await?;
            info!(run_id = %ticket.run_id, unique_id = %ticket.unique_id, "Run submitted");

            let run_id = ticket.run_id.clone();
            let wait = ticket.wait();
            tokio::pin!(wait);
            let record = tokio::select! {
                record = &mut wait => record?,
                _ = tokio::signal::ctrl_c() => {
                    warn!(run_id = %run_id, "Interrupted, stopping run");
                    orchestrator.shutdown().await;
                    wait.await?
                }
            };
            print_json(&record)?;
            if record.run_status() != Some(RunStatus::Success) {
                std::process::exit(1);
            }
        }
        Command::Preview(args) => {
            print_json(&orchestrator.preview_request(&args.into_request()?)?)?;
        }
        Command::NextId(caller) => {
            let id = orchestrator
                .next_id_preview(&caller.actor().pool_hint())
                .await?;
            println!("{}", id);
        }
        Command::Stats { year } => {
            let year = year.unwrap_or_else(|| chrono::Utc::now().year());
            print_json(&orchestrator.counter_stats(year).await?)?;
        }
        Command::Cancel { run_id } => {
            print_json(&orchestrator.cancel(&run_id).await?)?;
        }
        Command::Show { run_id } => {
            let run = orchestrator.get_run(&run_id).await?;
            let audit = orchestrator.audit_log(&run_id).await?;
            print_json(&serde_json::json!({ "run": run, "audit": audit }))?;
        }
        Command::List { status, limit } => {
            let filter = ListRunsFilter {
                status,
                limit,
                ..Default::default()
            };
            print_json(&orchestrator.list_runs(&filter).await?)?;
        }
    }

    Ok(())
}
