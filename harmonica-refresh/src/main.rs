use anyhow::{Context, anyhow};
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use harmonica_refresh::{
    config::RefreshConfig,
    refresh::{
        EditSource, PollMode, PollOptions, SummaryCoordinator, SummaryPoller, SummaryScope,
        UpdateOutcome,
    },
    storage::{NoopInvalidator, SummaryStore, sqlite_store::SqliteStore},
    summarizer::CommandSummarizer,
};
use serde::Serialize;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

/// A CLI tool to track and refresh Harmonica session summaries.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Base directory containing the .harmonica.db database file
    #[arg(short, long, default_value = ".")]
    base_dir: PathBuf,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialize the summary database
    Init,
    /// Register a session
    AddSession {
        /// Session ID
        id: String,
    },
    /// Register a participant's user session within a session
    AddParticipant {
        /// User session ID
        user_session_id: String,
        /// Session the participant belongs to
        session_id: String,
    },
    /// Register a project spanning several sessions
    AddProject {
        /// Project ID
        id: String,
        /// Member session IDs
        #[arg(required = true)]
        session_ids: Vec<String>,
    },
    /// Record an edit on a session or project
    Edit {
        /// Session or project ID
        resource_id: String,
        /// Attribute the edit to a participant's user session
        #[arg(long)]
        participant: Option<String>,
    },
    /// Show watermarks, staleness and the stored summary
    Status {
        /// Session or project ID
        resource_id: String,
        /// Treat the resource as a project
        #[arg(long)]
        project: bool,
        /// Output format
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
    /// Regenerate the summary right away
    Refresh {
        /// Session or project ID
        resource_id: String,
        /// Treat the resource as a project
        #[arg(long)]
        project: bool,
        /// Sessions to summarize; defaults to the project's linked sessions
        #[arg(long = "session", requires = "project")]
        sessions: Vec<String>,
    },
    /// Poll a resource and print status changes until Ctrl-C
    Watch {
        /// Session or project ID
        resource_id: String,
        /// Treat the resource as a project
        #[arg(long)]
        project: bool,
        /// Regenerate as soon as an edit is seen instead of debouncing
        #[arg(long)]
        immediate: bool,
    },
}

#[derive(Debug, Clone, PartialEq)]
enum OutputFormat {
    Summary,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "summary" => Ok(OutputFormat::Summary),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!("Invalid format: {s}")),
        }
    }
}

#[derive(Serialize)]
struct StatusOutput {
    resource_id: String,
    kind: &'static str,
    last_edit: i64,
    last_summary_update: i64,
    stale: bool,
    summary: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => RefreshConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => RefreshConfig::default(),
    };

    let store = SqliteStore::open(&args.base_dir).await?;

    match args.command {
        Commands::Init => {
            println!("Initialized summary database at {}", args.base_dir.display());
            println!(
                "Database location: {}",
                args.base_dir.join(harmonica_refresh::storage::sqlite_store::DATABASE_FILE).display()
            );
            Ok(())
        }
        Commands::AddSession { id } => {
            store.create_session(&id).await?;
            println!("Added session {id}");
            Ok(())
        }
        Commands::AddParticipant {
            user_session_id,
            session_id,
        } => {
            store
                .create_user_session(&user_session_id, &session_id)
                .await?;
            println!("Added participant {user_session_id} to session {session_id}");
            Ok(())
        }
        Commands::AddProject { id, session_ids } => {
            store.create_project(&id, &session_ids).await?;
            println!("Added project {id} with {} sessions", session_ids.len());
            Ok(())
        }
        Commands::Edit {
            resource_id,
            participant,
        } => {
            let source = match participant {
                Some(user_session_id) => EditSource::Participant { user_session_id },
                None => EditSource::Host,
            };
            let store = Arc::new(store);
            let coordinator = SummaryCoordinator::new(
                config,
                store.clone(),
                Arc::new(NoopSummarizer),
                Arc::new(NoopInvalidator),
            );
            coordinator.register_edit(&resource_id, source).await;

            let is_project = !store.project_sessions(&resource_id).await?.is_empty();
            let version = store.get_summary_version(&resource_id, is_project).await?;
            println!(
                "Recorded edit on {resource_id} at {}",
                format_millis(version.last_edit)
            );
            Ok(())
        }
        Commands::Status {
            resource_id,
            project,
            format,
        } => {
            let version = store.get_summary_version(&resource_id, project).await?;
            let output = StatusOutput {
                summary: store.get_summary(&resource_id).await?,
                kind: if project { "project" } else { "session" },
                last_edit: version.last_edit,
                last_summary_update: version.last_summary_update,
                stale: version.is_stale(),
                resource_id,
            };

            match format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&output)?);
                }
                OutputFormat::Summary => {
                    println!("{} {}", output.kind, output.resource_id);
                    println!("  Last edit: {}", format_millis(output.last_edit));
                    println!(
                        "  Last summary update: {}",
                        format_millis(output.last_summary_update)
                    );
                    println!("  Stale: {}", output.stale);
                    match &output.summary {
                        Some(summary) => println!("  Summary: {summary}"),
                        None => println!("  Summary: (none)"),
                    }
                }
            }
            Ok(())
        }
        Commands::Refresh {
            resource_id,
            project,
            sessions,
        } => {
            let scope = project_scope(&store, &resource_id, project, sessions).await?;
            let coordinator = command_coordinator(config, store)?;

            match coordinator.try_update_now(&resource_id, scope).await? {
                UpdateOutcome::Completed => println!("Refreshed summary for {resource_id}"),
                UpdateOutcome::AlreadyRunning => {
                    println!("A refresh for {resource_id} is already running")
                }
            }
            Ok(())
        }
        Commands::Watch {
            resource_id,
            project,
            immediate,
        } => {
            let scope = project_scope(&store, &resource_id, project, Vec::new()).await?;
            let coordinator = command_coordinator(config, store)?;
            let mode = if immediate {
                PollMode::Immediate
            } else {
                PollMode::Debounced
            };
            let options = PollOptions::new(mode, scope, coordinator.config().poll_interval());

            let mut events = coordinator.tracker().status_events();
            let poller = SummaryPoller::spawn(coordinator.clone(), resource_id.clone(), options)?;
            println!("Watching {resource_id} ({mode:?}); press Ctrl-C to stop");

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = events.recv() => match event {
                        Ok(event) => println!("{} {} {}", event.at.to_rfc3339(), event.resource_id, event.status),
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!("Dropped {skipped} status events");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }

            poller.shutdown();
            Ok(())
        }
    }
}

/// Build the scope for a refresh, falling back to the project's linked sessions.
async fn project_scope(
    store: &SqliteStore,
    resource_id: &str,
    project: bool,
    sessions: Vec<String>,
) -> anyhow::Result<SummaryScope> {
    if !project {
        return Ok(SummaryScope::Session);
    }
    let session_ids = if sessions.is_empty() {
        store.project_sessions(resource_id).await?
    } else {
        sessions
    };
    Ok(SummaryScope::project(session_ids))
}

fn command_coordinator(config: RefreshConfig, store: SqliteStore) -> anyhow::Result<SummaryCoordinator> {
    let command = config
        .summarizer_command
        .clone()
        .ok_or_else(|| anyhow!("No summarizer_command configured; pass --config with one set"))?;
    let summarizer = CommandSummarizer::from_command_line(&command)?;
    Ok(SummaryCoordinator::new(
        config,
        Arc::new(store),
        Arc::new(summarizer),
        Arc::new(NoopInvalidator),
    ))
}

fn format_millis(millis: i64) -> String {
    if millis == 0 {
        return "never".to_string();
    }
    match Utc.timestamp_millis_opt(millis).single() {
        Some(at) => at.to_rfc3339(),
        None => millis.to_string(),
    }
}

/// Edits never regenerate, so the edit command needs no real summarizer.
struct NoopSummarizer;

#[async_trait::async_trait]
impl harmonica_refresh::summarizer::Summarizer for NoopSummarizer {
    async fn create_summary(&self, resource_id: &str) -> anyhow::Result<String> {
        Err(anyhow!("No summarizer available to summarize {resource_id}"))
    }

    async fn create_multi_session_summary(
        &self,
        _session_ids: &[String],
        project_id: &str,
    ) -> anyhow::Result<String> {
        Err(anyhow!("No summarizer available to summarize {project_id}"))
    }
}
