mod chat;
mod doctor;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use flowchat_core::config::AppConfig;
use flowchat_core::error::FlowError;
use flowchat_core::flow::FlowDocument;
use flowchat_core::traits::FlowSource;
use flowchat_core::types::SessionId;
use flowchat_engine::{FileFlowSource, FlowGraph, Severity};
use flowchat_telemetry::{HttpBackend, SqliteTelemetry};

#[derive(Parser)]
#[command(name = "flowchat", version, about = "Run conversation flows in the terminal")]
struct Cli {
    /// Path to config file (default: ./flowchat.toml, then ~/.flowchat/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat with a flow in the terminal
    Chat {
        /// Flow file or directory, or the http(s) root of a backend
        #[arg(long)]
        flow: Option<String>,
        /// Assistant id sessions are reported under
        #[arg(long)]
        assistant: Option<String>,
        /// Skip typing delays
        #[arg(long)]
        instant: bool,
    },
    /// Check a flow document for structural problems
    Check {
        /// Path to the flow JSON
        flow: PathBuf,
    },
    /// List recorded sessions (sqlite telemetry)
    Sessions {
        /// Only sessions of this assistant
        #[arg(long)]
        assistant: Option<String>,
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Print a session's transcript (sqlite telemetry)
    Transcript {
        /// Session id as shown by `sessions`
        session: String,
    },
    /// Show current configuration
    Config,
    /// Run configuration health checks
    Doctor,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("flowchat=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Handle completions and check before config loading
    match &cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(*shell, &mut cmd, "flowchat", &mut std::io::stdout());
            return Ok(());
        }
        Commands::Check { flow } => return run_check(flow),
        _ => {}
    }

    let (config, config_path) = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Chat {
            flow,
            assistant,
            instant,
        } => {
            chat::run_chat(
                &config,
                chat::ChatOptions {
                    flow,
                    assistant,
                    instant,
                },
            )
            .await
        }
        Commands::Sessions { assistant, limit } => run_sessions(&config, assistant.as_deref(), limit),
        Commands::Transcript { session } => run_transcript(&config, &session),
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Doctor => {
            println!("flowchat doctor\n");
            doctor::run_doctor(&config, config_path.as_deref()).await;
            Ok(())
        }
        Commands::Completions { .. } | Commands::Check { .. } => Ok(()),
    }
}

/// Load the config file, or defaults when none exists. An explicit path
/// must exist.
fn load_config(explicit: Option<&Path>) -> anyhow::Result<(AppConfig, Option<PathBuf>)> {
    let path = AppConfig::resolve_path(explicit);
    if path.exists() {
        info!(path = %path.display(), "Loading config");
        let config = AppConfig::load(&path)?;
        return Ok((config, Some(path)));
    }
    if explicit.is_some() {
        return Err(FlowError::ConfigNotFound(path.display().to_string()).into());
    }
    warn!("No config file found, using defaults");
    Ok((AppConfig::default(), None))
}

/// Load the flow for `assistant_id`: `--flow` if given, else `engine.flow`.
/// An http(s) value is a backend root serving `/api/assistants/{id}/flow`.
pub(crate) async fn load_flow(
    config: &AppConfig,
    assistant_id: &str,
    flow_arg: Option<&str>,
) -> anyhow::Result<FlowDocument> {
    let location = flow_arg
        .map(str::to_string)
        .or_else(|| config.engine.flow.clone())
        .context("No flow configured. Pass --flow or set engine.flow")?;

    let doc = if location.starts_with("http://") || location.starts_with("https://") {
        HttpBackend::new(location.as_str(), config.telemetry.api_key.clone())?
            .load_flow(assistant_id)
            .await?
    } else {
        FileFlowSource::new(&location).load_flow(assistant_id).await?
    };
    info!(
        location = %location,
        nodes = doc.nodes.len(),
        edges = doc.edges.len(),
        "Flow loaded"
    );
    Ok(doc)
}

fn run_check(path: &Path) -> anyhow::Result<()> {
    let graph = FlowGraph::new(FlowDocument::load(path)?);
    let issues = graph.check();

    println!(
        "{}: {} nodes, {} edges",
        path.display(),
        graph.nodes().len(),
        graph.edges().len()
    );
    let mut errors = 0;
    for issue in &issues {
        let icon = match issue.severity() {
            Severity::Error => {
                errors += 1;
                "[!!]"
            }
            Severity::Warning => "[--]",
        };
        println!("  {} {}", icon, issue);
    }
    println!();
    println!("  {} errors, {} warnings", errors, issues.len() - errors);

    if errors > 0 {
        anyhow::bail!("flow has {} error(s)", errors);
    }
    Ok(())
}

fn open_store(config: &AppConfig) -> anyhow::Result<SqliteTelemetry> {
    let db_path = config.db_path();
    if !db_path.exists() {
        anyhow::bail!(
            "No session database at {} (set telemetry.backend = \"sqlite\")",
            db_path.display()
        );
    }
    Ok(SqliteTelemetry::open(&db_path)?)
}

fn run_sessions(config: &AppConfig, assistant: Option<&str>, limit: usize) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let sessions = store.list_sessions(assistant, limit)?;
    if sessions.is_empty() {
        println!("No sessions recorded.");
        return Ok(());
    }
    for s in sessions {
        println!(
            "{}  {}  {:<9}  {:>3} msgs  node {}",
            s.session.id,
            s.session.started_at.format("%Y-%m-%d %H:%M:%S"),
            s.session.status.as_str(),
            s.message_count,
            s.session.current_node_id.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

fn run_transcript(config: &AppConfig, session: &str) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let session_id = SessionId::from_str(session);
    let summary = store
        .get_session(&session_id)?
        .with_context(|| format!("Unknown session {}", session))?;

    println!(
        "Session {} ({}, assistant {})",
        summary.session.id,
        summary.session.status.as_str(),
        summary.session.assistant_id
    );
    for message in store.load_messages(&session_id)? {
        println!(
            "[{}] {:<4} {}",
            message.timestamp.format("%H:%M:%S%.3f"),
            message.sender.as_str(),
            message.content
        );
    }
    let visits = store.load_node_visits(&session_id)?;
    if !visits.is_empty() {
        println!();
        for visit in visits {
            println!(
                "  -> {} ({}) after {} ms",
                visit.node_id, visit.node_kind, visit.time_spent_on_previous_node_ms
            );
        }
    }
    Ok(())
}
