// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Stagehand main entry point - CLI over the orchestrator facade.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::Level;
use uuid::Uuid;

use stagehand::error::Result;
use stagehand::host::TmuxHost;
use stagehand::pipeline::StageSpec;
use stagehand::service::{Orchestrator, OrchestratorConfig};
use stagehand::telemetry::{init_telemetry, TelemetryConfig};
use stagehand::types::{AgentDefinition, StageType, TeamRoster};

/// Stagehand - pipeline orchestrator for autonomous coding agents.
#[derive(Parser)]
#[command(name = "stagehand")]
#[command(author, version, about = "Pipeline orchestrator for autonomous coding agents", long_about = None)]
struct Cli {
    /// Directory for persisted state
    #[arg(long, env = "STAGEHAND_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Repository whose pipelines get isolated worktrees
    #[arg(long, env = "STAGEHAND_REPO")]
    repo: Option<PathBuf>,

    /// Base branch for pipeline worktrees
    #[arg(long, default_value = "main")]
    base_branch: String,

    /// Show debug output
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestrator loops until interrupted
    Serve {
        /// YAML file with a list of agent definitions
        #[arg(short, long)]
        agents: Option<PathBuf>,
    },
    /// Pipeline queries and commands
    Pipeline {
        #[command(subcommand)]
        command: PipelineCommands,
    },
    /// Agent queries and commands
    Agent {
        #[command(subcommand)]
        command: AgentCommands,
    },
    /// Cron schedule helpers
    Cron {
        #[command(subcommand)]
        command: CronCommands,
    },
    /// Messaging between running agent sessions
    Msg {
        #[command(subcommand)]
        command: MsgCommands,
    },
}

#[derive(Subcommand)]
enum PipelineCommands {
    /// List all pipelines
    List,
    /// Show one pipeline with its stages and event log
    Show { id: Uuid },
    /// Create a pipeline and dispatch its first stage
    Create {
        /// The unit of work this pipeline realizes
        #[arg(long)]
        idea: String,
        /// Stage sequence, e.g. "implementer:impl,analyzer:review,merger:merge"
        #[arg(long)]
        stages: String,
    },
    /// Abort a pipeline, cancelling its active stage
    Abort {
        id: Uuid,
        #[arg(long, default_value = "operator abort")]
        reason: String,
    },
    /// Skip the stage owning a run and advance
    Skip {
        run_id: String,
        #[arg(long, default_value = "operator skip")]
        reason: String,
    },
    /// Re-dispatch the blocked stage of a pipeline
    Retry {
        id: Uuid,
        #[arg(long, default_value = "operator retry")]
        reason: String,
    },
    /// Destroy a finished pipeline's document and workspace
    Archive { id: Uuid },
}

#[derive(Subcommand)]
enum AgentCommands {
    /// Run an agent now
    Trigger {
        name: String,
        /// YAML file with a list of agent definitions
        #[arg(short, long)]
        agents: Option<PathBuf>,
    },
    /// Cancel all running instances of an agent
    Cancel { name: String },
    /// Relaunch a completed agent with a follow-up prompt
    Relaunch { name: String, follow_up: String },
    /// Show run history stats for an agent
    Stats { name: String },
    /// Currently running agents
    Running,
}

#[derive(Subcommand)]
enum CronCommands {
    /// Next occurrence times for an expression
    Next {
        expr: String,
        #[arg(short, long, default_value_t = 5)]
        count: usize,
        #[arg(short, long)]
        timezone: Option<String>,
    },
    /// Describe an expression in words
    Describe { expr: String },
}

#[derive(Subcommand)]
enum MsgCommands {
    /// Send to one agent session and confirm delivery
    Send { target: String, content: String },
    /// Broadcast to a team roster
    Team {
        /// Comma-separated member names
        #[arg(long)]
        members: String,
        content: String,
    },
    /// Broadcast to every active agent session
    All { content: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let telemetry = if cli.debug {
        TelemetryConfig::development()
    } else {
        TelemetryConfig::default().with_level(Level::WARN)
    };
    init_telemetry(&telemetry)?;

    let mut config = match &cli.data_dir {
        Some(dir) => OrchestratorConfig::at(dir.clone()),
        None => OrchestratorConfig::default(),
    };
    config.repo_root = cli.repo.clone();
    config.base_branch = cli.base_branch.clone();

    let orchestrator = Orchestrator::new(Arc::new(TmuxHost::new()), config);

    match cli.command {
        Commands::Serve { agents } => serve(orchestrator, agents).await,
        Commands::Pipeline { command } => pipeline_command(orchestrator, command).await,
        Commands::Agent { command } => agent_command(orchestrator, command).await,
        Commands::Cron { command } => cron_command(orchestrator, command),
        Commands::Msg { command } => msg_command(orchestrator, command).await,
    }
}

async fn serve(orchestrator: Orchestrator, agents: Option<PathBuf>) -> Result<()> {
    if let Some(path) = agents {
        for agent in load_agents(&path)? {
            orchestrator.register_agent(agent).await;
        }
    }
    orchestrator.start().await?;
    println!("{} orchestrator running, ctrl-c to stop", "stagehand".bold());
    tokio::signal::ctrl_c().await?;
    println!("shutting down");
    Ok(())
}

/// Collaborator shim: agent definitions normally arrive from the
/// dashboard's configuration layer.
fn load_agents(path: &PathBuf) -> Result<Vec<AgentDefinition>> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&raw)?)
}

async fn pipeline_command(orchestrator: Orchestrator, command: PipelineCommands) -> Result<()> {
    orchestrator.pipelines().load_existing().await?;
    match command {
        PipelineCommands::List => {
            for pipeline in orchestrator.list_pipelines().await {
                println!(
                    "{}  {}  {}  {} stages",
                    pipeline.id,
                    pipeline.idea_id.bold(),
                    status_colored(&pipeline.status.to_string()),
                    pipeline.stages.len()
                );
            }
        }
        PipelineCommands::Show { id } => {
            let Some(pipeline) = orchestrator.get_pipeline(id).await else {
                println!("{} pipeline {} not found", "error:".red(), id);
                return Ok(());
            };
            println!(
                "{} ({})  {}",
                pipeline.idea_id.bold(),
                pipeline.id,
                status_colored(&pipeline.status.to_string())
            );
            for stage in &pipeline.stages {
                println!(
                    "  {:<12} {:<10} {}  attempt {}",
                    stage.stage_type.to_string(),
                    stage.agent_name,
                    format!("{:?}", stage.status).to_lowercase(),
                    stage.attempt
                );
            }
            for event in &pipeline.events {
                println!(
                    "  {} {:<18} {}",
                    event.timestamp.format("%H:%M:%S"),
                    event.event_type,
                    event.description
                );
            }
        }
        PipelineCommands::Create { idea, stages } => {
            let specs = parse_stage_specs(&stages)?;
            let pipeline = orchestrator.create_pipeline(idea, specs).await?;
            println!("created pipeline {}", pipeline.id.to_string().bold());
        }
        PipelineCommands::Abort { id, reason } => {
            orchestrator.abort_pipeline(id, &reason).await?;
            println!("aborted {}", id);
        }
        PipelineCommands::Skip { run_id, reason } => {
            orchestrator.skip_stage(&run_id, &reason).await?;
            println!("skipped stage owning {}", run_id);
        }
        PipelineCommands::Retry { id, reason } => {
            orchestrator.retry_stage(id, &reason).await?;
            println!("retrying blocked stage of {}", id);
        }
        PipelineCommands::Archive { id } => {
            orchestrator.archive_pipeline(id).await?;
            println!("archived {}", id);
        }
    }
    Ok(())
}

async fn agent_command(orchestrator: Orchestrator, command: AgentCommands) -> Result<()> {
    match command {
        AgentCommands::Trigger { name, agents } => {
            if let Some(path) = agents {
                for agent in load_agents(&path)? {
                    orchestrator.register_agent(agent).await;
                }
            } else {
                orchestrator
                    .register_agent(AgentDefinition::new(&name))
                    .await;
            }
            let submission = orchestrator.trigger_agent(&name).await?;
            match submission.run_id {
                Some(run_id) => println!("started {} as {}", name.bold(), run_id),
                None => println!("{} not started ({:?})", name, submission.action),
            }
        }
        AgentCommands::Cancel { name } => {
            let cancelled = orchestrator.cancel_agent(&name).await?;
            println!("cancelled {} run(s) of {}", cancelled, name.bold());
        }
        AgentCommands::Relaunch { name, follow_up } => {
            orchestrator
                .register_agent(AgentDefinition::new(&name))
                .await;
            let submission = orchestrator.relaunch_agent(&name, &follow_up).await?;
            match submission.run_id {
                Some(run_id) => println!("relaunched {} as {}", name.bold(), run_id),
                None => println!("{} not relaunched ({:?})", name, submission.action),
            }
        }
        AgentCommands::Stats { name } => {
            let stats = orchestrator.agent_stats(&name)?;
            println!("{}", name.bold());
            println!("  runs:      {}", stats.total_runs);
            println!("  succeeded: {}", stats.succeeded.to_string().green());
            println!("  failed:    {}", stats.failed.to_string().red());
            println!("  cancelled: {}", stats.cancelled);
            println!("  avg time:  {}ms", stats.avg_duration_ms);
            if let Some(at) = stats.last_run_at {
                println!("  last run:  {}", at.format("%Y-%m-%d %H:%M:%S UTC"));
            }
        }
        AgentCommands::Running => {
            for run in orchestrator.list_running().await {
                println!(
                    "{}  {}  {}  since {}",
                    run.agent.bold(),
                    run.run_id,
                    run.session,
                    run.started_at.format("%H:%M:%S")
                );
            }
        }
    }
    Ok(())
}

fn cron_command(orchestrator: Orchestrator, command: CronCommands) -> Result<()> {
    match command {
        CronCommands::Next {
            expr,
            count,
            timezone,
        } => {
            let times = orchestrator.cron_next(&expr, timezone.as_deref(), count)?;
            println!("{}:", orchestrator.cron_describe(&expr)?);
            for time in times {
                println!("  {}", time.format("%Y-%m-%d %H:%M UTC"));
            }
        }
        CronCommands::Describe { expr } => {
            println!("{}", orchestrator.cron_describe(&expr)?);
        }
    }
    Ok(())
}

async fn msg_command(orchestrator: Orchestrator, command: MsgCommands) -> Result<()> {
    match command {
        MsgCommands::Send { target, content } => {
            let delivery = orchestrator.send_message(&target, &content).await?;
            println!(
                "delivered {} to {}",
                delivery.message_id.bold(),
                delivery.session
            );
        }
        MsgCommands::Team { members, content } => {
            let team = TeamRoster {
                name: "cli".to_string(),
                members: members.split(',').map(str::trim).map(String::from).collect(),
            };
            let result = orchestrator.broadcast_team(&team, &content).await;
            print_broadcast(&result.successful, &result.failed);
        }
        MsgCommands::All { content } => {
            let result = orchestrator.broadcast_all(&content).await?;
            print_broadcast(&result.successful, &result.failed);
        }
    }
    Ok(())
}

fn print_broadcast(successful: &[String], failed: &[String]) {
    for session in successful {
        println!("{} {}", "ok".green(), session);
    }
    for target in failed {
        println!("{} {}", "failed".red(), target);
    }
}

fn status_colored(status: &str) -> String {
    match status {
        "completed" => status.green().to_string(),
        "blocked" => status.red().to_string(),
        "aborted" => status.yellow().to_string(),
        "in_progress" => status.cyan().to_string(),
        other => other.to_string(),
    }
}

/// Parse "implementer:impl-agent,analyzer:review-agent" into stage specs.
fn parse_stage_specs(raw: &str) -> Result<Vec<StageSpec>> {
    let mut specs = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (kind, agent) = part.split_once(':').ok_or_else(|| {
            anyhow::anyhow!("stage '{}' must look like <stage_type>:<agent>", part)
        })?;
        let stage_type = match kind.to_ascii_lowercase().as_str() {
            "implementer" => StageType::Implementer,
            "analyzer" => StageType::Analyzer,
            "qa" => StageType::Qa,
            "merger" => StageType::Merger,
            other => anyhow::bail!("unknown stage type '{}'", other),
        };
        specs.push(StageSpec::new(stage_type, agent));
    }
    if specs.is_empty() {
        anyhow::bail!("stage sequence must not be empty");
    }
    Ok(specs)
}
