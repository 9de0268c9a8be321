#![forbid(unsafe_code)]

//! **maestro-cli** – Command-line interface for Maestro.
//!
//! Provides a local end-to-end demo (`workflow run`) that analyzes a project
//! description, builds the agent pool, executes every phase, and prints the
//! report, plus `serve` for the HTTP surface and a quick `health` check.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use maestro_service::{
    CreateWorkflowRequest, ServiceConfig, WorkflowOptions, WorkflowService,
};

//─────────────────────────────
//  CLI structure
//─────────────────────────────

#[derive(Parser)]
#[command(name = "maestro")]
#[command(about = "Maestro - agent pool orchestration runtime")]
#[command(version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Workflow operations
    Workflow {
        #[command(subcommand)]
        command: WorkflowCommands,
    },
    /// Serve the HTTP surface
    Serve,
    /// Print the local health summary
    Health,
}

#[derive(Subcommand)]
enum WorkflowCommands {
    /// Analyze a description, build the pool, and execute end to end
    Run {
        /// Project description
        description: String,
        /// Keep executing after a step failure
        #[arg(long)]
        continue_on_failure: bool,
        /// Apply evolution mutations at phase boundaries
        #[arg(long)]
        auto_apply_evolution: bool,
    },
}

//─────────────────────────────
//  Main application
//─────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let config = ServiceConfig::from_env();

    match cli.command {
        Commands::Workflow { command } => match command {
            WorkflowCommands::Run {
                description,
                continue_on_failure,
                auto_apply_evolution,
            } => run_workflow(&config, description, continue_on_failure, auto_apply_evolution).await,
        },
        Commands::Serve => maestro_service::http::serve(config).await,
        Commands::Health => {
            let service = WorkflowService::from_config(&config);
            let health = service.health().await;
            println!("{}", serde_json::to_string_pretty(&health)?);
            Ok(())
        }
    }
}

async fn run_workflow(
    config: &ServiceConfig,
    description: String,
    continue_on_failure: bool,
    auto_apply_evolution: bool,
) -> Result<()> {
    let service = WorkflowService::from_config(config);
    if config.llm_api_key.is_none() {
        info!("LLM_API_KEY not set; running with the canned client");
    }

    let created = service
        .create_workflow(CreateWorkflowRequest {
            user_input: description,
            session_id: format!("cli-{}", uuid::Uuid::new_v4()),
            user_id: "cli".to_string(),
            options: Some(WorkflowOptions {
                continue_on_failure,
                auto_apply_evolution,
            }),
        })
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;

    println!(
        "created workflow {} ({:?}) with {} steps, estimated {} min",
        created.workflow_id,
        created.project_type,
        created.steps.len(),
        created.estimated_minutes,
    );
    for step in &created.steps {
        println!("  [{}] agent {}", step.phase, step.agent_id);
    }

    let report = service
        .execute_workflow(created.workflow_id)
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;

    println!(
        "workflow finished: {:?} ({} of {} steps completed)",
        report.status,
        report.steps_completed,
        report.results.len(),
    );
    for result in &report.results {
        match &result.error {
            Some(error) => println!("  [{}] {:?}: {error}", result.phase, result.status),
            None => println!("  [{}] {:?}", result.phase, result.status),
        }
    }

    let status = service
        .get_workflow_status(created.workflow_id)
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    println!("progress {} ({:.0}%)", status.progress, status.percentage);

    Ok(())
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
