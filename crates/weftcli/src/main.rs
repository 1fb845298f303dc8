// crates/weftcli/src/main.rs

mod logging;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;
use weftcore::{
    ExecutedVia, ExecutionEvent, ExecutionId, ExecutionStatus, StepType, Value, WorkflowDefinition, WorkflowStep,
};
use weftnodes::WorkflowLibrary;
use weftruntime::{DependencyGraph, Engine, EngineConfig, ExecutionSnapshot, StepDispatcher};

#[derive(Parser)]
#[command(name = "weft")]
#[command(about = "Weft workflow engine CLI", long_about = None)]
struct Cli {
    /// Engine configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Workflow definitions that sub-agent-spawn steps may start, by name
    #[arg(long = "subflow", global = true)]
    subflows: Vec<PathBuf>,

    /// Queue failed integration calls for a manual operator instead of failing
    #[arg(long, global = true)]
    self_heal: bool,

    /// Show debug logs
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow file until it completes, fails or pauses
    Run {
        /// Path to workflow JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Variables as a JSON object
        #[arg(short, long)]
        input: Option<String>,

        /// Persist execution state here so the run can be resumed later
        #[arg(long)]
        state_dir: Option<PathBuf>,
    },

    /// Supply missing values to a paused execution
    Resume {
        #[arg(long)]
        state_dir: PathBuf,

        #[arg(short, long)]
        execution: Uuid,

        /// Values as a JSON object
        #[arg(short, long)]
        input: String,
    },

    /// Show one execution, or list every execution in the state directory
    Status {
        #[arg(long)]
        state_dir: PathBuf,

        #[arg(short, long)]
        execution: Option<Uuid>,
    },

    /// Cancel a paused execution
    Cancel {
        #[arg(long)]
        state_dir: PathBuf,

        #[arg(short, long)]
        execution: Uuid,
    },

    /// Delete terminal executions past their retention period
    Purge {
        #[arg(long)]
        state_dir: PathBuf,

        /// Overrides `retention_secs` from the configuration
        #[arg(long)]
        older_than_secs: Option<u64>,
    },

    /// Validate a workflow file and report graph diagnostics
    Validate {
        /// Path to workflow JSON file
        file: PathBuf,
    },

    /// List registered step executors
    Steps,

    /// Create an example workflow
    Init {
        /// Output file path
        #[arg(short, long, default_value = "workflow.json")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose);

    match &cli.command {
        Commands::Run { file, input, state_dir } => {
            let engine = build_engine(&cli, state_dir.clone()).await?;
            run_workflow(&engine, file, input.as_deref()).await?;
        }
        Commands::Resume { state_dir, execution, input } => {
            let engine = build_engine(&cli, Some(state_dir.clone())).await?;
            resume_workflow(&engine, *execution, input).await?;
        }
        Commands::Status { state_dir, execution } => {
            let engine = build_engine(&cli, Some(state_dir.clone())).await?;
            show_status(&engine, *execution).await?;
        }
        Commands::Cancel { state_dir, execution } => {
            let engine = build_engine(&cli, Some(state_dir.clone())).await?;
            engine.cancel(*execution).await?;
            println!("🛑 Execution {} cancelled", execution);
        }
        Commands::Purge { state_dir, older_than_secs } => {
            let engine = build_engine(&cli, Some(state_dir.clone())).await?;
            let removed = match older_than_secs {
                Some(secs) => engine.purge(chrono_secs(*secs)?).await?,
                None => engine.purge_expired().await?,
            };
            println!("🧹 Removed {} execution(s)", removed.len());
            for execution_id in removed {
                println!("   {}", execution_id);
            }
        }
        Commands::Validate { file } => {
            validate_workflow(file)?;
        }
        Commands::Steps => {
            list_steps();
        }
        Commands::Init { output } => {
            create_example_workflow(output)?;
        }
    }

    Ok(())
}

async fn build_engine(cli: &Cli, state_dir: Option<PathBuf>) -> Result<Engine> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    if state_dir.is_some() {
        config.state_dir = state_dir;
    }

    let mut dispatcher = StepDispatcher::new();
    let library = weftnodes::register_all(&mut dispatcher);
    load_subflows(&library, &cli.subflows).await?;

    let mut builder = Engine::builder().config(config).dispatcher(dispatcher);
    if cli.self_heal {
        builder = builder.fallback(Arc::new(weftnodes::operator_fallback()));
    }
    Ok(builder.build().await?)
}

async fn load_subflows(library: &WorkflowLibrary, files: &[PathBuf]) -> Result<()> {
    for file in files {
        library.insert(load_definition(file)?).await;
    }
    Ok(())
}

fn load_definition(file: &Path) -> Result<WorkflowDefinition> {
    let json = std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    serde_json::from_str(&json).with_context(|| format!("parsing {}", file.display()))
}

fn parse_variables(input: Option<&str>) -> Result<HashMap<String, Value>> {
    let Some(input) = input else {
        return Ok(HashMap::new());
    };
    let json: serde_json::Value = serde_json::from_str(input).context("input is not valid JSON")?;
    match Value::from(json) {
        Value::Object(map) => Ok(map),
        _ => bail!("Input must be a JSON object"),
    }
}

fn chrono_secs(secs: u64) -> Result<chrono::Duration> {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .context("--older-than-secs is too large")
}

async fn run_workflow(engine: &Engine, file: &Path, input: Option<&str>) -> Result<()> {
    println!("🚀 Loading workflow from: {}", file.display());
    let definition = load_definition(file)?;
    let variables = parse_variables(input)?;

    println!("📋 Workflow: {}", definition.name);
    println!("   Steps: {}", definition.steps.len());
    println!();

    let printer = spawn_event_printer(engine.subscribe());
    let execution_id = engine.start(definition, variables).await?;
    let snapshot = engine.wait(execution_id).await?;
    let _ = tokio::time::timeout(Duration::from_secs(1), printer).await;

    print_summary(&snapshot, engine.config().state_dir.is_some());
    Ok(())
}

async fn resume_workflow(engine: &Engine, execution_id: ExecutionId, input: &str) -> Result<()> {
    let supplied = parse_variables(Some(input))?;
    let printer = spawn_event_printer(engine.subscribe());
    engine.resume(execution_id, supplied).await?;
    let snapshot = engine.wait(execution_id).await?;
    let _ = tokio::time::timeout(Duration::from_secs(1), printer).await;

    print_summary(&snapshot, true);
    Ok(())
}

/// Print events until the execution stops.
fn spawn_event_printer(mut events: broadcast::Receiver<ExecutionEvent>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ExecutionEvent::WorkflowStarted { execution_id, .. } => {
                    println!("▶️  Workflow started ({})", execution_id);
                }
                ExecutionEvent::WorkflowResumed { supplied, .. } => {
                    println!("▶️  Resumed with: {}", supplied.join(", "));
                }
                ExecutionEvent::StepStarted { step_id, step_type, .. } => {
                    println!("  ⚡ Starting step: {} ({})", step_id, step_type);
                }
                ExecutionEvent::StepCompleted {
                    step_id,
                    executed_via,
                    duration_ms,
                    ..
                } => match executed_via {
                    ExecutedVia::Primary => println!("  ✅ Step {} completed in {}ms", step_id, duration_ms),
                    other => println!("  ✅ Step {} completed via {} in {}ms", step_id, other, duration_ms),
                },
                ExecutionEvent::StepFailed {
                    step_id,
                    error,
                    will_retry,
                    ..
                } => {
                    let suffix = if will_retry { " (retrying)" } else { "" };
                    println!("  ❌ Step {} failed: {}{}", step_id, error, suffix);
                }
                ExecutionEvent::WorkflowPaused { missing, .. } => {
                    println!("⏸️  Paused, waiting for: {}", missing.join(", "));
                    break;
                }
                ExecutionEvent::WorkflowCompleted { duration_ms, .. } => {
                    println!("✨ Workflow completed successfully in {}ms", duration_ms);
                    break;
                }
                ExecutionEvent::WorkflowFailed { error, .. } => {
                    println!("💥 Workflow failed: {}", error);
                    break;
                }
                ExecutionEvent::WorkflowCancelled { .. } => {
                    println!("🛑 Workflow cancelled");
                    break;
                }
            }
        }
    })
}

fn print_summary(snapshot: &ExecutionSnapshot, persisted: bool) {
    println!();
    println!("📊 Execution Summary:");
    println!("   Execution ID: {}", snapshot.execution_id);
    println!("   Status: {}", snapshot.status);
    println!("   Completed steps: {}", snapshot.results.len());

    match snapshot.status {
        ExecutionStatus::Paused => {
            println!();
            println!("⏸️  Missing inputs:");
            for name in &snapshot.missing_parameters {
                println!("   {}", name);
            }
            if persisted {
                println!();
                println!("Resume it with:");
                println!(
                    "  weft resume --state-dir <DIR> --execution {} --input '{{\"{}\": ...}}'",
                    snapshot.execution_id,
                    snapshot.missing_parameters.iter().next().map(String::as_str).unwrap_or("name")
                );
            } else {
                println!("   (run with --state-dir to resume later)");
            }
        }
        ExecutionStatus::Failed => {
            println!();
            println!(
                "💥 {}: {}",
                snapshot.error_kind.as_deref().unwrap_or("error"),
                snapshot.error_message.as_deref().unwrap_or("")
            );
            for (step_id, failure) in &snapshot.failed_steps {
                println!("   {} ({}) after {} attempt(s): {}", step_id, failure.kind, failure.attempts, failure.message);
            }
        }
        _ => {}
    }

    if !snapshot.results.is_empty() {
        println!();
        println!("📤 Outputs:");
        for (step_id, result) in &snapshot.results {
            let json = serde_json::to_string(&result.output.to_json()).unwrap_or_default();
            println!("   {} [{}]: {}", step_id, result.executed_via, json);
        }
    }
}

async fn show_status(engine: &Engine, execution: Option<ExecutionId>) -> Result<()> {
    match execution {
        Some(execution_id) => {
            let snapshot = engine.get_state(execution_id).await?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        None => {
            let executions = engine.state().list().await?;
            if executions.is_empty() {
                println!("No executions found");
            }
            for execution_id in executions {
                match engine.get_state(execution_id).await {
                    Ok(snapshot) => println!("{}  {:<10} {} step(s)", execution_id, snapshot.status.to_string(), snapshot.results.len()),
                    Err(e) => println!("{}  unreadable: {}", execution_id, e),
                }
            }
        }
    }
    Ok(())
}

fn validate_workflow(file: &Path) -> Result<()> {
    println!("🔍 Validating workflow: {}", file.display());

    let definition = load_definition(file)?;
    definition.validate()?;

    let graph = DependencyGraph::build(&definition);
    println!("✅ Workflow is valid:");
    println!("   Name: {}", definition.name);
    println!("   Steps: {}", definition.steps.len());
    println!("   Entry steps: {}", join(graph.roots()));

    for dangling in graph.dangling() {
        println!(
            "⚠️  Step {} references {{{{{}}}}}, which is not a step; it must be supplied as a variable",
            dangling.step_id, dangling.reference
        );
    }

    let cycles = graph.cycles();
    for cycle in &cycles {
        println!("❌ Cycle: {}", cycle.join(" -> "));
    }
    if !cycles.is_empty() {
        bail!("workflow has {} dependency cycle(s) and would deadlock", cycles.len());
    }
    Ok(())
}

fn join(ids: Vec<&String>) -> String {
    ids.into_iter().map(String::as_str).collect::<Vec<_>>().join(", ")
}

fn list_steps() {
    println!("📦 Available Step Executors:");
    println!();

    let mut dispatcher = StepDispatcher::new();
    weftnodes::register_all(&mut dispatcher);

    for (label, info) in dispatcher.list() {
        println!("  • {} ({})", label, info.name);
        if !info.description.is_empty() {
            println!("    {}", info.description);
        }
        for param in &info.parameters {
            let marker = if param.required { "*" } else { " " };
            println!("      {}{}: {}", marker, param.name, param.description);
        }
    }
}

fn create_example_workflow(output: &Path) -> Result<()> {
    let mut definition = WorkflowDefinition::new("Example HTTP Workflow");
    definition.description = Some("Fetches a record, then asks for approval before logging it".to_string());

    definition.add_step(
        WorkflowStep::new("fetch", StepType::IntegrationCall)
            .with_service("http")
            .with_parameter("url", "{{url}}")
            .with_retry(3, 500),
    );
    definition.add_step(
        WorkflowStep::new("approve", StepType::HumanInput)
            .with_parameter("prompt", "Log this response?")
            .with_parameter("fields", Value::Array(vec![Value::from("approved")]))
            .with_parameter("approved", "{{approved}}"),
    );
    definition.add_step(
        WorkflowStep::new("log", StepType::SystemReasoning)
            .with_dependency("approve")
            .with_parameter("operation", "log")
            .with_parameter("message", "status {{fetch.status}}: {{fetch.body}}"),
    );

    let json = serde_json::to_string_pretty(&definition)?;
    std::fs::write(output, json)?;

    println!("✨ Created example workflow: {}", output.display());
    println!();
    println!("Run it with:");
    println!(
        "  weft run --file {} --state-dir .weft --input '{{\"url\": \"https://api.github.com/zen\"}}'",
        output.display()
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_must_be_an_object() {
        let vars = parse_variables(Some(r#"{"email": "ada@x.io", "count": 2}"#)).unwrap();
        assert_eq!(vars["email"], Value::from("ada@x.io"));
        assert_eq!(vars["count"], Value::Integer(2));
        assert!(parse_variables(Some("[1, 2]")).is_err());
        assert!(parse_variables(None).unwrap().is_empty());
    }

    #[test]
    fn cli_parses_resume() {
        let id = Uuid::new_v4();
        let cli = Cli::try_parse_from([
            "weft",
            "resume",
            "--state-dir",
            "/tmp/weft",
            "--execution",
            &id.to_string(),
            "--input",
            "{}",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Resume { execution, .. } if execution == id));
    }
}
