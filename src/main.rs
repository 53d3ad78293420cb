mod config;
mod flows;
mod obs;
mod queue;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use tracing_subscriber::EnvFilter;

use crate::flows::linter::Linter;
use crate::flows::render::RenderFormat;
use crate::flows::runner::{FlowRunner, RunOptions};
use crate::flows::{DEFAULT_REGISTRY_PATH, FlowRegistry};
use crate::obs::assert_gate::{self, AssertOptions};
use crate::queue::broker::Broker;
use crate::queue::kv::KvStore;
use crate::queue::task::StepTask;
use crate::queue::worker::{SimulatedBody, Worker};

#[derive(Parser)]
#[command(name = "arx", about = "Persona-routed flow orchestration control plane")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Lint, run, render, and list flow definitions
    Flow {
        #[command(subcommand)]
        command: FlowCommands,
    },
    /// Start a queue worker (embeds the metrics exporter)
    Worker {
        /// Queue to consume (default: ARX_WORKER_QUEUE or q.coder)
        #[arg(long)]
        queue: Option<String>,
        /// Concurrent worker loops, one in-flight task each
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Metrics exporter and CI assertions
    Metrics {
        #[command(subcommand)]
        command: MetricsCommands,
    },
    /// Enqueue a synthetic dry-run load against the persona queues
    Enqueue {
        #[arg(long, default_value_t = 30)]
        coder: usize,
        #[arg(long, default_value_t = 10)]
        auditor: usize,
        #[arg(long, default_value = "flow_demo")]
        flow: String,
        #[arg(long, default_value = "feature/queue-demo")]
        branch: String,
    },
}

#[derive(Subcommand)]
enum FlowCommands {
    /// Validate a flow definition
    Lint {
        /// Flow ID to validate
        #[arg(long)]
        flow: String,
        #[arg(long, default_value = DEFAULT_REGISTRY_PATH)]
        registry: PathBuf,
    },
    /// Execute a flow
    Run {
        /// Flow ID to execute
        #[arg(long)]
        flow: String,
        /// Task ID for execution tracking
        #[arg(long)]
        task_id: Option<String>,
        #[arg(long, default_value = DEFAULT_REGISTRY_PATH)]
        registry: PathBuf,
        /// Execute in dry-run mode (the default; kept for symmetry)
        #[arg(long)]
        dry_run: bool,
        /// Execute in live mode (requires AR_ENABLE_FLOW_ENGINE=1 and ALLOW_WRITES=1)
        #[arg(long)]
        live: bool,
        /// Parameter in key=value form, repeatable
        #[arg(long = "param")]
        params: Vec<String>,
        /// Write the run summary as JSON to this path
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Render a flow as a diagram
    Render {
        #[arg(long)]
        flow: String,
        #[arg(long, default_value = DEFAULT_REGISTRY_PATH)]
        registry: PathBuf,
        #[arg(long, value_enum, default_value = "mmd")]
        format: RenderFormat,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// List available flows
    List {
        #[arg(long, default_value = DEFAULT_REGISTRY_PATH)]
        registry: PathBuf,
    },
}

#[derive(Subcommand)]
enum MetricsCommands {
    /// Serve the /metrics endpoint
    Serve {
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        addr: Option<String>,
    },
    /// Scrape /metrics and enforce the CI gate
    Assert {
        #[arg(long, default_value = "http://127.0.0.1:9108/metrics")]
        url: String,
        #[arg(long = "p95-ms", default_value_t = 1200.0)]
        p95_ms: f64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("arxflow=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Flow { command } => match command {
            FlowCommands::Lint { flow, registry } => cmd_lint(&flow, &registry),
            FlowCommands::Run {
                flow,
                task_id,
                registry,
                dry_run: _,
                live,
                params,
                out,
            } => cmd_run(&flow, task_id, &registry, live, &params, out.as_deref()).await,
            FlowCommands::Render {
                flow,
                registry,
                format,
                out,
            } => cmd_render(&flow, &registry, format, out.as_deref()),
            FlowCommands::List { registry } => cmd_list(&registry),
        },
        Commands::Worker { queue, concurrency } => cmd_worker(queue, concurrency).await,
        Commands::Metrics { command } => match command {
            MetricsCommands::Serve { port, addr } => cmd_metrics_serve(port, addr).await,
            MetricsCommands::Assert { url, p95_ms } => cmd_metrics_assert(url, p95_ms).await,
        },
        Commands::Enqueue {
            coder,
            auditor,
            flow,
            branch,
        } => cmd_enqueue(coder, auditor, &flow, &branch).await,
    }
}

fn cmd_lint(flow_id: &str, registry_path: &Path) -> Result<()> {
    println!("Linting flow: {flow_id}");
    println!("  registry: {}", registry_path.display());

    let results = Linter::lint_file(registry_path);
    let registry_result = &results["registry"];

    let Some(flow_result) = results.get(flow_id) else {
        if !registry_result.is_valid() {
            for finding in &registry_result.errors {
                println!("  • {}: {}", finding.code, finding.message);
            }
        } else {
            let available: Vec<&str> = results
                .keys()
                .filter(|k| k.as_str() != "registry")
                .map(String::as_str)
                .collect();
            println!("✗ flow '{flow_id}' not found in registry");
            println!("  available flows: {}", available.join(", "));
        }
        std::process::exit(1);
    };

    println!(
        "Registry validation: {}",
        if registry_result.is_valid() {
            "✓ PASS"
        } else {
            "✗ FAIL"
        }
    );
    println!(
        "Flow '{flow_id}' validation: {}",
        if flow_result.is_valid() {
            "✓ PASS"
        } else {
            "✗ FAIL"
        }
    );

    if !flow_result.errors.is_empty() {
        println!("\nErrors:");
        for finding in &flow_result.errors {
            println!("  • {}: {}", finding.code, finding.message);
        }
    }
    if !flow_result.warnings.is_empty() {
        println!("\nWarnings:");
        for finding in &flow_result.warnings {
            println!("  • {}: {}", finding.code, finding.message);
        }
    }

    if flow_result.is_valid() {
        println!("\nLint result: ✓ SUCCESS");
        Ok(())
    } else {
        println!("\nLint result: ✗ FAILED");
        std::process::exit(1);
    }
}

async fn cmd_run(
    flow_id: &str,
    task_id: Option<String>,
    registry_path: &Path,
    live: bool,
    params: &[String],
    out: Option<&Path>,
) -> Result<()> {
    let dry_run = !live;

    if live {
        if !config::flow_engine_enabled() {
            eprintln!("✗ flow engine disabled - set AR_ENABLE_FLOW_ENGINE=1 to enable");
            std::process::exit(1);
        }
        if std::env::var("ALLOW_WRITES").as_deref() != Ok("1") {
            eprintln!("✗ live execution blocked - set ALLOW_WRITES=1 to enable");
            std::process::exit(1);
        }
    }

    let registry = FlowRegistry::load(registry_path)?;
    let runner = FlowRunner::new(registry);
    let parameters = parse_params(params);

    println!("Executing flow: {flow_id}");
    println!("  task id: {}", task_id.as_deref().unwrap_or("auto"));
    println!("  dry-run: {dry_run}");
    if !parameters.is_empty() {
        println!("  parameters: {parameters:?}");
    }

    let outcome = match runner
        .execute(
            flow_id,
            RunOptions {
                parameters,
                dry_run,
                task_id,
            },
        )
        .await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            eprintln!("✗ flow execution failed: {e}");
            std::process::exit(1);
        }
    };

    let summary = &outcome.summary;
    println!("\nExecution summary:");
    println!("  flow: {}", summary.flow_id);
    println!("  success rate: {:.1}%", summary.success_rate * 100.0);
    println!("  duration: {:.1}s", summary.execution_time);
    println!(
        "  nodes: {}/{} successful",
        summary.successful_nodes, summary.total_nodes
    );

    if let Some(path) = out {
        let json = serde_json::to_string_pretty(summary)?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write summary: {}", path.display()))?;
        println!("  summary written to {}", path.display());
    }

    if summary.failed_nodes > 0 {
        println!("  failed: {} node(s)", summary.failed_nodes);
        for (node_id, result) in &outcome.results {
            if matches!(
                result.status,
                flows::NodeStatus::Failed | flows::NodeStatus::Timeout
            ) {
                println!(
                    "    • {node_id}: {} after {} attempt(s){}",
                    result.status.as_str(),
                    result.attempts,
                    result
                        .error_message
                        .as_deref()
                        .map(|m| format!(" - {m}"))
                        .unwrap_or_default()
                );
            }
        }
        println!("\n✗ execution completed with failures");
        std::process::exit(1);
    }

    println!("\n✓ execution completed successfully");
    Ok(())
}

fn cmd_render(
    flow_id: &str,
    registry_path: &Path,
    format: RenderFormat,
    out: Option<&Path>,
) -> Result<()> {
    let registry = FlowRegistry::load(registry_path)?;
    let Some(flow) = registry.flows.get(flow_id) else {
        eprintln!("✗ flow '{flow_id}' not found in registry");
        std::process::exit(1);
    };

    let output = flows::render::render(flow, flow_id, format)?;
    match out {
        Some(path) => {
            std::fs::write(path, output)
                .with_context(|| format!("failed to write diagram: {}", path.display()))?;
            println!("✓ rendered to {}", path.display());
        }
        None => println!("{output}"),
    }
    Ok(())
}

fn cmd_list(registry_path: &Path) -> Result<()> {
    let registry = FlowRegistry::load(registry_path)?;
    if registry.flows.is_empty() {
        println!("registry is empty");
        std::process::exit(1);
    }

    println!("Available flows ({}):", registry_path.display());
    for (flow_id, flow) in &registry.flows {
        println!("\n{flow_id}");
        println!("  name: {}", flow.name);
        if !flow.description.is_empty() {
            println!("  description: {}", flow.description);
        }
        println!(
            "  nodes: {}, edges: {}, guards: {}",
            flow.nodes.len(),
            flow.edges.len(),
            flow.guards.len()
        );
    }
    println!("\nTotal: {} flow(s)", registry.flows.len());
    Ok(())
}

async fn cmd_worker(queue: Option<String>, concurrency: Option<usize>) -> Result<()> {
    let config = config::Config::from_env();
    let queue = queue.unwrap_or(config.worker_queue);
    let concurrency = concurrency.unwrap_or(config.worker_concurrency).max(1);

    if !crate::queue::router::ALL_QUEUES.contains(&queue.as_str()) {
        tracing::warn!(queue = %queue, "queue is not one of the persona queues");
    }

    let broker = Broker::connect(&config.broker_url).await?;
    let kv = KvStore::connect(&config.kv_url).await?;

    let mut set = tokio::task::JoinSet::new();

    // Expose this worker's metrics for scraping.
    let metrics_port = config.metrics_port;
    let metrics_addr = config.metrics_addr.clone();
    set.spawn(async move {
        if let Err(e) = obs::exporter::serve(metrics_port, &metrics_addr).await {
            tracing::error!(error = %e, "metrics exporter stopped");
        }
    });

    tracing::info!(queue = %queue, concurrency, "starting workers");
    for _ in 0..concurrency {
        let worker = Worker::new(
            broker.clone(),
            kv.clone(),
            queue.clone(),
            Arc::new(SimulatedBody::default()),
        );
        set.spawn(async move {
            if let Err(e) = worker.run().await {
                tracing::error!(error = %e, "worker loop stopped");
            }
        });
    }

    while set.join_next().await.is_some() {}
    Ok(())
}

async fn cmd_metrics_serve(port: Option<u16>, addr: Option<String>) -> Result<()> {
    let config = config::Config::from_env();
    let port = port.unwrap_or(config.metrics_port);
    let addr = addr.unwrap_or(config.metrics_addr);
    obs::exporter::serve(port, &addr).await
}

async fn cmd_metrics_assert(url: String, p95_ms: f64) -> Result<()> {
    let opts = AssertOptions { url, p95_ms };
    if let Err(e) = assert_gate::run(&opts).await {
        eprintln!("✗ metrics assertion failed: {e}");
        std::process::exit(1);
    }
    Ok(())
}

async fn cmd_enqueue(coder: usize, auditor: usize, flow: &str, branch: &str) -> Result<()> {
    let config = config::Config::from_env();
    let broker = Broker::connect(&config.broker_url).await?;

    for (count, persona) in [(coder, "CODER_AI"), (auditor, "AUDITOR_AI")] {
        for i in 0..count {
            let mut task = StepTask::dry_run(
                flow,
                &format!("T-{}-{i:04}", &persona[..2]),
                &format!("step_{i:03}"),
                persona,
                branch,
            );
            task.model = "local-13b".to_string();
            task.payload
                .insert("i".to_string(), serde_json::json!(i));
            broker.enqueue(&task).await?;
        }
    }

    println!("✓ enqueued {coder}+{auditor} tasks for {flow}");
    Ok(())
}

/// Parse repeated `--param key=value` arguments.
fn parse_params(params: &[String]) -> HashMap<String, String> {
    let mut parsed = HashMap::new();
    for param in params {
        match param.split_once('=') {
            Some((key, value)) => {
                parsed.insert(key.to_string(), value.to_string());
            }
            None => {
                eprintln!("⚠ invalid parameter format: {param} (expected key=value)");
            }
        }
    }
    parsed
}
