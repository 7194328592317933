use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cadre_core::config::AppConfig;
use cadre_core::event::EventBus;
use cadre_core::traits::Oracle;
use cadre_core::types::{GraphEvent, Message, RunStatus};

use cadre_graph::{
    build_topology, Graph, RetryingOracle, RunContext, RunOutcome, ScriptedOracle,
};

#[derive(Parser)]
#[command(name = "cadre", version, about = "Supervised multi-agent graph runner")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "cadre.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the configured graph on a prompt and print the final log
    Run {
        /// The initial user request
        #[arg(trailing_var_arg = true)]
        prompt: Vec<String>,
        /// Print the outcome as JSON
        #[arg(long)]
        json: bool,
        /// Override the top-level step budget
        #[arg(long)]
        max_steps: Option<usize>,
    },
    /// Build the configured graph and report its wiring
    Validate,
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cadre=info,warn")),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "cadre", &mut io::stdout());
        return Ok(());
    }

    let mut config = if cli.config.exists() {
        AppConfig::load(&cli.config)?
    } else {
        warn!(path = %cli.config.display(), "Config file not found, using defaults");
        AppConfig::default()
    };

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Validate => {
            let graph = build_graph(&config)?;
            print_wiring(&graph);
            println!("ok");
        }
        Commands::Run {
            prompt,
            json,
            max_steps,
        } => {
            if let Some(max_steps) = max_steps {
                config.engine.max_steps = max_steps;
                if let Some(graph) = config.graph.as_mut() {
                    if let Some(engine) = graph.engine.as_mut() {
                        engine.max_steps = max_steps;
                    }
                }
            }

            let mut text = prompt.join(" ");
            if text.is_empty() {
                // Read from stdin
                let stdin = io::stdin();
                text = stdin
                    .lock()
                    .lines()
                    .map_while(|l| l.ok())
                    .collect::<Vec<_>>()
                    .join("\n");
            }
            if text.trim().is_empty() {
                anyhow::bail!("no prompt given");
            }

            let graph = build_graph(&config)?;
            let event_bus = Arc::new(EventBus::new(config.engine.event_capacity));
            let outcome = run_once(&graph, &event_bus, &text, !json).await;

            if json {
                println!("{}", serde_json::to_string_pretty(&outcome_json(&outcome))?);
            } else {
                for message in outcome.log.iter() {
                    println!("{}", message.render());
                }
            }

            if !outcome.is_completed() {
                std::process::exit(1);
            }
        }
        Commands::Completions { .. } => unreachable!("handled before config load"),
    }

    Ok(())
}

fn build_graph(config: &AppConfig) -> anyhow::Result<Graph> {
    let topology = config
        .graph
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("no [graph] section in config"))?;

    let scripted: Arc<dyn Oracle> = Arc::new(ScriptedOracle::from_config(&config.oracle));
    let resilient = config.oracle.retry.is_some() || config.oracle.timeout_secs.is_some();
    let oracle: Arc<dyn Oracle> = if resilient {
        Arc::new(RetryingOracle::from_config(scripted, &config.oracle))
    } else {
        scripted
    };

    Ok(build_topology(topology, oracle, &config.engine)?)
}

fn print_wiring(graph: &Graph) {
    println!(
        "{} (entry: {}, max_steps: {})",
        graph.name(),
        graph.entry(),
        graph.config().max_steps
    );
    for name in graph.node_names() {
        println!("  - {}", name);
    }
}

async fn run_once(
    graph: &Graph,
    event_bus: &Arc<EventBus>,
    input: &str,
    live: bool,
) -> RunOutcome {
    let cancel = tokio_util::sync::CancellationToken::new();
    let cancel_clone = cancel.clone();

    // Stop at the next step boundary on Ctrl-C
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Cancelling run...");
        cancel_clone.cancel();
    });

    let mut rx = event_bus.subscribe();

    // Spawn event printer
    let print_handle = tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event printer fell behind");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            if !live {
                if matches!(event, GraphEvent::RunFinished { .. }) {
                    break;
                }
                continue;
            }
            match event {
                GraphEvent::NodeStarted { graph, node, step } => {
                    eprintln!("[{} #{}] {}", graph, step, node);
                }
                GraphEvent::Decision { node, decision } => {
                    let why = truncate(&decision.justification, 120);
                    eprintln!("  [{} -> {}] {}", node, decision.route, why);
                }
                GraphEvent::FallbackTaken {
                    node, detail, to, ..
                } => {
                    eprintln!("  [FALLBACK] {} -> {}: {}", node, to, truncate(&detail, 120));
                }
                GraphEvent::HandoffResolved {
                    from,
                    target,
                    escalated,
                    ..
                } => {
                    let via = if escalated { " (escalated)" } else { "" };
                    eprintln!("  [handoff] {} -> {}{}", from, target, via);
                }
                GraphEvent::TeamEntered { team } => {
                    eprintln!("  [team: {}]", team);
                }
                GraphEvent::TeamExited {
                    team,
                    status,
                    appended,
                } => {
                    eprintln!("  [team {}: {}, +{} messages]", team, status, appended);
                }
                GraphEvent::RunFinished { status, steps, .. } => {
                    eprintln!("\n[{}: {} steps]", status, steps);
                    break;
                }
                GraphEvent::RunStarted { .. } | GraphEvent::Routed { .. } => {}
            }
        }
    });

    let ctx = RunContext::new()
        .with_cancel(cancel)
        .with_events(event_bus.clone());
    let outcome = graph.run_with(vec![Message::user(input)], &ctx).await;

    print_handle.await.ok();

    if let RunStatus::Failed(ref failure) = outcome.status {
        warn!(error = %failure, "Run failed");
    }
    outcome
}

fn outcome_json(outcome: &RunOutcome) -> serde_json::Value {
    serde_json::json!({
        "run_id": outcome.run_id,
        "status": outcome.status,
        "steps": outcome.steps,
        "trace": outcome.trace,
        "total_elapsed_ms": outcome.total_elapsed_ms,
        "log": outcome.log,
    })
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}
