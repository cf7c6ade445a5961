mod pipelines;

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use runnel_core::config::AppConfig;
use runnel_engine::{Orchestration, Orchestrator, RunLogger};

use pipelines::Pipeline;

#[derive(Parser)]
#[command(name = "runnel", version, about = "Graph-based async orchestration engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "runnel.toml", env = "RUNNEL_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one of the bundled demo pipelines
    Run {
        /// Pipeline to run
        #[arg(value_enum)]
        pipeline: Pipeline,
        /// Input value (defaults depend on the pipeline)
        #[arg(short, long)]
        input: Option<String>,
        /// Record execution steps and print the trace as JSON
        #[arg(long)]
        trace: bool,
    },
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
    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "runnel", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(&cli.config)?;

    let filter = config.log.as_ref().and_then(|log| log.filter.clone());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(filter.as_deref().unwrap_or("runnel=info,warn"))
        }))
        .with_target(false)
        .init();

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Run {
            pipeline,
            input,
            trace,
        } => {
            let input = input.unwrap_or_else(|| pipeline.default_input().to_string());
            match pipeline {
                Pipeline::Parse => drive(pipelines::parse()?, input, &config, trace).await?,
                Pipeline::Join => {
                    let value = parse_number(&input)?;
                    drive(pipelines::join()?, value, &config, trace).await?
                }
                Pipeline::Fanout => {
                    let value = parse_number(&input)?;
                    drive(pipelines::fanout()?, value, &config, trace).await?
                }
            }
        }
        Commands::Completions { .. } => unreachable!("handled before config load"),
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        AppConfig::load(path).with_context(|| format!("loading {}", path.display()))
    } else {
        Ok(AppConfig::default())
    }
}

fn parse_number(input: &str) -> anyhow::Result<i64> {
    input
        .trim()
        .parse()
        .with_context(|| format!("input must be an integer, got {:?}", input))
}

/// Run one orchestration, print its report and results, optionally the trace.
async fn drive<I, O>(
    graph: Orchestration<I, O>,
    input: I,
    config: &AppConfig,
    trace: bool,
) -> anyhow::Result<()>
where
    I: fmt::Debug + Send + Sync + 'static,
    O: fmt::Debug + Send + Sync + 'static,
{
    let mut engine = config.engine.clone();
    engine.record_steps |= trace;
    let mut orchestrator = Orchestrator::with_config(graph, engine);

    // Spawn RunLogger if logging is enabled
    let logger = match &config.log {
        Some(log_config) if log_config.enabled => {
            let logger = RunLogger::new(log_config.log_dir(), log_config.level);
            let rx = orchestrator.subscribe();
            Some(tokio::spawn(logger.run(rx, CancellationToken::new())))
        }
        _ => None,
    };

    let ctrl_c = orchestrator.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling at the next tick");
            ctrl_c.cancel();
        }
    });

    let outcome = orchestrator.invoke(input).await;

    if let Some(handle) = logger {
        if let Ok(Some(path)) = handle.await {
            info!(path = %path.display(), "Run log written");
        }
    }

    let report = outcome?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    for result in orchestrator.results() {
        println!("result: {:?}", result);
    }
    if trace {
        println!("{}", orchestrator.trace().to_json_pretty()?);
    }
    Ok(())
}
