use anyhow::{Context, Result};
use clap::Parser;
use finmem::memory::SqliteCheckpointStore;
use finmem::simulation::{load_observations, Simulation};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "finmem", about = "Trading agent with layered memory")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/finmem.toml")]
    config: String,

    /// JSON-lines file of market observations
    #[arg(short, long)]
    data: String,

    /// SQLite file for per-day memory checkpoints
    #[arg(long)]
    checkpoint: Option<String>,

    /// Continue from the run's latest checkpoint
    #[arg(long, requires = "checkpoint")]
    resume: bool,

    /// Identifies the run inside the checkpoint store
    #[arg(long, default_value = "default")]
    run_id: String,

    /// Pretty-print the output JSON
    #[arg(long)]
    pretty: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing (respects RUST_LOG env var)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config_str = std::fs::read_to_string(&cli.config)
        .with_context(|| format!("Failed to read config: {}", cli.config))?;
    let config = finmem::parse_config(&config_str)?;

    let observations = load_observations(&cli.data)
        .with_context(|| format!("Failed to load observations: {}", cli.data))?;

    let engine = finmem::build_engine(&config)?;
    let cycle = finmem::build_cycle(&config)?;
    let mut simulation = Simulation::new(&config.simulation, cli.run_id.clone(), cycle, engine);

    if let Some(path) = &cli.checkpoint {
        let store = SqliteCheckpointStore::open(path)
            .with_context(|| format!("Failed to open checkpoint DB: {path}"))?;
        simulation = simulation.with_checkpoints(store);
    }
    if cli.resume {
        simulation.resume().context("Failed to resume from checkpoint")?;
    }

    let cancel = simulation.cancel_token();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Received shutdown signal, stopping after the current day");
        cancel.cancel();
    });

    let summary = simulation.run(observations).await.context("Simulation failed")?;

    let output = if cli.pretty {
        serde_json::to_string_pretty(&summary)?
    } else {
        serde_json::to_string(&summary)?
    };
    println!("{output}");

    Ok(())
}
