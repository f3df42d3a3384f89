//! `keystone` command-line entry point.

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use keystone_core::{Annotated, KeystoneResult, TaskContext, TaskHandler};
use keystone_orchestrator::{KeystoneConfig, Orchestrator, Task, Worker, ESCALATION_TOPIC};
use keystone_security::{verify_entries, AuditEntry};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "keystone", about = "Keystone - agent task orchestration and escalation core")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "keystone.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check the configuration and print the effective values
    Validate,
    /// Print the effective escalation trigger table as JSON
    Triggers,
    /// Verify the hash chain of a persisted audit log
    VerifyAudit {
        /// Path to audit.jsonl (defaults to <audit.dir>/audit.jsonl)
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Run the orchestrator until interrupted
    Run {
        /// Number of generic workers to register
        #[arg(short, long, default_value_t = 2)]
        workers: usize,
        /// Submit this many echo tasks on start-up
        #[arg(long, default_value_t = 0)]
        demo_tasks: usize,
    },
}

/// Returns each step's payload unchanged.
struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    fn name(&self) -> &str {
        "echo"
    }

    async fn execute(&self, ctx: &TaskContext) -> KeystoneResult<Annotated<serde_json::Value>> {
        Ok(Annotated::ok(ctx.payload.clone()))
    }
}

async fn load_config(path: &Path) -> anyhow::Result<KeystoneConfig> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Ok(KeystoneConfig::from_toml(&text)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "Config file not found, using defaults");
            Ok(KeystoneConfig::default())
        }
        Err(e) => Err(anyhow::anyhow!(
            "Failed to read config file '{}': {e}",
            path.display()
        )),
    }
}

fn read_audit(path: &Path) -> anyhow::Result<Vec<AuditEntry>> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read audit log '{}': {e}", path.display()))?;
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .enumerate()
        .map(|(i, line)| {
            serde_json::from_str(line)
                .map_err(|e| anyhow::anyhow!("line {}: {e}", i + 1))
        })
        .collect()
}

async fn run(config: KeystoneConfig, workers: usize, demo_tasks: usize) -> anyhow::Result<()> {
    let orch = Orchestrator::new(config)?;
    orch.register_handler("echo", Arc::new(EchoHandler));
    for i in 0..workers {
        orch.register_worker(Worker::new(format!("worker-{i}")).with_capacity(4))
            .await;
    }

    let mut escalations = orch.bus().subscribe(ESCALATION_TOPIC);
    tokio::spawn(async move {
        while let Some(msg) = escalations.recv().await {
            match msg.body.get("rendered").and_then(|r| r.as_str()) {
                Some(text) => warn!(ticket = %msg.body["id"], "Human escalation:\n{text}"),
                None => info!(ticket = %msg.body["id"], level = %msg.body["target_level"], "Escalation"),
            }
        }
    });

    for i in 0..demo_tasks {
        let id = orch.submit(Task::new("echo", serde_json::json!({ "n": i })))?;
        info!(task_id = %id, "Demo task submitted");
    }

    let shutdown = CancellationToken::new();
    let loop_handle = {
        let orch = orch.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { orch.run(shutdown).await })
    };

    info!(workers, "Keystone running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    shutdown.cancel();
    loop_handle.await?;

    let health = orch.health().await;
    println!("{}", serde_json::to_string_pretty(&health.to_json())?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config).await?;

    match cli.command {
        Commands::Validate => {
            println!("{}", toml::to_string_pretty(&config)?);
            info!(config = %cli.config.display(), "Configuration is valid");
        }
        Commands::Triggers => {
            println!("{}", serde_json::to_string_pretty(&config.trigger_table())?);
        }
        Commands::VerifyAudit { file } => {
            let path = match (file, &config.audit.dir) {
                (Some(f), _) => f,
                (None, Some(dir)) => dir.join("audit.jsonl"),
                (None, None) => anyhow::bail!("no --file given and audit.dir is not configured"),
            };
            let entries = read_audit(&path)?;
            verify_entries(&entries)?;
            println!("{} entries, chain intact", entries.len());
        }
        Commands::Run {
            workers,
            demo_tasks,
        } => run(config, workers, demo_tasks).await?,
    }
    Ok(())
}
