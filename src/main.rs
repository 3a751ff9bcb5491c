//! Shepherd - Master/Slave Election on a Coordination Service
//!
//! Operator CLI: joins an election group on a ZooKeeper ensemble, writes
//! and checks configuration files, and runs a local election simulation
//! against the in-process ensemble.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use rand::seq::SliceRandom;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use shepherd::config::{LoggingConfig, ShepherdConfig};
use shepherd::coord::{MemoryEnsemble, SessionId, ZooKeeperConnector};
use shepherd::election::{ElectionManager, Role, RoleOutcome};
use shepherd::identity::resolve_identity;

/// Shepherd - master/slave election on a coordination service
#[derive(Parser)]
#[command(name = "shepherd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "shepherd.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join the election group on the configured ZooKeeper ensemble
    Start,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "shepherd.toml")]
        output: PathBuf,

        /// Coordination service endpoints (host:port), comma separated
        #[arg(long, default_value = "localhost:2181", value_delimiter = ',')]
        endpoints: Vec<String>,
    },

    /// Validate configuration file
    Validate,

    /// Show node information
    Info,

    /// Run an election group against an in-process ensemble and kill masters
    Simulate {
        /// Number of processes in the group
        #[arg(short, long, default_value_t = 3)]
        nodes: usize,

        /// Number of master failures to inject
        #[arg(short, long, default_value_t = 3)]
        rounds: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let logging = ShepherdConfig::from_file(&cli.config)
        .map(|config| config.logging)
        .unwrap_or_default();
    init_logging(cli.log_level.as_deref(), &logging)?;

    match cli.command {
        Commands::Start => run_start(&cli.config).await,
        Commands::Init { output, endpoints } => run_init(&output, &endpoints),
        Commands::Validate => run_validate(&cli.config),
        Commands::Info => run_info(&cli.config),
        Commands::Simulate { nodes, rounds } => run_simulate(&cli.config, nodes, rounds).await,
    }
}

/// Initialize logging
fn init_logging(level: Option<&str>, logging: &LoggingConfig) -> anyhow::Result<()> {
    let level = level.unwrap_or(&logging.level);
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let (writer, ansi) = match &logging.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            (BoxMakeWriter::new(Mutex::new(file)), false)
        }
        None => (BoxMakeWriter::new(std::io::stderr), true),
    };

    let fmt_layer = match logging.format.as_str() {
        "json" => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(writer)
            .boxed(),
        _ => tracing_subscriber::fmt::layer()
            .with_ansi(ansi)
            .with_writer(writer)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .try_init()
        .context("installing tracing subscriber")?;

    Ok(())
}

/// Write a configuration file with every option at its default
fn run_init(output: &Path, endpoints: &[String]) -> anyhow::Result<()> {
    let config = ShepherdConfig::with_endpoints(endpoints.to_vec());
    config.validate().context("invalid endpoints")?;

    let config_content = format!(
        "# Shepherd Configuration\n# Generated configuration file\n# [election] identity defaults to the hostname\n\n{}",
        config.to_toml()?
    );
    std::fs::write(output, config_content)
        .with_context(|| format!("writing {}", output.display()))?;

    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to point at your coordination service.");
    println!("Then start with: shepherd --config {} start", output.display());

    Ok(())
}

/// Run this process in the election group until Ctrl-C
async fn run_start(config_path: &Path) -> anyhow::Result<()> {
    tracing::info!("Starting Shepherd node...");

    let config = match ShepherdConfig::from_file(config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            return Err(e).context("loading configuration");
        }
    };
    let endpoints = config.coordinator.endpoints.join(",");

    let manager = ElectionManager::new(config, Arc::new(ZooKeeperConnector::new()))?;
    let mut outcomes = manager
        .take_outcomes()
        .await
        .context("role outcome channel already taken")?;

    manager
        .start()
        .await
        .with_context(|| format!("joining election group on {}", endpoints))?;
    tracing::info!(identity = %manager.identity(), "joined election group on {}", endpoints);

    loop {
        tokio::select! {
            outcome = outcomes.recv() => match outcome {
                Some(outcome) => log_outcome(outcome),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received shutdown signal");
                break;
            }
        }
    }

    manager.terminate().await;
    while let Ok(outcome) = outcomes.try_recv() {
        log_outcome(outcome);
    }

    tracing::info!("Shepherd shutdown complete");
    Ok(())
}

fn log_outcome(outcome: RoleOutcome) {
    match outcome {
        RoleOutcome::Master => tracing::info!("Now running as MASTER"),
        RoleOutcome::Slave => tracing::info!("Now running as SLAVE"),
        RoleOutcome::Disconnected => tracing::warn!("Disconnected from coordination service"),
    }
}

fn run_validate(config_path: &Path) -> anyhow::Result<()> {
    match ShepherdConfig::from_file(config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Endpoints:      {}", config.coordinator.endpoints.join(","));
            println!("  Election Node:  {}", config.election.election_node);
            println!("  Slaves Root:    {}", config.election.slaves_root);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e).with_context(|| format!("validating {}", config_path.display()))
        }
    }
}

fn run_info(config_path: &Path) -> anyhow::Result<()> {
    let config = ShepherdConfig::from_file(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let identity = resolve_identity(config.election.identity.as_deref())?;

    println!("Shepherd Node Information");
    println!("=========================");
    println!();
    println!("Identity:         {}", identity);
    println!("Slave Node:       {}", config.slave_node(&identity));
    println!();
    println!("Coordinator:");
    println!("  Endpoints:      {:?}", config.coordinator.endpoints);
    println!("  Session:        {} ms", config.coordinator.session_timeout_ms);
    println!("  Reconnect:      {} ms", config.coordinator.reconnect_interval_ms);
    println!();
    println!("Election:");
    println!("  Election Node:  {}", config.election.election_node);
    println!("  Slaves Root:    {}", config.election.slaves_root);
    println!("  Grace:          {} ms", config.election.terminate_grace_ms);

    Ok(())
}

/// Start `nodes` managers on one in-process ensemble, then expire the
/// master's session `rounds` times, printing the cluster after each failover
async fn run_simulate(config_path: &Path, nodes: usize, rounds: usize) -> anyhow::Result<()> {
    if nodes == 0 {
        bail!("simulation needs at least one node");
    }

    let mut config = if config_path.exists() {
        ShepherdConfig::from_file(config_path)
            .with_context(|| format!("loading {}", config_path.display()))?
    } else {
        ShepherdConfig::with_endpoints(vec!["memory:2181".to_string()])
    };
    config.election.terminate_grace_ms = 0;
    let failover_limit = (config.session_timeout() + config.reconnect_interval()) * 5;

    let ensemble = MemoryEnsemble::new();
    let mut identities: Vec<String> = (1..=nodes).map(|i| format!("node-{}", i)).collect();
    identities.shuffle(&mut rand::thread_rng());

    let mut managers = Vec::with_capacity(nodes);
    for identity in identities {
        let mut member = config.clone();
        member.election.identity = Some(identity.clone());
        let manager = Arc::new(ElectionManager::new(member, Arc::new(ensemble.clone()))?);

        if let Some(mut outcomes) = manager.take_outcomes().await {
            let identity = identity.clone();
            tokio::spawn(async move {
                while let Some(outcome) = outcomes.recv().await {
                    tracing::info!(func = "simulate", node = %identity, "role outcome: {}", outcome);
                }
            });
        }

        manager
            .start()
            .await
            .with_context(|| format!("starting {}", identity))?;
        managers.push(manager);
    }

    let master = wait_for_master(&managers, None, failover_limit).await?;
    print_snapshot(&master).await?;

    for round in 1..=rounds {
        let (old, session) = master_session(&managers).await?;
        println!("round {}: expiring session {} of master {}", round, session, old.identity());
        ensemble.expire_session(session).await;

        let master = wait_for_master(&managers, Some(old.identity()), failover_limit).await?;
        println!("round {}: {} took over", round, master.identity());
        print_snapshot(&master).await?;
    }

    futures::future::join_all(managers.iter().map(|m| m.terminate())).await;
    println!("simulation finished, {} sessions left open", ensemble.session_ids().await.len());

    Ok(())
}

async fn master_session(
    managers: &[Arc<ElectionManager>],
) -> anyhow::Result<(Arc<ElectionManager>, SessionId)> {
    for manager in managers {
        if manager.is_master().await {
            let session = manager
                .session_id()
                .await
                .with_context(|| format!("master {} has no session", manager.identity()))?;
            return Ok((manager.clone(), session));
        }
    }
    bail!("no master elected")
}

/// Wait until some process other than `previous` is master and `previous`
/// has rejoined as a slave; a lone process just has to win again
async fn wait_for_master(
    managers: &[Arc<ElectionManager>],
    previous: Option<&str>,
    limit: Duration,
) -> anyhow::Result<Arc<ElectionManager>> {
    let previous = if managers.len() > 1 { previous } else { None };

    let settled = async {
        loop {
            let mut master = None;
            let mut previous_rejoined = previous.is_none();

            for manager in managers {
                let role = manager.role().await;
                if Some(manager.identity()) == previous {
                    previous_rejoined |= role == Role::Slave;
                } else if role == Role::Master {
                    master = Some(manager.clone());
                }
            }

            if let (Some(master), true) = (master, previous_rejoined) {
                return master;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };

    match tokio::time::timeout(limit, settled).await {
        Ok(master) => Ok(master),
        Err(_) => bail!("no failover within {:?}", limit),
    }
}

async fn print_snapshot(manager: &ElectionManager) -> anyhow::Result<()> {
    let snapshot = manager.get_cluster_info().await?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}
