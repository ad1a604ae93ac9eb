//! bacnet-daq
//!
//! Polls BACnet/IP devices through locally hosted gateways and records
//! their present values.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use bacnet_daq::client::StackConnector;
use bacnet_daq::config::DaqConfig;
use bacnet_daq::inventory::{InventorySink, InventoryStore};
use bacnet_daq::process::{GroupFactory, ManagedGroups};
use bacnet_daq::recorder::LogRecorder;
use bacnet_daq::registry::GroupRegistry;
use bacnet_daq::scheduler::SchedulerSettings;
use bacnet_daq::topology::{DeviceGroupSpec, build_groups};
use bacnet_daq::daq_runtime::ProcessManager;

/// BACnet/IP data acquisition
#[derive(Parser, Debug)]
#[command(name = "bacnet-daq")]
#[command(about = "BACnet/IP multi-device polling and discovery engine", long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Spawn every device group and keep them reconciled (default)
    Run,

    /// Run discovery once through one gateway and print the summaries
    Discover {
        #[arg(long)]
        gateway: u32,
    },

    /// Write a variable once and print the verified read-back
    Write {
        #[arg(long)]
        variable: u32,

        #[arg(long)]
        value: f64,
    },

    /// Print the computed device groups
    Topology,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let config = DaqConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run(config, args.config).await,
        Command::Discover { gateway } => discover(config, gateway).await,
        Command::Write { variable, value } => write(config, variable, value).await,
        Command::Topology => {
            let groups = build_groups(&config)?;
            println!("{}", serde_json::to_string_pretty(&groups)?);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("bacnet_daq=info,bacnet_stack=info,daq_runtime=info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn factory(config: &DaqConfig) -> Result<GroupFactory> {
    let inventory = InventorySink::spawn(InventoryStore::new(&config.daq.inventory_path))
        .context("Failed to start inventory writer")?;
    Ok(GroupFactory {
        settings: SchedulerSettings::from_config(&config.daq, &config.stack),
        poll_interval: config.daq.poll_interval(),
        connector: Arc::new(StackConnector),
        recorder: Arc::new(LogRecorder),
        converter: None,
        inventory: Some(inventory),
    })
}

async fn run(config: DaqConfig, config_path: Option<PathBuf>) -> Result<()> {
    info!("Starting bacnet-daq v{}", env!("CARGO_PKG_VERSION"));

    let manager = ProcessManager::new_shared();
    let groups = ManagedGroups::new(Arc::clone(&manager), factory(&config)?);
    let mut registry = GroupRegistry::new(groups);

    let report = registry.reconcile(build_groups(&config)?).await;
    info!(groups = report.spawned.len(), "Device groups started");

    let mut reconcile_timer = tokio::time::interval(config.daq.reconcile_interval());
    reconcile_timer.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
            _ = reconcile_timer.tick() => {
                // Configuration is re-read so edits take effect without a restart
                let specs = match DaqConfig::load(config_path.as_deref()).and_then(|c| build_groups(&c)) {
                    Ok(specs) => specs,
                    Err(e) => {
                        warn!(error = %e, "Configuration reload failed, keeping current groups");
                        continue;
                    }
                };
                let report = registry.reconcile(specs).await;
                if !(report.spawned.is_empty()
                    && report.recreated.is_empty()
                    && report.stopped.is_empty()
                    && report.respawned.is_empty()
                    && report.given_up.is_empty())
                {
                    info!(?report, "Reconciled device groups");
                }
            }
        }
    }

    registry.stop_all().await;
    if let Err(e) = manager.shutdown_all().await {
        warn!(error = %e, "Some groups did not stop cleanly");
    }
    info!("bacnet-daq stopped");
    Ok(())
}

fn find_group(config: &DaqConfig, matches: impl Fn(&DeviceGroupSpec) -> bool) -> Result<DeviceGroupSpec> {
    build_groups(config)?
        .into_iter()
        .find(|g| matches(g))
        .context("No active device group matches")
}

async fn discover(config: DaqConfig, gateway: u32) -> Result<()> {
    let spec = find_group(&config, |g| g.gateway.id == gateway)?;
    let factory = factory(&config)?;
    let inventory = factory.inventory.clone();

    let summaries = tokio::task::spawn_blocking(move || {
        let mut scheduler = factory.scheduler(&spec);
        let result = scheduler.discover();
        scheduler.stop();
        result
    })
    .await??;

    if let Some(inventory) = inventory {
        inventory.flush();
    }
    println!("{}", serde_json::to_string_pretty(&summaries)?);
    Ok(())
}

async fn write(config: DaqConfig, variable: u32, value: f64) -> Result<()> {
    let spec = find_group(&config, |g| g.object(variable).is_some())?;
    let factory = factory(&config)?;

    let result = tokio::task::spawn_blocking(move || {
        let mut scheduler = factory.scheduler(&spec);
        let result = scheduler.write(variable, value);
        scheduler.stop();
        result
    })
    .await?;

    match result {
        Ok(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Err(e) => bail!("Write failed ({:?}): {}", e.kind(), e),
    }
}
