//! Assignment simulator
//!
//! Drives an [`AssignmentManager`] against an in-process storage fleet and
//! prints a JSON summary.

use clap::{Parser, Subcommand, ValueEnum};
use rand::Rng;
use regionmaster::assignment::{
    AssignmentManager, AssignmentServices, ExecuteResponse, RegionState, TransportError,
};
use regionmaster::common::{parse_duration, Config};
use regionmaster::sim::{SimCluster, SimTransport};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "regionmaster-sim")]
#[command(about = "Run region assignment against a simulated storage fleet")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Assign a table's regions and wait for all of them
    Run {
        /// Number of regions
        #[arg(long, default_value = "1000")]
        regions: usize,

        /// Number of storage nodes
        #[arg(long, default_value = "5")]
        servers: usize,

        /// Procedure worker threads (overrides the config file)
        #[arg(long)]
        workers: Option<usize>,

        /// Injected node behavior
        #[arg(long, value_enum, default_value = "good")]
        fault: Fault,

        /// Crash this many nodes once every region has been submitted
        #[arg(long, default_value = "0")]
        kill: usize,

        /// Keep procedure and region state under the configured store dir
        #[arg(long)]
        durable: bool,

        /// Also print the metrics in Prometheus text format
        #[arg(long)]
        prometheus: bool,

        /// How long to wait for each procedure (e.g. "500ms", "30s", "2m")
        #[arg(long, default_value = "60s")]
        timeout: String,
    },

    /// Print the effective configuration
    ShowConfig,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Fault {
    /// Every node answers immediately
    Good,
    /// About one open in twenty fails on the node
    Random,
    /// The first call to every node is rejected with a full queue
    QueueFull,
    /// The first two calls to every node time out
    Timeout,
}

fn transport(cluster: &SimCluster, fault: Fault) -> Arc<SimTransport> {
    match fault {
        Fault::Good => cluster.good_transport(),
        Fault::Random => cluster.transport(|nodes, server, request, _| {
            let mut rng = rand::thread_rng();
            let mut response = ExecuteResponse::default();
            for op in &request.opens {
                let result = if rng.gen_bool(0.05) {
                    nodes.fail_open(server, &op.region)
                } else {
                    nodes.open_region(server, &op.region)
                };
                response.opens.push((op.op_id, result));
            }
            for op in &request.closes {
                response
                    .closes
                    .push((op.op_id, nodes.close_region(server, &op.region)));
            }
            Ok(response)
        }),
        Fault::QueueFull => cluster.transport(|nodes, server, request, call| {
            if call == 1 {
                return Err(TransportError::QueueTooBig);
            }
            Ok(nodes.good_response(server, request))
        }),
        Fault::Timeout => cluster.transport(|nodes, server, request, call| {
            if call <= 2 {
                return Err(TransportError::Timeout);
            }
            Ok(nodes.good_response(server, request))
        }),
    }
}

/// `RUST_LOG` wins over the configured level
fn log_filter(rust_log: Option<&str>, configured: &str) -> EnvFilter {
    rust_log
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(configured))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;

    let rust_log = std::env::var("RUST_LOG").ok();
    tracing_subscriber::registry()
        .with(log_filter(rust_log.as_deref(), &config.log_level))
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Run {
            regions,
            servers,
            workers,
            fault,
            kill,
            durable,
            prometheus,
            timeout,
        } => {
            if let Some(workers) = workers {
                config.executor.worker_threads = workers;
            }
            if servers == 0 {
                anyhow::bail!("--servers must be at least 1");
            }

            let cluster = SimCluster::new(servers);
            let transport = transport(&cluster, fault);
            let services = if durable {
                std::fs::create_dir_all(&config.store.dir)?;
                AssignmentServices::open(&config, cluster.registry(), transport.clone())?
            } else {
                cluster.memory_services(transport.clone())
            };

            let started = Instant::now();
            let manager = AssignmentManager::start(config, services).await?;
            let forwarder = cluster.connect(&manager);

            let table = SimCluster::table_regions("sim", regions);
            let proc_ids = manager.assign_many(&table)?;

            for server in cluster.servers.iter().take(kill) {
                tracing::warn!("Killing {}", server);
                cluster.nodes.crash(server);
            }

            let deadline = parse_duration(&timeout)?;
            let mut succeeded = 0usize;
            let mut failed = 0usize;
            for id in proc_ids {
                match manager.wait_for(id, deadline).await {
                    Ok(outcome) if outcome.is_success() => succeeded += 1,
                    Ok(_) => failed += 1,
                    Err(e) => {
                        tracing::error!("Procedure {} did not finish: {}", id, e);
                        failed += 1;
                    }
                }
            }
            let elapsed = started.elapsed();

            let opened = table
                .iter()
                .filter(|region| {
                    manager
                        .region_state(region)
                        .map(|r| r.state == RegionState::Open)
                        .unwrap_or(false)
                })
                .count();
            let per_server: Vec<serde_json::Value> = cluster
                .servers
                .iter()
                .map(|server| {
                    serde_json::json!({
                        "server": server.to_string(),
                        "regions": cluster.nodes.hosted_on(server).len(),
                        "calls": transport.calls_to(server),
                    })
                })
                .collect();
            let metrics = manager.metrics();
            let summary = serde_json::json!({
                "regions": regions,
                "servers": servers,
                "fault": format!("{:?}", fault),
                "killed": kill.min(servers),
                "succeeded": succeeded,
                "failed": failed,
                "open": opened,
                "conflicts": cluster.nodes.conflicts(),
                "elapsed_ms": elapsed.as_millis() as u64,
                "assign": {
                    "submitted": metrics.assign.submitted.get(),
                    "succeeded": metrics.assign.succeeded.get(),
                    "failed": metrics.assign.failed.get(),
                },
                "crashes": metrics.server_crash.succeeded.get(),
                "rpcs": metrics.dispatch.rpcs_sent.get(),
                "rpc_retries": metrics.dispatch.rpc_retries.get(),
                "servers_detail": per_server,
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
            if prometheus {
                print!("{}", metrics.to_prometheus());
            }

            manager.shutdown().await;
            forwarder.abort();
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_filter_defaults_to_configured_level() {
        assert_eq!(log_filter(None, "debug").to_string(), "debug");
        assert_eq!(log_filter(Some("warn"), "debug").to_string(), "warn");
    }
}
