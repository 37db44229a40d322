// SPDX-License-Identifier: Apache-2.0

//! The cluster-agent binary.
//!
//! Takes a YAML config and a YAML file of initial per-FG HIPRI admissions.
//! Exit codes: 0 success, 1 runtime error, 2 bad arguments, 3 config I/O or
//! parse error.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use heyp_cluster_agent::allocator::ClusterAllocator;
use heyp_cluster_agent::fast_controller::FastClusterController;
use heyp_cluster_agent::full_controller::FullClusterController;
use heyp_cluster_agent::server::{run_loop, ClusterAgentService};
use heyp_cluster_agent::ClusterController;
use heyp_common::NdjsonLogger;
use heyp_config::{load_admissions, load_yaml, to_chrono, ClusterAgentConfig};
use heyp_flows::FlowAggregator;
use heyp_proto::v1::cluster_agent_server::ClusterAgentServer;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "cluster-agent", about = "HEYP cluster agent")]
struct Args {
    /// Path to the agent configuration (YAML).
    config: PathBuf,
    /// Path to the initial per-FG admissions (YAML AllocBundle).
    admissions: PathBuf,
}

fn build_controller(
    config: &ClusterAgentConfig,
    admissions: &heyp_proto::AllocBundle,
) -> Result<Arc<dyn ClusterController>, heyp_common::ndjson::Error> {
    if let Some(fast) = &config.fast_controller {
        info!("starting fast cluster controller");
        return Ok(Arc::new(FastClusterController::create(fast, admissions)));
    }

    info!("starting full cluster controller");
    let predictor = &config.flow_aggregator.demand_predictor;
    let aggregator = FlowAggregator::new_host_to_cluster(
        Box::new(heyp_alg::BweDemandPredictor::new(
            to_chrono(predictor.time_window),
            predictor.usage_multiplier,
            predictor.min_demand_bps,
        )),
        to_chrono(predictor.time_window),
    );
    let recorder = match &config.alloc_log_path {
        Some(path) => Some(NdjsonLogger::create(path)?),
        None => None,
    };
    let allocator = ClusterAllocator::create(&config.allocator, admissions, recorder);
    Ok(Arc::new(FullClusterController::new(aggregator, allocator)))
}

async fn run(config: ClusterAgentConfig, admissions: heyp_proto::AllocBundle) -> Result<(), String> {
    let controller =
        build_controller(&config, &admissions).map_err(|e| format!("failed to open alloc log: {e}"))?;

    let should_exit = Arc::new(AtomicBool::new(false));
    let control_loop = {
        let controller = Arc::clone(&controller);
        let should_exit = Arc::clone(&should_exit);
        let control_period = config.server.control_period;
        std::thread::Builder::new()
            .name("control-loop".to_string())
            .spawn(move || run_loop(controller, control_period, should_exit))
            .map_err(|e| format!("failed to spawn control loop: {e}"))?
    };

    info!(address = %config.server.address, "server listening");
    let service = ClusterAgentService::new(Arc::clone(&controller));
    let serve = tonic::transport::Server::builder()
        .add_service(ClusterAgentServer::new(service))
        .serve_with_shutdown(config.server.address, async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        });

    let result = serve.await.map_err(|e| format!("server failed: {e}"));

    should_exit.store(true, Ordering::SeqCst);
    let _ = control_loop.join();
    result
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config: ClusterAgentConfig = match load_yaml(&args.config) {
        Ok(c) => c,
        Err(e) => {
            error!("{e}");
            return ExitCode::from(3);
        }
    };
    if let Err(e) = config.validate() {
        error!("{e}");
        return ExitCode::from(3);
    }
    let admissions = match load_admissions(&args.admissions) {
        Ok(a) => a,
        Err(e) => {
            error!("{e}");
            return ExitCode::from(3);
        }
    };

    match run(config, admissions).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::from(1)
        }
    }
}
