// SPDX-License-Identifier: Apache-2.0

//! The host-agent binary.
//!
//! Takes a YAML configuration. Exit codes: 0 success, 1 runtime error,
//! 2 bad arguments, 3 config I/O or parse error.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use heyp_alg::BweDemandPredictor;
use heyp_config::{load_yaml, to_chrono, HostAgentConfig};
use heyp_flows::StaticDCMapper;
use heyp_host_agent::daemon::HostDaemon;
use heyp_host_agent::enforcer::{expand_dest_into_hosts_single_pri, NopHostEnforcer};
use heyp_host_agent::linux::LinuxHostEnforcer;
use heyp_host_agent::ss_reporter::{self, SsFlowStateReporter};
use heyp_host_agent::{FlowTracker, HostEnforcer};
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "host-agent", about = "HEYP host agent")]
struct Args {
    /// Path to the agent configuration (YAML).
    config: PathBuf,
}

async fn run(config: HostAgentConfig) -> Result<(), String> {
    let host_id: u64 = rand::rng().random();
    info!(host_id, "host assigned id");

    info!("creating flow tracker");
    let predictor = &config.flow_tracker.demand_predictor;
    let time_window = to_chrono(predictor.time_window);
    let flow_tracker = Arc::new(FlowTracker::new(
        Box::new(BweDemandPredictor::new(
            time_window,
            predictor.usage_multiplier,
            predictor.min_demand_bps,
        )),
        heyp_host_agent::flow_tracker::Config {
            usage_history_window: time_window * 2,
            ignore_instantaneous_usage: config.flow_tracker.ignore_instantaneous_usage,
        },
    ));

    info!("creating flow state reporter");
    let reporter = Arc::new(SsFlowStateReporter::new(
        ss_reporter::Config {
            host_id,
            ss_binary_name: config.flow_state_reporter.ss_binary_name.clone(),
            my_addrs: config.flow_state_reporter.this_host_addrs.clone(),
            collect_aux: config.flow_state_reporter.collect_aux,
        },
        Arc::clone(&flow_tracker),
    ));

    info!("creating dc mapper");
    let dc_mapper = Arc::new(StaticDCMapper::new(&config.dc_mapper));

    info!("creating host enforcer");
    let enforcer: Arc<dyn HostEnforcer> = if config.enforcer.enforce {
        let mapper = Arc::clone(&dc_mapper);
        let enforcer = LinuxHostEnforcer::new(
            config.enforcer.device.clone(),
            config.enforcer.dscps_to_ignore_class_id.clone(),
            Arc::new(move |alloc| expand_dest_into_hosts_single_pri(&mapper, alloc)),
        );
        enforcer
            .reset_device_config()
            .await
            .map_err(|e| format!("failed to reset device config: {e}"))?;
        Arc::new(enforcer)
    } else {
        Arc::new(NopHostEnforcer)
    };

    let cancel = CancellationToken::new();
    let monitor = reporter.spawn_monitor_done(cancel.clone());

    let daemon = HostDaemon::new(
        config,
        host_id,
        Arc::clone(&flow_tracker),
        Arc::clone(&reporter),
        dc_mapper,
        enforcer,
    );

    info!("running daemon main loop");
    let run = {
        let cancel = cancel.clone();
        tokio::spawn(async move { daemon.run(cancel).await })
    };

    let result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            Ok(())
        }
        joined = run => match joined {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(e) => Err(format!("daemon task failed: {e}")),
        },
    };

    cancel.cancel();
    let _ = monitor.await;
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

    let config: HostAgentConfig = match load_yaml(&args.config) {
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

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::from(1)
        }
    }
}
