// SPDX-License-Identifier: Apache-2.0

//! The host daemon: connects to the cluster-agent and runs the report /
//! enforce loops.
//!
//! Two tasks share the bidirectional stream: the info sender polls the flow
//! tracker every inform period, rolls connection-level flows up to
//! host-flow granularity, and writes an [`InfoBundle`]; the enforcer reads
//! [`AllocBundle`]s and applies them. Shutdown is cooperative: on
//! cancellation the info sender stops writing and closes the request
//! stream, and the enforcer exits when the response stream ends.

use std::sync::Arc;

use chrono::Utc;
use heyp_alg::demand::BweDemandPredictor;
use heyp_config::HostAgentConfig;
use heyp_flows::{FlowAggregator, StaticDCMapper};
use heyp_proto::v1::cluster_agent_client::ClusterAgentClient;
use heyp_proto::{FlowInfo, FlowMarker, InfoBundle, Timestamp};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::enforcer::HostEnforcer;
use crate::flow_tracker::FlowTracker;
use crate::ss_reporter::SsFlowStateReporter;

/// Errors that terminate the daemon.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The initial dial to the cluster-agent timed out or failed.
    #[error("failed to connect to cluster agent at {addr}: {source}")]
    Connect {
        /// The configured address.
        addr: String,
        /// Underlying transport error.
        #[source]
        source: tonic::transport::Error,
    },
    /// The configured address is malformed.
    #[error("bad cluster agent address {addr}")]
    BadAddress {
        /// The configured address.
        addr: String,
    },
    /// The stream could not be established.
    #[error("failed to register host: {0}")]
    Register(#[from] tonic::Status),
}

/// See the module docs.
pub struct HostDaemon {
    config: HostAgentConfig,
    host_id: u64,
    flow_tracker: Arc<FlowTracker>,
    reporter: Arc<SsFlowStateReporter>,
    dc_mapper: Arc<StaticDCMapper>,
    enforcer: Arc<dyn HostEnforcer>,
}

impl HostDaemon {
    /// Creates a daemon.
    pub fn new(
        config: HostAgentConfig,
        host_id: u64,
        flow_tracker: Arc<FlowTracker>,
        reporter: Arc<SsFlowStateReporter>,
        dc_mapper: Arc<StaticDCMapper>,
        enforcer: Arc<dyn HostEnforcer>,
    ) -> Self {
        Self {
            config,
            host_id,
            flow_tracker,
            reporter,
            dc_mapper,
            enforcer,
        }
    }

    /// Dials the cluster-agent and runs until cancelled.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), Error> {
        let addr = self.config.daemon.cluster_agent_addr.clone();
        let endpoint = tonic::transport::Endpoint::from_shared(format!("http://{addr}"))
            .map_err(|_| Error::BadAddress { addr: addr.clone() })?
            .connect_timeout(self.config.daemon.cluster_agent_connection_timeout);
        info!(%addr, "connecting to cluster agent");
        let channel = endpoint.connect().await.map_err(|source| Error::Connect {
            addr: addr.clone(),
            source,
        })?;
        let mut client = ClusterAgentClient::new(channel);

        let (info_tx, info_rx) = tokio::sync::mpsc::channel::<InfoBundle>(1);
        let outbound = tokio_stream::wrappers::ReceiverStream::new(info_rx);
        let mut inbound = client.register_host(outbound).await?.into_inner();

        let this = Arc::new(self);

        let info_task = {
            let this = Arc::clone(&this);
            let cancel = cancel.clone();
            tokio::spawn(async move { this.send_info_loop(cancel, info_tx).await })
        };

        let enforce_task = {
            let this = Arc::clone(&this);
            tokio::spawn(async move {
                loop {
                    match inbound.message().await {
                        Ok(Some(bundle)) => {
                            debug!(num_allocs = bundle.flow_allocs.len(), "got alloc bundle");
                            this.enforcer.enforce_allocs(&bundle).await;
                        }
                        Ok(None) => {
                            info!("alloc stream closed");
                            break;
                        }
                        Err(status) => {
                            warn!(%status, "alloc stream failed");
                            break;
                        }
                    }
                }
            })
        };

        let _ = info_task.await;
        let _ = enforce_task.await;
        Ok(())
    }

    async fn send_info_loop(
        &self,
        cancel: CancellationToken,
        info_tx: tokio::sync::mpsc::Sender<InfoBundle>,
    ) {
        let predictor_config = &self.config.flow_tracker.demand_predictor;
        let window = heyp_config::to_chrono(predictor_config.time_window);
        let host_aggregator = FlowAggregator::new_conn_to_host(
            Box::new(BweDemandPredictor::new(
                window,
                predictor_config.usage_multiplier,
                predictor_config.min_demand_bps,
            )),
            window * 2,
        );

        let mut gen: u64 = 0;
        let mut interval = tokio::time::interval(self.config.daemon.inform_period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            let enforcer = Arc::clone(&self.enforcer);
            if let Err(e) = self
                .reporter
                .report_state(&move |flow| enforcer.is_lopri(flow))
                .await
            {
                warn!(error = %e, "failed to refresh flow state");
            }

            gen += 1;
            let bundle = self.collect_info_bundle(&host_aggregator, gen);
            if info_tx.send(bundle).await.is_err() {
                warn!("info stream closed; stopping reports");
                break;
            }
        }
        // Dropping info_tx closes the request stream (writes done).
    }

    /// Rolls the tracker's flows up to host-flow granularity and bundles
    /// them.
    fn collect_info_bundle(&self, host_aggregator: &FlowAggregator, gen: u64) -> InfoBundle {
        let now = Utc::now();

        let mut conn_infos: Vec<FlowInfo> = Vec::new();
        self.flow_tracker.for_each_active_flow(|_, fi| {
            conn_infos.push(fi.clone());
        });
        conn_infos.extend(self.flow_tracker.take_done_flows());

        // Classify each connection into its FG; unknown destinations cannot
        // be steered and are skipped.
        conn_infos.retain_mut(|fi| {
            let Some(flow) = fi.flow.as_mut() else {
                return false;
            };
            let Some(src_dc) = self.dc_mapper.host_dc(&flow.src_addr) else {
                debug!(addr = %flow.src_addr, "unknown source DC");
                return false;
            };
            let Some(dst_dc) = self.dc_mapper.host_dc(&flow.dst_addr) else {
                debug!(addr = %flow.dst_addr, "unknown destination DC");
                return false;
            };
            flow.src_dc = src_dc.to_string();
            flow.dst_dc = dst_dc.to_string();
            flow.job = self.config.daemon.job.clone();
            true
        });

        let bundler = FlowMarker {
            host_id: self.host_id,
            job: self.config.daemon.job.clone(),
            ..Default::default()
        };
        host_aggregator.update(&InfoBundle {
            bundler: Some(bundler.clone()),
            timestamp: Some(Timestamp::from_datetime(now)),
            flow_infos: conn_infos,
            gen,
        });

        let mut flow_infos = Vec::new();
        host_aggregator.for_each_agg(|_, agg| {
            flow_infos.push(agg.parent.clone());
        });

        InfoBundle {
            bundler: Some(bundler),
            timestamp: Some(Timestamp::from_datetime(now)),
            flow_infos,
            gen,
        }
    }
}
