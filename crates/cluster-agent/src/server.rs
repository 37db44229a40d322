// SPDX-License-Identifier: Apache-2.0

//! The gRPC server: one bidirectional stream per host.
//!
//! The read half registers a controller listener on the first bundle and
//! feeds every bundle into the controller. The write half coalesces: the
//! listener pushes bundles into a watch channel, so a slow host only ever
//! sees the newest staged bundle. When the read half finishes (EOF or
//! error) the listener handle drops, which tears down the channel and ends
//! the response stream.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use heyp_proto::v1::cluster_agent_server::ClusterAgent;
use heyp_proto::{AllocBundle, InfoBundle};
use tokio::sync::watch;
use tokio_stream::Stream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, warn};

use crate::controller::ClusterController;

/// Implements the `ClusterAgent` service on top of a controller.
pub struct ClusterAgentService {
    controller: Arc<dyn ClusterController>,
}

impl ClusterAgentService {
    /// Creates the service.
    pub fn new(controller: Arc<dyn ClusterController>) -> Self {
        Self { controller }
    }
}

#[tonic::async_trait]
impl ClusterAgent for ClusterAgentService {
    type RegisterHostStream =
        Pin<Box<dyn Stream<Item = Result<AllocBundle, Status>> + Send + 'static>>;

    async fn register_host(
        &self,
        request: Request<Streaming<InfoBundle>>,
    ) -> Result<Response<Self::RegisterHostStream>, Status> {
        let peer = request
            .remote_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        info!(%peer, "new connection");

        let mut input = request.into_inner();
        let (tx, mut rx) = watch::channel(AllocBundle::default());
        let controller = Arc::clone(&self.controller);

        let _ = tokio::spawn(async move {
            // Dropped at the end of this task, which deregisters the
            // listener and closes the response stream.
            let mut listener = None;
            let mut bundler_id = -1;
            let peer = peer;
            loop {
                match input.message().await {
                    Ok(Some(bundle)) => {
                        debug!(%peer, num_fgs = bundle.flow_infos.len(), "got info");
                        if listener.is_none() {
                            let host_id = bundle.bundler().host_id;
                            let tx = tx.clone();
                            listener = Some(controller.register_listener(
                                host_id,
                                Arc::new(move |alloc: &AllocBundle| {
                                    let _ = tx.send(alloc.clone());
                                }),
                            ));
                            bundler_id = controller.get_bundler_id(bundle.bundler());
                        }
                        controller.update_info(bundler_id, &bundle);
                    }
                    Ok(None) => {
                        info!(%peer, "stream closed by host");
                        break;
                    }
                    Err(status) => {
                        warn!(%peer, %status, "stream read failed");
                        break;
                    }
                }
            }
            drop(listener);
        });

        let output = async_stream::stream! {
            loop {
                if rx.changed().await.is_err() {
                    break;
                }
                let bundle = rx.borrow_and_update().clone();
                yield Ok(bundle);
            }
        };
        Ok(Response::new(Box::pin(output)))
    }
}

/// Repeatedly computes and broadcasts allocations until `should_exit` is
/// set. Runs on a dedicated thread.
pub fn run_loop(
    controller: Arc<dyn ClusterController>,
    control_period: Duration,
    should_exit: Arc<AtomicBool>,
) {
    while !should_exit.load(Ordering::SeqCst) {
        debug!("compute new allocations");
        controller.compute_and_broadcast();
        std::thread::sleep(control_period);
    }
}
