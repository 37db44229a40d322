// SPDX-License-Identifier: Apache-2.0

//! End-to-end check of the report → allocate → enforce plumbing: a real
//! gRPC server backed by the full controller and the BwE allocator.

use std::sync::Arc;

use heyp_alg::BweDemandPredictor;
use heyp_cluster_agent::allocator::ClusterAllocator;
use heyp_cluster_agent::full_controller::FullClusterController;
use heyp_cluster_agent::server::ClusterAgentService;
use heyp_cluster_agent::ClusterController;
use heyp_config::{ClusterAllocatorConfig, ClusterAllocatorType};
use heyp_flows::FlowAggregator;
use heyp_proto::v1::cluster_agent_client::ClusterAgentClient;
use heyp_proto::v1::cluster_agent_server::ClusterAgentServer;
use heyp_proto::{AllocBundle, FlowAlloc, FlowInfo, FlowMarker, InfoBundle, Timestamp};

fn fg_marker() -> FlowMarker {
    FlowMarker {
        src_dc: "chicago".into(),
        dst_dc: "detroit".into(),
        ..Default::default()
    }
}

fn make_controller() -> Arc<FullClusterController> {
    let aggregator = FlowAggregator::new_host_to_cluster(
        Box::new(BweDemandPredictor::new(chrono::Duration::seconds(60), 1.0, 0)),
        chrono::Duration::seconds(60),
    );
    let admissions = AllocBundle {
        flow_allocs: vec![FlowAlloc {
            flow: Some(fg_marker()),
            hipri_rate_limit_bps: 666_666,
            lopri_rate_limit_bps: 0,
        }],
        gen: 0,
    };
    let config = ClusterAllocatorConfig {
        allocator_type: ClusterAllocatorType::Bwe,
        ..Default::default()
    };
    let allocator = ClusterAllocator::create(&config, &admissions, None);
    Arc::new(FullClusterController::new(aggregator, allocator))
}

fn info_bundle(host_id: u64, demand: i64) -> InfoBundle {
    let mut flow = fg_marker();
    flow.host_id = host_id;
    flow.job = "app".into();
    InfoBundle {
        bundler: Some(FlowMarker {
            host_id,
            ..Default::default()
        }),
        timestamp: Some(Timestamp {
            seconds: 1,
            nanos: 0,
        }),
        flow_infos: vec![FlowInfo {
            flow: Some(flow),
            predicted_demand_bps: demand,
            ewma_usage_bps: demand,
            ..Default::default()
        }],
        gen: 1,
    }
}

#[tokio::test]
async fn host_report_yields_rate_limit() {
    let controller = make_controller();
    let service =
        ClusterAgentService::new(Arc::clone(&controller) as Arc<dyn ClusterController>);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let incoming = tokio_stream::wrappers::TcpListenerStream::new(listener);
    let server = tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(ClusterAgentServer::new(service))
            .serve_with_incoming(incoming)
            .await
    });

    let mut client = ClusterAgentClient::connect(format!("http://{addr}"))
        .await
        .unwrap();

    let (info_tx, info_rx) = tokio::sync::mpsc::channel::<InfoBundle>(4);
    let outbound = tokio_stream::wrappers::ReceiverStream::new(info_rx);
    let mut inbound = client.register_host(outbound).await.unwrap().into_inner();

    info_tx.send(info_bundle(7, 600_000)).await.unwrap();

    // The controller only learns about the host once the server has read
    // the first bundle, so poke the control loop until the alloc arrives.
    let alloc = loop {
        controller.compute_and_broadcast();
        match tokio::time::timeout(std::time::Duration::from_millis(100), inbound.message())
            .await
        {
            Ok(result) => break result.unwrap().unwrap(),
            Err(_) => continue,
        }
    };

    assert_eq!(alloc.flow_allocs.len(), 1);
    let got = &alloc.flow_allocs[0];
    assert_eq!(got.flow().host_id, 7);
    assert_eq!(got.flow().dst_dc, "detroit");
    // Sole child: the waterlevel settles at its own demand.
    assert_eq!(got.hipri_rate_limit_bps, 600_000);
    assert_eq!(got.lopri_rate_limit_bps, 0);

    drop(info_tx);
    assert!(inbound.message().await.unwrap().is_none());
    server.abort();
}
