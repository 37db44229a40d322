// SPDX-License-Identifier: Apache-2.0

//! The host enforcer interface.

use async_trait::async_trait;
use heyp_flows::StaticDCMapper;
use heyp_proto::{AllocBundle, FlowAlloc, FlowMarker};
use tracing::{debug, error};

/// Host flows matched by a [`FlowAlloc`], split by the priority they should
/// use.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MatchedHostFlows {
    /// Flows to run at high priority.
    pub hipri: Vec<FlowMarker>,
    /// Flows to run at low priority.
    pub lopri: Vec<FlowMarker>,
}

/// Expands a FlowAlloc into matched host flows under single-priority
/// enforcement: an alloc with a positive LOPRI limit must have a zero HIPRI
/// limit, and all matched flows take the LOPRI side.
///
/// An alloc whose flow has no dst_addr expands to one host-flow per host of
/// the destination DC in the static mapping.
pub fn expand_dest_into_hosts_single_pri(
    dc_mapper: &StaticDCMapper,
    flow_alloc: &FlowAlloc,
) -> MatchedHostFlows {
    let mut matched = MatchedHostFlows::default();
    let use_lopri = flow_alloc.lopri_rate_limit_bps > 0;
    if use_lopri {
        debug_assert_eq!(
            flow_alloc.hipri_rate_limit_bps, 0,
            "single-priority expansion cannot accept both positive hipri and lopri rate limits"
        );
    }
    let flow = flow_alloc.flow();
    let expanded = if use_lopri {
        &mut matched.lopri
    } else {
        &mut matched.hipri
    };
    if flow.dst_addr.is_empty() {
        match dc_mapper.hosts_for_dc(&flow.dst_dc) {
            None => error!(dst_dc = %flow.dst_dc, "no hosts match DC"),
            Some(hosts) => {
                expanded.reserve(hosts.len());
                for host in hosts {
                    let mut f = flow.clone();
                    f.dst_addr = host.clone();
                    expanded.push(f);
                }
            }
        }
    } else {
        expanded.push(flow.clone());
    }
    matched
}

/// Applies alloc bundles to the host and answers QoS queries from the flow
/// reporter.
#[async_trait]
pub trait HostEnforcer: Send + Sync {
    /// Applies one bundle. Failures are logged and leave unrelated FGs
    /// untouched.
    async fn enforce_allocs(&self, bundle: &AllocBundle);

    /// Whether the enforcer currently marks this flow LOPRI.
    fn is_lopri(&self, flow: &FlowMarker) -> bool;
}

/// An enforcer that does nothing; keeps the telemetry path running when
/// enforcement is disabled.
#[derive(Debug, Default)]
pub struct NopHostEnforcer;

#[async_trait]
impl HostEnforcer for NopHostEnforcer {
    async fn enforce_allocs(&self, bundle: &AllocBundle) {
        debug!(num_allocs = bundle.flow_allocs.len(), "nop enforcer: ignoring allocs");
    }

    fn is_lopri(&self, _flow: &FlowMarker) -> bool {
        false
    }
}
