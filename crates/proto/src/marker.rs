// SPDX-License-Identifier: Apache-2.0

//! Flow-marker views and map keys.
//!
//! A [`FlowMarker`] identifies a flow at connection granularity. The control
//! plane mostly works on coarser views of the marker:
//!
//! - cluster-flow: `(src_dc, dst_dc)` — one entry per flow group (FG)
//! - host-flow: `(src_dc, dst_dc, job, host_id)` — one entry per host per FG
//! - conn-flow: the full tuple, including the seqnum disambiguator
//!
//! Each view has an owned key type suitable for use in hash maps, plus a
//! projection that clears the fields outside the view.

use std::sync::OnceLock;

use crate::{FlowAlloc, FlowInfo, FlowMarker, InfoBundle};

/// Returns a marker with every field cleared, equivalent to the projection of
/// any marker onto the empty view.
pub fn empty_marker() -> &'static FlowMarker {
    static EMPTY: OnceLock<FlowMarker> = OnceLock::new();
    EMPTY.get_or_init(FlowMarker::default)
}

/// Projects a marker onto the cluster-flow view: only `(src_dc, dst_dc)`
/// survive.
pub fn to_cluster_flow(flow: &FlowMarker) -> FlowMarker {
    FlowMarker {
        src_dc: flow.src_dc.clone(),
        dst_dc: flow.dst_dc.clone(),
        ..Default::default()
    }
}

/// Projects a marker onto the host-flow view: `(src_dc, dst_dc, job,
/// host_id)` survive.
pub fn to_host_flow(flow: &FlowMarker) -> FlowMarker {
    FlowMarker {
        src_dc: flow.src_dc.clone(),
        dst_dc: flow.dst_dc.clone(),
        job: flow.job.clone(),
        host_id: flow.host_id,
        ..Default::default()
    }
}

/// Owned key for the cluster-flow view.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClusterFlowKey {
    /// Source datacenter.
    pub src_dc: String,
    /// Destination datacenter.
    pub dst_dc: String,
}

impl From<&FlowMarker> for ClusterFlowKey {
    fn from(flow: &FlowMarker) -> Self {
        Self {
            src_dc: flow.src_dc.clone(),
            dst_dc: flow.dst_dc.clone(),
        }
    }
}

/// Owned key for the host-flow view.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct HostFlowKey {
    /// Source datacenter.
    pub src_dc: String,
    /// Destination datacenter.
    pub dst_dc: String,
    /// Job name, may be empty.
    pub job: String,
    /// Host identifier.
    pub host_id: u64,
}

impl From<&FlowMarker> for HostFlowKey {
    fn from(flow: &FlowMarker) -> Self {
        Self {
            src_dc: flow.src_dc.clone(),
            dst_dc: flow.dst_dc.clone(),
            job: flow.job.clone(),
            host_id: flow.host_id,
        }
    }
}

/// Owned key for the conn-flow view (the full marker).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FlowKey {
    /// Source datacenter.
    pub src_dc: String,
    /// Destination datacenter.
    pub dst_dc: String,
    /// Job name, may be empty.
    pub job: String,
    /// Host identifier.
    pub host_id: u64,
    /// Source address.
    pub src_addr: String,
    /// Destination address.
    pub dst_addr: String,
    /// Transport protocol (raw wire value).
    pub protocol: i32,
    /// Source port.
    pub src_port: i32,
    /// Destination port.
    pub dst_port: i32,
    /// Tuple-reuse disambiguator.
    pub seqnum: u64,
}

impl From<&FlowMarker> for FlowKey {
    fn from(flow: &FlowMarker) -> Self {
        Self {
            src_dc: flow.src_dc.clone(),
            dst_dc: flow.dst_dc.clone(),
            job: flow.job.clone(),
            host_id: flow.host_id,
            src_addr: flow.src_addr.clone(),
            dst_addr: flow.dst_addr.clone(),
            protocol: flow.protocol,
            src_port: flow.src_port,
            dst_port: flow.dst_port,
            seqnum: flow.seqnum,
        }
    }
}

/// Selects which marker fields participate in [`is_same_flow`].
#[derive(Clone, Copy, Debug)]
pub struct CompareFlowOptions {
    /// Compare `(src_dc, dst_dc)`.
    pub cmp_fg: bool,
    /// Compare the job name.
    pub cmp_job: bool,
    /// Compare the host id.
    pub cmp_src_host: bool,
    /// Compare addresses, protocol, and ports.
    pub cmp_conn: bool,
    /// Compare the seqnum.
    pub cmp_seqnum: bool,
}

impl Default for CompareFlowOptions {
    fn default() -> Self {
        Self {
            cmp_fg: true,
            cmp_job: true,
            cmp_src_host: true,
            cmp_conn: true,
            cmp_seqnum: true,
        }
    }
}

/// Compares two markers on the fields selected by `opt`.
pub fn is_same_flow(lhs: &FlowMarker, rhs: &FlowMarker, opt: CompareFlowOptions) -> bool {
    if opt.cmp_fg && (lhs.src_dc != rhs.src_dc || lhs.dst_dc != rhs.dst_dc) {
        return false;
    }
    if opt.cmp_job && lhs.job != rhs.job {
        return false;
    }
    if opt.cmp_src_host && lhs.host_id != rhs.host_id {
        return false;
    }
    if opt.cmp_conn
        && (lhs.src_addr != rhs.src_addr
            || lhs.dst_addr != rhs.dst_addr
            || lhs.protocol != rhs.protocol
            || lhs.src_port != rhs.src_port
            || lhs.dst_port != rhs.dst_port)
    {
        return false;
    }
    if opt.cmp_seqnum && lhs.seqnum != rhs.seqnum {
        return false;
    }
    true
}

/// True when the marker names a complete host-flow: FG and host id set, and
/// no connection-level fields present.
pub fn is_host_flow(flow: &FlowMarker) -> bool {
    !flow.src_dc.is_empty()
        && !flow.dst_dc.is_empty()
        && flow.host_id != 0
        && flow.src_addr.is_empty()
        && flow.dst_addr.is_empty()
        && flow.src_port == 0
        && flow.dst_port == 0
        && flow.seqnum == 0
}

/// True when the marker names a complete cluster-flow: FG set and nothing
/// finer present.
pub fn is_cluster_flow(flow: &FlowMarker) -> bool {
    !flow.src_dc.is_empty()
        && !flow.dst_dc.is_empty()
        && flow.host_id == 0
        && flow.job.is_empty()
        && flow.src_addr.is_empty()
        && flow.dst_addr.is_empty()
        && flow.src_port == 0
        && flow.dst_port == 0
        && flow.seqnum == 0
}

impl FlowInfo {
    /// The flow marker, or an empty marker when unset.
    pub fn flow(&self) -> &FlowMarker {
        self.flow.as_ref().unwrap_or_else(|| empty_marker())
    }
}

impl FlowAlloc {
    /// The flow marker, or an empty marker when unset.
    pub fn flow(&self) -> &FlowMarker {
        self.flow.as_ref().unwrap_or_else(|| empty_marker())
    }
}

impl InfoBundle {
    /// The bundler identity, or an empty marker when unset.
    pub fn bundler(&self) -> &FlowMarker {
        self.bundler.as_ref().unwrap_or_else(|| empty_marker())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn_marker() -> FlowMarker {
        FlowMarker {
            src_dc: "chicago".into(),
            dst_dc: "detroit".into(),
            job: "video".into(),
            host_id: 7,
            src_addr: "10.0.0.1".into(),
            dst_addr: "10.1.0.9".into(),
            protocol: crate::Protocol::ProtoTcp as i32,
            src_port: 2000,
            dst_port: 443,
            seqnum: 3,
        }
    }

    #[test]
    fn views_clear_finer_fields() {
        let m = conn_marker();
        let cluster = to_cluster_flow(&m);
        assert_eq!(cluster.src_dc, "chicago");
        assert_eq!(cluster.dst_dc, "detroit");
        assert!(is_cluster_flow(&cluster));

        let host = to_host_flow(&m);
        assert_eq!(host.host_id, 7);
        assert_eq!(host.job, "video");
        assert!(is_host_flow(&host));
        assert!(!is_cluster_flow(&host));
    }

    #[test]
    fn same_flow_per_view() {
        let a = conn_marker();
        let mut b = conn_marker();
        b.seqnum = 4;
        b.src_port = 2001;

        let fg_only = CompareFlowOptions {
            cmp_fg: true,
            cmp_job: false,
            cmp_src_host: false,
            cmp_conn: false,
            cmp_seqnum: false,
        };
        assert!(is_same_flow(&a, &b, fg_only));
        assert!(!is_same_flow(&a, &b, CompareFlowOptions::default()));
    }

    #[test]
    fn keys_project_consistently() {
        let a = conn_marker();
        let ka = ClusterFlowKey::from(&a);
        let kb = ClusterFlowKey::from(&to_cluster_flow(&a));
        assert_eq!(ka, kb);

        let ha = HostFlowKey::from(&a);
        let hb = HostFlowKey::from(&to_host_flow(&a));
        assert_eq!(ha, hb);
    }
}
