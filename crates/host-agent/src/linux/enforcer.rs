// SPDX-License-Identifier: Apache-2.0

//! The Linux host enforcer.
//!
//! State: one HTB root qdisc (`1:`, default class 0) on the outbound
//! device; per (FG, priority) an HTB class `1:N` carrying that side's rate
//! limit; iptables rules in mangle/OUTPUT steering each matched host flow
//! into its class and DSCP.
//!
//! Allocations apply in three phases so flows are never transiently
//! under-limited:
//!
//! 1. create missing classes and raise rate limits
//! 2. commit the iptables diff (classification + DSCP)
//! 3. lower the remaining rate limits
//!
//! If phase 2 fails, phase 3 is skipped: lowering limits for flows whose
//! rules were not updated would under-limit them.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use heyp_proto::marker::FlowKey;
use heyp_proto::{AllocBundle, FlowAlloc, FlowMarker};
use parking_lot::Mutex;
use tracing::{error, warn};

use super::iptables;
use super::tc::TcCaller;
use crate::enforcer::{HostEnforcer, MatchedHostFlows};

/// DSCP for high-priority traffic. Literal; must match across deployments.
pub const DSCP_HIPRI: &str = "AF41";
/// DSCP for low-priority traffic. Literal; must match across deployments.
pub const DSCP_LOPRI: &str = "AF31";

/// Matches a FlowAlloc to the host flows it governs.
pub type MatchHostFlowsFn = Arc<dyn Fn(&FlowAlloc) -> MatchedHostFlows + Send + Sync>;

#[derive(Clone, Debug, Default)]
struct PrioritySys {
    class_id: String,
    cur_rate_limit_bps: i64,
    did_create_class: bool,
    update_after_ipt_change: bool,
}

#[derive(Clone, Debug, Default)]
struct FlowSys {
    hipri: PrioritySys,
    lopri: PrioritySys,
}

struct EnforceState {
    ipt: iptables::Controller,
    sys_info: HashMap<FlowKey, FlowSys>, // entries are never deleted
    next_class_id: i32,
}

/// See the module docs.
pub struct LinuxHostEnforcer {
    device: String,
    match_host_flows: MatchHostFlowsFn,
    tc: TcCaller,
    state: tokio::sync::Mutex<EnforceState>,
    // Kept outside `state` so the flow reporter can query QoS without
    // waiting on an enforcement pass.
    applied_settings: Arc<Mutex<iptables::SettingBatch>>,
}

fn assert_valid_port(port32: i32) -> u16 {
    u16::try_from(port32).unwrap_or_else(|_| {
        warn!(port = port32, "port out of range; matching any");
        0
    })
}

impl LinuxHostEnforcer {
    /// Creates an enforcer for `device`.
    pub fn new(
        device: impl Into<String>,
        dscps_to_ignore_class_id: Vec<String>,
        match_host_flows: MatchHostFlowsFn,
    ) -> Self {
        let device = device.into();
        Self {
            tc: TcCaller::default(),
            state: tokio::sync::Mutex::new(EnforceState {
                ipt: iptables::Controller::new(
                    device.clone(),
                    dscps_to_ignore_class_id,
                    iptables::Runner::default(),
                ),
                sys_info: HashMap::new(),
                next_class_id: 2,
            }),
            applied_settings: Arc::new(Mutex::new(iptables::SettingBatch::default())),
            match_host_flows,
            device,
        }
    }

    /// Resets the device: recreates the root qdisc and flushes the mangle
    /// table.
    pub async fn reset_device_config(&self) -> Result<(), String> {
        let mut state = self.state.lock().await;
        // Deleting a missing qdisc fails; that is fine.
        let _ = self
            .tc
            .call(&["qdisc", "delete", "dev", &self.device, "root"])
            .await;
        self.tc
            .call(&[
                "qdisc", "add", "dev", &self.device, "root", "handle", "1:", "htb", "default",
                "0",
            ])
            .await
            .map_err(|e| format!("failed to reset traffic control: {e}"))?;
        state
            .ipt
            .clear()
            .await
            .map_err(|e| format!("failed to reset iptables: {e}"))?;
        self.applied_settings.lock().settings.clear();
        Ok(())
    }

    async fn update_traffic_control_for_flow(
        &self,
        rate_limit_bps: i64,
        next_class_id: &mut i32,
        sys: &mut PrioritySys,
    ) -> Result<(), String> {
        let rate_limit_mbps = rate_limit_bps as f64 / (1024.0 * 1024.0);
        let rate = format!("{rate_limit_mbps}mbit");

        if sys.class_id.is_empty() {
            sys.class_id = format!("1:{}", *next_class_id);
            *next_class_id += 1;
        }

        let verb = if sys.did_create_class { "change" } else { "add" };
        let result = self
            .tc
            .call(&[
                "class",
                verb,
                "dev",
                &self.device,
                "parent",
                "1:",
                "classid",
                &sys.class_id,
                "htb",
                "rate",
                &rate,
            ])
            .await;
        match result {
            Ok(_) => {
                sys.did_create_class = true;
                Ok(())
            }
            Err(e) => Err(format!("failed to {verb} tc class: {e}")),
        }
    }

    fn stage_iptables_for_flow(
        ipt: &mut iptables::Controller,
        matched_flows: &[FlowMarker],
        dscp: &str,
        class_id: &str,
    ) {
        if matched_flows.is_empty() {
            return;
        }
        debug_assert!(
            !class_id.is_empty(),
            "class_id must be set before staging iptables rules"
        );
        for f in matched_flows {
            ipt.stage(iptables::Setting {
                src_port: assert_valid_port(f.src_port),
                dst_port: assert_valid_port(f.dst_port),
                dst_addr: f.dst_addr.clone(),
                class_id: class_id.to_string(),
                dscp: dscp.to_string(),
            });
        }
    }
}

#[async_trait]
impl HostEnforcer for LinuxHostEnforcer {
    async fn enforce_allocs(&self, bundle: &AllocBundle) {
        let mut state = self.state.lock().await;
        let state = &mut *state;

        // Phase 1: create rate limiters for (FG, priority) pairs that need
        // one and raise rate limits; defer decreases.
        for flow_alloc in &bundle.flow_allocs {
            let matched = (self.match_host_flows)(flow_alloc);
            let sys = state
                .sys_info
                .entry(FlowKey::from(flow_alloc.flow()))
                .or_default();

            let mut st = Ok(());

            let must_create = sys.hipri.class_id.is_empty() && !matched.hipri.is_empty();
            if must_create || flow_alloc.hipri_rate_limit_bps > sys.hipri.cur_rate_limit_bps {
                st = self
                    .update_traffic_control_for_flow(
                        flow_alloc.hipri_rate_limit_bps,
                        &mut state.next_class_id,
                        &mut sys.hipri,
                    )
                    .await;
                sys.hipri.update_after_ipt_change = false;
            } else if flow_alloc.hipri_rate_limit_bps < sys.hipri.cur_rate_limit_bps {
                sys.hipri.update_after_ipt_change = true;
            }
            sys.hipri.cur_rate_limit_bps = flow_alloc.hipri_rate_limit_bps;

            let must_create = sys.lopri.class_id.is_empty() && !matched.lopri.is_empty();
            if must_create || flow_alloc.lopri_rate_limit_bps > sys.lopri.cur_rate_limit_bps {
                let st2 = self
                    .update_traffic_control_for_flow(
                        flow_alloc.lopri_rate_limit_bps,
                        &mut state.next_class_id,
                        &mut sys.lopri,
                    )
                    .await;
                st = st.and(st2);
                sys.lopri.update_after_ipt_change = false;
            } else if flow_alloc.lopri_rate_limit_bps < sys.lopri.cur_rate_limit_bps {
                sys.lopri.update_after_ipt_change = true;
            }
            sys.lopri.cur_rate_limit_bps = flow_alloc.lopri_rate_limit_bps;

            if let Err(e) = st {
                error!(alloc = ?flow_alloc, error = %e, "failed to increase rate limits for flow");
                warn!("will not change iptables config for flow");
                continue;
            }

            Self::stage_iptables_for_flow(
                &mut state.ipt,
                &matched.hipri,
                DSCP_HIPRI,
                &sys.hipri.class_id,
            );
            Self::stage_iptables_for_flow(
                &mut state.ipt,
                &matched.lopri,
                DSCP_LOPRI,
                &sys.lopri.class_id,
            );
        }

        // Phase 2: commit the iptables diff.
        if let Err(e) = state.ipt.commit_changes().await {
            error!(error = %e, "failed to commit iptables config");
            warn!("will not decrease rate limits");
            *self.applied_settings.lock() = state.ipt.applied_settings().clone();
            return;
        }
        *self.applied_settings.lock() = state.ipt.applied_settings().clone();

        // Phase 3: apply the deferred rate decreases.
        for flow_alloc in &bundle.flow_allocs {
            let Some(sys) = state.sys_info.get_mut(&FlowKey::from(flow_alloc.flow()))
            else {
                continue;
            };
            let mut st = Ok(());
            if sys.hipri.update_after_ipt_change {
                st = self
                    .update_traffic_control_for_flow(
                        sys.hipri.cur_rate_limit_bps,
                        &mut state.next_class_id,
                        &mut sys.hipri,
                    )
                    .await;
                sys.hipri.update_after_ipt_change = false;
            }
            if sys.lopri.update_after_ipt_change {
                let st2 = self
                    .update_traffic_control_for_flow(
                        sys.lopri.cur_rate_limit_bps,
                        &mut state.next_class_id,
                        &mut sys.lopri,
                    )
                    .await;
                st = st.and(st2);
                sys.lopri.update_after_ipt_change = false;
            }
            if let Err(e) = st {
                error!(alloc = ?flow_alloc, error = %e, "failed to reduce rate limits for flow");
            }
        }
    }

    fn is_lopri(&self, flow: &FlowMarker) -> bool {
        let applied = self.applied_settings.lock();
        iptables::settings_find_dscp(
            &applied,
            assert_valid_port(flow.src_port),
            assert_valid_port(flow.dst_port),
            &flow.dst_addr,
            DSCP_HIPRI,
        ) == DSCP_LOPRI
    }
}
