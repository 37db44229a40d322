// SPDX-License-Identifier: Apache-2.0

//! Drives the per-FG allocators across a worker pool and groups the results
//! into per-host bundles.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use heyp_common::{Executor, NdjsonLogger, TaskGroup};
use heyp_config::ClusterAllocatorConfig;
use heyp_flows::AggInfo;
use heyp_proto::{AllocBundle, FlowAlloc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

use crate::per_agg::{self, DebugState, PerAggAllocator};

const NUM_ALLOC_CORES: usize = 8;

/// Partial allocation lists, one per FG handled this tick.
#[derive(Clone, Debug, Default)]
pub struct AllocSet {
    /// One inner vector per aggregate.
    pub partial_sets: Vec<Vec<FlowAlloc>>,
}

/// One NDJSON line of allocation debugging output.
#[derive(Debug, Serialize)]
pub struct DebugAllocRecord {
    /// Allocation time (RFC 3339).
    pub timestamp: String,
    /// The aggregate the allocator saw.
    pub info: AggInfo,
    /// The allocations it produced.
    pub flow_allocs: Vec<FlowAlloc>,
    /// Internal allocator state for this decision.
    pub debug_state: DebugState,
}

/// Runs the configured per-FG allocator for every aggregate of a tick.
pub struct ClusterAllocator {
    alloc: Arc<dyn PerAggAllocator>,
    // Declared before `exec`: an open task group holds a sender into the
    // worker pool, and the pool joins its workers on drop.
    group: Mutex<Option<TaskGroup>>,
    exec: Executor,
    allocs: Arc<Mutex<AllocSet>>,
    recorder: Option<Arc<Mutex<NdjsonLogger>>>,
}

impl ClusterAllocator {
    /// Creates the allocator selected by `config`, seeded with the
    /// cluster-wide admissions.
    pub fn create(
        config: &ClusterAllocatorConfig,
        cluster_wide_allocs: &AllocBundle,
        recorder: Option<NdjsonLogger>,
    ) -> Self {
        let alloc = per_agg::create_allocator(config, cluster_wide_allocs);
        Self {
            alloc,
            exec: Executor::new(NUM_ALLOC_CORES, "cluster-alloc"),
            group: Mutex::new(None),
            allocs: Arc::new(Mutex::new(AllocSet::default())),
            recorder: recorder.map(|r| Arc::new(Mutex::new(r))),
        }
    }

    /// Starts a new tick: clears collected allocations.
    pub fn reset(&self) {
        let mut group = self.group.lock();
        *group = Some(self.exec.new_task_group());
        self.allocs.lock().partial_sets.clear();
    }

    /// Hands one aggregate to the allocator, asynchronously.
    pub fn add_info(&self, time: DateTime<Utc>, info: AggInfo) {
        let group = self.group.lock();
        let group = group.as_ref().expect("reset() must be called before add_info()");
        let alloc = Arc::clone(&self.alloc);
        let allocs = Arc::clone(&self.allocs);
        let recorder = self.recorder.clone();
        group.add_task_no_status(move || {
            let mut debug_state = DebugState::default();
            let a = alloc.alloc_agg(time, &info, &mut debug_state);
            if let Some(recorder) = recorder {
                let record = DebugAllocRecord {
                    timestamp: time.to_rfc3339(),
                    info,
                    flow_allocs: a.clone(),
                    debug_state,
                };
                if let Err(e) = recorder.lock().write(&record) {
                    warn!(error = %e, "failed to log allocation record");
                }
            }
            allocs.lock().partial_sets.push(a);
        });
    }

    /// Waits for all pending aggregates and returns this tick's allocations.
    pub fn get_allocs(&self) -> AllocSet {
        let group = self.group.lock().take();
        if let Some(group) = group {
            group.wait_all_no_status();
        }
        self.allocs.lock().clone()
    }
}

/// Groups an [`AllocSet`] into one [`AllocBundle`] per host.
pub fn bundle_by_host(allocs: AllocSet) -> HashMap<u64, AllocBundle> {
    let mut by_host: HashMap<u64, AllocBundle> = HashMap::new();
    for set in allocs.partial_sets {
        for alloc in set {
            let host_id = alloc.flow().host_id;
            by_host.entry(host_id).or_default().flow_allocs.push(alloc);
        }
    }
    by_host
}
