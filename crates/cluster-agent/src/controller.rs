// SPDX-License-Identifier: Apache-2.0

//! The controller interface shared by the full and fast variants.

use std::sync::Arc;

use heyp_common::ParId;
use heyp_proto::{AllocBundle, FlowMarker, InfoBundle};

/// Callback invoked with each new bundle for a host. Must not block: it runs
/// under the controller's broadcast lock.
pub type OnNewBundle = Arc<dyn Fn(&AllocBundle) + Send + Sync>;

/// A registered listener. Dropping the handle removes the listener from the
/// controller; the controller itself holds no strong reference back.
pub trait ListenerHandle: Send {}

/// A cluster controller: ingests host reports and periodically computes and
/// broadcasts allocations.
pub trait ClusterController: Send + Sync + 'static {
    /// Ingests one report from the identified bundler.
    fn update_info(&self, bundler_id: ParId, info: &InfoBundle);

    /// Runs one control tick: aggregate, allocate, broadcast.
    fn compute_and_broadcast(&self);

    /// Registers a listener for the host's alloc bundles.
    fn register_listener(&self, host_id: u64, on_new_bundle: OnNewBundle) -> Box<dyn ListenerHandle>;

    /// Resolves the stable id of a bundler.
    fn get_bundler_id(&self, bundler: &FlowMarker) -> ParId;
}
