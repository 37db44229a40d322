// SPDX-License-Identifier: Apache-2.0

//! The HEYP cluster-agent.
//!
//! One cluster-agent runs per source cluster. It ingests [`InfoBundle`]s
//! from host-agents over a bidirectional gRPC stream, aggregates them per
//! flow group, computes HIPRI/LOPRI admissions and per-host rate limits, and
//! pushes [`AllocBundle`]s back out.
//!
//! Two controller variants exist: [`full_controller::FullClusterController`]
//! (aggregator → per-FG allocator → bundle-by-host → broadcast) and
//! [`fast_controller::FastClusterController`] (sampling aggregator, hashing
//! downgrade, diff broadcast) for very large fleets.
//!
//! [`InfoBundle`]: heyp_proto::InfoBundle
//! [`AllocBundle`]: heyp_proto::AllocBundle

pub mod allocator;
pub mod controller;
pub mod fast_aggregator;
pub mod fast_controller;
pub mod full_controller;
pub mod per_agg;
pub mod server;

pub use controller::{ClusterController, ListenerHandle, OnNewBundle};
