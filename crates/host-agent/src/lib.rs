// SPDX-License-Identifier: Apache-2.0

//! The HEYP host-agent.
//!
//! A per-host process that observes outbound TCP socket state via an
//! `ss`-compatible inspector ([`ss_reporter`]), tracks per-flow usage
//! ([`flow_tracker`]), reports host-flow aggregates to the cluster-agent
//! ([`daemon`]), and enforces the returned rate limits and QoS marks with
//! Linux traffic control and Netfilter ([`linux`]).

pub mod daemon;
pub mod enforcer;
pub mod flow_tracker;
pub mod linux;
pub mod ss_parser;
pub mod ss_reporter;

pub use enforcer::{HostEnforcer, NopHostEnforcer};
pub use flow_tracker::FlowTracker;
