// SPDX-License-Identifier: Apache-2.0

//! The Linux enforcer: HTB classes via `tc` and packet classification /
//! DSCP marking via `iptables-restore` against the mangle table.

pub mod enforcer;
pub mod iptables;
pub mod tc;

pub use enforcer::LinuxHostEnforcer;
