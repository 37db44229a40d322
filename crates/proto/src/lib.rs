// SPDX-License-Identifier: Apache-2.0

//! Wire types and gRPC stubs for the HEYP control plane.
//!
//! The message and service definitions live in `proto/heyp/v1/heyp.proto`;
//! the generated code is vendored in `src/heyp.v1.rs` (see `build.rs` for how
//! to regenerate it). Hand-written helpers on top of the generated types
//! (flow-marker views, map keys, comparisons, timestamp conversions) live in
//! [`marker`] and [`timestamp`].

#[allow(unused_qualifications, rustdoc::invalid_html_tags)]
#[path = "heyp.v1.rs"]
pub mod v1;

pub mod marker;
pub mod timestamp;

pub use v1::{
    AllocBundle, FlowAlloc, FlowInfo, FlowMarker, InfoBundle, Protocol, Timestamp,
    flow_info::AuxInfo,
};
