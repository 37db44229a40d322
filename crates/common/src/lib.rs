// SPDX-License-Identifier: Apache-2.0

//! Shared support code for the HEYP agents: a fixed worker pool with task
//! groups, a parallel indexed map for partitioning per-host state, a mutex
//! that warns on long acquisitions, and an NDJSON record writer.

pub mod executor;
pub mod ndjson;
pub mod par_indexed_map;
pub mod timed_mutex;

pub use executor::{Executor, TaskGroup};
pub use ndjson::NdjsonLogger;
pub use par_indexed_map::{GetResult, ParId, ParIndexedMap};
pub use timed_mutex::TimedMutex;
