// SPDX-License-Identifier: Apache-2.0

//! Conversions between wire timestamps and [`chrono`] times.

use chrono::{DateTime, TimeZone, Utc};

use crate::Timestamp;

impl Timestamp {
    /// Builds a wire timestamp from a UTC time.
    pub fn from_datetime(t: DateTime<Utc>) -> Self {
        Self {
            seconds: t.timestamp(),
            nanos: t.timestamp_subsec_nanos() as i32,
        }
    }

    /// Converts to a UTC time. Out-of-range values clamp to the epoch.
    pub fn to_datetime(&self) -> DateTime<Utc> {
        match Utc.timestamp_opt(self.seconds, self.nanos.max(0) as u32) {
            chrono::LocalResult::Single(t) => t,
            _ => DateTime::<Utc>::UNIX_EPOCH,
        }
    }
}
