//! # Repository Module
//!
//! One repository per table, reached through the [`Database`](crate::Database)
//! accessors. Instants are stored as INTEGER epoch milliseconds.

pub mod event_queue;
pub mod lifecycle;
pub mod membership;
pub mod provider_events;
pub mod zone_cache;

use chrono::{DateTime, Utc};

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.and_then(DateTime::from_timestamp_millis)
}
