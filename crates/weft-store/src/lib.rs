//! SQLite-backed persistence for weft.
//!
//! `SqliteStore` implements every persistence trait the engine and the
//! telemetry loops need. `SqliteQueue` is a durable job queue over the same
//! kind of database; both can share one file (WAL mode).
//!
//! Aggregates (daily costs, metric counters, pin usage) are updated with
//! single `INSERT .. ON CONFLICT DO UPDATE` or `UPDATE .. SET x = x + ?`
//! statements so concurrent writers never lose increments.

mod alerts;
mod queue;
mod schema;
mod store;
mod telemetry;

pub use queue::SqliteQueue;
pub use store::SqliteStore;

use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use weft_core::error::WeftError;

pub(crate) fn db_err(e: rusqlite::Error) -> WeftError {
    WeftError::Database(e.to_string())
}

/// Fixed-width RFC 3339 (millisecond precision, `Z`), so stored timestamps
/// compare correctly as text.
pub(crate) fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_ts(s: &str) -> weft_core::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| WeftError::Database(format!("bad timestamp '{}': {}", s, e)))
}

pub(crate) fn parse_opt_ts(s: Option<String>) -> weft_core::Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

pub(crate) fn parse_enum<T: FromStr<Err = String>>(s: &str) -> weft_core::Result<T> {
    s.parse().map_err(WeftError::Database)
}

pub(crate) fn parse_json<T: serde::de::DeserializeOwned>(s: &str) -> weft_core::Result<T> {
    serde_json::from_str(s).map_err(WeftError::from)
}

pub(crate) fn parse_opt_json(s: Option<String>) -> weft_core::Result<Option<serde_json::Value>> {
    s.as_deref().map(parse_json).transpose()
}
