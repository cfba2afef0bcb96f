//! Save/load hooks
//!
//! The on-disk model format belongs to the host application. These hooks only
//! name and log the snapshot an agent would write or read.

use std::path::Path;

use time::{OffsetDateTime, format_description};

/// Timestamped snapshot file name, e.g. `value-agent-20261018-101500.model`
pub fn snapshot_name(kind: &str) -> String {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    let stamp = format_description::parse_borrowed::<2>("[year][month][day]-[hour][minute][second]")
        .ok()
        .and_then(|format| now.format(&format).ok())
        .unwrap_or_else(|| now.unix_timestamp().to_string());
    format!("{}-{}.model", kind, stamp)
}

pub fn log_save(kind: &str, path: &Path, parameters: usize) {
    tracing::info!(
        "Save requested for {} ({} parameters) at {}; snapshot {} not written",
        kind,
        parameters,
        path.display(),
        snapshot_name(kind)
    );
}

pub fn log_load(kind: &str, path: &Path) {
    tracing::info!(
        "Load requested for {} from {}; keeping current weights",
        kind,
        path.display()
    );
}
