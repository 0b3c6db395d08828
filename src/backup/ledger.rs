//! Names of the marker files that record sizes next to the backed up data.
//!
//! The remote keeps one `latest` directory plus one directory per older version, named after the
//! timestamp of the run that produced it. Empty marker files carry the bookkeeping:
//! `<name>_<version>_size_<bytes>` inside a version directory and
//! `<name>_<timestamp>_transferred_<bytes>` next to `latest`.

use derive_more::Display;
use snafu::{OptionExt, ResultExt, Snafu};
use time::PrimitiveDateTime;

use crate::ext::parse_timestamp;

pub const LATEST_DIR: &str = "latest";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum MarkerKind {
    #[display("size")]
    Size,
    #[display("transferred")]
    Transferred,
}

/// Local artifact of a run, e.g. `home_2024-03-01-184500_scout.log`.
pub fn artifact_name(backup: &str, timestamp: &str, label: &str, extension: &str) -> String {
    format!("{backup}_{timestamp}_{label}.{extension}")
}

pub fn marker_name(backup: &str, version: &str, kind: MarkerKind, bytes: u64) -> String {
    format!("{backup}_{version}_{kind}_{bytes}")
}

/// `(version, bytes)` of a marker file; a leading directory is ignored.
pub fn parse_marker(path: &str, kind: MarkerKind) -> Result<(String, u64), LedgerError> {
    let file_name = path.rsplit('/').next().unwrap_or(path);
    let mut parts = file_name.rsplitn(4, '_');
    let (Some(bytes), Some(label), Some(version), Some(_backup)) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return MalformedMarkerSnafu { file: path }.fail();
    };
    if label != kind.to_string() {
        return MalformedMarkerSnafu { file: path }.fail();
    }
    let bytes = bytes
        .parse()
        .ok()
        .context(MalformedMarkerSnafu { file: path })?;
    Ok((version.to_string(), bytes))
}

/// Include filter matching the sync log of a run, whatever its timestamp.
pub fn sync_log_pattern(backup: &str) -> String {
    format!("/{backup}_*_sync.log")
}

/// Timestamp embedded in a sync log name like `home_2024-03-01-184500_sync.log`.
pub fn timestamp_from_log(log_name: &str) -> Result<&str, LedgerError> {
    let mut parts = log_name.rsplitn(3, '_');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(_), Some(timestamp), Some(_)) => Ok(timestamp),
        _ => MalformedMarkerSnafu { file: log_name }.fail(),
    }
}

pub fn parse_log_timestamp(log_name: &str) -> Result<PrimitiveDateTime, LedgerError> {
    let timestamp = timestamp_from_log(log_name)?;
    parse_timestamp(timestamp).context(InvalidTimestampSnafu { file: log_name })
}

/// Include filter for every artifact a run left next to its sync log.
pub fn run_artifacts_pattern(log_name: &str) -> String {
    let prefix = log_name.strip_suffix("sync.log").unwrap_or(log_name);
    format!("/{prefix}*")
}

#[derive(Debug, Snafu)]
pub enum LedgerError {
    #[snafu(display("Unexpected file name '{file}' in the backup ledger"))]
    MalformedMarker { file: String },
    #[snafu(display("File '{file}' does not carry a valid timestamp"))]
    InvalidTimestamp {
        file: String,
        source: time::error::Parse,
    },
}
