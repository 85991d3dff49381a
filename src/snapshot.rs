//! Append-only, line-delimited JSON snapshot writer.
//!
//! Each line is `{"Time": <unix-seconds>, "Counters": {<name>: <int>, …}}`.
//! Opened for append at coordinator start and kept open for the Job's
//! duration. Writes go through a plain `std::fs::File` called directly from
//! the coordinator's async tasks — each write is a single small append at a
//! 1Hz cadence, so the brief block on the executor thread is cheap — and a
//! write failure is logged, never fatal.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use serde::Serialize;

use crate::errors::SnapshotError;
use crate::metrics::SNAPSHOT_WRITE_ERRORS_TOTAL;

#[derive(Serialize)]
struct SnapshotLine<'a> {
    #[serde(rename = "Time")]
    time: i64,
    #[serde(rename = "Counters")]
    counters: &'a BTreeMap<String, i64>,
}

pub struct SnapshotWriter {
    file: File,
}

impl SnapshotWriter {
    pub fn open(path: &Path) -> Result<Self, SnapshotError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| SnapshotError::Open {
                path: path.display().to_string(),
                source,
            })?;
        Ok(Self { file })
    }

    /// Writes one snapshot line. `counters` is a plain `HashMap` from the
    /// merge step; sorting into a `BTreeMap` here gives the lexicographic
    /// key order the spec requires for log/snapshot output.
    pub fn write_counters(
        &mut self,
        now_unix_secs: i64,
        counters: impl IntoIterator<Item = (String, i64)>,
    ) -> Result<(), SnapshotError> {
        let sorted: BTreeMap<String, i64> = counters.into_iter().collect();
        let line = SnapshotLine {
            time: now_unix_secs,
            counters: &sorted,
        };
        let serialized = serde_json::to_string(&line).map_err(|source| SnapshotError::Serialize { source })?;

        writeln!(self.file, "{serialized}").map_err(|source| SnapshotError::Write { source })?;
        self.file.flush().map_err(|source| SnapshotError::Write { source })
    }
}

/// Writes a snapshot, logging (not propagating) any failure — the caller's
/// Job continues regardless, per the snapshot-write-error policy.
pub fn write_counters_lenient(
    writer: &mut SnapshotWriter,
    now_unix_secs: i64,
    counters: impl IntoIterator<Item = (String, i64)>,
) {
    if let Err(err) = writer.write_counters(now_unix_secs, counters) {
        tracing::warn!(%err, "failed to write counter snapshot");
        SNAPSHOT_WRITE_ERRORS_TOTAL.inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::BufRead;

    // S3: snapshot format.
    #[test]
    fn snapshot_line_contains_expected_counter() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("counters.txt");
        let mut writer = SnapshotWriter::open(&path).unwrap();

        let mut counters = HashMap::new();
        counters.insert("signalrcore:echo:success".to_string(), 2i64);
        writer.write_counters(1_700_000_000, counters).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let line = contents.lines().next().unwrap();
        assert!(line.contains("\"signalrcore:echo:success\":2"));
        assert!(line.contains("\"Time\":1700000000"));
    }

    #[test]
    fn snapshot_file_is_append_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("counters.txt");

        {
            let mut writer = SnapshotWriter::open(&path).unwrap();
            writer.write_counters(1, HashMap::new()).unwrap();
        }
        {
            let mut writer = SnapshotWriter::open(&path).unwrap();
            writer.write_counters(2, HashMap::new()).unwrap();
        }

        let file = std::fs::File::open(&path).unwrap();
        let lines: Vec<_> = std::io::BufReader::new(file).lines().collect();
        assert_eq!(lines.len(), 2);
    }
}
