//! Point-in-time snapshot files.
//!
//! Each snapshot is a versioned file `snapshot.<unix-ms>` in the data
//! directory, holding the full state image plus the capture timestamp.
//! Writes go to a `.tmp` file first and are atomically renamed on
//! completion, so a partial snapshot never corrupts an existing one.
//! Restore picks the newest file and drops entries whose remaining TTL
//! is already spent.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use vesper_core::StateEntry;

use crate::format::{self, FormatError};
use crate::record;

/// Filename prefix for snapshot files.
const SNAPSHOT_PREFIX: &str = "snapshot.";

/// Writes a snapshot of `state` captured at `unix_ms`. Returns the
/// final file path.
pub fn write_snapshot(
    data_dir: &Path,
    unix_ms: i64,
    state: &[StateEntry],
) -> Result<PathBuf, FormatError> {
    fs::create_dir_all(data_dir)?;
    let final_path = data_dir.join(format!("{SNAPSHOT_PREFIX}{unix_ms}"));
    let tmp_path = final_path.with_extension("tmp");

    let file = File::create(&tmp_path)?;
    let mut writer = BufWriter::new(file);
    record::write_state_file(&mut writer, format::SNAP_MAGIC, unix_ms, state)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    fs::rename(&tmp_path, &final_path)?;
    Ok(final_path)
}

/// Finds the newest snapshot file in the data directory.
pub fn latest_snapshot(data_dir: &Path) -> Result<Option<PathBuf>, FormatError> {
    let entries = match fs::read_dir(data_dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut best: Option<(i64, PathBuf)> = None;
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(ts) = name.strip_prefix(SNAPSHOT_PREFIX) else {
            continue;
        };
        let Ok(ts) = ts.parse::<i64>() else { continue };
        if best.as_ref().is_none_or(|(t, _)| ts > *t) {
            best = Some((ts, entry.path()));
        }
    }
    Ok(best.map(|(_, p)| p))
}

/// Reads a snapshot file, rebasing TTLs against `now_unix_ms` and
/// filtering entries that have expired since capture. Returns the
/// capture timestamp alongside the surviving entries.
pub fn read_snapshot(
    path: &Path,
    now_unix_ms: i64,
) -> Result<(i64, Vec<StateEntry>), FormatError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let (captured, entries) = record::read_state_file(&mut reader, format::SNAP_MAGIC)?;
    Ok((
        captured,
        record::filter_expired(entries, captured, now_unix_ms),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use vesper_core::{SortedSet, Value};

    fn temp_dir() -> tempfile::TempDir {
        tempfile::tempdir().expect("create temp dir")
    }

    fn sample_state() -> Vec<StateEntry> {
        vec![
            StateEntry {
                key: "plain".into(),
                value: Value::Str(Bytes::from("data")),
                remaining_ttl_ms: -1,
            },
            StateEntry {
                key: "board".into(),
                value: Value::SortedSet(Box::new(SortedSet::from_members([
                    (1.0, "a".to_owned()),
                    (2.0, "b".to_owned()),
                ]))),
                remaining_ttl_ms: -1,
            },
        ]
    }

    #[test]
    fn snapshot_restore_is_identity_over_live_state() {
        let dir = temp_dir();
        let state = sample_state();
        let path = write_snapshot(dir.path(), 5000, &state).unwrap();

        let (captured, restored) = read_snapshot(&path, 5000).unwrap();
        assert_eq!(captured, 5000);
        assert_eq!(restored, state);
    }

    #[test]
    fn snapshot_filters_expired_on_restore() {
        let dir = temp_dir();
        let state = vec![
            StateEntry {
                key: "survivor".into(),
                value: Value::Int(1),
                remaining_ttl_ms: 60_000,
            },
            StateEntry {
                key: "goner".into(),
                value: Value::Int(2),
                remaining_ttl_ms: 100,
            },
        ];
        let path = write_snapshot(dir.path(), 0, &state).unwrap();

        let (_, restored) = read_snapshot(&path, 1_000).unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].key, "survivor");
        assert_eq!(restored[0].remaining_ttl_ms, 59_000);
    }

    #[test]
    fn latest_snapshot_picks_newest() {
        let dir = temp_dir();
        write_snapshot(dir.path(), 100, &sample_state()).unwrap();
        write_snapshot(dir.path(), 300, &sample_state()).unwrap();
        write_snapshot(dir.path(), 200, &sample_state()).unwrap();

        let latest = latest_snapshot(dir.path()).unwrap().unwrap();
        assert!(latest.to_string_lossy().ends_with("snapshot.300"));
    }

    #[test]
    fn latest_snapshot_empty_dir() {
        let dir = temp_dir();
        assert!(latest_snapshot(dir.path()).unwrap().is_none());
    }

    #[test]
    fn latest_snapshot_missing_dir() {
        let dir = temp_dir();
        let missing = dir.path().join("nope");
        assert!(latest_snapshot(&missing).unwrap().is_none());
    }

    #[test]
    fn no_tmp_files_left_behind() {
        let dir = temp_dir();
        write_snapshot(dir.path(), 42, &sample_state()).unwrap();
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn corrupt_snapshot_rejected() {
        let dir = temp_dir();
        let path = write_snapshot(dir.path(), 7, &sample_state()).unwrap();
        let mut data = fs::read(&path).unwrap();
        let mid = data.len() / 2;
        data[mid] ^= 0xFF;
        fs::write(&path, &data).unwrap();

        assert!(read_snapshot(&path, 7).is_err());
    }
}
