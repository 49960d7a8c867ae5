//! Type-tagged state record codec shared by the preamble and snapshots.
//!
//! Each record is a full (key, value, remaining-ttl) triple:
//! ```text
//! [key_len: 4B][key][type_tag: 1B][type-specific payload][ttl_ms: 8B]
//! ```
//! `ttl_ms` is the TTL remaining when the file was written, or -1 for no
//! expiry. Readers rebase it against the file's write timestamp.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{Read, Write};

use bytes::Bytes;
use vesper_core::{SortedSet, StateEntry, Value};

use crate::format::{self, FormatError};

/// Type tags for record payloads.
const TYPE_STRING: u8 = 0;
const TYPE_INT: u8 = 1;
const TYPE_FLOAT: u8 = 2;
const TYPE_LIST: u8 = 3;
const TYPE_SET: u8 = 4;
const TYPE_HASH: u8 = 5;
const TYPE_SORTED_SET: u8 = 6;

fn read_string(r: &mut impl Read, field: &str) -> Result<String, FormatError> {
    let bytes = format::read_bytes(r)?;
    String::from_utf8(bytes)
        .map_err(|_| FormatError::InvalidData(format!("{field} is not valid utf-8")))
}

/// Serializes a state record into `buf` (no checksum).
pub fn write_record(buf: &mut Vec<u8>, entry: &StateEntry) -> Result<(), FormatError> {
    format::write_bytes(buf, entry.key.as_bytes())?;
    match &entry.value {
        Value::Str(data) => {
            format::write_u8(buf, TYPE_STRING)?;
            format::write_bytes(buf, data)?;
        }
        Value::Int(n) => {
            format::write_u8(buf, TYPE_INT)?;
            format::write_i64(buf, *n)?;
        }
        Value::Float(f) => {
            format::write_u8(buf, TYPE_FLOAT)?;
            format::write_f64(buf, *f)?;
        }
        Value::List(items) => {
            format::write_u8(buf, TYPE_LIST)?;
            format::write_u32(buf, items.len() as u32)?;
            for item in items {
                format::write_bytes(buf, item)?;
            }
        }
        Value::Set(members) => {
            format::write_u8(buf, TYPE_SET)?;
            format::write_u32(buf, members.len() as u32)?;
            for member in members {
                format::write_bytes(buf, member.as_bytes())?;
            }
        }
        Value::Hash(fields) => {
            format::write_u8(buf, TYPE_HASH)?;
            format::write_u32(buf, fields.len() as u32)?;
            for (field, value) in fields {
                format::write_bytes(buf, field.as_bytes())?;
                format::write_bytes(buf, value)?;
            }
        }
        Value::SortedSet(ss) => {
            format::write_u8(buf, TYPE_SORTED_SET)?;
            format::write_u32(buf, ss.len() as u32)?;
            for (score, member) in ss.to_pairs() {
                format::write_f64(buf, score)?;
                format::write_bytes(buf, member.as_bytes())?;
            }
        }
    }
    format::write_i64(buf, entry.remaining_ttl_ms)?;
    Ok(())
}

/// Reads one state record from the reader.
pub fn read_record(r: &mut impl Read) -> Result<StateEntry, FormatError> {
    let key = read_string(r, "key")?;
    let tag = format::read_u8(r)?;
    let value = match tag {
        TYPE_STRING => Value::Str(Bytes::from(format::read_bytes(r)?)),
        TYPE_INT => Value::Int(format::read_i64(r)?),
        TYPE_FLOAT => Value::Float(format::read_f64(r)?),
        TYPE_LIST => {
            let count = format::read_u32(r)?;
            format::validate_collection_count(count, "list")?;
            let mut items = VecDeque::with_capacity(format::capped_capacity(count));
            for _ in 0..count {
                items.push_back(Bytes::from(format::read_bytes(r)?));
            }
            Value::List(items)
        }
        TYPE_SET => {
            let count = format::read_u32(r)?;
            format::validate_collection_count(count, "set")?;
            let mut members = HashSet::with_capacity(format::capped_capacity(count));
            for _ in 0..count {
                members.insert(read_string(r, "set member")?);
            }
            Value::Set(members)
        }
        TYPE_HASH => {
            let count = format::read_u32(r)?;
            format::validate_collection_count(count, "hash")?;
            let mut fields = HashMap::with_capacity(format::capped_capacity(count));
            for _ in 0..count {
                let field = read_string(r, "hash field")?;
                let value = Bytes::from(format::read_bytes(r)?);
                fields.insert(field, value);
            }
            Value::Hash(fields)
        }
        TYPE_SORTED_SET => {
            let count = format::read_u32(r)?;
            format::validate_collection_count(count, "sorted set")?;
            let mut pairs = Vec::with_capacity(format::capped_capacity(count));
            for _ in 0..count {
                let score = format::read_f64(r)?;
                let member = read_string(r, "sorted set member")?;
                pairs.push((score, member));
            }
            Value::SortedSet(Box::new(SortedSet::from_members(pairs)))
        }
        other => return Err(FormatError::UnknownTag(other)),
    };
    let remaining_ttl_ms = format::read_i64(r)?;
    Ok(StateEntry {
        key,
        value,
        remaining_ttl_ms,
    })
}

/// Writes a full state image: header (caller supplies the magic), the
/// write timestamp, record count, records, and a footer CRC over the
/// record bytes.
pub fn write_state_file(
    w: &mut impl Write,
    magic: &[u8; 4],
    written_unix_ms: i64,
    state: &[StateEntry],
) -> Result<(), FormatError> {
    format::write_header(w, magic)?;
    format::write_i64(w, written_unix_ms)?;
    format::write_u32(w, state.len() as u32)?;

    let mut body = Vec::new();
    for entry in state {
        write_record(&mut body, entry)?;
    }
    w.write_all(&body)?;
    format::write_u32(w, format::crc32(&body))?;
    Ok(())
}

/// Reads a full state image written by [`write_state_file`]. Returns the
/// write timestamp and the records, after CRC verification.
pub fn read_state_file(
    r: &mut impl Read,
    magic: &[u8; 4],
) -> Result<(i64, Vec<StateEntry>), FormatError> {
    format::read_header(r, magic)?;
    let written_unix_ms = format::read_i64(r)?;
    let count = format::read_u32(r)?;
    format::validate_collection_count(count, "state record")?;

    // read the remaining bytes so the CRC can cover the raw record body
    let mut rest = Vec::new();
    r.read_to_end(&mut rest)?;
    if rest.len() < 4 {
        return Err(FormatError::UnexpectedEof);
    }
    let (body, crc_bytes) = rest.split_at(rest.len() - 4);
    let stored = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
    format::verify_crc32(body, stored)?;

    let mut cursor = std::io::Cursor::new(body);
    let mut entries = Vec::with_capacity(format::capped_capacity(count));
    for _ in 0..count {
        entries.push(read_record(&mut cursor)?);
    }
    Ok((written_unix_ms, entries))
}

/// Rebases TTLs recorded at `written_unix_ms` against `now_unix_ms`,
/// dropping entries whose remaining time is already spent.
pub fn filter_expired(
    entries: Vec<StateEntry>,
    written_unix_ms: i64,
    now_unix_ms: i64,
) -> Vec<StateEntry> {
    let elapsed = (now_unix_ms - written_unix_ms).max(0);
    entries
        .into_iter()
        .filter_map(|mut e| {
            if e.remaining_ttl_ms < 0 {
                return Some(e);
            }
            let left = e.remaining_ttl_ms - elapsed;
            if left <= 0 {
                return None;
            }
            e.remaining_ttl_ms = left;
            Some(e)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(entry: StateEntry) {
        let mut buf = Vec::new();
        write_record(&mut buf, &entry).unwrap();
        let decoded = read_record(&mut std::io::Cursor::new(&buf)).unwrap();
        assert_eq!(entry, decoded);
    }

    #[test]
    fn record_round_trip_string() {
        round_trip(StateEntry {
            key: "hello".into(),
            value: Value::Str(Bytes::from("world")),
            remaining_ttl_ms: 5000,
        });
    }

    #[test]
    fn record_round_trip_scalars() {
        round_trip(StateEntry {
            key: "n".into(),
            value: Value::Int(-42),
            remaining_ttl_ms: -1,
        });
        round_trip(StateEntry {
            key: "f".into(),
            value: Value::Float(2.5),
            remaining_ttl_ms: -1,
        });
    }

    #[test]
    fn record_round_trip_collections() {
        round_trip(StateEntry {
            key: "l".into(),
            value: Value::List(VecDeque::from([Bytes::from("a"), Bytes::from("b")])),
            remaining_ttl_ms: -1,
        });
        round_trip(StateEntry {
            key: "s".into(),
            value: Value::Set(HashSet::from(["m1".to_owned(), "m2".to_owned()])),
            remaining_ttl_ms: -1,
        });
        round_trip(StateEntry {
            key: "h".into(),
            value: Value::Hash(HashMap::from([("f".to_owned(), Bytes::from("v"))])),
            remaining_ttl_ms: -1,
        });
    }

    #[test]
    fn record_round_trip_sorted_set() {
        let ss = SortedSet::from_members([
            (100.0, "alice".to_owned()),
            (200.5, "bob".to_owned()),
            (f64::INFINITY, "top".to_owned()),
        ]);
        round_trip(StateEntry {
            key: "board".into(),
            value: Value::SortedSet(Box::new(ss)),
            remaining_ttl_ms: 120_000,
        });
    }

    #[test]
    fn state_file_round_trip() {
        let state = vec![
            StateEntry {
                key: "a".into(),
                value: Value::Int(1),
                remaining_ttl_ms: -1,
            },
            StateEntry {
                key: "b".into(),
                value: Value::Str(Bytes::from("two")),
                remaining_ttl_ms: 10_000,
            },
        ];
        let mut buf = Vec::new();
        write_state_file(&mut buf, format::SNAP_MAGIC, 1234, &state).unwrap();

        let (ts, decoded) =
            read_state_file(&mut std::io::Cursor::new(&buf), format::SNAP_MAGIC).unwrap();
        assert_eq!(ts, 1234);
        assert_eq!(state, decoded);
    }

    #[test]
    fn state_file_detects_corruption() {
        let state = vec![StateEntry {
            key: "k".into(),
            value: Value::Str(Bytes::from("v")),
            remaining_ttl_ms: -1,
        }];
        let mut buf = Vec::new();
        write_state_file(&mut buf, format::SNAP_MAGIC, 0, &state).unwrap();

        // flip a byte inside the record body
        let mid = buf.len() / 2;
        buf[mid] ^= 0xFF;
        let err = read_state_file(&mut std::io::Cursor::new(&buf), format::SNAP_MAGIC).unwrap_err();
        assert!(matches!(err, FormatError::ChecksumMismatch { .. }));
    }

    #[test]
    fn filter_expired_rebases_ttls() {
        let entries = vec![
            StateEntry {
                key: "keeps".into(),
                value: Value::Int(1),
                remaining_ttl_ms: -1,
            },
            StateEntry {
                key: "alive".into(),
                value: Value::Int(2),
                remaining_ttl_ms: 10_000,
            },
            StateEntry {
                key: "dead".into(),
                value: Value::Int(3),
                remaining_ttl_ms: 1_000,
            },
        ];
        let filtered = filter_expired(entries, 0, 5_000);
        assert_eq!(filtered.len(), 2);
        assert_eq!(filtered[0].key, "keeps");
        assert_eq!(filtered[1].key, "alive");
        assert_eq!(filtered[1].remaining_ttl_ms, 5_000);
    }
}
