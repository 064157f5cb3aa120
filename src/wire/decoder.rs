//! `decode(payload) -> Message` (§4.1). Total: every error path below is
//! caught by `decode` and folded into `Message::Malformed` rather than
//! propagated, so callers never see a `Result` at this boundary.

use chrono::{DateTime, Utc};

use crate::errors::{DecodeError, DecodeResult};

use super::buffer::BufferReader;
use super::message::{ColumnSchema, KeyKind, Lsn, Message, RelationSchema, TupleColumn, TupleData};

/// Seconds from the Unix epoch (1970-01-01) to the Postgres epoch (2000-01-01).
const PG_EPOCH_OFFSET_SECS: i64 = 946_684_800;

pub fn decode(payload: &[u8]) -> Message {
    match try_decode(payload) {
        Ok(message) => message,
        Err(error) => Message::Malformed {
            reason: error.to_string(),
            raw: payload.to_vec(),
        },
    }
}

fn try_decode(payload: &[u8]) -> DecodeResult<Message> {
    if payload.is_empty() {
        return Err(DecodeError::EmptyBuffer);
    }
    let mut reader = BufferReader::new(payload);
    let tag = reader.read_char()?;
    match tag {
        'B' => parse_begin(&mut reader),
        'C' => parse_commit(&mut reader),
        'R' => parse_relation(&mut reader),
        'I' => parse_insert(&mut reader),
        'U' => parse_update(&mut reader),
        'D' => parse_delete(&mut reader),
        'T' => parse_truncate(&mut reader),
        'M' => parse_logical_message(&mut reader),
        other => Err(DecodeError::UnknownTag(other)),
    }
}

fn pg_timestamp_to_utc(raw: i64) -> DateTime<Utc> {
    let secs = raw.div_euclid(1_000_000) + PG_EPOCH_OFFSET_SECS;
    let nsecs = raw.rem_euclid(1_000_000) * 1_000;
    DateTime::from_timestamp(secs, nsecs as u32).unwrap_or_else(|| DateTime::from_timestamp(0, 0).unwrap())
}

fn parse_begin(reader: &mut BufferReader) -> DecodeResult<Message> {
    let final_lsn = Lsn(reader.read_u64()?);
    let timestamp = pg_timestamp_to_utc(reader.read_u64()? as i64);
    let xid = reader.read_u32()?;
    Ok(Message::Begin { final_lsn, timestamp, xid })
}

fn parse_commit(reader: &mut BufferReader) -> DecodeResult<Message> {
    let flags = reader.read_u8()?;
    let commit_lsn = Lsn(reader.read_u64()?);
    let end_lsn = Lsn(reader.read_u64()?);
    let timestamp = pg_timestamp_to_utc(reader.read_u64()? as i64);
    Ok(Message::Commit { flags, commit_lsn, end_lsn, timestamp })
}

fn parse_relation(reader: &mut BufferReader) -> DecodeResult<Message> {
    let relation_oid = reader.read_u32()?;
    let namespace = reader.read_cstr()?;
    let relation_name = reader.read_cstr()?;
    let replica_identity = reader.read_char()?.into();
    let ncols = reader.read_u16()?;

    let mut columns = Vec::with_capacity(ncols as usize);
    for _ in 0..ncols {
        let flags = reader.read_u8()?;
        let name = reader.read_cstr()?;
        let type_oid = reader.read_u32()?;
        let type_modifier = reader.read_i32()?;
        columns.push(ColumnSchema {
            name,
            type_oid,
            type_modifier,
            key_flag: flags & 1 != 0,
        });
    }

    Ok(Message::Relation {
        relation: RelationSchema {
            relation_oid,
            namespace,
            relation_name,
            replica_identity,
            columns,
        },
    })
}

fn parse_insert(reader: &mut BufferReader) -> DecodeResult<Message> {
    let relation_oid = reader.read_u32()?;
    expect_marker(reader, 'N')?;
    let tuple = parse_tuple_data(reader, false)?;
    Ok(Message::Insert { relation_oid, tuple })
}

fn parse_update(reader: &mut BufferReader) -> DecodeResult<Message> {
    let relation_oid = reader.read_u32()?;
    let marker = reader.read_char()?;
    let (key_kind, old_tuple) = match marker {
        'K' => (Some(KeyKind::Key), Some(parse_tuple_data(reader, true)?)),
        'O' => (Some(KeyKind::OldAll), Some(parse_tuple_data(reader, true)?)),
        'N' => (None, None),
        other => return Err(DecodeError::UnexpectedMarker { expected: 'N', got: other }),
    };

    if old_tuple.is_some() {
        expect_marker(reader, 'N')?;
    }
    let new_tuple = parse_tuple_data(reader, true)?;

    Ok(Message::Update { relation_oid, key_kind, old_tuple, new_tuple })
}

fn parse_delete(reader: &mut BufferReader) -> DecodeResult<Message> {
    let relation_oid = reader.read_u32()?;
    let marker = reader.read_char()?;
    let key_kind = match marker {
        'K' => KeyKind::Key,
        'O' => KeyKind::OldAll,
        other => return Err(DecodeError::UnexpectedMarker { expected: 'K', got: other }),
    };
    let tuple = parse_tuple_data(reader, false)?;
    Ok(Message::Delete { relation_oid, key_kind, tuple })
}

fn parse_truncate(reader: &mut BufferReader) -> DecodeResult<Message> {
    let nrel = reader.read_u32()?;
    let options = reader.read_u8()?;
    // nrel is untrusted wire input; don't reserve capacity for it before
    // a single oid is actually read.
    let mut relation_oids = Vec::new();
    for _ in 0..nrel {
        relation_oids.push(reader.read_u32()?);
    }
    Ok(Message::Truncate { relation_oids, options })
}

fn parse_logical_message(reader: &mut BufferReader) -> DecodeResult<Message> {
    let transactional = reader.read_char()? == 't';
    let lsn = Lsn(reader.read_u64()?);
    let prefix = reader.read_cstr()?;
    let content = reader.read_length_prefixed_bytes()?;
    Ok(Message::LogicalMessage { transactional, lsn, prefix, content })
}

fn parse_tuple_data(reader: &mut BufferReader, allow_unchanged: bool) -> DecodeResult<TupleData> {
    let ncols = reader.read_u16()?;
    let mut columns = Vec::with_capacity(ncols as usize);
    for _ in 0..ncols {
        let marker = reader.read_char()?;
        let column = match marker {
            'n' => TupleColumn::Null,
            'u' => {
                if !allow_unchanged {
                    return Err(DecodeError::UnchangedNotAllowed);
                }
                TupleColumn::Unchanged
            }
            't' => {
                let bytes = reader.read_length_prefixed_bytes()?;
                let text = String::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8)?;
                TupleColumn::Text(text)
            }
            'b' => TupleColumn::Binary(reader.read_length_prefixed_bytes()?),
            other => return Err(DecodeError::InvalidTupleMarker(other)),
        };
        columns.push(column);
    }
    Ok(TupleData { columns })
}

fn expect_marker(reader: &mut BufferReader, expected: char) -> DecodeResult<()> {
    let got = reader.read_char()?;
    if got != expected {
        return Err(DecodeError::UnexpectedMarker { expected, got });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn begin_bytes(lsn: u64, ts_us: i64, xid: u32) -> Vec<u8> {
        let mut buf = vec![b'B'];
        buf.extend_from_slice(&lsn.to_be_bytes());
        buf.extend_from_slice(&(ts_us as u64).to_be_bytes());
        buf.extend_from_slice(&xid.to_be_bytes());
        buf
    }

    #[test]
    fn empty_payload_is_malformed() {
        match decode(&[]) {
            Message::Malformed { .. } => {}
            other => panic!("expected Malformed, got {other:?}"),
        }
    }

    #[test]
    fn decodes_begin() {
        let bytes = begin_bytes(0x01, 0, 100);
        match decode(&bytes) {
            Message::Begin { final_lsn, xid, .. } => {
                assert_eq!(final_lsn, Lsn(1));
                assert_eq!(xid, 100);
            }
            other => panic!("expected Begin, got {other:?}"),
        }
    }

    #[test]
    fn decodes_commit() {
        let mut buf = vec![b'C', 0];
        buf.extend_from_slice(&0x10u64.to_be_bytes());
        buf.extend_from_slice(&0x18u64.to_be_bytes());
        buf.extend_from_slice(&0u64.to_be_bytes());
        match decode(&buf) {
            Message::Commit { commit_lsn, end_lsn, .. } => {
                assert_eq!(commit_lsn, Lsn(0x10));
                assert_eq!(end_lsn, Lsn(0x18));
            }
            other => panic!("expected Commit, got {other:?}"),
        }
    }

    #[test]
    fn decodes_relation_and_insert() {
        let mut rel = vec![b'R'];
        rel.extend_from_slice(&16384u32.to_be_bytes());
        rel.extend_from_slice(b"public\0");
        rel.extend_from_slice(b"t\0");
        rel.push(b'd');
        rel.extend_from_slice(&1u16.to_be_bytes());
        rel.push(1); // key flag
        rel.extend_from_slice(b"id\0");
        rel.extend_from_slice(&23u32.to_be_bytes());
        rel.extend_from_slice(&(-1i32).to_be_bytes());

        match decode(&rel) {
            Message::Relation { relation } => {
                assert_eq!(relation.relation_oid, 16384);
                assert_eq!(relation.columns.len(), 1);
                assert!(relation.columns[0].key_flag);
            }
            other => panic!("expected Relation, got {other:?}"),
        }

        let mut insert = vec![b'I'];
        insert.extend_from_slice(&16384u32.to_be_bytes());
        insert.push(b'N');
        insert.extend_from_slice(&1u16.to_be_bytes());
        insert.push(b't');
        insert.extend_from_slice(&2u32.to_be_bytes());
        insert.extend_from_slice(b"42");

        match decode(&insert) {
            Message::Insert { relation_oid, tuple } => {
                assert_eq!(relation_oid, 16384);
                assert_eq!(tuple.columns, vec![TupleColumn::Text("42".to_string())]);
            }
            other => panic!("expected Insert, got {other:?}"),
        }
    }

    #[test]
    fn unchanged_marker_inside_insert_is_malformed() {
        let mut insert = vec![b'I'];
        insert.extend_from_slice(&1u32.to_be_bytes());
        insert.push(b'N');
        insert.extend_from_slice(&1u16.to_be_bytes());
        insert.push(b'u');

        match decode(&insert) {
            Message::Malformed { .. } => {}
            other => panic!("expected Malformed, got {other:?}"),
        }
    }

    #[test]
    fn decodes_truncate() {
        let mut buf = vec![b'T'];
        buf.extend_from_slice(&2u32.to_be_bytes());
        buf.push(0);
        buf.extend_from_slice(&16384u32.to_be_bytes());
        buf.extend_from_slice(&16385u32.to_be_bytes());

        match decode(&buf) {
            Message::Truncate { relation_oids, .. } => {
                assert_eq!(relation_oids, vec![16384, 16385]);
            }
            other => panic!("expected Truncate, got {other:?}"),
        }
    }

    #[test]
    fn truncate_with_bogus_nrel_is_malformed_not_an_oom() {
        // nrel = u32::MAX with no oid bytes behind it must fail on the
        // first read_u32 call, not attempt to reserve capacity for it.
        let mut buf = vec![b'T'];
        buf.extend_from_slice(&u32::MAX.to_be_bytes());
        buf.push(0);

        match decode(&buf) {
            Message::Malformed { .. } => {}
            other => panic!("expected Malformed, got {other:?}"),
        }
    }

    #[test]
    fn decodes_logical_message() {
        let mut buf = vec![b'M', b't'];
        buf.extend_from_slice(&0x50u64.to_be_bytes());
        buf.extend_from_slice(b"app\0");
        buf.extend_from_slice(&3u32.to_be_bytes());
        buf.extend_from_slice(b"hi!");

        match decode(&buf) {
            Message::LogicalMessage { transactional, prefix, content, .. } => {
                assert!(transactional);
                assert_eq!(prefix, "app");
                assert_eq!(content, b"hi!");
            }
            other => panic!("expected LogicalMessage, got {other:?}"),
        }
    }

    #[test]
    fn truncated_buffer_never_panics() {
        for len in 0..8 {
            let buf = vec![b'B'; len];
            let _ = decode(&buf);
        }
    }
}
