//! The assembler's output type and the scratch state it accumulates
//! between `Begin` and `Commit` (§3's `TransactionContext`, §6's
//! `ChangeEvent`).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::wire::{KeyKind, Lsn, TupleColumn, TupleData};

/// A single decoded column value, tagged the way §9's "Dynamic record
/// shape" note describes: text, binary-as-hex, null, or the TOAST
/// "unchanged" sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedValue {
    Null,
    /// Only ever produced transiently while diffing an UPDATE; never
    /// written into `record` (§4.2's value-decoding rule).
    Unchanged,
    Text(String),
    /// Lowercase hex of the raw bytes.
    Binary(String),
}

impl DecodedValue {
    pub fn from_tuple_column(column: &TupleColumn) -> Self {
        match column {
            TupleColumn::Null => DecodedValue::Null,
            TupleColumn::Unchanged => DecodedValue::Unchanged,
            TupleColumn::Text(s) => DecodedValue::Text(s.clone()),
            TupleColumn::Binary(bytes) => DecodedValue::Binary(to_hex(bytes)),
        }
    }

    /// String coercion used for `record_pks`. Primary keys are never
    /// expected to be null or unchanged in practice, but both are handled
    /// defensively rather than panicking.
    pub fn to_pk_string(&self) -> String {
        match self {
            DecodedValue::Text(s) => s.clone(),
            DecodedValue::Binary(hex) => hex.clone(),
            DecodedValue::Null | DecodedValue::Unchanged => String::new(),
        }
    }
}

impl Serialize for DecodedValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            DecodedValue::Null => serializer.serialize_none(),
            DecodedValue::Unchanged => serializer.serialize_str("unchanged"),
            DecodedValue::Text(s) => serializer.serialize_str(s),
            DecodedValue::Binary(hex) => serializer.serialize_str(hex),
        }
    }
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut acc, b| {
        acc.push_str(&format!("{b:02x}"));
        acc
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Insert,
    Update,
    Delete,
    Truncate,
}

impl ChangeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeAction::Insert => "insert",
            ChangeAction::Update => "update",
            ChangeAction::Delete => "delete",
            ChangeAction::Truncate => "truncate",
        }
    }
}

/// The output record, matching §6's archive-store write schema field for
/// field.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeEvent {
    pub id: Uuid,
    pub wal_pipeline_id: String,
    pub commit_lsn: u64,
    pub seq: u64,
    pub record_pks: Vec<String>,
    pub record: BTreeMap<String, DecodedValue>,
    /// Mirrors `record`. The core never has a caller-populated pre-decoded
    /// copy to put here instead (§9's open question), so it is always a
    /// clone of `record`.
    pub data: BTreeMap<String, DecodedValue>,
    pub changes: Option<BTreeMap<String, DecodedValue>>,
    pub action: ChangeAction,
    pub committed_at: DateTime<Utc>,
    pub source_table_oid: u32,
    pub source_table_schema: String,
    pub source_table_name: String,
    pub inserted_at: DateTime<Utc>,
}

/// One buffered row or relation-level change, captured in wire form so
/// schema resolution can be deferred to `Commit` time. This is what lets
/// the assembler survive a relation-cache miss on a single row without
/// losing the rest of the transaction (§7, taxonomy item 2).
#[derive(Debug, Clone)]
pub enum PendingKind {
    Insert { new: TupleData },
    Update {
        key_kind: Option<KeyKind>,
        old: Option<TupleData>,
        new: TupleData,
    },
    Delete {
        key_kind: KeyKind,
        old: TupleData,
    },
    Truncate,
    /// A transactional `LogicalMessage`; buffered so it takes a slot in
    /// commit order but never itself produces a `ChangeEvent` (§4.2).
    Noop,
}

#[derive(Debug, Clone)]
pub struct PendingChange {
    pub relation_oid: u32,
    pub kind: PendingKind,
}

/// Per-worker scratch state live between `Begin` and `Commit`.
#[derive(Debug, Clone)]
pub struct TransactionContext {
    pub xid: u32,
    pub final_lsn: Lsn,
    pub pending: Vec<PendingChange>,
}

impl TransactionContext {
    pub fn new(xid: u32, final_lsn: Lsn) -> Self {
        Self { xid, final_lsn, pending: Vec::new() }
    }
}
