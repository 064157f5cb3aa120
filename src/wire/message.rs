//! Typed representation of the messages the `pgoutput` plugin emits.
//! Field names and layouts track §4.1 of the wire table exactly.

use chrono::{DateTime, Utc};

/// A WAL log sequence number. Kept as a plain `u64` for comparison and
/// feedback; `Display` renders the conventional Postgres `%X/%X` form so
/// it reads naturally in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn(pub u64);

impl std::fmt::Display for Lsn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl From<u64> for Lsn {
    fn from(value: u64) -> Self {
        Lsn(value)
    }
}

/// `replica_identity` as carried on a `Relation` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaIdentity {
    Default,
    Nothing,
    Full,
    Index,
    /// Any byte outside `d`/`n`/`f`/`i`; kept rather than rejected so a
    /// forward-compatible server extension doesn't make the whole
    /// Relation message unparseable.
    Unknown(char),
}

impl From<char> for ReplicaIdentity {
    fn from(c: char) -> Self {
        match c {
            'd' => ReplicaIdentity::Default,
            'n' => ReplicaIdentity::Nothing,
            'f' => ReplicaIdentity::Full,
            'i' => ReplicaIdentity::Index,
            other => ReplicaIdentity::Unknown(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSchema {
    pub name: String,
    pub type_oid: u32,
    pub type_modifier: i32,
    /// Derived from `flags & 1` on the wire.
    pub key_flag: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationSchema {
    pub relation_oid: u32,
    pub namespace: String,
    pub relation_name: String,
    pub replica_identity: ReplicaIdentity,
    pub columns: Vec<ColumnSchema>,
}

/// One column's value inside a `TupleData`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TupleColumn {
    Null,
    /// TOAST value omitted because it is unchanged; legal only in UPDATE
    /// old/new tuples (§4.1).
    Unchanged,
    Text(String),
    Binary(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TupleData {
    pub columns: Vec<TupleColumn>,
}

/// `K` (key columns only) vs `O` (full old row), the marker preceding an
/// UPDATE/DELETE old tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Key,
    OldAll,
}

/// A fully decoded `pgoutput` message. `Malformed` is the escape hatch
/// that keeps `decode()` total (§4.1): any short or ill-formed payload
/// ends here instead of panicking or propagating a `Result`.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Begin {
        final_lsn: Lsn,
        timestamp: DateTime<Utc>,
        xid: u32,
    },
    Commit {
        flags: u8,
        commit_lsn: Lsn,
        end_lsn: Lsn,
        timestamp: DateTime<Utc>,
    },
    Relation {
        relation: RelationSchema,
    },
    Insert {
        relation_oid: u32,
        tuple: TupleData,
    },
    Update {
        relation_oid: u32,
        key_kind: Option<KeyKind>,
        old_tuple: Option<TupleData>,
        new_tuple: TupleData,
    },
    Delete {
        relation_oid: u32,
        key_kind: KeyKind,
        tuple: TupleData,
    },
    Truncate {
        relation_oids: Vec<u32>,
        options: u8,
    },
    LogicalMessage {
        transactional: bool,
        lsn: Lsn,
        prefix: String,
        content: Vec<u8>,
    },
    Malformed {
        reason: String,
        raw: Vec<u8>,
    },
}

impl Message {
    /// Short tag used in log fields; mirrors the wire tag where one exists.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Begin { .. } => "begin",
            Message::Commit { .. } => "commit",
            Message::Relation { .. } => "relation",
            Message::Insert { .. } => "insert",
            Message::Update { .. } => "update",
            Message::Delete { .. } => "delete",
            Message::Truncate { .. } => "truncate",
            Message::LogicalMessage { .. } => "logical_message",
            Message::Malformed { .. } => "malformed",
        }
    }
}
