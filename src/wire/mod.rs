//! The `pgoutput` wire protocol: a pure, total decoder with no I/O and no
//! shared state (§4.1). Reusable across every worker task without
//! synchronization.

mod buffer;
mod decoder;
mod message;

pub use buffer::{BufferReader, BufferWriter};
pub use decoder::decode;
pub use message::{
    ColumnSchema, KeyKind, Lsn, Message, ReplicaIdentity, RelationSchema, TupleColumn, TupleData,
};
