//! The two external collaborators named in §6: the control-plane store
//! (read-only source of desired slots) and the archive store (write-only
//! sink for assembled events). Both are traits so the Supervisor and
//! Stream Worker can be exercised against in-memory fakes in tests.

mod memory;
mod postgres;

pub use memory::{InMemoryArchiveStore, InMemoryControlPlaneStore};
pub use postgres::{PgArchiveStore, PgControlPlaneStore};

use async_trait::async_trait;

use crate::assembler::ChangeEvent;
use crate::errors::{SupervisorError, WorkerError};

/// Host/port/database/user/password needed to open a replication
/// connection, per §3's `connection` field on `SlotDescriptor`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
}

impl ConnectionParams {
    /// Renders a libpq keyword/value conninfo string suitable for
    /// `PQconnectdb`, with `replication=database` appended so the
    /// connection opens in logical-replication mode.
    pub fn to_conninfo_string(&self) -> String {
        format!(
            "host={} port={} dbname={} user={} password={} replication=database",
            escape_conninfo(&self.host),
            self.port,
            escape_conninfo(&self.database),
            escape_conninfo(&self.user),
            escape_conninfo(&self.password),
        )
    }
}

fn escape_conninfo(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// Identifies one logical-replication subscription (§3). Immutable for a
/// worker's lifetime; the Supervisor restarts the worker rather than
/// mutating a descriptor it already handed out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotDescriptor {
    pub db_id: String,
    /// The replication-slot row's own id, distinct from `db_id`; carried
    /// through to `ChangeEvent::wal_pipeline_id` (§6).
    pub slot_id: String,
    pub connection: ConnectionParams,
    pub slot_name: String,
    pub publication_name: String,
}

/// Read-only view of the control-plane's `postgres_databases` joined to
/// `postgres_replication_slots` (§6).
#[async_trait]
pub trait ControlPlaneStore: Send + Sync {
    /// All slots currently marked `status = active`.
    async fn active_slots(&self) -> Result<Vec<SlotDescriptor>, SupervisorError>;
}

/// Write-only sink for assembled events (§6). `append_batch` must be
/// atomic per call: either the whole commit's events land, or none do.
/// The worker relies on this to decide whether it may advance feedback.
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    async fn append_batch(&self, events: &[ChangeEvent]) -> Result<(), WorkerError>;
}
