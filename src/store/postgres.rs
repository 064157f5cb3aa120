//! `tokio-postgres`-backed implementations of the control-plane and
//! archive store traits. Neither is exercised by the core's own test
//! suite (that uses [`super::memory`]); these are the production wiring
//! used by `main`.

use async_trait::async_trait;
use tokio_postgres::NoTls;
use tracing::{info, warn};

use crate::assembler::ChangeEvent;
use crate::errors::{SupervisorError, WorkerError};

use super::{ConnectionParams, ControlPlaneStore, ArchiveStore, SlotDescriptor};

/// Reads `postgres_databases` joined to `postgres_replication_slots`
/// (§6) on every call; the Supervisor is responsible for polling at
/// `CHECK_INTERVAL`, not this store.
pub struct PgControlPlaneStore {
    conninfo: String,
}

impl PgControlPlaneStore {
    pub fn new(params: &ConnectionParams) -> Self {
        Self { conninfo: params.to_conninfo_string() }
    }

    async fn connect(&self) -> Result<tokio_postgres::Client, SupervisorError> {
        let (client, connection) = tokio_postgres::connect(&self.conninfo, NoTls)
            .await
            .map_err(|e| SupervisorError::ControlPlaneStore(e.to_string()))?;
        tokio::spawn(async move {
            if let Err(error) = connection.await {
                warn!(%error, "control-plane store connection closed with error");
            }
        });
        Ok(client)
    }
}

#[async_trait]
impl ControlPlaneStore for PgControlPlaneStore {
    async fn active_slots(&self) -> Result<Vec<SlotDescriptor>, SupervisorError> {
        let client = self.connect().await?;
        let rows = client
            .query(
                "SELECT d.id, s.id, d.hostname, d.port, d.db_name, d.username, d.password, \
                 s.slot_name, s.publication_name \
                 FROM postgres_replication_slots s \
                 JOIN postgres_databases d ON d.id = s.postgres_database_id \
                 WHERE s.status = 'active'",
                &[],
            )
            .await
            .map_err(|e| SupervisorError::ControlPlaneStore(e.to_string()))?;

        let mut slots = Vec::with_capacity(rows.len());
        for row in rows {
            let db_id: String = row.get(0);
            let slot_id: String = row.get(1);
            let host: String = row.get(2);
            let port: i32 = row.get(3);
            let database: String = row.get(4);
            let user: String = row.get(5);
            let password: String = row.get(6);
            let slot_name: String = row.get(7);
            let publication_name: String = row.get(8);

            slots.push(SlotDescriptor {
                db_id,
                slot_id,
                connection: ConnectionParams { host, port: port as u16, database, user, password },
                slot_name,
                publication_name,
            });
        }

        info!(count = slots.len(), "fetched active slots from control-plane store");
        Ok(slots)
    }
}

/// Appends each commit's `ChangeEvent`s to an `events` table in a single
/// transaction, so `append_batch` is atomic the way §5 requires.
pub struct PgArchiveStore {
    conninfo: String,
}

impl PgArchiveStore {
    pub fn new(params: &ConnectionParams) -> Self {
        Self { conninfo: params.to_conninfo_string() }
    }

    async fn connect(&self) -> Result<tokio_postgres::Client, WorkerError> {
        let (client, connection) = tokio_postgres::connect(&self.conninfo, NoTls)
            .await
            .map_err(|e| WorkerError::ArchiveWrite(e.to_string()))?;
        tokio::spawn(async move {
            if let Err(error) = connection.await {
                warn!(%error, "archive store connection closed with error");
            }
        });
        Ok(client)
    }
}

#[async_trait]
impl ArchiveStore for PgArchiveStore {
    async fn append_batch(&self, events: &[ChangeEvent]) -> Result<(), WorkerError> {
        if events.is_empty() {
            return Ok(());
        }

        let mut client = self.connect().await?;
        let tx = client.transaction().await.map_err(|e| WorkerError::ArchiveWrite(e.to_string()))?;

        for event in events {
            let record = serde_json::to_value(&event.record).map_err(|e| WorkerError::ArchiveWrite(e.to_string()))?;
            let data = serde_json::to_value(&event.data).map_err(|e| WorkerError::ArchiveWrite(e.to_string()))?;
            let changes = event
                .changes
                .as_ref()
                .map(serde_json::to_value)
                .transpose()
                .map_err(|e| WorkerError::ArchiveWrite(e.to_string()))?;

            tx.execute(
                "INSERT INTO events \
                 (id, wal_pipeline_id, commit_lsn, seq, record_pks, record, data, changes, \
                  action, committed_at, source_table_oid, source_table_schema, source_table_name, inserted_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
                &[
                    &event.id,
                    &event.wal_pipeline_id,
                    &(event.commit_lsn as i64),
                    &(event.seq as i64),
                    &event.record_pks,
                    &record,
                    &data,
                    &changes,
                    &event.action.as_str(),
                    &event.committed_at,
                    &(event.source_table_oid as i64),
                    &event.source_table_schema,
                    &event.source_table_name,
                    &event.inserted_at,
                ],
            )
            .await
            .map_err(|e| WorkerError::ArchiveWrite(e.to_string()))?;
        }

        tx.commit().await.map_err(|e| WorkerError::ArchiveWrite(e.to_string()))?;
        Ok(())
    }
}
