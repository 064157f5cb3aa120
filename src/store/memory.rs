//! In-memory fakes for the store traits, used by the Supervisor and
//! Stream Worker test suites so they don't need a live Postgres
//! instance. Mirrors the stdout dev-sink's role in the original: a
//! stand-in collaborator that's fine to depend on directly in tests.

use std::sync::Mutex;

use async_trait::async_trait;

use crate::assembler::ChangeEvent;
use crate::errors::{SupervisorError, WorkerError};

use super::{ArchiveStore, ControlPlaneStore, SlotDescriptor};

/// Holds a fixed or swappable set of desired slots. `set_slots` lets a
/// test simulate a control-plane change between two reconcile ticks.
#[derive(Default)]
pub struct InMemoryControlPlaneStore {
    slots: Mutex<Vec<SlotDescriptor>>,
}

impl InMemoryControlPlaneStore {
    pub fn new(slots: Vec<SlotDescriptor>) -> Self {
        Self { slots: Mutex::new(slots) }
    }

    pub fn set_slots(&self, slots: Vec<SlotDescriptor>) {
        *self.slots.lock().expect("control-plane store mutex poisoned") = slots;
    }
}

#[async_trait]
impl ControlPlaneStore for InMemoryControlPlaneStore {
    async fn active_slots(&self) -> Result<Vec<SlotDescriptor>, SupervisorError> {
        Ok(self.slots.lock().expect("control-plane store mutex poisoned").clone())
    }
}

/// Accumulates every appended event so tests can assert on ordering and
/// contents.
#[derive(Default)]
pub struct InMemoryArchiveStore {
    events: Mutex<Vec<ChangeEvent>>,
}

impl InMemoryArchiveStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ChangeEvent> {
        self.events.lock().expect("archive store mutex poisoned").clone()
    }
}

#[async_trait]
impl ArchiveStore for InMemoryArchiveStore {
    async fn append_batch(&self, events: &[ChangeEvent]) -> Result<(), WorkerError> {
        self.events.lock().expect("archive store mutex poisoned").extend_from_slice(events);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::ChangeAction;
    use chrono::Utc;
    use uuid::Uuid;

    fn sample_event(seq: u64) -> ChangeEvent {
        ChangeEvent {
            id: Uuid::new_v4(),
            wal_pipeline_id: "pipeline-1".into(),
            commit_lsn: 0x10,
            seq,
            record_pks: vec!["1".into()],
            record: Default::default(),
            data: Default::default(),
            changes: None,
            action: ChangeAction::Insert,
            committed_at: Utc::now(),
            source_table_oid: 16384,
            source_table_schema: "public".into(),
            source_table_name: "t".into(),
            inserted_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn archive_store_preserves_append_order() {
        let store = InMemoryArchiveStore::new();
        store.append_batch(&[sample_event(1), sample_event(2)]).await.unwrap();
        store.append_batch(&[sample_event(3)]).await.unwrap();

        let events = store.events();
        assert_eq!(events.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn control_plane_store_reflects_set_slots() {
        let store = InMemoryControlPlaneStore::new(Vec::new());
        assert!(store.active_slots().await.unwrap().is_empty());

        store.set_slots(vec![SlotDescriptor {
            db_id: "db-1".into(),
            slot_id: "slot-1".into(),
            connection: super::super::ConnectionParams {
                host: "localhost".into(),
                port: 5432,
                database: "app".into(),
                user: "replicator".into(),
                password: "secret".into(),
            },
            slot_name: "sub".into(),
            publication_name: "pub".into(),
        }]);

        let slots = store.active_slots().await.unwrap();
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0].db_id, "db-1");
    }
}
