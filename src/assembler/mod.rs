//! Commit-scoped event assembler (§4.2). One instance per Stream Worker,
//! never shared: it owns the relation-schema cache and the in-progress
//! transaction's buffered rows.

mod event;

pub use event::{ChangeAction, ChangeEvent, DecodedValue, PendingChange, PendingKind, TransactionContext};

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use tracing::{error, warn};
use uuid::Uuid;

use crate::errors::AssemblerError;
use crate::wire::{ColumnSchema, KeyKind, Lsn, Message, RelationSchema, TupleData};

enum AssemblerState {
    Idle,
    InTx(TransactionContext),
}

/// Drives one stream's `IDLE -> IN_TX -> IDLE` state machine and caches
/// that stream's relation schemas.
pub struct EventAssembler {
    wal_pipeline_id: String,
    relations: HashMap<u32, RelationSchema>,
    state: AssemblerState,
}

impl EventAssembler {
    pub fn new(wal_pipeline_id: impl Into<String>) -> Self {
        Self {
            wal_pipeline_id: wal_pipeline_id.into(),
            relations: HashMap::new(),
            state: AssemblerState::Idle,
        }
    }

    /// Feed one decoded message in. Returns the events produced, always
    /// empty except right after a `Commit`.
    pub fn handle(&mut self, message: Message) -> Vec<ChangeEvent> {
        match message {
            Message::Relation { relation } => {
                self.relations.insert(relation.relation_oid, relation);
                Vec::new()
            }
            Message::Begin { final_lsn, xid, .. } => {
                if matches!(self.state, AssemblerState::InTx(_)) {
                    let error = AssemblerError::ProtocolViolation("Begin received mid-transaction".into());
                    warn!(xid, %error, "discarding prior buffered rows");
                }
                self.state = AssemblerState::InTx(TransactionContext::new(xid, final_lsn));
                Vec::new()
            }
            Message::Insert { relation_oid, tuple } => {
                self.buffer(relation_oid, PendingKind::Insert { new: tuple });
                Vec::new()
            }
            Message::Update { relation_oid, key_kind, old_tuple, new_tuple } => {
                self.buffer(relation_oid, PendingKind::Update { key_kind, old: old_tuple, new: new_tuple });
                Vec::new()
            }
            Message::Delete { relation_oid, key_kind, tuple } => {
                self.buffer(relation_oid, PendingKind::Delete { key_kind, old: tuple });
                Vec::new()
            }
            Message::Truncate { relation_oids, .. } => {
                for relation_oid in relation_oids {
                    self.buffer(relation_oid, PendingKind::Truncate);
                }
                Vec::new()
            }
            Message::LogicalMessage { transactional, prefix, .. } => {
                if transactional {
                    // oid 0: logical messages aren't scoped to a relation.
                    self.buffer(0, PendingKind::Noop);
                } else {
                    warn!(prefix = %prefix, "non-transactional logical message, passing through unbuffered");
                }
                Vec::new()
            }
            Message::Commit { commit_lsn, end_lsn: _, timestamp, .. } => {
                match std::mem::replace(&mut self.state, AssemblerState::Idle) {
                    AssemblerState::InTx(ctx) => self.flush(ctx, commit_lsn, timestamp),
                    AssemblerState::Idle => {
                        let error = AssemblerError::ProtocolViolation("Commit received while IDLE".into());
                        warn!(%error, "discarding");
                        Vec::new()
                    }
                }
            }
            Message::Malformed { reason, .. } => {
                error!(reason = %reason, "malformed protocol message; skipping");
                Vec::new()
            }
        }
    }

    fn buffer(&mut self, relation_oid: u32, kind: PendingKind) {
        match &mut self.state {
            AssemblerState::InTx(ctx) => ctx.pending.push(PendingChange { relation_oid, kind }),
            AssemblerState::Idle => {
                warn!(relation_oid, "row change received while IDLE; discarding");
            }
        }
    }

    fn flush(&mut self, ctx: TransactionContext, commit_lsn: Lsn, committed_at: DateTime<Utc>) -> Vec<ChangeEvent> {
        let mut events = Vec::with_capacity(ctx.pending.len());
        let mut seq: u64 = 0;

        for pending in ctx.pending {
            if matches!(pending.kind, PendingKind::Noop) {
                continue;
            }

            let Some(schema) = self.relations.get(&pending.relation_oid) else {
                let error = AssemblerError::UnknownRelation(pending.relation_oid);
                error!(%error, "dropping row");
                continue;
            };

            let (action, record, record_pks, changes) = match pending.kind {
                PendingKind::Insert { new } => {
                    let cols = columns_for_tuple(schema, false);
                    (ChangeAction::Insert, build_record(&new, &cols), record_pks(&new, &cols), None)
                }
                PendingKind::Update { key_kind, old, new } => {
                    let new_cols = columns_for_tuple(schema, false);
                    let changes = old.as_ref().map(|old_tuple| {
                        let old_cols = columns_for_tuple(schema, key_kind == Some(KeyKind::Key));
                        compute_changes(old_tuple, &old_cols, &new, &new_cols)
                    });
                    (
                        ChangeAction::Update,
                        build_record(&new, &new_cols),
                        record_pks(&new, &new_cols),
                        Some(changes.unwrap_or_default()),
                    )
                }
                PendingKind::Delete { key_kind, old } => {
                    let cols = columns_for_tuple(schema, key_kind == KeyKind::Key);
                    (ChangeAction::Delete, build_record(&old, &cols), record_pks(&old, &cols), None)
                }
                PendingKind::Truncate => (ChangeAction::Truncate, BTreeMap::new(), Vec::new(), None),
                PendingKind::Noop => unreachable!("filtered above"),
            };

            seq += 1;
            events.push(ChangeEvent {
                id: Uuid::new_v4(),
                wal_pipeline_id: self.wal_pipeline_id.clone(),
                commit_lsn: commit_lsn.0,
                seq,
                record_pks,
                data: record.clone(),
                record,
                changes,
                action,
                committed_at,
                source_table_oid: schema.relation_oid,
                source_table_schema: schema.namespace.clone(),
                source_table_name: schema.relation_name.clone(),
                inserted_at: Utc::now(),
            });
        }

        events
    }
}

/// The schema columns a given tuple's values line up with, by position.
/// A `K`-marker old tuple carries only the key columns (§4.1), so its
/// column list is a strict subset of the full relation in relation order,
/// not the full list with gaps, and must be matched against the same
/// subset here or every later column's position would be misread.
fn columns_for_tuple(schema: &RelationSchema, key_only: bool) -> Vec<&ColumnSchema> {
    if key_only {
        schema.columns.iter().filter(|c| c.key_flag).collect()
    } else {
        schema.columns.iter().collect()
    }
}

fn build_record(tuple: &TupleData, columns: &[&ColumnSchema]) -> BTreeMap<String, DecodedValue> {
    let mut record = BTreeMap::new();
    for (column, value) in columns.iter().zip(tuple.columns.iter()) {
        let decoded = DecodedValue::from_tuple_column(value);
        if decoded == DecodedValue::Unchanged {
            // §4.2: unchanged-TOAST never appears in `record`.
            continue;
        }
        record.insert(column.name.clone(), decoded);
    }
    record
}

fn record_pks(tuple: &TupleData, columns: &[&ColumnSchema]) -> Vec<String> {
    columns
        .iter()
        .zip(tuple.columns.iter())
        .filter(|(column, _)| column.key_flag)
        .map(|(_, value)| DecodedValue::from_tuple_column(value).to_pk_string())
        .collect()
}

fn compute_changes(
    old: &TupleData,
    old_columns: &[&ColumnSchema],
    new: &TupleData,
    new_columns: &[&ColumnSchema],
) -> BTreeMap<String, DecodedValue> {
    let old_by_name: HashMap<&str, DecodedValue> = old_columns
        .iter()
        .zip(old.columns.iter())
        .map(|(column, value)| (column.name.as_str(), DecodedValue::from_tuple_column(value)))
        .collect();

    let mut changes = BTreeMap::new();
    for (column, new_value) in new_columns.iter().zip(new.columns.iter()) {
        let Some(old_value) = old_by_name.get(column.name.as_str()) else { continue };
        let new_value = DecodedValue::from_tuple_column(new_value);
        if *old_value == DecodedValue::Unchanged || new_value == DecodedValue::Unchanged {
            // Can't tell whether an unsent TOAST value actually differs.
            continue;
        }
        if *old_value != new_value {
            changes.insert(column.name.clone(), old_value.clone());
        }
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{ColumnSchema, KeyKind, ReplicaIdentity, TupleColumn};
    use chrono::TimeZone;

    fn relation(oid: u32, cols: Vec<(&str, bool)>) -> Message {
        Message::Relation {
            relation: RelationSchema {
                relation_oid: oid,
                namespace: "public".into(),
                relation_name: "t".into(),
                replica_identity: ReplicaIdentity::Default,
                columns: cols
                    .into_iter()
                    .map(|(name, key)| ColumnSchema { name: name.into(), type_oid: 23, type_modifier: -1, key_flag: key })
                    .collect(),
            },
        }
    }

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn scenario_1_insert_single_column() {
        let mut assembler = EventAssembler::new("pipeline-1");
        assert!(assembler.handle(Message::Begin { final_lsn: Lsn(1), timestamp: ts(), xid: 100 }).is_empty());
        assert!(assembler.handle(relation(16384, vec![("id", true)])).is_empty());
        assert!(assembler
            .handle(Message::Insert {
                relation_oid: 16384,
                tuple: TupleData { columns: vec![TupleColumn::Text("42".into())] },
            })
            .is_empty());

        let events = assembler.handle(Message::Commit {
            flags: 0,
            commit_lsn: Lsn(0x10),
            end_lsn: Lsn(0x18),
            timestamp: ts(),
        });

        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.action, ChangeAction::Insert);
        assert_eq!(event.commit_lsn, 0x10);
        assert_eq!(event.seq, 1);
        assert_eq!(event.record_pks, vec!["42".to_string()]);
        assert_eq!(event.record.get("id"), Some(&DecodedValue::Text("42".into())));
        assert!(event.changes.is_none());
        assert_eq!(event.source_table_schema, "public");
        assert_eq!(event.source_table_name, "t");
    }

    #[test]
    fn scenario_2_update_with_key_change() {
        let mut assembler = EventAssembler::new("pipeline-1");
        assembler.handle(Message::Begin { final_lsn: Lsn(1), timestamp: ts(), xid: 100 });
        assembler.handle(relation(16384, vec![("id", true)]));
        assembler.handle(Message::Update {
            relation_oid: 16384,
            key_kind: Some(KeyKind::Key),
            old_tuple: Some(TupleData { columns: vec![TupleColumn::Text("1".into())] }),
            new_tuple: TupleData { columns: vec![TupleColumn::Text("2".into())] },
        });
        let events = assembler.handle(Message::Commit {
            flags: 0,
            commit_lsn: Lsn(0x20),
            end_lsn: Lsn(0x28),
            timestamp: ts(),
        });

        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.action, ChangeAction::Update);
        assert_eq!(event.record.get("id"), Some(&DecodedValue::Text("2".into())));
        assert_eq!(event.record_pks, vec!["2".to_string()]);
        assert_eq!(event.changes.as_ref().unwrap().get("id"), Some(&DecodedValue::Text("1".into())));
    }

    #[test]
    fn scenario_3_delete_replica_identity_full() {
        let mut assembler = EventAssembler::new("pipeline-1");
        assembler.handle(Message::Begin { final_lsn: Lsn(1), timestamp: ts(), xid: 100 });
        assembler.handle(relation(16384, vec![("id", true), ("name", false)]));
        assembler.handle(Message::Delete {
            relation_oid: 16384,
            key_kind: KeyKind::OldAll,
            tuple: TupleData { columns: vec![TupleColumn::Text("5".into()), TupleColumn::Text("alice".into())] },
        });
        let events = assembler.handle(Message::Commit {
            flags: 0,
            commit_lsn: Lsn(0x30),
            end_lsn: Lsn(0x38),
            timestamp: ts(),
        });

        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.action, ChangeAction::Delete);
        assert_eq!(event.record.get("id"), Some(&DecodedValue::Text("5".into())));
        assert_eq!(event.record.get("name"), Some(&DecodedValue::Text("alice".into())));
        assert_eq!(event.record_pks, vec!["5".to_string()]);
        assert!(event.changes.is_none());
    }

    #[test]
    fn scenario_4_unchanged_toast_in_update() {
        let mut assembler = EventAssembler::new("pipeline-1");
        assembler.handle(Message::Begin { final_lsn: Lsn(1), timestamp: ts(), xid: 100 });
        assembler.handle(relation(16384, vec![("id", true), ("blob", false)]));
        assembler.handle(Message::Update {
            relation_oid: 16384,
            key_kind: Some(KeyKind::OldAll),
            old_tuple: Some(TupleData { columns: vec![TupleColumn::Text("7".into()), TupleColumn::Unchanged] }),
            new_tuple: TupleData { columns: vec![TupleColumn::Text("7".into()), TupleColumn::Unchanged] },
        });
        let events = assembler.handle(Message::Commit {
            flags: 0,
            commit_lsn: Lsn(0x40),
            end_lsn: Lsn(0x48),
            timestamp: ts(),
        });

        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert!(event.changes.as_ref().unwrap().is_empty());
        assert!(!event.record.contains_key("blob"));
        assert_eq!(event.record.get("id"), Some(&DecodedValue::Text("7".into())));
    }

    #[test]
    fn scenario_5_cross_commit_ordering() {
        let mut assembler = EventAssembler::new("pipeline-1");
        assembler.handle(relation(16384, vec![("id", true)]));

        assembler.handle(Message::Begin { final_lsn: Lsn(1), timestamp: ts(), xid: 1 });
        assembler.handle(Message::Insert {
            relation_oid: 16384,
            tuple: TupleData { columns: vec![TupleColumn::Text("1".into())] },
        });
        let first = assembler.handle(Message::Commit {
            flags: 0,
            commit_lsn: Lsn(0x50),
            end_lsn: Lsn(0x58),
            timestamp: ts(),
        });

        assembler.handle(Message::Begin { final_lsn: Lsn(2), timestamp: ts(), xid: 2 });
        assembler.handle(Message::Insert {
            relation_oid: 16384,
            tuple: TupleData { columns: vec![TupleColumn::Text("2".into())] },
        });
        let second = assembler.handle(Message::Commit {
            flags: 0,
            commit_lsn: Lsn(0x60),
            end_lsn: Lsn(0x68),
            timestamp: ts(),
        });

        assert_eq!(first[0].commit_lsn, 0x50);
        assert_eq!(second[0].commit_lsn, 0x60);
        assert!(first[0].commit_lsn < second[0].commit_lsn);
    }

    #[test]
    fn missing_relation_drops_row_without_stalling_transaction() {
        let mut assembler = EventAssembler::new("pipeline-1");
        assembler.handle(relation(1, vec![("id", true)]));

        assembler.handle(Message::Begin { final_lsn: Lsn(1), timestamp: ts(), xid: 1 });
        // Relation 2 was never cached (simulates a worker restart that lost its cache).
        assembler.handle(Message::Delete {
            relation_oid: 2,
            key_kind: KeyKind::Key,
            tuple: TupleData { columns: vec![TupleColumn::Text("9".into())] },
        });
        assembler.handle(Message::Insert {
            relation_oid: 1,
            tuple: TupleData { columns: vec![TupleColumn::Text("10".into())] },
        });
        let events = assembler.handle(Message::Commit {
            flags: 0,
            commit_lsn: Lsn(0x70),
            end_lsn: Lsn(0x78),
            timestamp: ts(),
        });

        // Only the resolvable row survives; the commit still flushes.
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].seq, 1);
        assert_eq!(events[0].action, ChangeAction::Insert);
    }

    #[test]
    fn key_only_old_tuple_does_not_misalign_against_full_schema() {
        // Old tuple carries only the key column ('K' marker); it must be
        // matched against the key-only column subset, not positionally
        // against the full 3-column schema, or "name" would be read as
        // the key's value.
        let mut assembler = EventAssembler::new("pipeline-1");
        assembler.handle(relation(16384, vec![("id", true), ("name", false), ("age", false)]));
        assembler.handle(Message::Begin { final_lsn: Lsn(1), timestamp: ts(), xid: 1 });
        assembler.handle(Message::Update {
            relation_oid: 16384,
            key_kind: Some(KeyKind::Key),
            old_tuple: Some(TupleData { columns: vec![TupleColumn::Text("1".into())] }),
            new_tuple: TupleData {
                columns: vec![
                    TupleColumn::Text("1".into()),
                    TupleColumn::Text("bob".into()),
                    TupleColumn::Text("30".into()),
                ],
            },
        });
        let events = assembler.handle(Message::Commit {
            flags: 0,
            commit_lsn: Lsn(0xB0),
            end_lsn: Lsn(0xB8),
            timestamp: ts(),
        });

        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.record.get("name"), Some(&DecodedValue::Text("bob".into())));
        assert_eq!(event.record.get("age"), Some(&DecodedValue::Text("30".into())));
        // Only "id" is comparable against the key-only old tuple; name/age
        // have no old value to diff against, so they never appear here.
        assert!(event.changes.as_ref().unwrap().is_empty());
    }

    #[test]
    fn begin_while_in_tx_discards_prior_buffer() {
        let mut assembler = EventAssembler::new("pipeline-1");
        assembler.handle(relation(1, vec![("id", true)]));
        assembler.handle(Message::Begin { final_lsn: Lsn(1), timestamp: ts(), xid: 1 });
        assembler.handle(Message::Insert {
            relation_oid: 1,
            tuple: TupleData { columns: vec![TupleColumn::Text("1".into())] },
        });
        // A second Begin without a Commit discards the buffered insert above.
        assembler.handle(Message::Begin { final_lsn: Lsn(2), timestamp: ts(), xid: 2 });
        let events = assembler.handle(Message::Commit {
            flags: 0,
            commit_lsn: Lsn(0x80),
            end_lsn: Lsn(0x88),
            timestamp: ts(),
        });
        assert!(events.is_empty());
    }

    #[test]
    fn row_changes_while_idle_are_discarded() {
        let mut assembler = EventAssembler::new("pipeline-1");
        assembler.handle(relation(1, vec![("id", true)]));
        let events = assembler.handle(Message::Insert {
            relation_oid: 1,
            tuple: TupleData { columns: vec![TupleColumn::Text("1".into())] },
        });
        assert!(events.is_empty());
        // Commit while IDLE is likewise a no-op, not a panic.
        let events = assembler.handle(Message::Commit {
            flags: 0,
            commit_lsn: Lsn(0x90),
            end_lsn: Lsn(0x98),
            timestamp: ts(),
        });
        assert!(events.is_empty());
    }

    #[test]
    fn truncate_emits_one_event_per_relation() {
        let mut assembler = EventAssembler::new("pipeline-1");
        assembler.handle(relation(1, vec![("id", true)]));
        assembler.handle(relation(2, vec![("id", true)]));
        assembler.handle(Message::Begin { final_lsn: Lsn(1), timestamp: ts(), xid: 1 });
        assembler.handle(Message::Truncate { relation_oids: vec![1, 2], options: 0 });
        let events = assembler.handle(Message::Commit {
            flags: 0,
            commit_lsn: Lsn(0xA0),
            end_lsn: Lsn(0xA8),
            timestamp: ts(),
        });

        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.action == ChangeAction::Truncate));
        assert_eq!(events[0].seq, 1);
        assert_eq!(events[1].seq, 2);
    }
}
