//! One Stream Worker per active slot (§4.3). Replication I/O rides on
//! libpq, which is synchronous, so the whole startup-plus-main-loop runs
//! inside a single `spawn_blocking` task; archive-store writes bridge
//! back into async code via `Handle::block_on` from that same thread.

mod backoff;
mod connection;
mod feedback;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use libpq_sys::ExecStatusType;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use crate::assembler::EventAssembler;
use crate::errors::WorkerError;
use crate::store::{ArchiveStore, SlotDescriptor};
use crate::tracing_context::TracingContext;
use crate::wire::{Message, decode};

use connection::{CopyData, PgConnection};
use feedback::build_standby_status_update;

/// How a blocking run of the worker ended, decided by
/// [`run_blocking_loop`] and interpreted by [`StreamWorker::run`].
enum LoopOutcome {
    /// `run_flag` was cleared; the worker should not be retried.
    Shutdown,
    /// Transport-level failure; retry after a backoff (§7 item 4).
    Transient(WorkerError),
    /// Authentication, missing slot/publication, or a failed
    /// `pg_terminate_backend` (§7 items 3 and 5); the Supervisor will
    /// retry on its next reconcile tick rather than this worker looping.
    Unrecoverable(WorkerError),
}

pub struct StreamWorker {
    descriptor: SlotDescriptor,
    run_flag: Arc<AtomicBool>,
    archive_store: Arc<dyn ArchiveStore>,
    feedback_interval: Duration,
    reconnect_backoff: Duration,
    read_timeout: Duration,
}

impl StreamWorker {
    pub fn new(
        descriptor: SlotDescriptor,
        run_flag: Arc<AtomicBool>,
        archive_store: Arc<dyn ArchiveStore>,
        feedback_interval: Duration,
        reconnect_backoff: Duration,
        read_timeout: Duration,
    ) -> Self {
        Self { descriptor, run_flag, archive_store, feedback_interval, reconnect_backoff, read_timeout }
    }

    /// Drives this worker until `run_flag` is cleared or it hits an
    /// unrecoverable error. Never returns an `Err`; per §7, per-process
    /// failures are logged, not propagated, and the Supervisor decides
    /// whether to retry.
    pub async fn run(self) {
        let tracing_context = TracingContext::new();
        info!(
            correlation_id = %tracing_context.correlation_id,
            db_id = %self.descriptor.db_id,
            "starting stream worker"
        );

        loop {
            if !self.run_flag.load(Ordering::Acquire) {
                break;
            }

            let descriptor = self.descriptor.clone();
            let run_flag = self.run_flag.clone();
            let archive_store = self.archive_store.clone();
            let feedback_interval = self.feedback_interval;
            let read_timeout = self.read_timeout;
            let handle = Handle::current();

            let outcome = tokio::task::spawn_blocking(move || {
                run_blocking_loop(&descriptor, &run_flag, archive_store.as_ref(), feedback_interval, read_timeout, &handle)
            })
            .await;

            match outcome {
                Ok(LoopOutcome::Shutdown) => {
                    info!(db_id = %self.descriptor.db_id, "stream worker shut down gracefully");
                    break;
                }
                Ok(LoopOutcome::Unrecoverable(error)) => {
                    error!(db_id = %self.descriptor.db_id, %error, "unrecoverable worker error, exiting for supervisor to retry");
                    break;
                }
                Ok(LoopOutcome::Transient(error)) => {
                    let backoff = backoff::jittered(self.reconnect_backoff);
                    warn!(db_id = %self.descriptor.db_id, %error, backoff_ms = backoff.as_millis() as u64, "transient worker error, reconnecting");
                    tokio::time::sleep(backoff).await;
                }
                Err(join_error) => {
                    error!(db_id = %self.descriptor.db_id, %join_error, "worker task panicked");
                    break;
                }
            }
        }
    }
}

fn run_blocking_loop(
    descriptor: &SlotDescriptor,
    run_flag: &AtomicBool,
    archive_store: &dyn ArchiveStore,
    feedback_interval: Duration,
    read_timeout: Duration,
    handle: &Handle,
) -> LoopOutcome {
    let conn = match PgConnection::connect(&descriptor.connection.to_conninfo_string()) {
        Ok(conn) => conn,
        Err(error) => return LoopOutcome::Unrecoverable(error),
    };

    if let Err(error) = resolve_slot_occupancy(&conn, &descriptor.slot_name) {
        return LoopOutcome::Unrecoverable(error);
    }

    if let Err(error) = start_replication(&conn, &descriptor.slot_name, &descriptor.publication_name) {
        return LoopOutcome::Unrecoverable(error);
    }

    if let Err(error) = conn.set_nonblocking() {
        return LoopOutcome::Transient(error);
    }

    info!(db_id = %descriptor.db_id, slot = %descriptor.slot_name, "replication stream started");

    let mut assembler = EventAssembler::new(descriptor.slot_id.clone());
    let mut last_feedback = Instant::now();
    let mut flush_lsn: u64 = 0;

    loop {
        if !run_flag.load(Ordering::Acquire) {
            let _ = send_feedback(&conn, flush_lsn);
            return LoopOutcome::Shutdown;
        }

        if last_feedback.elapsed() >= feedback_interval {
            if let Err(error) = send_feedback(&conn, flush_lsn) {
                return LoopOutcome::Transient(error);
            }
            last_feedback = Instant::now();
        }

        let data = match conn.get_copy_data() {
            Ok(CopyData::Data(data)) => data,
            Ok(CopyData::WouldBlock) => {
                // No data buffered yet; block on the socket up to
                // `read_timeout` so `run_flag` is re-checked at least that
                // often even during a quiet stream (§5).
                match conn.wait_readable(read_timeout) {
                    Ok(true) => {
                        if let Err(error) = conn.consume_input() {
                            return LoopOutcome::Transient(error);
                        }
                    }
                    Ok(false) => {}
                    Err(error) => return LoopOutcome::Transient(error),
                }
                continue;
            }
            Ok(CopyData::Done) => {
                return LoopOutcome::Transient(WorkerError::protocol("replication stream ended (CopyDone)"));
            }
            Err(error) => return LoopOutcome::Transient(error),
        };

        if data.is_empty() {
            continue;
        }

        match data[0] {
            b'w' => {
                // XLogData: 1 byte tag, u64 data_start (wal_start), u64 wal_end, u64 send_time, payload.
                if data.len() < 25 {
                    warn!("XLogData message too short, skipping");
                    continue;
                }
                let payload = &data[25..];
                let message = decode(payload);
                // Captured before `handle` consumes the message: feedback
                // must advance to the Commit's `end_lsn`, not its
                // `commit_lsn` (§4.2, §4.3 "record the commit's end_lsn as
                // the safe feedback point").
                let commit_end_lsn = match &message {
                    Message::Commit { end_lsn, .. } => Some(end_lsn.0),
                    _ => None,
                };
                let events = assembler.handle(message);

                if !events.is_empty() {
                    if let Err(error) = handle.block_on(archive_store.append_batch(&events)) {
                        return LoopOutcome::Transient(error);
                    }
                    if let Some(end_lsn) = commit_end_lsn {
                        flush_lsn = end_lsn;
                    }
                    if let Err(error) = send_feedback(&conn, flush_lsn) {
                        return LoopOutcome::Transient(error);
                    }
                    last_feedback = Instant::now();
                }
            }
            b'k' => {
                // Primary keepalive: 1 byte tag, u64 wal_end, u64 send_time, u8 reply_requested.
                if data.len() >= 18 && data[17] == 1 {
                    if let Err(error) = send_feedback(&conn, flush_lsn) {
                        return LoopOutcome::Transient(error);
                    }
                    last_feedback = Instant::now();
                }
            }
            other => {
                warn!(tag = other as char, "unexpected replication stream message, skipping");
            }
        }
    }
}

fn resolve_slot_occupancy(conn: &PgConnection, slot_name: &str) -> Result<(), WorkerError> {
    let query = format!(
        "SELECT active_pid FROM pg_replication_slots WHERE slot_name = '{}'",
        slot_name.replace('\'', "''")
    );
    let result = conn.exec(&query)?;
    if !result.is_ok() {
        return Err(WorkerError::protocol("failed to query pg_replication_slots"));
    }
    if result.ntuples() == 0 {
        return Err(WorkerError::protocol(format!("replication slot '{slot_name}' does not exist")));
    }

    let Some(active_pid) = result.getvalue(0, 0) else {
        return Ok(());
    };
    let Ok(active_pid) = active_pid.parse::<i32>() else {
        return Ok(());
    };
    if active_pid == conn.backend_pid() {
        return Ok(());
    }

    warn!(slot = slot_name, pid = active_pid, "slot occupied by a stale backend, terminating it");
    let terminate = conn.exec(&format!("SELECT pg_terminate_backend({active_pid})"))?;
    if !terminate.is_ok() {
        return Err(WorkerError::protocol(format!("failed to terminate stale backend {active_pid}")));
    }
    Ok(())
}

fn start_replication(conn: &PgConnection, slot_name: &str, publication_name: &str) -> Result<(), WorkerError> {
    let sql = format!(
        "START_REPLICATION SLOT \"{slot_name}\" LOGICAL 0/0 (proto_version '1', publication_names '{publication_name}')"
    );
    let result = conn.exec(&sql)?;
    if result.status() != ExecStatusType::PGRES_COPY_BOTH {
        return Err(WorkerError::protocol(format!("START_REPLICATION failed: {:?}", result.status())));
    }
    Ok(())
}

fn send_feedback(conn: &PgConnection, flush_lsn: u64) -> Result<(), WorkerError> {
    let message = build_standby_status_update(flush_lsn)?;
    conn.put_copy_data(&message)?;
    conn.flush()?;
    debug!(flush_lsn, "sent standby status update");
    Ok(())
}
