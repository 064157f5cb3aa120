//! Converges running Stream Workers toward the control-plane's desired
//! set of active slots (§4.4). Workers are tracked in an explicit,
//! mutex-guarded field rather than process-global state, so the
//! Supervisor can be constructed, tested, and torn down like any other
//! value (§9's "global registry" design note).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::store::{ArchiveStore, ControlPlaneStore, SlotDescriptor};
use crate::worker::StreamWorker;

/// Runtime record for one running worker (§3). `run_flag` is owned here
/// and handed to the worker at spawn time; clearing it is how the
/// Supervisor asks a worker to stop.
struct WorkerHandle {
    descriptor: SlotDescriptor,
    run_flag: Arc<AtomicBool>,
    task: tokio::task::JoinHandle<()>,
}

pub struct Supervisor {
    control_plane: Arc<dyn ControlPlaneStore>,
    archive_store: Arc<dyn ArchiveStore>,
    workers: Mutex<HashMap<String, WorkerHandle>>,
    feedback_interval: Duration,
    reconnect_backoff: Duration,
    read_timeout: Duration,
}

impl Supervisor {
    pub fn new(
        control_plane: Arc<dyn ControlPlaneStore>,
        archive_store: Arc<dyn ArchiveStore>,
        feedback_interval: Duration,
        reconnect_backoff: Duration,
        read_timeout: Duration,
    ) -> Self {
        Self {
            control_plane,
            archive_store,
            workers: Mutex::new(HashMap::new()),
            feedback_interval,
            reconnect_backoff,
            read_timeout,
        }
    }

    /// Runs `reconcile` every `check_interval` until cancelled. Intended
    /// to be the body of the process's main task.
    pub async fn run(&self, check_interval: Duration) {
        let mut ticker = tokio::time::interval(check_interval);
        loop {
            ticker.tick().await;
            self.reconcile().await;
        }
    }

    /// One reconciliation pass, steps 1-5 of §4.4.
    pub async fn reconcile(&self) {
        let desired = match self.control_plane.active_slots().await {
            Ok(slots) => slots,
            Err(error) => {
                // Fail-open (§4.4, §7 item 6): keep the existing worker set.
                warn!(%error, "failed to fetch active slots from control-plane store, keeping existing workers");
                return;
            }
        };

        let mut workers = self.workers.lock().await;
        let desired_by_id: HashMap<&str, &SlotDescriptor> =
            desired.iter().map(|d| (d.db_id.as_str(), d)).collect();

        // Step 3: tear down workers for slots no longer desired.
        let to_remove: Vec<String> =
            workers.keys().filter(|db_id| !desired_by_id.contains_key(db_id.as_str())).cloned().collect();
        for db_id in to_remove {
            if let Some(handle) = workers.remove(&db_id) {
                info!(db_id, "slot no longer active, stopping worker");
                handle.run_flag.store(false, Ordering::Release);
            }
        }

        // Step 5: restart workers whose descriptor changed.
        let mut to_restart = Vec::new();
        for descriptor in &desired {
            if let Some(handle) = workers.get(&descriptor.db_id) {
                if &handle.descriptor != descriptor {
                    to_restart.push(descriptor.clone());
                }
            }
        }
        for descriptor in to_restart {
            if let Some(handle) = workers.remove(&descriptor.db_id) {
                info!(db_id = %descriptor.db_id, "slot descriptor changed, restarting worker");
                handle.run_flag.store(false, Ordering::Release);
                handle.task.abort();
            }
            self.spawn_worker(&mut workers, descriptor);
        }

        // Step 4: spawn workers for newly desired slots.
        for descriptor in desired {
            if !workers.contains_key(&descriptor.db_id) {
                self.spawn_worker(&mut workers, descriptor);
            }
        }
    }

    /// Starts a worker for `descriptor` immediately rather than waiting
    /// for the next poll tick. Idempotent: a no-op if a worker for this
    /// `db_id` is already running (§4.4).
    pub async fn notify_new_slot(&self, descriptor: SlotDescriptor) {
        let mut workers = self.workers.lock().await;
        if workers.contains_key(&descriptor.db_id) {
            return;
        }
        info!(db_id = %descriptor.db_id, "starting worker from direct notification");
        self.spawn_worker(&mut workers, descriptor);
    }

    pub async fn running_worker_count(&self) -> usize {
        self.workers.lock().await.len()
    }

    fn spawn_worker(&self, workers: &mut HashMap<String, WorkerHandle>, descriptor: SlotDescriptor) {
        let run_flag = Arc::new(AtomicBool::new(true));
        let worker = StreamWorker::new(
            descriptor.clone(),
            run_flag.clone(),
            self.archive_store.clone(),
            self.feedback_interval,
            self.reconnect_backoff,
            self.read_timeout,
        );
        let task = tokio::spawn(worker.run());
        workers.insert(descriptor.db_id.clone(), WorkerHandle { descriptor, run_flag, task });
    }
}
