//! Saga runner
//!
//! Named background tasks with singleton semantics: at most one task runs
//! under a given name. Starting returns a `SagaCancel` bound to that name and
//! to the specific run, so a stale cancel from an earlier run can never stop a
//! later one.
//!
//! Misuse (double start, stale cancel) is reported as a `SagaError`. The
//! `start_saga` / `SagaCancel::cancel` conveniences also log it, and never panic.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info};

use crate::error::SagaError;
use crate::lock;

static NEXT_RUN_ID: AtomicU64 = AtomicU64::new(1);

/// Whatever the underlying concurrency primitive is, the runner only needs
/// to be able to cancel it and to ask whether it already ended.
pub trait TaskHandle: Send + Sync {
    fn cancel(&self);
    fn is_finished(&self) -> bool;
}

impl TaskHandle for AbortHandle {
    fn cancel(&self) {
        self.abort();
    }

    fn is_finished(&self) -> bool {
        AbortHandle::is_finished(self)
    }
}

impl<T: Send + 'static> TaskHandle for JoinHandle<T> {
    fn cancel(&self) {
        self.abort();
    }

    fn is_finished(&self) -> bool {
        JoinHandle::is_finished(self)
    }
}

struct RunningSaga {
    run_id: u64,
    handle: Box<dyn TaskHandle>,
}

type SagaTable = Mutex<HashMap<String, RunningSaga>>;

/// Registry of running sagas, keyed by name. Cheap to clone; clones share the table.
#[derive(Clone, Default)]
pub struct SagaRunner {
    sagas: Arc<SagaTable>,
}

impl SagaRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `task` under `name` unless a saga with that name is already running.
    ///
    /// The entry removes itself when `task` completes.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime, like `tokio::spawn`.
    pub fn try_start_saga<F>(&self, name: &str, task: F) -> Result<SagaCancel, SagaError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut table = lock(&self.sagas);
        prune_finished(&mut table, name);
        if table.contains_key(name) {
            return Err(SagaError::AlreadyRunning {
                name: name.to_string(),
            });
        }

        let run_id = self.spawn_into(&mut table, name, task);
        drop(table);

        info!(
            component = "saga",
            event = "saga.started",
            saga = %name,
            run_id,
            "Saga started"
        );
        Ok(SagaCancel::bound(&self.sagas, name, run_id))
    }

    /// Start `task` under `name`, cancelling whatever run held the name.
    ///
    /// The swap happens under one lock, so concurrent callers each get a live
    /// cancel and exactly one run survives.
    pub fn replace_saga<F>(&self, name: &str, task: F) -> SagaCancel
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut table = lock(&self.sagas);
        let previous = table.remove(name);
        let run_id = self.spawn_into(&mut table, name, task);
        drop(table);

        if let Some(previous) = previous {
            previous.handle.cancel();
            debug!(
                component = "saga",
                event = "saga.replaced",
                saga = %name,
                run_id = previous.run_id,
                "Previous run cancelled"
            );
        }
        info!(
            component = "saga",
            event = "saga.started",
            saga = %name,
            run_id,
            "Saga started"
        );
        SagaCancel::bound(&self.sagas, name, run_id)
    }

    /// Spawn `task` and record it under `name`. The caller holds the table lock.
    fn spawn_into<F>(&self, table: &mut HashMap<String, RunningSaga>, name: &str, task: F) -> u64
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let run_id = NEXT_RUN_ID.fetch_add(1, Ordering::Relaxed);
        let sagas = Arc::downgrade(&self.sagas);
        let owned_name = name.to_string();
        let join = tokio::spawn(async move {
            task.await;
            if let Some(sagas) = sagas.upgrade() {
                remove_completed(&sagas, &owned_name, run_id);
            }
        });

        table.insert(
            name.to_string(),
            RunningSaga {
                run_id,
                handle: Box::new(join.abort_handle()),
            },
        );
        run_id
    }

    /// Like `try_start_saga`, but a duplicate start is logged and answered with
    /// a cancel that does nothing.
    pub fn start_saga<F>(&self, name: &str, task: F) -> SagaCancel
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match self.try_start_saga(name, task) {
            Ok(cancel) => cancel,
            Err(e) => {
                error!(
                    component = "saga",
                    event = "saga.start.rejected",
                    saga = %name,
                    error = %e,
                    "Saga already running, start ignored"
                );
                SagaCancel::noop()
            }
        }
    }

    /// Track a task started elsewhere under `name`.
    pub fn register_saga(
        &self,
        name: &str,
        handle: Box<dyn TaskHandle>,
    ) -> Result<SagaCancel, SagaError> {
        let mut table = lock(&self.sagas);
        prune_finished(&mut table, name);
        if table.contains_key(name) {
            return Err(SagaError::AlreadyRunning {
                name: name.to_string(),
            });
        }

        let run_id = NEXT_RUN_ID.fetch_add(1, Ordering::Relaxed);
        table.insert(name.to_string(), RunningSaga { run_id, handle });
        drop(table);

        debug!(
            component = "saga",
            event = "saga.registered",
            saga = %name,
            run_id,
            "External task registered"
        );
        Ok(SagaCancel::bound(&self.sagas, name, run_id))
    }

    /// Cancel whatever run currently holds `name`.
    pub fn cancel_saga(&self, name: &str) -> Result<(), SagaError> {
        cancel_entry(&self.sagas, name, None)
    }

    pub fn is_saga_running(&self, name: &str) -> bool {
        let mut table = lock(&self.sagas);
        prune_finished(&mut table, name);
        table.contains_key(name)
    }

    /// Names of running sagas, sorted.
    pub fn running_sagas(&self) -> Vec<String> {
        let mut table = lock(&self.sagas);
        table.retain(|_, saga| !saga.handle.is_finished());
        let mut names: Vec<String> = table.keys().cloned().collect();
        names.sort();
        names
    }

    /// Cancel every running saga (shutdown).
    pub fn cancel_all(&self) {
        let drained: Vec<(String, RunningSaga)> = lock(&self.sagas).drain().collect();
        for (name, saga) in drained {
            saga.handle.cancel();
            debug!(
                component = "saga",
                event = "saga.cancelled",
                saga = %name,
                run_id = saga.run_id,
                "Saga cancelled on shutdown"
            );
        }
    }
}

/// Entries whose task ended without going through the wrapper (panic, or an
/// externally registered handle) are dropped before the table is consulted.
fn prune_finished(table: &mut HashMap<String, RunningSaga>, name: &str) {
    if table
        .get(name)
        .is_some_and(|saga| saga.handle.is_finished())
    {
        table.remove(name);
    }
}

fn remove_completed(sagas: &SagaTable, name: &str, run_id: u64) {
    let mut table = lock(sagas);
    if table.get(name).is_some_and(|saga| saga.run_id == run_id) {
        table.remove(name);
        debug!(
            component = "saga",
            event = "saga.completed",
            saga = %name,
            run_id,
            "Saga completed"
        );
    }
}

fn cancel_entry(sagas: &SagaTable, name: &str, run_id: Option<u64>) -> Result<(), SagaError> {
    let removed = {
        let mut table = lock(sagas);
        let same_run = table
            .get(name)
            .is_some_and(|saga| run_id.map_or(true, |id| id == saga.run_id));
        if same_run {
            table.remove(name)
        } else {
            None
        }
    };

    match removed {
        Some(saga) => {
            saga.handle.cancel();
            info!(
                component = "saga",
                event = "saga.cancelled",
                saga = %name,
                run_id = saga.run_id,
                "Saga cancelled"
            );
            Ok(())
        }
        None => {
            error!(
                component = "saga",
                event = "saga.cancel.stale",
                saga = %name,
                "Cancel called for a saga that is not running"
            );
            Err(SagaError::NotRunning {
                name: name.to_string(),
            })
        }
    }
}

#[derive(Clone)]
struct CancelTarget {
    sagas: Weak<SagaTable>,
    name: String,
    run_id: u64,
}

/// Cancels one specific saga run. Cloneable; every clone targets the same run.
#[derive(Clone)]
#[must_use = "dropping the cancel handle leaves the saga running with no way to stop this run"]
pub struct SagaCancel {
    target: Option<CancelTarget>,
}

impl SagaCancel {
    fn bound(sagas: &Arc<SagaTable>, name: &str, run_id: u64) -> Self {
        Self {
            target: Some(CancelTarget {
                sagas: Arc::downgrade(sagas),
                name: name.to_string(),
                run_id,
            }),
        }
    }

    /// Handle returned when a start was rejected. Cancelling it does nothing.
    pub fn noop() -> Self {
        Self { target: None }
    }

    pub fn is_noop(&self) -> bool {
        self.target.is_none()
    }

    pub fn name(&self) -> Option<&str> {
        self.target.as_ref().map(|t| t.name.as_str())
    }

    /// Stop the run this handle was created for.
    ///
    /// Cancelling a run that already ended (or was already cancelled) is logged
    /// and returns `SagaError::NotRunning`.
    pub fn cancel(&self) -> Result<(), SagaError> {
        let Some(target) = &self.target else {
            return Ok(());
        };
        match target.sagas.upgrade() {
            Some(sagas) => cancel_entry(&sagas, &target.name, Some(target.run_id)),
            None => {
                error!(
                    component = "saga",
                    event = "saga.cancel.stale",
                    saga = %target.name,
                    "Cancel called after the saga runner was dropped"
                );
                Err(SagaError::NotRunning {
                    name: target.name.clone(),
                })
            }
        }
    }
}

impl std::fmt::Debug for SagaCancel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.target {
            Some(t) => f
                .debug_struct("SagaCancel")
                .field("name", &t.name)
                .field("run_id", &t.run_id)
                .finish(),
            None => f.write_str("SagaCancel(noop)"),
        }
    }
}
