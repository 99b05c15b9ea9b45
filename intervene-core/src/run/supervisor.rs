use std::future::Future;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{RunError, run_and_finish};
use crate::config::Config;
use crate::events::{RunEvent, RunLogger};

/// A started run: its id and the receiving end of its event stream.
pub struct RunHandle {
    pub run_id: String,
    pub events: mpsc::UnboundedReceiver<RunEvent>,
}

struct ActiveRun {
    logger: RunLogger,
    task: JoinHandle<()>,
}

/// Runs at most one pipeline at a time, each on its own tokio task.
///
/// Starting a run aborts the one in flight. The aborted run's stream gets a
/// terminal `done` event carrying a cancellation error.
#[derive(Default)]
pub struct RunSupervisor {
    active: Mutex<Option<ActiveRun>>,
}

impl RunSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> MutexGuard<'_, Option<ActiveRun>> {
        // A panic while holding the slot leaves nothing half-written.
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start a run of `config`, cancelling any run in flight.
    pub fn start(&self, config: Config, objective: Option<String>) -> RunHandle {
        let run_id = uuid::Uuid::new_v4().to_string();
        let (logger, events) = RunLogger::channel(run_id.clone());
        self.start_with(logger.clone(), run_and_finish(config, objective, logger));
        RunHandle { run_id, events }
    }

    /// Spawn `job` as the active run. `logger` must be the one `job` reports to.
    pub fn start_with<F>(&self, logger: RunLogger, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut slot = self.slot();
        if let Some(previous) = slot.take() {
            cancel_run(previous);
        }
        log::debug!("starting run {}", logger.run_id());
        let task = tokio::spawn(job);
        *slot = Some(ActiveRun { logger, task });
    }

    /// Cancel the active run. Returns true if a run was still in flight.
    pub fn cancel(&self) -> bool {
        match self.slot().take() {
            Some(run) => cancel_run(run),
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.slot()
            .as_ref()
            .is_some_and(|run| !run.logger.is_finished() && !run.task.is_finished())
    }
}

fn cancel_run(run: ActiveRun) -> bool {
    run.task.abort();
    let cancelled = run.logger.finish(Err(RunError::Cancelled.to_string()));
    if cancelled {
        log::info!("cancelled run {}", run.logger.run_id());
    }
    cancelled
}
