//! Per-deployment registry of in-flight tasks and their progress.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use chrono::{DateTime, Utc};
use log::{info, warn};
use thiserror::Error;

use crate::task::{DeployState, ProgressSink};

/// The last published progress record for one deployment.
#[derive(Debug, Clone)]
pub struct DeployProgress {
    pub state: DeployState,
    pub message: String,
    pub updated_at: DateTime<Utc>,
}

struct Slot {
    progress: DeployProgress,
    worker: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

impl Slot {
    /// Whether a worker for this deployment is still underway. A finished
    /// but unreaped handle does not count, so an abnormally dead worker
    /// cannot wedge its deployment name.
    fn underway(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|worker| !worker.is_finished())
    }
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error("Another deployment of {0} is already underway")]
    AlreadyUnderway(String),

    #[error("failed to spawn deployment worker: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Single-flight registry of deployment workers.
///
/// At most one live worker exists per deployment name. The supervisor is
/// the progress sink for its workers: every published record overwrites the
/// slot, and terminal records drop the worker handle while the record stays
/// observable. `stop_all` is wired to the host's shutdown signal.
#[derive(Default)]
pub struct TaskSupervisor {
    slots: Mutex<HashMap<String, Slot>>,
}

impl TaskSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// The last progress record for a deployment, if any was published.
    pub fn progress(&self, name: &str) -> Option<DeployProgress> {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.get(name).map(|slot| slot.progress.clone())
    }

    /// Whether a worker for the deployment is currently underway.
    pub fn underway(&self, name: &str) -> bool {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.get(name).is_some_and(Slot::underway)
    }

    /// Start a worker for the deployment unless one is already underway.
    /// The task receives the cooperative stop flag for its slot.
    pub fn start<F>(&self, name: &str, task: F) -> Result<(), StartError>
    where
        F: FnOnce(Arc<AtomicBool>) + Send + 'static,
    {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        if slots.get(name).is_some_and(Slot::underway) {
            return Err(StartError::AlreadyUnderway(name.to_string()));
        }

        let stop = Arc::new(AtomicBool::new(false));
        let worker = std::thread::Builder::new()
            .name(format!("deploy-{name}"))
            .spawn({
                let stop = Arc::clone(&stop);
                move || task(stop)
            })?;

        slots.insert(
            name.to_string(),
            Slot {
                progress: DeployProgress {
                    state: DeployState::Starting,
                    message: "Task is starting".to_string(),
                    updated_at: Utc::now(),
                },
                worker: Some(worker),
                stop,
            },
        );
        Ok(())
    }

    /// Signal every live worker to stop, wait for each, and clear the map.
    pub fn stop_all(&self) {
        let workers: Vec<(String, JoinHandle<()>)> = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots
                .iter_mut()
                .filter_map(|(name, slot)| {
                    slot.stop.store(true, Ordering::SeqCst);
                    slot.worker.take().map(|worker| (name.clone(), worker))
                })
                .collect()
        };

        for (name, worker) in workers {
            info!("waiting for deployment worker {name}");
            if worker.join().is_err() {
                warn!("deployment worker {name} panicked");
            }
        }

        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.clear();
    }
}

impl ProgressSink for TaskSupervisor {
    fn publish(&self, name: &str, state: DeployState, message: &str) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let progress = DeployProgress {
            state,
            message: message.to_string(),
            updated_at: Utc::now(),
        };
        match slots.get_mut(name) {
            Some(slot) => {
                slot.progress = progress;
                if state.is_terminal() {
                    // The slot becomes observable-only.
                    slot.worker = None;
                }
            }
            None => {
                slots.insert(
                    name.to_string(),
                    Slot {
                        progress,
                        worker: None,
                        stop: Arc::new(AtomicBool::new(false)),
                    },
                );
            }
        }
    }
}
