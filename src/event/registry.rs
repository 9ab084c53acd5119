//! Run registry - maps run identifiers to their event streams
//!
//! Entries are created at run start and removed a grace period after the
//! terminal event, so a late subscriber can still drain the stream.
//! Cancellation is cooperative: the flag is checked by critic loops between
//! iterations; in-flight LLM calls finish but their results are discarded.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{ProbeError, Result};

use super::stream::{EventKind, RunEvent, RunStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Done,
    Error,
}

/// Everything the registry knows about one run
pub struct RunHandle {
    pub run_id: String,
    stream: RunStream,
    cancelled: Arc<AtomicBool>,
    subscribed: AtomicBool,
    status: RwLock<RunStatus>,
    output_file: RwLock<Option<String>>,
}

impl RunHandle {
    fn new(run_id: String, capacity: usize) -> Self {
        Self {
            run_id,
            stream: RunStream::new(capacity),
            cancelled: Arc::new(AtomicBool::new(false)),
            subscribed: AtomicBool::new(false),
            status: RwLock::new(RunStatus::Pending),
            output_file: RwLock::new(None),
        }
    }

    /// Publish onto this run's stream (discarded after the terminal event)
    pub fn publish(&self, kind: EventKind) -> bool {
        self.stream.publish(kind)
    }

    /// Shared view of this run's stream (for the orchestrator)
    pub fn stream(&self) -> RunStream {
        self.stream.clone()
    }

    /// Shared cancellation flag (for the orchestrator)
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn set_status(&self, status: RunStatus) {
        *self.status.write() = status;
    }

    pub fn status(&self) -> RunStatus {
        *self.status.read()
    }

    pub fn set_output_file(&self, file: impl Into<String>) {
        *self.output_file.write() = Some(file.into());
    }

    pub fn output_file(&self) -> Option<String> {
        self.output_file.read().clone()
    }

    /// Claim the single consumer slot for this run's stream
    pub fn subscribe(self: &Arc<Self>) -> Result<EventSubscriber> {
        if self
            .subscribed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ProbeError::StreamAlreadyClaimed {
                run_id: self.run_id.clone(),
            });
        }
        Ok(EventSubscriber {
            handle: Arc::clone(self),
        })
    }
}

/// The single consumer of one run's events
pub struct EventSubscriber {
    handle: Arc<RunHandle>,
}

impl EventSubscriber {
    /// Next event in publication order; `None` after the terminal event
    pub async fn next(&mut self) -> Option<RunEvent> {
        self.handle.stream.next().await
    }
}

/// Maps `run_id → RunHandle`; shared across the server and orchestrator
#[derive(Clone)]
pub struct RunRegistry {
    runs: Arc<DashMap<String, Arc<RunHandle>>>,
    grace_period: Duration,
    event_capacity: usize,
}

impl RunRegistry {
    pub fn new(grace_period: Duration, event_capacity: usize) -> Self {
        Self {
            runs: Arc::new(DashMap::new()),
            grace_period,
            event_capacity,
        }
    }

    /// Register a new run under a fresh UUID
    pub fn create(&self) -> Arc<RunHandle> {
        let run_id = Uuid::new_v4().to_string();
        let handle = Arc::new(RunHandle::new(run_id.clone(), self.event_capacity));
        self.runs.insert(run_id.clone(), Arc::clone(&handle));
        info!(run_id, "run registered");
        handle
    }

    pub fn get(&self, run_id: &str) -> Option<Arc<RunHandle>> {
        self.runs.get(run_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Cooperatively cancel a run
    pub fn cancel(&self, run_id: &str) -> Result<()> {
        let handle = self.get(run_id).ok_or_else(|| ProbeError::RunNotFound {
            run_id: run_id.to_string(),
        })?;
        handle.cancel();
        info!(run_id, "run cancellation requested");
        Ok(())
    }

    /// Schedule eviction after the grace period following a terminal event.
    ///
    /// The grace period lets a late subscriber attach and drain the stream.
    pub fn schedule_cleanup(&self, run_id: &str) {
        let runs = Arc::clone(&self.runs);
        let run_id = run_id.to_string();
        let grace = self.grace_period;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if runs.remove(&run_id).is_some() {
                debug!(run_id, "run evicted after grace period");
            }
        });
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}
