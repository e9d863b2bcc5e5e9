use crate::error::StepError;
use crate::types::{RunId, StepId, StepResult, StepStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tokio::sync::broadcast;

/// Step lifecycle notification emitted by the scheduler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub run_id: RunId,
    pub step_id: StepId,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(run_id: RunId, step_id: StepId, status: StepStatus) -> Self {
        Self {
            run_id,
            step_id,
            status,
            output: None,
            error: None,
            timestamp: Utc::now(),
        }
    }

    /// Event describing a settled step
    pub fn settled(run_id: RunId, step_id: StepId, result: &StepResult) -> Self {
        Self {
            run_id,
            step_id,
            status: result.status,
            output: result.output.clone(),
            error: result.error.clone(),
            timestamp: result.completed_at.unwrap_or_else(Utc::now),
        }
    }
}

/// Receiver of progress events.
///
/// Called inline by the scheduler, so implementations must return quickly and
/// must not block; hand the event off to a channel when real work is needed.
pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: ProgressEvent);
}

impl<F> ProgressSink for F
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn on_event(&self, event: ProgressEvent) {
        self(event)
    }
}

/// Publish/subscribe fan-out of progress events, one channel per run
pub struct ProgressHub {
    channels: Mutex<HashMap<RunId, broadcast::Sender<ProgressEvent>>>,
    capacity: usize,
}

impl ProgressHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Subscribe to the events of a run. Subscribing before the run starts is allowed.
    pub fn subscribe(&self, run_id: RunId) -> broadcast::Receiver<ProgressEvent> {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels
            .entry(run_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Send an event to the subscribers of its run. Without subscribers the event is dropped.
    pub fn publish(&self, event: ProgressEvent) {
        let channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(sender) = channels.get(&event.run_id) {
            // Err only means nobody is listening right now
            let _ = sender.send(event);
        }
    }

    /// Drop the channel of a finished run; subscribers observe `Closed`
    pub fn close(&self, run_id: RunId) {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&run_id);
    }

    pub fn subscriber_count(&self, run_id: RunId) -> usize {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&run_id)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}

impl Default for ProgressHub {
    fn default() -> Self {
        Self::new(256)
    }
}

impl ProgressSink for ProgressHub {
    fn on_event(&self, event: ProgressEvent) {
        self.publish(event);
    }
}
