//! Engine event system.
//!
//! [`EventBus`] wraps a `tokio::sync::broadcast` channel with a bounded
//! ring-buffer of recent events so that late-joining observers can catch up.
//! Events are best effort: the durable record of a job is always its
//! persisted row, never the event stream.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::ids::{BatchId, JobId, StepId};
use crate::pipeline::BatchStatus;

/// Maximum number of events retained in the ring buffer.
const MAX_RECENT_EVENTS: usize = 100;

// ---------------------------------------------------------------------------
// EventPayload
// ---------------------------------------------------------------------------

/// Payload describing what happened.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    // -- Job lifecycle -------------------------------------------------------
    JobStarted {
        job_id: JobId,
    },
    StepStarted {
        job_id: JobId,
        step_id: StepId,
        label: String,
    },
    StepCompleted {
        job_id: JobId,
        step_id: StepId,
        output_url: String,
    },
    JobCompleted {
        job_id: JobId,
        output_url: String,
    },
    JobFailed {
        job_id: JobId,
        error: String,
    },

    // -- External generation -------------------------------------------------
    GenerationQueued {
        job_id: JobId,
        request_id: String,
    },
    GenerationStatus {
        job_id: JobId,
        status: String,
    },

    // -- Batch ---------------------------------------------------------------
    BatchProgress {
        batch_id: BatchId,
        status: BatchStatus,
        completed: u32,
        failed: u32,
        total: u32,
    },
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// A timestamped event ready for broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique event identifier.
    pub id: Uuid,
    /// When the event occurred.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub payload: EventPayload,
}

impl Event {
    /// Create a new event with a fresh UUID and the current timestamp.
    pub fn new(payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Broadcast channel with a bounded ring buffer of recent events.
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    recent: RwLock<VecDeque<Event>>,
}

impl EventBus {
    /// Create a new event bus.
    ///
    /// `capacity` controls the broadcast channel buffer size (not the ring
    /// buffer, which is always [`MAX_RECENT_EVENTS`]).
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            recent: RwLock::new(VecDeque::with_capacity(MAX_RECENT_EVENTS)),
        }
    }

    /// Subscribe to the broadcast channel.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Broadcast an event to all current subscribers and store it in the
    /// ring buffer.
    pub fn broadcast(&self, payload: EventPayload) {
        let event = Event::new(payload);

        {
            let mut recent = self.recent.write();
            if recent.len() >= MAX_RECENT_EVENTS {
                recent.pop_back();
            }
            recent.push_front(event.clone());
        }

        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    /// Return the `n` most recent events (newest first).
    pub fn recent_events(&self, n: usize) -> Vec<Event> {
        let recent = self.recent.read();
        recent.iter().take(n).cloned().collect()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
