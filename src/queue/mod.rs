//! # Deferred Creation Queue
//!
//! An in-process, unbounded MPSC queue that absorbs bulk subscription
//! creation so a single slow item cannot stall the broker connection.
//! Producers (HTTP request tasks, the bulk-import handler) enqueue without
//! blocking; one [`TaskProcessor`](processor::TaskProcessor) per queue drains
//! it in strict FIFO order.

pub mod processor;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::services::SubscriptionRequest;

pub use processor::{ProcessorStatsSnapshot, TaskProcessor};

/// One partition of deferred bulk subscription creation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreationTask {
    pub items: Vec<SubscriptionRequest>,
    pub username: String,
    pub queue_id: i64,

    /// Completion destination; `None` means nobody is listening
    pub destination: Option<String>,
}

/// Producer half of the creation queue; cheap to clone
#[derive(Debug, Clone)]
pub struct TaskQueue {
    tx: mpsc::UnboundedSender<CreationTask>,
}

impl TaskQueue {
    /// Create a queue and the receiver its processor will consume
    pub fn unbounded() -> (Self, mpsc::UnboundedReceiver<CreationTask>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Enqueue a task; never blocks
    pub fn enqueue(&self, task: CreationTask) -> Result<(), QueueError> {
        self.tx.send(task).map_err(|_| QueueError::Closed)
    }
}

/// Split a bulk request into the synchronous first partition and the deferred
/// remainder
///
/// The first partition is processed in the caller's task so the requester gets
/// immediate partial feedback; the rest become [`CreationTask`]s. A size of
/// zero is treated as one.
pub fn partition<T>(items: Vec<T>, size: usize) -> (Vec<T>, Vec<Vec<T>>) {
    let size = size.max(1);
    let mut chunks: Vec<Vec<T>> = Vec::new();
    let mut first = Vec::new();

    for item in items {
        if first.len() < size {
            first.push(item);
            continue;
        }
        match chunks.last_mut() {
            Some(chunk) if chunk.len() < size => chunk.push(item),
            _ => chunks.push(vec![item]),
        }
    }

    (first, chunks)
}

/// Queue errors
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("creation queue is closed")]
    Closed,
}
