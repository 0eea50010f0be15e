//! Job queue contracts.
//!
//! One logical queue per worker type: `fetch`, plus `analyze.<module>` for
//! every analysis module. Delivery is at-least-once; a consumer must `ack`
//! a delivery when done or `nack` it to have it redelivered later.

pub mod memory;

use crate::error::QueueError;
use crate::models::ModuleKind;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

pub use memory::{MemoryQueue, QueueSettings};

/// Name of a logical queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueName {
    Fetch,
    Module(ModuleKind),
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueName::Fetch => write!(f, "fetch"),
            QueueName::Module(module) => write!(f, "analyze.{}", module.id()),
        }
    }
}

/// Capture the target page of an analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchTask {
    pub analysis_id: String,
    pub asset_path: String,
}

/// Run one module against the captured assets of an analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleTask {
    pub analysis_id: String,
    pub asset_path: String,
    pub module: ModuleKind,
}

/// Every payload that travels through the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Task {
    Fetch(FetchTask),
    Module(ModuleTask),
}

impl Task {
    /// The queue this task belongs on.
    pub fn queue(&self) -> QueueName {
        match self {
            Task::Fetch(_) => QueueName::Fetch,
            Task::Module(task) => QueueName::Module(task.module),
        }
    }

    pub fn analysis_id(&self) -> &str {
        match self {
            Task::Fetch(task) => &task.analysis_id,
            Task::Module(task) => &task.analysis_id,
        }
    }
}

/// Settles a delivery. Implemented by each queue backend.
pub trait Acknowledger: Send + Sync {
    fn ack(self: Arc<Self>, delivery_id: u64);
    fn nack(self: Arc<Self>, delivery_id: u64, task: Task, attempt: u32);
}

/// One delivery of a task to a consumer.
///
/// Dropping a delivery without settling it leaves the task unacknowledged;
/// the in-memory queue treats that like a `nack`.
pub struct Delivery {
    pub task: Task,
    /// 1 for the first delivery, incremented on every redelivery.
    pub attempt: u32,
    delivery_id: u64,
    acker: Option<Arc<dyn Acknowledger>>,
}

impl Delivery {
    pub(crate) fn new(
        task: Task,
        attempt: u32,
        delivery_id: u64,
        acker: Arc<dyn Acknowledger>,
    ) -> Self {
        Self {
            task,
            attempt,
            delivery_id,
            acker: Some(acker),
        }
    }

    /// The task was handled; never deliver it again.
    pub fn ack(mut self) {
        if let Some(acker) = self.acker.take() {
            acker.ack(self.delivery_id);
        }
    }

    /// The task could not be handled now; redeliver it after a backoff.
    pub fn nack(mut self) {
        if let Some(acker) = self.acker.take() {
            acker.nack(self.delivery_id, self.task.clone(), self.attempt);
        }
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if let Some(acker) = self.acker.take() {
            acker.nack(self.delivery_id, self.task.clone(), self.attempt);
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("task", &self.task)
            .field("attempt", &self.attempt)
            .field("delivery_id", &self.delivery_id)
            .finish()
    }
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Put a task on the queue named by [`Task::queue`].
    async fn enqueue(&self, task: Task) -> Result<(), QueueError>;

    /// Wait for the next delivery on `queue`. `None` once the queue is closed.
    async fn receive(&self, queue: QueueName) -> Option<Delivery>;

    /// Stop delivering; pending receivers return `None`.
    fn close(&self);
}
