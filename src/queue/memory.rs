//! In-process queue with at-least-once delivery.
//!
//! Tasks are stored as JSON payloads and decoded on receive, so a payload
//! that does not match its queue is caught at the boundary and
//! dead-lettered instead of reaching a handler.

use super::{Acknowledger, Delivery, JobQueue, QueueName, Task};
use crate::error::QueueError;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, warn};

/// Redelivery behaviour of the queue.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Delay before the first redelivery of a nacked task.
    pub redelivery_base: Duration,
    pub redelivery_max: Duration,
    /// Deliveries after which a nacked task is dead-lettered.
    pub max_deliveries: u32,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            redelivery_base: Duration::from_millis(500),
            redelivery_max: Duration::from_secs(30),
            max_deliveries: 5,
        }
    }
}

impl QueueSettings {
    fn redelivery_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.redelivery_base
            .saturating_mul(1u32 << exponent)
            .min(self.redelivery_max)
    }
}

/// A payload that will never be delivered again.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub queue: String,
    pub payload: String,
    pub reason: String,
}

struct Envelope {
    payload: Vec<u8>,
    attempt: u32,
}

struct Inner {
    settings: QueueSettings,
    queues: Mutex<HashMap<QueueName, VecDeque<Envelope>>>,
    notifiers: Mutex<HashMap<QueueName, Arc<Notify>>>,
    in_flight: Mutex<HashSet<u64>>,
    enqueued: Mutex<HashMap<QueueName, u64>>,
    dead_letters: Mutex<Vec<DeadLetter>>,
    next_delivery: AtomicU64,
    closed: AtomicBool,
}

impl Inner {
    fn notifier(&self, queue: QueueName) -> Arc<Notify> {
        let mut notifiers = self.notifiers.lock().unwrap_or_else(|e| e.into_inner());
        notifiers.entry(queue).or_default().clone()
    }

    fn push(&self, queue: QueueName, envelope: Envelope) {
        self.queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(queue)
            .or_default()
            .push_back(envelope);
        self.notifier(queue).notify_one();
    }

    fn pop(&self, queue: QueueName) -> Option<Envelope> {
        self.queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(&queue)
            .and_then(VecDeque::pop_front)
    }

    fn dead_letter(&self, queue: QueueName, payload: &[u8], reason: String) {
        error!("Dead-lettering task on {}: {}", queue, reason);
        self.dead_letters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(DeadLetter {
                queue: queue.to_string(),
                payload: String::from_utf8_lossy(payload).to_string(),
                reason,
            });
    }

    /// Decode a payload and check it belongs on the queue it came from.
    fn decode(queue: QueueName, payload: &[u8]) -> Result<Task, String> {
        let task: Task =
            serde_json::from_slice(payload).map_err(|e| format!("malformed payload: {}", e))?;
        if task.queue() != queue {
            return Err(format!("task for {} delivered to {}", task.queue(), queue));
        }
        Ok(task)
    }
}

impl Acknowledger for Inner {
    fn ack(self: Arc<Self>, delivery_id: u64) {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&delivery_id);
    }

    fn nack(self: Arc<Self>, delivery_id: u64, task: Task, attempt: u32) {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&delivery_id);

        let queue = task.queue();
        let payload = match serde_json::to_vec(&task) {
            Ok(payload) => payload,
            Err(e) => {
                self.dead_letter(queue, &[], format!("failed to re-encode task: {}", e));
                return;
            }
        };

        if attempt >= self.settings.max_deliveries {
            self.dead_letter(
                queue,
                &payload,
                format!("gave up after {} deliveries", attempt),
            );
            return;
        }

        let delay = self.settings.redelivery_delay(attempt);
        debug!("Redelivering task on {} in {:?}", queue, delay);
        let envelope = Envelope {
            payload,
            attempt: attempt + 1,
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) if !delay.is_zero() => {
                // Hold only a weak reference while waiting, so a dropped queue
                // is not kept alive by its timers.
                let inner = Arc::downgrade(&self);
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(inner) = inner.upgrade() {
                        inner.push(queue, envelope);
                    }
                });
            }
            _ => self.push(queue, envelope),
        }
    }
}

/// Queue held entirely in process memory.
#[derive(Clone)]
pub struct MemoryQueue {
    inner: Arc<Inner>,
}

impl MemoryQueue {
    pub fn new(settings: QueueSettings) -> Self {
        let inner = Arc::new(Inner {
            settings,
            queues: Mutex::new(HashMap::new()),
            notifiers: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
            enqueued: Mutex::new(HashMap::new()),
            dead_letters: Mutex::new(Vec::new()),
            next_delivery: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        });
        Self { inner }
    }

    /// Number of tasks ever enqueued on `queue` (redeliveries excluded).
    #[cfg(test)]
    pub fn enqueued_count(&self, queue: QueueName) -> u64 {
        self.inner
            .enqueued
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&queue)
            .copied()
            .unwrap_or(0)
    }

    /// Tasks waiting on `queue`, not counting in-flight deliveries.
    #[cfg(test)]
    pub fn depth(&self, queue: QueueName) -> usize {
        self.inner
            .queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&queue)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    pub fn in_flight(&self) -> usize {
        self.inner
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner
            .dead_letters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Push a raw payload, bypassing encoding. Exercises the boundary check.
    #[cfg(test)]
    pub(crate) fn push_raw(&self, queue: QueueName, payload: &[u8]) {
        self.inner.push(
            queue,
            Envelope {
                payload: payload.to_vec(),
                attempt: 1,
            },
        );
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(QueueSettings::default())
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, task: Task) -> Result<(), QueueError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }

        let queue = task.queue();
        let payload = serde_json::to_vec(&task)?;

        *self
            .inner
            .enqueued
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(queue)
            .or_insert(0) += 1;

        debug!("Enqueued task for analysis {} on {}", task.analysis_id(), queue);
        self.inner.push(queue, Envelope { payload, attempt: 1 });
        Ok(())
    }

    async fn receive(&self, queue: QueueName) -> Option<Delivery> {
        let notify = self.inner.notifier(queue);

        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.inner.closed.load(Ordering::SeqCst) {
                return None;
            }

            while let Some(envelope) = self.inner.pop(queue) {
                match Inner::decode(queue, &envelope.payload) {
                    Ok(task) => {
                        let delivery_id = self.inner.next_delivery.fetch_add(1, Ordering::SeqCst);
                        self.inner
                            .in_flight
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .insert(delivery_id);

                        let acker: Arc<dyn Acknowledger> = self.inner.clone();
                        return Some(Delivery::new(task, envelope.attempt, delivery_id, acker));
                    }
                    Err(reason) => {
                        warn!("Rejected payload on {}: {}", queue, reason);
                        self.inner.dead_letter(queue, &envelope.payload, reason);
                    }
                }
            }

            notified.await;
        }
    }

    fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let notifiers = self
            .inner
            .notifiers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        for notify in notifiers.values() {
            notify.notify_waiters();
        }
    }
}
