use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::config::{QueueConfig, QueueOverflow};
use crate::error::{JudgeError, Result};

/// Bounded FIFO of job IDs waiting for a worker.
///
/// Producers push through a bounded `mpsc` channel. All consumers share the
/// single receiver behind a fair async mutex, so IDs leave in arrival order
/// and each ID is delivered to exactly one worker. Only the start of
/// execution is ordered; jobs finish in whatever order their runs end.
#[derive(Debug)]
pub struct JobQueue {
    tx: mpsc::Sender<Uuid>,
    rx: Mutex<mpsc::Receiver<Uuid>>,
    capacity: usize,
    overflow: QueueOverflow,
    enqueue_timeout: Duration,
}

impl JobQueue {
    pub fn new(config: &QueueConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.capacity);
        Self {
            tx,
            rx: Mutex::new(rx),
            capacity: config.capacity,
            overflow: config.overflow,
            enqueue_timeout: config.enqueue_timeout,
        }
    }

    /// Queue with the default overflow policy (fail fast).
    pub fn with_capacity(capacity: usize) -> Self {
        Self::new(&QueueConfig {
            capacity,
            ..QueueConfig::default()
        })
    }

    /// Add a job ID. Never waits longer than the configured enqueue timeout.
    pub async fn enqueue(&self, job_id: Uuid) -> Result<()> {
        match self.overflow {
            QueueOverflow::Reject => self.try_enqueue(job_id),
            QueueOverflow::Block => {
                match tokio::time::timeout(self.enqueue_timeout, self.tx.send(job_id)).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(_)) => Err(JudgeError::QueueClosed),
                    Err(_) => Err(JudgeError::QueueSaturated {
                        capacity: self.capacity,
                    }),
                }
            }
        }
    }

    /// Add a job ID without waiting.
    pub fn try_enqueue(&self, job_id: Uuid) -> Result<()> {
        self.tx.try_send(job_id).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => JudgeError::QueueSaturated {
                capacity: self.capacity,
            },
            mpsc::error::TrySendError::Closed(_) => JudgeError::QueueClosed,
        })
    }

    /// Wait for the next job ID. Cancel-safe: dropping the future before it
    /// resolves loses no ID and releases the receiver for other workers.
    pub async fn dequeue(&self) -> Option<Uuid> {
        let mut rx = self.rx.lock().await;
        rx.recv().await
    }

    /// Number of IDs currently waiting
    pub fn depth(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.depth() == 0
    }

    pub fn is_full(&self) -> bool {
        self.tx.capacity() == 0
    }
}
