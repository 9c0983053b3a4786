//! Bounded fan-out of readings from producers to consumers.
//!
//! Backed by a `tokio::sync::broadcast` channel. A consumer that falls more
//! than `capacity` readings behind loses the oldest ones; the loss is counted
//! and logged, never silent.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;

use crate::sensor::Reading;

#[derive(Clone)]
pub struct ReadingBus {
    tx: broadcast::Sender<Reading>,
    dropped: Arc<AtomicU64>,
}

impl ReadingBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish a reading; returns how many consumers will see it.
    pub fn publish(&self, reading: Reading) -> usize {
        self.tx.send(reading).unwrap_or(0)
    }

    pub fn subscribe(&self) -> BusReceiver {
        BusReceiver {
            rx: self.tx.subscribe(),
            dropped: self.dropped.clone(),
        }
    }

    /// Readings lost to slow consumers since start.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

pub struct BusReceiver {
    rx: broadcast::Receiver<Reading>,
    dropped: Arc<AtomicU64>,
}

impl BusReceiver {
    /// Next reading, skipping over any lag. `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<Reading> {
        loop {
            match self.rx.recv().await {
                Ok(reading) => return Some(reading),
                Err(RecvError::Lagged(n)) => {
                    self.dropped.fetch_add(n, Ordering::Relaxed);
                    warn!(dropped = n, "consumer lagged, oldest readings dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}
