//! Dead letter queue for exchanges that exhausted redelivery.
//!
//! The queue is bounded: when full, the oldest entry is dropped to make room.
//! It is cheap to clone; clones share the same storage.
//!
//! # Example
//!
//! ```
//! use conduit_core::{Exchange, Failure};
//! use conduit_runtime::dead_letter::DeadLetterQueue;
//!
//! let dlq = DeadLetterQueue::new(100);
//! let mut exchange = Exchange::new();
//! exchange.set_failure(Failure::msg("Connection timeout"));
//!
//! dlq.push(exchange, 3);
//! assert_eq!(dlq.len(), 1);
//! assert_eq!(dlq.peek().unwrap().error_message, "Connection timeout");
//! ```

use chrono::{DateTime, Utc};
use conduit_core::Exchange;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

/// One dead-lettered exchange.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    /// The exchange, as it was when redelivery gave up.
    pub exchange: Exchange,

    /// Number of redelivery attempts made.
    pub redeliveries: u32,

    /// The failure message, empty when the exchange carried none.
    pub error_message: String,

    /// When the entry was queued.
    pub failed_at: DateTime<Utc>,
}

/// Bounded FIFO of dead letters.
#[derive(Debug, Clone)]
pub struct DeadLetterQueue {
    queue: Arc<Mutex<VecDeque<DeadLetter>>>,
    max_size: usize,
}

impl DeadLetterQueue {
    /// Create a queue holding at most `max_size` entries.
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: Arc::new(Mutex::new(VecDeque::new())),
            max_size,
        }
    }

    /// Queue an exchange, dropping the oldest entry if full.
    pub fn push(&self, exchange: Exchange, redeliveries: u32) {
        let error_message = exchange
            .failure()
            .or_else(|| exchange.exception_caught())
            .map(ToString::to_string)
            .unwrap_or_default();

        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);

        if queue.len() >= self.max_size {
            queue.pop_front();
            metrics::counter!("conduit_dlq_dropped_total").increment(1);
            tracing::warn!(max_size = self.max_size, "Dead letter queue at capacity, dropping oldest entry");
        }

        let exchange_id = exchange.id().clone();
        queue.push_back(DeadLetter {
            exchange,
            redeliveries,
            error_message,
            failed_at: Utc::now(),
        });

        // Queue length is bounded by max_size, far below f64's exact integer range
        #[allow(clippy::cast_precision_loss)]
        metrics::gauge!("conduit_dlq_size").set(queue.len() as f64);
        metrics::counter!("conduit_dlq_pushed_total").increment(1);

        tracing::warn!(
            exchange_id = %exchange_id,
            redeliveries,
            queue_size = queue.len(),
            "Exchange moved to dead letter queue"
        );
    }

    /// Current number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return all entries, oldest first.
    pub fn drain(&self) -> Vec<DeadLetter> {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        let entries: Vec<_> = queue.drain(..).collect();

        metrics::gauge!("conduit_dlq_size").set(0.0);
        tracing::info!(count = entries.len(), "Drained dead letter queue");

        entries
    }

    /// The oldest entry, without removing it.
    #[must_use]
    pub fn peek(&self) -> Option<DeadLetter> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .front()
            .cloned()
    }

    /// Maximum number of entries.
    #[must_use]
    pub const fn max_size(&self) -> usize {
        self.max_size
    }
}

impl Default for DeadLetterQueue {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::Failure;
    use serde_json::json;

    #[test]
    fn test_drops_oldest_when_full() {
        let dlq = DeadLetterQueue::new(2);
        for body in ["a", "b", "c"] {
            let mut exchange = Exchange::with_body(json!(body));
            exchange.set_failure(Failure::msg(format!("{body} failed")));
            dlq.push(exchange, 1);
        }

        let entries = dlq.drain();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].exchange.body(), &json!("b"));
        assert_eq!(entries[1].error_message, "c failed");
        assert!(dlq.is_empty());
    }

    #[test]
    fn test_clones_share_storage() {
        let dlq = DeadLetterQueue::new(10);
        let clone = dlq.clone();

        clone.push(Exchange::new(), 0);

        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq.peek().unwrap().error_message, "");
    }
}
