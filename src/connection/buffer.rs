use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Outbound payload waiting for the link to come back
#[derive(Debug, Clone)]
pub struct BufferedMessage {
    pub payload: Vec<u8>,
    pub enqueued_at: Instant,
}

impl BufferedMessage {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            payload,
            enqueued_at: Instant::now(),
        }
    }

    pub fn is_expired(&self, ttl: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.enqueued_at) > ttl
    }
}

/// Bounded FIFO of outbound messages.
///
/// Overflow evicts the oldest message; expired messages are skipped when the
/// buffer is drained. Both are silent drops recorded in the counters.
#[derive(Debug)]
pub struct MessageBuffer {
    messages: VecDeque<BufferedMessage>,
    capacity: usize,
    ttl: Duration,
    dropped_overflow: u64,
    dropped_expired: u64,
}

impl MessageBuffer {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            messages: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            ttl,
            dropped_overflow: 0,
            dropped_expired: 0,
        }
    }

    /// Enqueue a message, returning true if an older message was evicted
    pub fn push(&mut self, message: BufferedMessage) -> bool {
        if self.capacity == 0 {
            self.dropped_overflow += 1;
            return true;
        }

        let mut evicted = false;
        while self.messages.len() >= self.capacity {
            self.messages.pop_front();
            self.dropped_overflow += 1;
            evicted = true;
        }
        self.messages.push_back(message);
        evicted
    }

    /// Put a message back at the head after a failed flush
    pub fn push_front(&mut self, message: BufferedMessage) {
        if self.messages.len() >= self.capacity {
            // The head is the oldest, so the returning message loses
            self.dropped_overflow += 1;
            return;
        }
        self.messages.push_front(message);
    }

    /// Next message that is still within its TTL, dropping expired ones
    pub fn pop_fresh(&mut self, now: Instant) -> Option<BufferedMessage> {
        while let Some(message) = self.messages.pop_front() {
            if message.is_expired(self.ttl, now) {
                self.dropped_expired += 1;
                debug!(
                    "Dropping buffered message ({} bytes) older than {:?}",
                    message.payload.len(),
                    self.ttl
                );
                continue;
            }
            return Some(message);
        }
        None
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn dropped_overflow(&self) -> u64 {
        self.dropped_overflow
    }

    pub fn dropped_expired(&self) -> u64 {
        self.dropped_expired
    }
}
