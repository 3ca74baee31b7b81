use std::collections::VecDeque;

use super::FailoverEvent;

/// Maximum number of failover events to keep in history
pub const MAX_FAILOVER_HISTORY: usize = 100;

/// Fixed-capacity failover log; the oldest event is evicted first
#[derive(Debug, Clone)]
pub struct FailoverHistory {
    events: VecDeque<FailoverEvent>,
    capacity: usize,
}

impl FailoverHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, event: FailoverEvent) {
        if self.capacity == 0 {
            return;
        }
        while self.events.len() >= self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn latest(&self) -> Option<&FailoverEvent> {
        self.events.back()
    }

    /// Oldest first
    pub fn to_vec(&self) -> Vec<FailoverEvent> {
        self.events.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}

impl Default for FailoverHistory {
    fn default() -> Self {
        Self::new(MAX_FAILOVER_HISTORY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redundancy::{AudioSource, FailoverReason};
    use chrono::Utc;

    fn event(to: AudioSource) -> FailoverEvent {
        FailoverEvent {
            timestamp: Utc::now(),
            from: to.other(),
            to,
            reason: FailoverReason::Manual,
        }
    }

    #[test]
    fn test_history_evicts_oldest() {
        let mut history = FailoverHistory::new(3);
        history.push(event(AudioSource::Backup));
        history.push(event(AudioSource::Primary));
        history.push(event(AudioSource::Backup));
        history.push(event(AudioSource::Primary));

        assert_eq!(history.len(), 3);
        let kept: Vec<AudioSource> = history.to_vec().iter().map(|e| e.to).collect();
        assert_eq!(
            kept,
            vec![AudioSource::Primary, AudioSource::Backup, AudioSource::Primary]
        );
        assert_eq!(history.latest().map(|e| e.to), Some(AudioSource::Primary));
    }

    #[test]
    fn test_default_capacity() {
        let mut history = FailoverHistory::default();
        for _ in 0..(MAX_FAILOVER_HISTORY + 20) {
            history.push(event(AudioSource::Backup));
        }
        assert_eq!(history.len(), MAX_FAILOVER_HISTORY);
    }
}
