use dashmap::{mapref::entry::Entry, DashMap};

use crate::types::Topic;

#[derive(Debug, PartialEq, Eq)]
pub enum ApplyDecision {
    ApplyInOrder,
    DropOld,
    GapDetected { expected: u64, got: u64 },
}

/// Per-topic sequence watermark. The first sequence seen on a topic is the baseline.
#[derive(Debug, Default)]
pub struct OrderingGuard {
    last_applied: DashMap<Topic, u64>,
}

impl OrderingGuard {
    pub fn new() -> Self {
        Self {
            last_applied: DashMap::new(),
        }
    }

    /// Classifies `incoming` and advances the watermark unless it is a duplicate.
    pub fn classify(&self, topic: &Topic, incoming: u64) -> ApplyDecision {
        match self.last_applied.entry(topic.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(incoming);
                ApplyDecision::ApplyInOrder
            }
            Entry::Occupied(mut slot) => {
                let last = *slot.get();

                if incoming <= last {
                    return ApplyDecision::DropOld;
                }

                // gaps advance too; the caller refetches
                slot.insert(incoming);
                let expected = last + 1;
                if incoming != expected {
                    ApplyDecision::GapDetected {
                        expected,
                        got: incoming,
                    }
                } else {
                    ApplyDecision::ApplyInOrder
                }
            }
        }
    }

    pub fn reset(&self, topic: &Topic) {
        self.last_applied.remove(topic);
    }

    pub fn clear(&self) {
        self.last_applied.clear();
    }
}
