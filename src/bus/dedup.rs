use std::collections::{BTreeSet, HashMap};

use crate::domain::SignalKey;

/// Bounded memory of seen `(producer_id, sequence_id)` pairs.
///
/// Once a producer's window is full the oldest ids are forgotten and everything at
/// or below them is treated as already seen, which is sound because sequence ids
/// only grow per producer.
#[derive(Debug)]
pub struct Deduplicator {
    capacity: usize,
    seen: HashMap<String, ProducerWindow>,
}

#[derive(Debug, Default)]
struct ProducerWindow {
    ids: BTreeSet<u64>,
    floor: Option<u64>,
}

impl Deduplicator {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            seen: HashMap::new(),
        }
    }

    pub fn contains(&self, key: &SignalKey) -> bool {
        self.seen.get(&key.producer_id).map_or(false, |w| {
            w.floor.map_or(false, |f| key.sequence_id <= f) || w.ids.contains(&key.sequence_id)
        })
    }

    /// Record a key; returns false if it was already seen
    pub fn insert(&mut self, key: &SignalKey) -> bool {
        if self.contains(key) {
            return false;
        }
        let window = self.seen.entry(key.producer_id.clone()).or_default();
        window.ids.insert(key.sequence_id);
        while window.ids.len() > self.capacity {
            if let Some(oldest) = window.ids.pop_first() {
                window.floor = Some(window.floor.map_or(oldest, |f| f.max(oldest)));
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.seen.values().map(|w| w.ids.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
