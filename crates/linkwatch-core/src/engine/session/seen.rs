// Bounded message-id dedup set with FIFO eviction.

use std::collections::{HashSet, VecDeque};

#[derive(Debug)]
pub struct SeenMessages {
    ids: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl SeenMessages {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        SeenMessages {
            ids: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    /// Record `id`. Returns false if it was already present.
    pub fn insert(&mut self, id: String) -> bool {
        if self.ids.contains(&id) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.ids.insert(id.clone());
        self.order.push_back(id);
        true
    }
}
