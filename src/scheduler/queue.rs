use std::collections::{HashSet, VecDeque};

use uuid::Uuid;

pub const DEFAULT_MAX_JOBS: usize = 10_000;

/// FIFO of job ids waiting for a worker slot. A job id is queued at most
/// once no matter how often it is discovered.
#[derive(Debug)]
pub struct DispatchQueue {
    order: VecDeque<Uuid>,
    queued: HashSet<Uuid>,
    max_jobs: usize,
}

impl Default for DispatchQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchQueue {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_JOBS)
    }

    pub fn with_capacity(max_jobs: usize) -> Self {
        Self {
            order: VecDeque::new(),
            queued: HashSet::new(),
            max_jobs,
        }
    }

    /// Queue a job. Returns false if the queue is at capacity; a job that is
    /// already queued counts as accepted.
    pub fn push(&mut self, id: Uuid) -> bool {
        if self.queued.contains(&id) {
            return true;
        }
        if self.is_full() {
            return false;
        }
        self.queued.insert(id);
        self.order.push_back(id);
        true
    }

    /// Oldest queued job.
    pub fn pop(&mut self) -> Option<Uuid> {
        let id = self.order.pop_front()?;
        self.queued.remove(&id);
        Some(id)
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.queued.contains(id)
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.queued.clear();
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.order.len() >= self.max_jobs
    }
}
