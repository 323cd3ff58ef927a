//! Pending work queue.

use std::collections::VecDeque;

use crate::agent::WorkItem;

/// FIFO of work items not yet launched. Items come out in ascending order and
/// each one comes out at most once.
#[derive(Debug, Clone, Default)]
pub struct PendingQueue {
    items: VecDeque<WorkItem>,
}

impl PendingQueue {
    /// Queue `0..total`.
    pub fn new(total: usize) -> Self {
        Self {
            items: (0..total).collect(),
        }
    }

    pub fn pop(&mut self) -> Option<WorkItem> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
