//! Outbound dispatch queue.
//!
//! Holds encoded frames that could not be written because the link was down.
//! The queue lives only in memory; pending messages survive a restart through
//! the ledger instead.

use std::collections::VecDeque;

#[derive(Debug, Default)]
pub struct DispatchQueue {
    frames: VecDeque<String>,
}

impl DispatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame: String) {
        self.frames.push_back(frame);
    }

    /// Take every queued frame in insertion order, leaving the queue empty.
    pub fn take_all(&mut self) -> VecDeque<String> {
        std::mem::take(&mut self.frames)
    }

    /// Put frames that could not be written back at the head, ahead of
    /// anything queued since, keeping their relative order.
    pub fn restore_front(&mut self, mut unsent: VecDeque<String>) {
        unsent.append(&mut self.frames);
        self.frames = unsent;
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_in_fifo_order() {
        let mut queue = DispatchQueue::new();
        queue.push("a".into());
        queue.push("b".into());
        queue.push("c".into());

        let drained: Vec<_> = queue.take_all().into_iter().collect();
        assert_eq!(drained, vec!["a", "b", "c"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn restore_front_keeps_order() {
        let mut queue = DispatchQueue::new();
        queue.push("a".into());
        queue.push("b".into());
        let mut taken = queue.take_all();
        taken.pop_front();
        queue.push("c".into());

        queue.restore_front(taken);
        let drained: Vec<_> = queue.take_all().into_iter().collect();
        assert_eq!(drained, vec!["b", "c"]);
    }
}
