//! Per-session admission queue.
//!
//! Two FIFO lanes (high, normal) plus a single in-flight slot. The slot is
//! claimed as soon as a request is chosen for dispatch, including while it
//! waits on a conversation lock, so a session never has two requests moving
//! towards the provider at once.

use std::collections::VecDeque;

use serde::Serialize;

use super::completion::{RequestId, RequestPriority};

#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionQueue {
    high: VecDeque<RequestId>,
    normal: VecDeque<RequestId>,
    in_flight: Option<RequestId>,
}

impl SessionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append to the lane for `priority`.
    pub fn enqueue(&mut self, request_id: RequestId, priority: RequestPriority) {
        match priority {
            RequestPriority::High => self.high.push_back(request_id),
            RequestPriority::Normal => self.normal.push_back(request_id),
        }
    }

    /// Pop the next request, high lane first.
    pub fn pop_next(&mut self) -> Option<RequestId> {
        self.high.pop_front().or_else(|| self.normal.pop_front())
    }

    /// Remove a queued (not in-flight) request. Returns whether it was present.
    pub fn remove(&mut self, request_id: &RequestId) -> bool {
        for lane in [&mut self.high, &mut self.normal] {
            if let Some(pos) = lane.iter().position(|id| id == request_id) {
                lane.remove(pos);
                return true;
            }
        }
        false
    }

    pub fn claim(&mut self, request_id: RequestId) {
        self.in_flight = Some(request_id);
    }

    /// Free the slot if `request_id` holds it.
    pub fn release(&mut self, request_id: &RequestId) -> bool {
        if self.in_flight.as_ref() == Some(request_id) {
            self.in_flight = None;
            true
        } else {
            false
        }
    }

    pub fn in_flight(&self) -> Option<&RequestId> {
        self.in_flight.as_ref()
    }

    /// No request in flight and nothing waiting.
    pub fn is_idle(&self) -> bool {
        self.in_flight.is_none() && self.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.high.is_empty() && self.normal.is_empty()
    }

    /// Number of waiting requests.
    pub fn len(&self) -> usize {
        self.high.len() + self.normal.len()
    }

    /// Zero-based position in dispatch order.
    pub fn position(&self, request_id: &RequestId) -> Option<usize> {
        if let Some(pos) = self.high.iter().position(|id| id == request_id) {
            return Some(pos);
        }
        self.normal
            .iter()
            .position(|id| id == request_id)
            .map(|pos| pos + self.high.len())
    }

    /// Waiting requests in dispatch order.
    pub fn pending(&self) -> Vec<RequestId> {
        self.high.iter().chain(self.normal.iter()).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn id(s: &str) -> RequestId {
        RequestId::from(s)
    }

    #[test]
    fn test_high_lane_admitted_first() {
        let mut q = SessionQueue::new();
        q.enqueue(id("n1"), RequestPriority::Normal);
        q.enqueue(id("h1"), RequestPriority::High);
        q.enqueue(id("n2"), RequestPriority::Normal);
        q.enqueue(id("h2"), RequestPriority::High);

        assert_eq!(q.position(&id("h2")), Some(1));
        assert_eq!(q.position(&id("n1")), Some(2));
        assert_eq!(q.pop_next(), Some(id("h1")));
        assert_eq!(q.pop_next(), Some(id("h2")));
        assert_eq!(q.pop_next(), Some(id("n1")));
        assert_eq!(q.pop_next(), Some(id("n2")));
        assert_eq!(q.pop_next(), None);
    }

    #[test]
    fn test_slot_and_idle() {
        let mut q = SessionQueue::new();
        assert!(q.is_idle());
        q.claim(id("a"));
        assert!(!q.is_idle());
        assert!(!q.release(&id("b")));
        assert!(q.release(&id("a")));
        assert!(q.is_idle());
    }

    #[test]
    fn test_remove_queued() {
        let mut q = SessionQueue::new();
        q.enqueue(id("a"), RequestPriority::Normal);
        q.enqueue(id("b"), RequestPriority::Normal);
        assert!(q.remove(&id("a")));
        assert!(!q.remove(&id("a")));
        assert_eq!(q.pending(), vec![id("b")]);
    }

    proptest! {
        #[test]
        fn prop_lanes_are_fifo(priorities in proptest::collection::vec(any::<bool>(), 0..64)) {
            let mut q = SessionQueue::new();
            let mut highs = Vec::new();
            let mut normals = Vec::new();
            for (i, high) in priorities.iter().enumerate() {
                let rid = RequestId(format!("r{i}"));
                if *high {
                    highs.push(rid.clone());
                    q.enqueue(rid, RequestPriority::High);
                } else {
                    normals.push(rid.clone());
                    q.enqueue(rid, RequestPriority::Normal);
                }
            }
            let mut drained = Vec::new();
            while let Some(next) = q.pop_next() {
                drained.push(next);
            }
            highs.extend(normals);
            prop_assert_eq!(drained, highs);
        }
    }
}
