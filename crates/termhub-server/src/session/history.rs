//! Capped output history for replay on attach.
//!
//! Stores the last N output chunks of a session so that a late or
//! reconnecting observer sees everything still retained, without the server
//! keeping unbounded output.

use std::collections::VecDeque;

/// Maximum number of chunks a session retains.
pub const HISTORY_LIMIT: usize = 1000;

/// A fixed-capacity FIFO of text chunks.
#[derive(Debug)]
pub struct History {
    chunks: VecDeque<String>,
    capacity: usize,
}

impl Default for History {
    fn default() -> Self {
        Self::new(HISTORY_LIMIT)
    }
}

impl History {
    /// Create a history holding at most `capacity` chunks.
    pub fn new(capacity: usize) -> Self {
        Self {
            chunks: VecDeque::with_capacity(capacity.min(64)),
            capacity,
        }
    }

    /// Append a chunk, evicting the oldest one when full.
    pub fn push(&mut self, chunk: String) {
        if self.capacity == 0 {
            return;
        }
        if self.chunks.len() == self.capacity {
            self.chunks.pop_front();
        }
        self.chunks.push_back(chunk);
    }

    /// All retained chunks, oldest first.
    pub fn snapshot(&self) -> Vec<String> {
        self.chunks.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_order() {
        let mut h = History::new(10);
        h.push("a".into());
        h.push("b".into());
        assert_eq!(h.snapshot(), vec!["a", "b"]);
        assert_eq!(h.len(), 2);
    }

    #[test]
    fn evicts_oldest_at_capacity() {
        let mut h = History::new(3);
        for c in ["a", "b", "c", "d", "e"] {
            h.push(c.into());
        }
        assert_eq!(h.snapshot(), vec!["c", "d", "e"]);
        assert_eq!(h.len(), 3);
    }

    #[test]
    fn default_cap_is_a_thousand() {
        let mut h = History::default();
        for i in 0..1500 {
            h.push(i.to_string());
        }
        assert_eq!(h.len(), HISTORY_LIMIT);
        let snap = h.snapshot();
        assert_eq!(snap.first().map(String::as_str), Some("500"));
        assert_eq!(snap.last().map(String::as_str), Some("1499"));
    }

    #[test]
    fn zero_capacity() {
        let mut h = History::new(0);
        h.push("x".into());
        assert!(h.is_empty());
    }
}
