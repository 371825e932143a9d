//! Console line ring buffer of a service.

use std::collections::VecDeque;
use std::sync::Mutex;

/// Lines cached per service for screen backlog replay.
pub const DEFAULT_SCREEN_CAPACITY: usize = 128;

/// Fixed-size ring of the most recent console lines.
pub struct ScreenBuffer {
    capacity: usize,
    lines: Mutex<VecDeque<String>>,
}

impl ScreenBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            lines: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, line: String) {
        let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// The cached backlog, oldest first.
    pub fn backlog(&self) -> Vec<String> {
        let lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        lines.iter().cloned().collect()
    }

    pub fn clear(&self) {
        let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        lines.clear();
    }
}

impl Default for ScreenBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_SCREEN_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_drops_oldest_lines() {
        let screen = ScreenBuffer::new(3);
        for i in 0..5 {
            screen.push(format!("line-{i}"));
        }

        assert_eq!(
            screen.backlog(),
            vec!["line-2".to_string(), "line-3".to_string(), "line-4".to_string()]
        );
    }

    #[test]
    fn test_default_capacity() {
        let screen = ScreenBuffer::default();
        for i in 0..200 {
            screen.push(format!("{i}"));
        }
        assert_eq!(screen.backlog().len(), DEFAULT_SCREEN_CAPACITY);
        assert_eq!(screen.backlog()[0], "72");
    }
}
