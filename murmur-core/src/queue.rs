//! Swap-on-read MPSC queue.
//!
//! Writers push under a mutex and learn the post-push length; the single
//! reader steals the whole backlog in one swap. A writer that observes
//! length 1 knows the queue was empty and is responsible for scheduling a
//! drain, so wake-ups are amortized over the backlog instead of paid per
//! message.

use std::sync::Mutex;

pub struct SwapQueue<T> {
    inner: Mutex<Vec<T>>,
}

impl<T> Default for SwapQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SwapQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Vec::new()),
        }
    }

    /// Pushes a value and returns the queue length after the push.
    pub fn push(&self, value: T) -> usize {
        let mut q = self.inner.lock().unwrap();
        q.push(value);
        q.len()
    }

    /// Exchanges the backlog with `into` in one operation. `into` should be
    /// empty; its capacity is recycled for the next backlog.
    pub fn swap_into(&self, into: &mut Vec<T>) {
        debug_assert!(into.is_empty());
        let mut q = self.inner.lock().unwrap();
        std::mem::swap(&mut *q, into);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_reports_post_push_length() {
        let q = SwapQueue::new();
        assert_eq!(q.push(1), 1);
        assert_eq!(q.push(2), 2);
    }

    #[test]
    fn swap_steals_everything() {
        let q = SwapQueue::new();
        q.push("a");
        q.push("b");
        let mut out = Vec::new();
        q.swap_into(&mut out);
        assert_eq!(out, vec!["a", "b"]);
        assert!(q.is_empty());
    }

    #[test]
    fn concurrent_pushes_all_arrive() {
        use std::sync::Arc;
        let q = Arc::new(SwapQueue::new());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let q = q.clone();
                std::thread::spawn(move || {
                    for i in 0..1000 {
                        q.push(t * 1000 + i);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let mut out = Vec::new();
        q.swap_into(&mut out);
        assert_eq!(out.len(), 4000);
    }
}
