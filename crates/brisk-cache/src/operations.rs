use std::collections::HashMap;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;

use crate::error::{CacheError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Frame {
    CacheAction,
    LongRunningOperation,
}

/// Per-thread stacks of nested cache actions and long-running operations.
///
/// A thread is "in a cache action" while the innermost frame on its stack is a cache action.
/// A long-running operation nested inside a cache action suspends it.
#[derive(Debug, Default)]
pub struct OperationStack {
    stacks: Mutex<HashMap<ThreadId, Vec<Frame>>>,
}

impl OperationStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_cache_action(&self) {
        self.push(Frame::CacheAction);
    }

    pub fn pop_cache_action(&self) -> Result<()> {
        self.pop(Frame::CacheAction)
    }

    pub fn push_long_running_operation(&self) {
        self.push(Frame::LongRunningOperation);
    }

    pub fn pop_long_running_operation(&self) -> Result<()> {
        self.pop(Frame::LongRunningOperation)
    }

    /// Whether the current thread is inside a cache action that is not suspended.
    pub fn is_in_cache_action(&self) -> bool {
        self.top(thread::current().id()) == Some(Frame::CacheAction)
    }

    /// Whether any thread is currently inside an unsuspended cache action.
    pub fn any_thread_in_cache_action(&self) -> bool {
        self.stacks
            .lock()
            .values()
            .any(|stack| stack.last() == Some(&Frame::CacheAction))
    }

    /// Number of frames on the current thread's stack.
    pub fn depth(&self) -> usize {
        self.stacks
            .lock()
            .get(&thread::current().id())
            .map_or(0, Vec::len)
    }

    fn top(&self, thread: ThreadId) -> Option<Frame> {
        self.stacks
            .lock()
            .get(&thread)
            .and_then(|stack| stack.last().copied())
    }

    fn push(&self, frame: Frame) {
        self.stacks
            .lock()
            .entry(thread::current().id())
            .or_default()
            .push(frame);
    }

    fn pop(&self, expected: Frame) -> Result<()> {
        let id = thread::current().id();
        let mut stacks = self.stacks.lock();
        let Some(stack) = stacks.get_mut(&id) else {
            return Err(CacheError::LockProtocolViolation(format!(
                "cannot pop {expected:?}: the operation stack of this thread is empty"
            )));
        };
        match stack.last() {
            Some(top) if *top == expected => {
                stack.pop();
            }
            Some(top) => {
                return Err(CacheError::LockProtocolViolation(format!(
                    "cannot pop {expected:?}: the innermost operation is {top:?}"
                )))
            }
            None => {
                return Err(CacheError::LockProtocolViolation(format!(
                    "cannot pop {expected:?}: the operation stack of this thread is empty"
                )))
            }
        }
        if stack.is_empty() {
            stacks.remove(&id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn long_running_operations_suspend_cache_actions() {
        let ops = OperationStack::new();
        assert!(!ops.is_in_cache_action());

        ops.push_cache_action();
        assert!(ops.is_in_cache_action());
        ops.push_long_running_operation();
        assert!(!ops.is_in_cache_action());
        ops.push_cache_action();
        assert!(ops.is_in_cache_action());
        assert_eq!(ops.depth(), 3);

        ops.pop_cache_action().unwrap();
        ops.pop_long_running_operation().unwrap();
        assert!(ops.is_in_cache_action());
        ops.pop_cache_action().unwrap();
        assert_eq!(ops.depth(), 0);
    }

    #[test]
    fn mismatched_pops_are_protocol_violations() {
        let ops = OperationStack::new();
        assert!(matches!(
            ops.pop_cache_action(),
            Err(CacheError::LockProtocolViolation(_))
        ));

        ops.push_long_running_operation();
        assert!(matches!(
            ops.pop_cache_action(),
            Err(CacheError::LockProtocolViolation(_))
        ));
        // The failed pop left the stack alone.
        ops.pop_long_running_operation().unwrap();
    }

    #[test]
    fn stacks_are_per_thread_but_visible_across_threads() {
        let ops = Arc::new(OperationStack::new());
        ops.push_cache_action();

        let other = ops.clone();
        std::thread::spawn(move || {
            assert!(!other.is_in_cache_action());
            assert!(other.any_thread_in_cache_action());
        })
        .join()
        .unwrap();

        ops.pop_cache_action().unwrap();
        assert!(!ops.any_thread_in_cache_action());
    }

    #[test]
    fn emptied_stacks_are_forgotten() {
        let ops = Arc::new(OperationStack::new());
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let ops = ops.clone();
                std::thread::spawn(move || {
                    ops.push_cache_action();
                    ops.push_long_running_operation();
                    ops.pop_long_running_operation().unwrap();
                    ops.pop_cache_action().unwrap();
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert!(ops.stacks.lock().is_empty());
    }
}
